//! ResponseSelector: routes a pipeline outcome to an endpoint response.
//!
//! Rules are evaluated in declaration order and the first one whose
//! condition is absent or true wins. The selected rule then shapes the body:
//! `yield` picks an item or sub-range of a sequenced outcome, and mappings
//! (if any) keep only the mapped fields under their new names.

use std::str::FromStr;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error};

use super::context::ExecutionContext;
use super::expression::{insert_path, parse_condition, parse_mapping, ExpressionError};
use crate::domain::{Payload, PipelineOutcome, ResponseRule};

/// Selection of an item or sub-range of a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldSpec {
    /// `N`: the single item at N, unwrapped
    Index(usize),
    /// `N..`: from N to the end
    From(usize),
    /// `..N`: `[0, N)`
    Until(usize),
    /// `N..M`: `[N, M)`
    Range(usize, usize),
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("Invalid yield '{spec}': {reason}")]
pub struct YieldError {
    pub spec: String,
    pub reason: String,
}

impl FromStr for YieldSpec {
    type Err = YieldError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let spec = input.trim();
        let invalid = |reason: &str| YieldError {
            spec: input.to_string(),
            reason: reason.to_string(),
        };
        let number = |s: &str| -> Result<usize, YieldError> {
            s.trim()
                .parse()
                .map_err(|_| invalid("bounds must be non-negative integers"))
        };

        match spec.split_once("..") {
            None => Ok(Self::Index(number(spec)?)),
            Some(("", "")) => Err(invalid("at least one bound is required")),
            Some(("", end)) => Ok(Self::Until(number(end)?)),
            Some((start, "")) => Ok(Self::From(number(start)?)),
            Some((start, end)) => {
                let (start, end) = (number(start)?, number(end)?);
                if end < start {
                    return Err(invalid("upper bound is below lower bound"));
                }
                Ok(Self::Range(start, end))
            }
        }
    }
}

impl YieldSpec {
    /// Apply to a value. Non-sequences count as a one-item sequence and null
    /// as an empty one; an out-of-range index yields null.
    pub fn apply(&self, value: Value) -> Value {
        let items = match value {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };

        match *self {
            Self::Index(i) => items.into_iter().nth(i).unwrap_or(Value::Null),
            Self::From(n) => Value::Array(items.into_iter().skip(n).collect()),
            Self::Until(n) => Value::Array(items.into_iter().take(n).collect()),
            Self::Range(start, end) => Value::Array(
                items
                    .into_iter()
                    .skip(start)
                    .take(end.saturating_sub(start))
                    .collect(),
            ),
        }
    }
}

/// What the HTTP layer sends back
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointResponse {
    pub status: u16,
    pub body: Payload,
}

/// No rule matched; a server-side configuration fault
#[derive(Debug, Clone, Error, PartialEq)]
#[error("No response rule of endpoint '{endpoint}' matched the pipeline outcome")]
pub struct NoResponseMatchedError {
    pub endpoint: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SelectError {
    #[error(transparent)]
    NoMatch(#[from] NoResponseMatchedError),

    #[error("Endpoint '{endpoint}' response {status}: {source}")]
    Expression {
        endpoint: String,
        status: u16,
        source: ExpressionError,
    },

    #[error("Endpoint '{endpoint}' response {status}: {source}")]
    Yield {
        endpoint: String,
        status: u16,
        source: YieldError,
    },
}

impl SelectError {
    /// Every selection error is a server-side fault
    pub fn status(&self) -> u16 {
        500
    }
}

/// Picks and shapes the response for an outcome
pub struct ResponseSelector;

impl ResponseSelector {
    /// Select the first matching rule and shape the body.
    ///
    /// `ctx` is the context of the run that produced `outcome`; conditions and
    /// mappings can address its steps and args as well as outcome fields.
    pub fn select(
        endpoint: &str,
        rules: &[ResponseRule],
        outcome: &PipelineOutcome,
        ctx: &ExecutionContext,
    ) -> Result<EndpointResponse, SelectError> {
        let ctx = ctx.clone().with_outcome(outcome);

        for (index, rule) in rules.iter().enumerate() {
            if !Self::matches(endpoint, index, rule, &ctx)? {
                continue;
            }
            debug!(endpoint, rule = index, status = rule.status, "Response rule matched");
            return Self::shape(endpoint, rule, outcome, ctx);
        }

        error!(
            endpoint,
            success = outcome.success,
            "No response rule matched, configuration defect"
        );
        Err(NoResponseMatchedError {
            endpoint: endpoint.to_string(),
        }
        .into())
    }

    fn matches(
        endpoint: &str,
        index: usize,
        rule: &ResponseRule,
        ctx: &ExecutionContext,
    ) -> Result<bool, SelectError> {
        let Some(condition) = rule.when.as_deref() else {
            return Ok(true);
        };

        let expr = parse_condition(condition).map_err(|source| SelectError::Expression {
            endpoint: endpoint.to_string(),
            status: rule.status,
            source,
        })?;

        // A condition over a field the outcome lacks does not match
        match expr.test(ctx) {
            Ok(matched) => Ok(matched),
            Err(e) => {
                debug!(endpoint, rule = index, error = %e, "Response condition unresolved");
                Ok(false)
            }
        }
    }

    fn shape(
        endpoint: &str,
        rule: &ResponseRule,
        outcome: &PipelineOutcome,
        ctx: ExecutionContext,
    ) -> Result<EndpointResponse, SelectError> {
        let yielded = match rule.yield_spec.as_deref() {
            Some(spec) => {
                let spec: YieldSpec = spec.parse().map_err(|source| SelectError::Yield {
                    endpoint: endpoint.to_string(),
                    status: rule.status,
                    source,
                })?;
                Some(spec.apply(outcome.value()))
            }
            None => None,
        };

        if rule.mappings.is_empty() {
            let body = match yielded {
                Some(value) => Payload::Parsed(value),
                None => outcome.body.clone(),
            };
            return Ok(EndpointResponse {
                status: rule.status,
                body,
            });
        }

        let ctx = match yielded {
            Some(value) => ctx.with_outcome_value(value, outcome.success),
            None => ctx,
        };

        let mut fields = Map::new();
        for mapping in &rule.mappings {
            let value = parse_mapping(&mapping.from)
                .and_then(|expr| expr.evaluate(&ctx).map_err(ExpressionError::from))
                .map_err(|source| SelectError::Expression {
                    endpoint: endpoint.to_string(),
                    status: rule.status,
                    source,
                })?;
            insert_path(&mut fields, &mapping.target(), value);
        }

        Ok(EndpointResponse {
            status: rule.status,
            body: Payload::Parsed(Value::Object(fields)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Mapping;
    use serde_json::json;

    fn rule(status: u16, when: Option<&str>) -> ResponseRule {
        ResponseRule {
            status,
            when: when.map(str::to_string),
            yield_spec: None,
            mappings: Vec::new(),
        }
    }

    #[test]
    fn test_yield_parsing() {
        assert_eq!("5..".parse(), Ok(YieldSpec::From(5)));
        assert_eq!("..6".parse(), Ok(YieldSpec::Until(6)));
        assert_eq!("5..11".parse(), Ok(YieldSpec::Range(5, 11)));
        assert_eq!("0".parse(), Ok(YieldSpec::Index(0)));
        assert!("..".parse::<YieldSpec>().is_err());
        assert!("3..1".parse::<YieldSpec>().is_err());
        assert!("-1".parse::<YieldSpec>().is_err());
    }

    #[test]
    fn test_yield_application() {
        let items = json!([0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(YieldSpec::Index(0).apply(items.clone()), json!(0));
        assert_eq!(YieldSpec::From(5).apply(items.clone()), json!([5, 6, 7]));
        assert_eq!(YieldSpec::Until(2).apply(items.clone()), json!([0, 1]));
        assert_eq!(YieldSpec::Range(2, 4).apply(items.clone()), json!([2, 3]));
        assert_eq!(YieldSpec::Index(20).apply(items), Value::Null);
        assert_eq!(YieldSpec::Index(0).apply(json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn test_first_match_wins() {
        let rules = vec![
            rule(201, Some("${success}")),
            rule(202, Some("true")),
            rule(400, None),
        ];
        let ctx = ExecutionContext::empty();

        let ok = PipelineOutcome::succeeded(Payload::from(json!({"id": 1})));
        let response = ResponseSelector::select("e", &rules, &ok, &ctx).unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.body, Payload::from(json!({"id": 1})));

        let failed = PipelineOutcome::failed("s", "bad", None);
        let response = ResponseSelector::select("e", &rules[..1], &failed, &ctx);
        assert!(matches!(response, Err(SelectError::NoMatch(_))));
    }

    #[test]
    fn test_mappings_rename_fields() {
        let mut fallback = rule(400, None);
        fallback.mappings = vec![
            Mapping::new("${field1}", "field1a"),
            Mapping::new("${field2}", "field2a"),
        ];
        let outcome = PipelineOutcome::failed(
            "validate",
            "invalid",
            Some(json!({"field1": "x", "field2": "y"})),
        );

        let response = ResponseSelector::select(
            "create_team",
            &[rule(201, Some("${success} == true")), fallback],
            &outcome,
            &ExecutionContext::empty(),
        )
        .unwrap();

        assert_eq!(response.status, 400);
        assert_eq!(response.body, Payload::from(json!({"field1a": "x", "field2a": "y"})));
    }

    #[test]
    fn test_yield_before_mapping() {
        let mut first = rule(200, None);
        first.yield_spec = Some("0".to_string());
        first.mappings = vec![Mapping::new("${name}", "title")];

        let outcome = PipelineOutcome::succeeded(Payload::from(json!([
            {"name": "a"},
            {"name": "b"}
        ])));
        let response =
            ResponseSelector::select("list", &[first], &outcome, &ExecutionContext::empty())
                .unwrap();
        assert_eq!(response.body, Payload::from(json!({"title": "a"})));
    }
}
