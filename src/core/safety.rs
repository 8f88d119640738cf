//! Per-run safety limits.
//!
//! A run is halted, never retried, when it would execute more steps than
//! allowed, hand a provider (or receive back) an oversized payload, or outlive
//! its run timeout. Hooks count as steps.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Steps a single run may execute (default: 50)
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Largest serialized payload entering or leaving a step (default: 10MB)
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,

    /// Step timeout used when a step sets none (default: 30)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    /// Wall-clock budget for the whole run (default: 300)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,
}

fn default_max_steps() -> u32 {
    50
}
fn default_max_payload_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_step_timeout() -> u64 {
    30
}
fn default_run_timeout() -> u64 {
    300
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_payload_bytes: default_max_payload_bytes(),
            step_timeout_seconds: default_step_timeout(),
            run_timeout_seconds: default_run_timeout(),
        }
    }
}

/// Which side of a step a payload is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadDirection {
    Input,
    Output,
}

impl fmt::Display for PayloadDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

impl SafetyLimits {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    /// Reject a step payload of `size` serialized bytes
    pub fn validate_payload(
        &self,
        direction: PayloadDirection,
        size: u64,
    ) -> Result<(), SafetyViolation> {
        if size <= self.max_payload_bytes {
            return Ok(());
        }
        Err(SafetyViolation::MaxPayloadBytes {
            direction,
            actual: size,
            limit: self.max_payload_bytes,
        })
    }

    /// Whether the run may start another step
    pub fn check(&self, tracker: &SafetyTracker) -> Result<(), SafetyViolation> {
        if tracker.steps_executed >= self.max_steps {
            return Err(SafetyViolation::MaxSteps {
                actual: tracker.steps_executed,
                limit: self.max_steps,
            });
        }

        let elapsed = tracker.elapsed_seconds();
        if elapsed >= self.run_timeout_seconds {
            return Err(SafetyViolation::RunTimeout {
                elapsed_seconds: elapsed,
                limit_seconds: self.run_timeout_seconds,
            });
        }
        Ok(())
    }
}

/// Usage accumulated by one run
#[derive(Debug, Clone)]
pub struct SafetyTracker {
    pub steps_executed: u32,

    /// Serialized bytes handed to providers
    pub input_bytes: u64,

    /// Serialized bytes providers returned
    pub output_bytes: u64,

    pub started_at: Instant,
}

impl Default for SafetyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyTracker {
    pub fn new() -> Self {
        Self {
            steps_executed: 0,
            input_bytes: 0,
            output_bytes: 0,
            started_at: Instant::now(),
        }
    }

    /// Count a step that completed
    pub fn record_step(&mut self, input_bytes: u64, output_bytes: u64) {
        self.steps_executed += 1;
        self.input_bytes += input_bytes;
        self.output_bytes += output_bytes;
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Time left before the run timeout
    pub fn remaining(&self, limits: &SafetyLimits) -> Duration {
        limits.run_timeout().saturating_sub(self.started_at.elapsed())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SafetyViolation {
    #[error("Step limit reached: {actual} of {limit} steps already executed")]
    MaxSteps { actual: u32, limit: u32 },

    #[error("Step {direction} of {actual} bytes exceeds the {limit} byte payload limit")]
    MaxPayloadBytes {
        direction: PayloadDirection,
        actual: u64,
        limit: u64,
    },

    #[error("Run timeout: {elapsed_seconds}s elapsed, limit is {limit_seconds}s")]
    RunTimeout {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = SafetyLimits::default();
        assert_eq!(limits.max_steps, 50);
        assert_eq!(limits.max_payload_bytes, 10 * 1024 * 1024);
        assert_eq!(limits.step_timeout_seconds, 30);
        assert_eq!(limits.run_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_payload_direction_in_violation() {
        let limits = SafetyLimits {
            max_payload_bytes: 100,
            ..Default::default()
        };

        assert!(limits.validate_payload(PayloadDirection::Input, 100).is_ok());
        let err = limits
            .validate_payload(PayloadDirection::Output, 101)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Step output of 101 bytes exceeds the 100 byte payload limit"
        );
    }

    #[test]
    fn test_zero_run_timeout_trips_immediately() {
        let limits = SafetyLimits {
            run_timeout_seconds: 0,
            ..Default::default()
        };
        let tracker = SafetyTracker::new();

        assert!(matches!(
            limits.check(&tracker),
            Err(SafetyViolation::RunTimeout { limit_seconds: 0, .. })
        ));
        assert_eq!(tracker.remaining(&limits), Duration::ZERO);
    }
}
