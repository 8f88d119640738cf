//! Step payloads and provider references.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;

/// Data flowing into and out of a step.
///
/// Whether the initial payload is parsed or handed over as raw bytes is
/// decided once, before the first step runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured fields
    Parsed(Value),

    /// Uninterpreted bytes
    Raw(Vec<u8>),
}

impl Default for Payload {
    fn default() -> Self {
        Self::Parsed(Value::Null)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Parsed(value)
    }
}

impl Payload {
    /// Interpret request bytes according to a content type.
    ///
    /// JSON, YAML and plain text are parsed; anything else (or no content
    /// type with a non-empty body) stays raw.
    pub fn interpret(bytes: Vec<u8>, content_type: Option<&str>) -> Result<Self, PayloadError> {
        let essence = content_type
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_lowercase())
            .unwrap_or_default();

        if bytes.is_empty() && essence.is_empty() {
            return Ok(Self::Parsed(Value::Null));
        }

        match essence.as_str() {
            "application/json" | "text/json" => {
                if bytes.is_empty() {
                    return Ok(Self::Parsed(Value::Null));
                }
                serde_json::from_slice(&bytes)
                    .map(Self::Parsed)
                    .map_err(|e| PayloadError::Malformed {
                        content_type: essence.clone(),
                        message: e.to_string(),
                    })
            }
            "application/yaml" | "application/x-yaml" | "text/yaml" => {
                serde_yaml::from_slice::<Value>(&bytes)
                    .map(Self::Parsed)
                    .map_err(|e| PayloadError::Malformed {
                        content_type: essence.clone(),
                        message: e.to_string(),
                    })
            }
            "text/plain" => String::from_utf8(bytes)
                .map(|s| Self::Parsed(Value::String(s)))
                .map_err(|e| PayloadError::Malformed {
                    content_type: essence.clone(),
                    message: e.to_string(),
                }),
            _ => Ok(Self::Raw(bytes)),
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw(_))
    }

    /// View as a JSON value. Raw bytes are exposed as a (lossy) string.
    pub fn as_value(&self) -> Value {
        match self {
            Self::Parsed(value) => value.clone(),
            Self::Raw(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    /// Serialized size, used for safety limits
    pub fn size_bytes(&self) -> u64 {
        match self {
            Self::Parsed(Value::Null) => 0,
            Self::Parsed(value) => serde_json::to_vec(value)
                .map(|v| v.len() as u64)
                .unwrap_or(0),
            Self::Raw(bytes) => bytes.len() as u64,
        }
    }

    /// Bytes handed to an external provider
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Parsed(value) => serde_json::to_vec(value).unwrap_or_default(),
            Self::Raw(bytes) => bytes.clone(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PayloadError {
    #[error("Malformed {content_type} payload: {message}")]
    Malformed {
        content_type: String,
        message: String,
    },
}

/// Where a step's business logic lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderRef {
    /// In-process function, `builtin:<name>`
    Builtin { name: String },

    /// Pre-built image, `docker:[user:pass@]image[:tag]`
    Image(ImageRef),

    /// Image built from a Dockerfile, `file:<dir>/Dockerfile`
    Dockerfile { path: String },

    /// Image produced by a named builder, `<builder>:<path>`
    Custom { builder: String, path: String },
}

impl ProviderRef {
    pub fn is_builtin(&self) -> bool {
        matches!(self, Self::Builtin { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub username: Option<String>,
    pub password: Option<String>,
    pub image: String,
    pub tag: Option<String>,
}

impl ImageRef {
    /// `image:tag`, defaulting the tag to `latest`
    pub fn reference(&self) -> String {
        format!("{}:{}", self.image, self.tag.as_deref().unwrap_or("latest"))
    }
}

impl FromStr for ImageRef {
    type Err = ProviderRefError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (credentials, image_and_tag) = match input.split_once('@') {
            Some((creds, rest)) => {
                let (user, pass) = creds
                    .split_once(':')
                    .ok_or_else(|| ProviderRefError::Credentials(input.to_string()))?;
                if user.is_empty() || pass.is_empty() {
                    return Err(ProviderRefError::Credentials(input.to_string()));
                }
                (Some((user.to_string(), pass.to_string())), rest)
            }
            None => (None, input),
        };

        // A colon after the last slash separates the tag; earlier colons
        // belong to a registry port.
        let last_slash = image_and_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (image, tag) = match image_and_tag[last_slash..].rfind(':') {
            Some(idx) => {
                let split = last_slash + idx;
                (
                    &image_and_tag[..split],
                    Some(image_and_tag[split + 1..].to_string()),
                )
            }
            None => (image_and_tag, None),
        };

        if image.is_empty() || tag.as_deref() == Some("") {
            return Err(ProviderRefError::Image(input.to_string()));
        }

        Ok(Self {
            username: credentials.as_ref().map(|(u, _)| u.clone()),
            password: credentials.map(|(_, p)| p),
            image: image.to_string(),
            tag,
        })
    }
}

impl FromStr for ProviderRef {
    type Err = ProviderRefError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();

        if let Some(name) = input.strip_prefix("builtin:") {
            if name.is_empty() {
                return Err(ProviderRefError::Unsupported(input.to_string()));
            }
            return Ok(Self::Builtin {
                name: name.to_string(),
            });
        }

        if let Some(image) = input.strip_prefix("docker:") {
            return Ok(Self::Image(image.parse()?));
        }

        if input.to_lowercase().ends_with("dockerfile") {
            let path = input
                .strip_prefix("file:")
                .ok_or_else(|| ProviderRefError::Dockerfile(input.to_string()))?;
            let dir = &path[..path.len() - "dockerfile".len()];
            return Ok(Self::Dockerfile {
                path: dir.to_string(),
            });
        }

        match input.split_once(':') {
            Some((builder, path)) if !builder.is_empty() && !path.is_empty() => Ok(Self::Custom {
                builder: builder.to_string(),
                path: path.to_string(),
            }),
            _ => Err(ProviderRefError::Unsupported(input.to_string())),
        }
    }
}

impl fmt::Display for ProviderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builtin { name } => write!(f, "builtin:{}", name),
            Self::Image(image) => write!(f, "docker:{}", image.reference()),
            Self::Dockerfile { path } => write!(f, "file:{}Dockerfile", path),
            Self::Custom { builder, path } => write!(f, "{}:{}", builder, path),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderRefError {
    #[error("Unsupported step provider '{0}'")]
    Unsupported(String),

    #[error("Provider with @ must be in the form user:pass@image:tag, got '{0}'")]
    Credentials(String),

    #[error("Invalid image reference '{0}'")]
    Image(String),

    #[error("Dockerfile providers must be in the form file:<dir>/Dockerfile, got '{0}'")]
    Dockerfile(String),
}
