//! Model variables written next to the network configs (`configs/vars`).

use std::{collections::HashMap, path::Path};

/// Variables describing the initial network, as written by the config
/// generator: one `key=value` per line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelVars {
    pub model_left_context: i64,
    pub model_right_context: i64,
    /// Number of times layers are added during discriminative pretraining.
    pub num_hidden_layers: usize,
    pub add_lda: bool,
    pub include_log_softmax: bool,
    pub num_targets: Option<i64>,
}

impl ModelVars {
    /// Load and parse a vars file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, VarsError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| VarsError::Io(path.display().to_string(), e))?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Parse vars file content. `origin` names the source in error messages.
    pub fn parse(content: &str, origin: &str) -> Result<Self, VarsError> {
        let mut raw: HashMap<&str, &str> = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(VarsError::Malformed(origin.to_string(), line.to_string()));
            };
            let key = match key.trim() {
                "left_context" => "model_left_context",
                "right_context" => "model_right_context",
                other => other,
            };
            raw.insert(key, value.trim());
        }

        let get = |key: &'static str| {
            raw.get(key)
                .copied()
                .ok_or_else(|| VarsError::Missing(key, origin.to_string()))
        };

        let model_left_context = parse_int(get("model_left_context")?, "model_left_context")?;
        let model_right_context = parse_int(get("model_right_context")?, "model_right_context")?;
        let num_hidden_layers = get("num_hidden_layers")?;

        Ok(Self {
            model_left_context,
            model_right_context,
            num_hidden_layers: num_hidden_layers
                .parse()
                .map_err(|_| invalid("num_hidden_layers", num_hidden_layers))?,
            add_lda: parse_bool(get("add_lda")?, "add_lda")?,
            include_log_softmax: parse_bool(get("include_log_softmax")?, "include_log_softmax")?,
            num_targets: raw
                .get("num_targets")
                .map(|v| parse_int(v, "num_targets"))
                .transpose()?,
        })
    }
}

fn invalid(key: &'static str, value: &str) -> VarsError {
    VarsError::Invalid(key, value.to_string())
}

fn parse_int(value: &str, key: &'static str) -> Result<i64, VarsError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn parse_bool(value: &str, key: &'static str) -> Result<bool, VarsError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

/// Errors that can occur when reading model variables.
#[derive(Debug, thiserror::Error)]
pub enum VarsError {
    #[error("failed to read vars file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("malformed line in {0}: '{1}'")]
    Malformed(String, String),
    #[error("variable {0} needs to be defined in {1}")]
    Missing(&'static str, String),
    #[error("invalid value for {0}: '{1}'")]
    Invalid(&'static str, String),
}
