//! Layered connection configuration with strict precedence.
//!
//! Final connector config is merged from five layers, later layers winning:
//! built-in defaults, a JSON/YAML file, environment variables under a
//! protocol prefix, a caller-supplied map, and explicit overrides. After the
//! merge a declared set of required keys must be present and non-empty.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::EtlError;
use crate::JsonMap;

/// Optional layers merged below the caller-supplied config map.
#[derive(Debug, Default, Clone)]
pub struct ConfigLayers {
    /// JSON or YAML file merged above `defaults`.
    pub file_path: Option<String>,
    /// Environment prefix: `<PREFIX>_<KEY>` becomes config key `<key>`.
    pub env_prefix: Option<String>,
    /// Built-in defaults, the lowest-precedence layer.
    pub defaults: JsonMap,
    /// Explicit overrides, the highest-precedence layer. Null values are
    /// dropped so unset overrides never mask lower layers.
    pub overrides: JsonMap,
}

/// Resolve the final connector config from all layers.
///
/// Precedence, low to high: `layers.defaults`, file, environment,
/// `config`, `layers.overrides`. Returns the merged map with unknown keys
/// preserved for downstream connector validation.
pub fn load_connection_config(
    config: Option<&JsonMap>,
    layers: &ConfigLayers,
    required: &[&str],
) -> Result<JsonMap, EtlError> {
    let mut merged = JsonMap::new();

    merge_into(&mut merged, &layers.defaults);
    if let Some(path) = &layers.file_path {
        let file_config = read_config_file(Path::new(path))?;
        merge_into(&mut merged, &file_config);
    }
    if let Some(prefix) = &layers.env_prefix {
        let env_config = read_prefixed_env(prefix);
        merge_into(&mut merged, &env_config);
    }
    if let Some(config) = config {
        merge_into(&mut merged, config);
    }
    for (key, value) in &layers.overrides {
        if !value.is_null() {
            merged.insert(key.clone(), value.clone());
        }
    }

    ensure_required_keys(&merged, required)?;
    debug!(
        config = %crate::redact::redacted_display(&merged),
        "connection config resolved"
    );
    Ok(merged)
}

/// Load a connector config file for the registry: JSON for `.json`, YAML for
/// `.yaml`/`.yml`, anything else is an unsupported format. The root must be
/// a key/value object.
pub fn load_connector_config(path: &Path) -> Result<JsonMap, EtlError> {
    read_config_file(path)
}

fn merge_into(merged: &mut JsonMap, layer: &JsonMap) {
    for (key, value) in layer {
        merged.insert(key.clone(), value.clone());
    }
}

fn read_prefixed_env(prefix: &str) -> JsonMap {
    let token = format!("{}_", prefix.to_uppercase());
    let mut values = JsonMap::new();
    for (key, value) in std::env::vars() {
        if let Some(stripped) = key.strip_prefix(&token) {
            values.insert(stripped.to_lowercase(), Value::String(value));
        }
    }
    debug!(prefix = %token, keys = values.len(), "loaded config keys from environment");
    values
}

fn read_config_file(path: &Path) -> Result<JsonMap, EtlError> {
    if !path.exists() {
        return Err(EtlError::ConfigFileNotFound(path.display().to_string()));
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    let content = std::fs::read_to_string(path)
        .map_err(|e| EtlError::InvalidConfig(format!("{}: {}", path.display(), e)))?;

    let parsed: Value = match extension.as_str() {
        "json" => serde_json::from_str(&content)
            .map_err(|e| EtlError::InvalidConfig(format!("{}: {}", path.display(), e)))?,
        "yaml" | "yml" => serde_yaml::from_str(&content)
            .map_err(|e| EtlError::InvalidConfig(format!("{}: {}", path.display(), e)))?,
        other => return Err(EtlError::UnsupportedConfigFormat(other.to_string())),
    };

    match parsed {
        Value::Object(map) => Ok(map),
        _ => Err(EtlError::InvalidConfig(
            "config file must contain a key/value object at the root".to_string(),
        )),
    }
}

fn ensure_required_keys(config: &JsonMap, required: &[&str]) -> Result<(), EtlError> {
    let missing: Vec<String> = required
        .iter()
        .filter(|key| match config.get(**key) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        })
        .map(|key| key.to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(EtlError::MissingConfigKeys(missing))
    }
}

/// Deserialize a typed connector config from the merged map.
///
/// Unknown keys are ignored; type errors surface as invalid-parameter
/// errors naming the protocol.
pub fn typed_config<T: DeserializeOwned>(
    protocol: &'static str,
    merged: &JsonMap,
) -> Result<T, EtlError> {
    serde_json::from_value(Value::Object(merged.clone())).map_err(|e| {
        EtlError::InvalidConfig(format!("invalid parameters for protocol '{}': {}", protocol, e))
    })
}

/// Lenient deserializers for typed connector configs.
///
/// Environment-variable layers carry strings; the config loader does not
/// coerce them, so numeric and boolean fields accept both native values and
/// their string forms.
pub mod de {
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| D::Error::custom("expected a non-negative integer")),
            Value::String(s) => s
                .trim()
                .parse()
                .map_err(|e| D::Error::custom(format!("invalid integer '{}': {}", s, e))),
            other => Err(D::Error::custom(format!("expected integer, got {}", other))),
        }
    }

    pub fn lenient_u16<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        let value = lenient_u64(deserializer)?;
        u16::try_from(value).map_err(|_| D::Error::custom(format!("{} is out of range", value)))
    }

    pub fn lenient_usize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
        let value = lenient_u64(deserializer)?;
        usize::try_from(value).map_err(|_| D::Error::custom(format!("{} is out of range", value)))
    }

    pub fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| D::Error::custom("expected a number")),
            Value::String(s) => s
                .trim()
                .parse()
                .map_err(|e| D::Error::custom(format!("invalid number '{}': {}", s, e))),
            other => Err(D::Error::custom(format!("expected number, got {}", other))),
        }
    }

    pub fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Bool(b) => Ok(b),
            Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(true),
                "false" | "no" | "0" | "off" => Ok(false),
                other => Err(D::Error::custom(format!("invalid boolean '{}'", other))),
            },
            other => Err(D::Error::custom(format!("expected boolean, got {}", other))),
        }
    }

    /// Accepts a sequence of strings or one comma-separated string.
    pub fn string_or_seq<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<String>, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(s
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    other => Err(D::Error::custom(format!("expected string, got {}", other))),
                })
                .collect(),
            other => Err(D::Error::custom(format!(
                "expected string or sequence, got {}",
                other
            ))),
        }
    }
}
