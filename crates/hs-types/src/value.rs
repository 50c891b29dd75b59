//! Scalar parameter values and their command-line rendering.

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// A concrete parameter value: one candidate of a sweep parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParameterValue {
    /// Textual form injected into child command lines.
    ///
    /// Booleans use the `True`/`False` pair Python argument parsers expect.
    /// Floats use the shortest representation that round-trips, always keeping
    /// a decimal point or exponent so `0.0` never collapses into the integer `0`.
    pub fn render(&self) -> String {
        match self {
            Self::Bool(true) => "True".to_string(),
            Self::Bool(false) => "False".to_string(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => format!("{v:?}"),
            Self::Str(v) => v.clone(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(v) => serde_json::Value::Bool(*v),
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Str(v) => serde_json::Value::String(v.clone()),
        }
    }

    /// Reject values that cannot be compared or rendered stably.
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        match self {
            Self::Float(v) if v.is_nan() => Err(ConfigError::InvalidValue {
                name: name.to_string(),
                message: "NaN is not a valid candidate".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floats_keep_decimal_form() {
        assert_eq!(ParameterValue::Float(0.0).render(), "0.0");
        assert_eq!(ParameterValue::Float(0.001).render(), "0.001");
        assert_eq!(ParameterValue::Float(1.5e-3).render(), "0.0015");
        assert_eq!(ParameterValue::Float(1e-5).render(), "1e-5");
        assert_eq!(ParameterValue::Float(64.0).render(), "64.0");
    }

    #[test]
    fn booleans_render_python_style() {
        assert_eq!(ParameterValue::Bool(true).render(), "True");
        assert_eq!(ParameterValue::Bool(false).render(), "False");
    }

    #[test]
    fn untagged_yaml_scalars() {
        let values: Vec<ParameterValue> =
            serde_yaml::from_str("[true, 64, 0.0, 0.00001, channel_independent]").unwrap();
        assert_eq!(
            values,
            vec![
                ParameterValue::Bool(true),
                ParameterValue::Int(64),
                ParameterValue::Float(0.0),
                ParameterValue::Float(0.00001),
                ParameterValue::Str("channel_independent".into()),
            ]
        );
    }

    #[test]
    fn nan_is_rejected() {
        let err = ParameterValue::Float(f64::NAN).validate("lr").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(ParameterValue::Float(0.1).validate("lr").is_ok());
    }

    #[test]
    fn json_form() {
        assert_eq!(ParameterValue::Int(3).to_json(), serde_json::json!(3));
        assert_eq!(ParameterValue::Float(0.5).to_json(), serde_json::json!(0.5));
        assert_eq!(ParameterValue::from("x").to_json(), serde_json::json!("x"));
    }
}
