//! Tagged parameter values and parameter schemas.
//!
//! Tool arguments arrive as loosely-typed JSON from the model.  They are
//! converted into [`ParamValue`] so tools can match on a closed set of
//! shapes, and validated against each tool's [`ParameterSpec`] list before
//! execution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Named tool arguments.
pub type ToolParams = BTreeMap<String, ParamValue>;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A single argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum ParamValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    /// Borrow as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Integer view of a whole, non-negative number.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) if *n >= 0.0 && n.fract() == 0.0 => Some(*n as u64),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "array",
            Self::Map(_) => "object",
        }
    }
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<ParamValue> for Value {
    fn from(value: ParamValue) -> Self {
        match value {
            ParamValue::Null => Value::Null,
            ParamValue::Bool(b) => Value::Bool(b),
            ParamValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                    Value::from(n as i64)
                } else {
                    serde_json::Number::from_f64(n)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            ParamValue::String(s) => Value::String(s),
            ParamValue::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            ParamValue::Map(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for ParamValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

/// Convert a JSON object into tool parameters.  Non-object values yield an
/// empty map.
pub fn params_from_json(value: Value) -> ToolParams {
    match value {
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| (k, ParamValue::from(v)))
            .collect(),
        _ => ToolParams::new(),
    }
}

/// Render tool parameters back into a JSON object.
pub fn params_to_json(params: &ToolParams) -> Value {
    Value::Object(
        params
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.clone())))
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// Schemas
// ---------------------------------------------------------------------------

/// The declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    fn accepts(self, value: &ParamValue) -> bool {
        matches!(
            (self, value),
            (Self::String, ParamValue::String(_))
                | (Self::Number, ParamValue::Number(_))
                | (Self::Boolean, ParamValue::Bool(_))
                | (Self::Array, ParamValue::List(_))
                | (Self::Object, ParamValue::Map(_))
        )
    }

    /// Lenient conversion for values models commonly quote.
    fn coerce(self, value: &ParamValue) -> Option<ParamValue> {
        let s = value.as_str()?.trim();
        match self {
            Self::Number => s.parse::<f64>().ok().map(ParamValue::Number),
            Self::Boolean => match s {
                "true" => Some(ParamValue::Bool(true)),
                "false" => Some(ParamValue::Bool(false)),
                _ => None,
            },
            _ => None,
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        };
        write!(f, "{s}")
    }
}

/// Declaration of one tool parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ParamValue>,
    pub description: String,
}

impl ParameterSpec {
    /// A required parameter.
    pub fn required(name: &str, kind: ParamType, description: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            required: true,
            default: None,
            description: description.to_owned(),
        }
    }

    /// An optional parameter without a default.
    pub fn optional(name: &str, kind: ParamType, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }

    /// An optional parameter filled with `default` when absent.
    pub fn with_default(
        name: &str,
        kind: ParamType,
        default: impl Into<ParamValue>,
        description: &str,
    ) -> Self {
        Self {
            required: false,
            default: Some(default.into()),
            ..Self::required(name, kind, description)
        }
    }
}

/// Declared interface of a tool, exposed to the model in the system prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
}

/// Check `params` against `specs`, filling defaults.
///
/// Absent or null optional parameters take their default.  Quoted numbers
/// and booleans are coerced.  Parameters not named in `specs` pass through
/// untouched.
pub fn validate_params(
    specs: &[ParameterSpec],
    params: &ToolParams,
) -> std::result::Result<ToolParams, String> {
    let mut out = params.clone();

    for spec in specs {
        let present = match out.get(&spec.name) {
            None | Some(ParamValue::Null) => None,
            Some(v) => Some(v.clone()),
        };

        match present {
            None => {
                if let Some(default) = &spec.default {
                    out.insert(spec.name.clone(), default.clone());
                } else if spec.required {
                    return Err(format!("missing required parameter `{}`", spec.name));
                } else {
                    out.remove(&spec.name);
                }
            }
            Some(value) if spec.kind.accepts(&value) => {}
            Some(value) => match spec.kind.coerce(&value) {
                Some(coerced) => {
                    out.insert(spec.name.clone(), coerced);
                }
                None => {
                    return Err(format!(
                        "parameter `{}` expected {}, got {}",
                        spec.name,
                        spec.kind,
                        value.type_name()
                    ));
                }
            },
        }
    }

    Ok(out)
}
