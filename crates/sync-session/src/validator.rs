//! The validator port: coerce inbound JSON values against declared type
//! descriptors.
//!
//! The projection half of the port (typed value -> JSON) is fulfilled by
//! the owner's serde `Serialize` impl; this module only guards the inbound
//! direction.  The default adapter performs structural JSON checks with a
//! little numeric coercion (exact-integral floats pass as integers, ints
//! pass as floats).

use crate::error::ValidationFailure;
use serde_json::Value;

/// Declared type of a field or handler parameter.
///
/// Attributes without a descriptor are unchecked passthrough.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDesc {
    /// Accept anything.
    Any,
    Bool,
    Int,
    Float,
    Str,
    /// Homogeneous array.
    List(Box<TypeDesc>),
    /// String-keyed mapping with homogeneous values.
    Map(Box<TypeDesc>),
    /// Any JSON object.
    Object,
    /// The inner type, or null.
    Optional(Box<TypeDesc>),
}

impl TypeDesc {
    fn expects(&self) -> &'static str {
        match self {
            TypeDesc::Any => "any value",
            TypeDesc::Bool => "a boolean",
            TypeDesc::Int => "an integer",
            TypeDesc::Float => "a number",
            TypeDesc::Str => "a string",
            TypeDesc::List(_) => "an array",
            TypeDesc::Map(_) | TypeDesc::Object => "an object",
            TypeDesc::Optional(_) => "a value or null",
        }
    }
}

/// The port: given a descriptor and a raw JSON value, produce the coerced
/// value or a failure pointing at the offending path.
pub trait Validator: Send + Sync {
    fn validate(
        &self,
        desc: &TypeDesc,
        value: &Value,
        path: &str,
    ) -> Result<Value, ValidationFailure>;
}

/// Default adapter: identity with structural JSON checks.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonValidator;

impl Validator for JsonValidator {
    fn validate(
        &self,
        desc: &TypeDesc,
        value: &Value,
        path: &str,
    ) -> Result<Value, ValidationFailure> {
        let fail = || {
            ValidationFailure::new(
                path,
                format!("expected {}, got {}", desc.expects(), kind_of(value)),
            )
        };
        match desc {
            TypeDesc::Any => Ok(value.clone()),
            TypeDesc::Bool => value.as_bool().map(Value::Bool).ok_or_else(fail),
            TypeDesc::Int => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
                // Exact-integral floats pass (JSON peers often send 3.0).
                Value::Number(n) => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.is_finite() => {
                        Ok(Value::Number(serde_json::Number::from(f as i64)))
                    }
                    _ => Err(fail()),
                },
                _ => Err(fail()),
            },
            TypeDesc::Float => match value {
                Value::Number(_) => Ok(value.clone()),
                _ => Err(fail()),
            },
            TypeDesc::Str => match value {
                Value::String(_) => Ok(value.clone()),
                _ => Err(fail()),
            },
            TypeDesc::List(inner) => match value {
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for (i, item) in items.iter().enumerate() {
                        out.push(self.validate(inner, item, &format!("{path}/{i}"))?);
                    }
                    Ok(Value::Array(out))
                }
                _ => Err(fail()),
            },
            TypeDesc::Map(inner) => match value {
                Value::Object(entries) => {
                    let mut out = serde_json::Map::with_capacity(entries.len());
                    for (k, v) in entries {
                        out.insert(k.clone(), self.validate(inner, v, &format!("{path}/{k}"))?);
                    }
                    Ok(Value::Object(out))
                }
                _ => Err(fail()),
            },
            TypeDesc::Object => match value {
                Value::Object(_) => Ok(value.clone()),
                _ => Err(fail()),
            },
            TypeDesc::Optional(inner) => match value {
                Value::Null => Ok(Value::Null),
                other => self.validate(inner, other, path),
            },
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
