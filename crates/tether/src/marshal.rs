//! Value conversion between host and engine.
//!
//! The call protocol only ever exchanges three shapes: strings, arrays of
//! strings, and booleans. Richer payloads travel inside the strings, encoded
//! by a layer above this crate. Anything else is a caller error.

use rquickjs::{Array, Ctx, Value};
use serde::Serialize;

use crate::error::Result;

/// Nested arrays deeper than this are reported as null by [`to_host_value`].
const MAX_HOST_VALUE_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarshalError {
    #[error("expected {expected} but found {found}")]
    UnexpectedType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("expected string at index {index} but found {found}")]
    NonStringElement { index: usize, found: &'static str },
}

/// Short name of a value's shape, for error messages and protocol diagnostics.
pub(crate) fn describe(value: &Value<'_>) -> &'static str {
    if value.is_undefined() {
        "undefined"
    } else if value.is_null() {
        "null"
    } else if value.is_bool() {
        "boolean"
    } else if value.is_int() || value.is_float() {
        "number"
    } else if value.is_string() {
        "string"
    } else if value.is_symbol() {
        "symbol"
    } else if value.is_array() {
        "array"
    } else if value.is_function() {
        "function"
    } else if value.is_object() {
        "object"
    } else {
        "unknown"
    }
}

pub(crate) fn to_js_string<'js>(ctx: &Ctx<'js>, value: &str) -> rquickjs::Result<Value<'js>> {
    Ok(rquickjs::String::from_str(ctx.clone(), value)?.into_value())
}

pub(crate) fn to_js_string_array<'js>(
    ctx: &Ctx<'js>,
    values: &[String],
) -> rquickjs::Result<Value<'js>> {
    let array = Array::new(ctx.clone())?;
    for (index, value) in values.iter().enumerate() {
        array.set(index, to_js_string(ctx, value)?)?;
    }
    Ok(array.into_value())
}

pub(crate) fn to_js_bool<'js>(ctx: &Ctx<'js>, value: bool) -> Value<'js> {
    Value::new_bool(ctx.clone(), value)
}

pub(crate) fn from_js_string(value: &Value<'_>) -> Result<String> {
    let string = value.as_string().ok_or(MarshalError::UnexpectedType {
        expected: "string",
        found: describe(value),
    })?;
    Ok(string.to_string()?)
}

pub(crate) fn from_js_string_array(value: &Value<'_>) -> Result<Vec<String>> {
    let array = value.as_array().ok_or(MarshalError::UnexpectedType {
        expected: "array",
        found: describe(value),
    })?;

    let mut result = Vec::with_capacity(array.len());
    for index in 0..array.len() {
        let element: Value = array.get(index)?;
        let string = element
            .as_string()
            .ok_or(MarshalError::NonStringElement {
                index,
                found: describe(&element),
            })?;
        result.push(string.to_string()?);
    }
    Ok(result)
}

pub(crate) fn from_js_bool(value: &Value<'_>) -> Result<bool> {
    Ok(value.as_bool().ok_or(MarshalError::UnexpectedType {
        expected: "boolean",
        found: describe(value),
    })?)
}

/// Host-side mirror of an evaluation result.
///
/// Undefined, null and shapes without a host counterpart (plain objects,
/// functions, symbols) all become [`JsValue::Null`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsValue {
    Null,
    Bool(bool),
    Int(i32),
    Float(f64),
    String(String),
    Array(Vec<JsValue>),
}

pub(crate) fn to_host_value(value: &Value<'_>) -> Result<JsValue> {
    to_host_value_at(value, 0)
}

fn to_host_value_at(value: &Value<'_>, depth: usize) -> Result<JsValue> {
    if let Some(b) = value.as_bool() {
        return Ok(JsValue::Bool(b));
    }
    if let Some(i) = value.as_int() {
        return Ok(JsValue::Int(i));
    }
    if let Some(f) = value.as_float() {
        return Ok(JsValue::Float(f));
    }
    if let Some(s) = value.as_string() {
        return Ok(JsValue::String(s.to_string()?));
    }
    if let Some(array) = value.as_array()
        && depth < MAX_HOST_VALUE_DEPTH
    {
        let mut elements = Vec::with_capacity(array.len());
        for index in 0..array.len() {
            let element: Value = array.get(index)?;
            elements.push(to_host_value_at(&element, depth + 1)?);
        }
        return Ok(JsValue::Array(elements));
    }
    Ok(JsValue::Null)
}
