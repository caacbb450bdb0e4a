//! Parameter resolution and constraint checking
//!
//! Supplied values are merged with defaults, normalized to their declared
//! type and checked against every declared constraint before anything else
//! in the template is looked at.

use crate::error::ValidationError;
use crate::template::{ParameterSpec, ParameterType};
use regex::Regex;
use serde_json::{Number, Value};
use std::collections::BTreeMap;

/// Values supplied by the caller, keyed by parameter name
pub type ParameterInputs = BTreeMap<String, Value>;

/// Resolve every declared parameter to a validated value
pub fn resolve_parameters(
    specs: &BTreeMap<String, ParameterSpec>,
    inputs: &ParameterInputs,
) -> Result<BTreeMap<String, Value>, ValidationError> {
    if let Some(unknown) = inputs.keys().find(|name| !specs.contains_key(*name)) {
        return Err(ValidationError::UnknownParameter(unknown.clone()));
    }

    let mut resolved = BTreeMap::new();
    for (name, spec) in specs {
        let raw = inputs
            .get(name)
            .or(spec.default.as_ref())
            .ok_or_else(|| ValidationError::MissingParameter(name.clone()))?;
        let value = normalize(name, spec, raw)?;
        check_constraints(name, spec, &value)?;
        log::debug!("Parameter {name} = {value}");
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

fn violation(name: &str, constraint: &str, message: impl Into<String>) -> ValidationError {
    ValidationError::Parameter {
        parameter: name.to_string(),
        constraint: constraint.to_string(),
        message: message.into(),
    }
}

/// Coerce a raw value to the declared type
///
/// Command-line values arrive as strings, so numbers are parsed; numbers
/// given to string parameters are rendered as text.
fn normalize(name: &str, spec: &ParameterSpec, raw: &Value) -> Result<Value, ValidationError> {
    match spec.param_type {
        ParameterType::Number => {
            let number = match raw {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .filter(|n| n.is_finite())
            .ok_or_else(|| violation(name, "Type", format!("{raw} is not a number")))?;
            Ok(number_value(number))
        }
        ParameterType::String | ParameterType::Enum => match raw {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(violation(name, "Type", format!("{other} is not a string"))),
        },
    }
}

/// Integral values stay integers so `3` and `"3"` resolve identically
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

fn check_constraints(name: &str, spec: &ParameterSpec, value: &Value) -> Result<(), ValidationError> {
    if !spec.allowed_values.is_empty() {
        let allowed = spec
            .allowed_values
            .iter()
            .map(|candidate| normalize(name, spec, candidate))
            .collect::<Result<Vec<_>, _>>()?;
        if !allowed.contains(value) {
            let listed: Vec<String> = allowed.iter().map(display_value).collect();
            return Err(violation(
                name,
                "AllowedValues",
                format!(
                    "{} is not one of [{}]",
                    display_value(value),
                    listed.join(", ")
                ),
            ));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = spec.min_value
            && n < min
        {
            return Err(violation(name, "MinValue", format!("{n} is below {min}")));
        }
        if let Some(max) = spec.max_value
            && n > max
        {
            return Err(violation(name, "MaxValue", format!("{n} is above {max}")));
        }
    }

    if let Some(s) = value.as_str() {
        let length = s.chars().count();
        if let Some(min) = spec.min_length
            && length < min
        {
            return Err(violation(
                name,
                "MinLength",
                format!("length {length} is below {min}"),
            ));
        }
        if let Some(max) = spec.max_length
            && length > max
        {
            return Err(violation(
                name,
                "MaxLength",
                format!("length {length} is above {max}"),
            ));
        }
        if let Some(pattern) = &spec.allowed_pattern {
            // The whole value must match, not a substring.
            let anchored = Regex::new(&format!("^(?:{pattern})$"))
                .map_err(|e| violation(name, "AllowedPattern", format!("invalid pattern: {e}")))?;
            if !anchored.is_match(s) {
                return Err(violation(
                    name,
                    "AllowedPattern",
                    format!("'{s}' does not match /{pattern}/"),
                ));
            }
        }
    }

    Ok(())
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
