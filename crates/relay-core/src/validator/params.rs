// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scalar coercion, bounds and regex checks for a single parameter value.

use chrono::{DateTime, NaiveDate};
use regex::Regex;
use relay_model::{Parameter, ParameterType};
use serde_json::{Number, Value};

use super::{Bound, ValidationError};

fn type_error(key: &str, expected: &str, value: &Value) -> ValidationError {
    ValidationError::TypeError {
        key: key.to_string(),
        expected: expected.to_string(),
        value: value.to_string(),
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Exact integer value. Integral JSON numbers and digit strings are taken
/// as-is; a float is accepted only when whole and inside the `i64` range.
fn integer_of(value: &Value) -> Option<Number> {
    let from_float = |f: f64| {
        let in_range = (i64::MIN as f64..i64::MAX as f64).contains(&f);
        (f.is_finite() && f.fract() == 0.0 && in_range).then(|| Number::from(f as i64))
    };
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.clone()),
        Value::Number(n) => n.as_f64().and_then(from_float),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .map(Number::from)
                .or_else(|_| s.parse::<u64>().map(Number::from))
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(from_float))
        }
        _ => None,
    }
}

fn float_value(key: &str, f: f64, original: &Value) -> Result<Value, ValidationError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| type_error(key, "FLOAT", original))
}

fn epoch_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ms) = s.parse::<i64>() {
                return Some(ms);
            }
            if let Ok(at) = DateTime::parse_from_rfc3339(s) {
                return Some(at.timestamp_millis());
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc().timestamp_millis())
        }
        _ => None,
    }
}

/// Coerce a non-null scalar (or dictionary) to the parameter's type.
///
/// Dictionaries are only shape-checked here; nested parameters are handled
/// by the caller.
pub(super) fn coerce(key: &str, kind: ParameterType, value: Value) -> Result<Value, ValidationError> {
    match kind {
        ParameterType::Any => Ok(value),
        ParameterType::String => match value {
            Value::String(_) => Ok(value),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(type_error(key, "STRING", &other)),
        },
        ParameterType::Integer => match integer_of(&value) {
            Some(n) => Ok(Value::Number(n)),
            None => Err(type_error(key, "INTEGER", &value)),
        },
        ParameterType::Float => match number_of(&value) {
            Some(f) => float_value(key, f, &value),
            None => Err(type_error(key, "FLOAT", &value)),
        },
        ParameterType::Boolean => match value {
            Value::Bool(_) => Ok(value),
            other => Err(type_error(key, "BOOLEAN", &other)),
        },
        ParameterType::Dictionary => match value {
            Value::Object(_) => Ok(value),
            other => Err(type_error(key, "DICTIONARY", &other)),
        },
        ParameterType::Date | ParameterType::Datetime => match epoch_millis(&value) {
            Some(ms) => Ok(Value::Number(Number::from(ms))),
            None => Err(type_error(key, kind.as_str(), &value)),
        },
    }
}

fn check_bound(key: &str, parameter: &Parameter, actual: f64) -> Result<(), ValidationError> {
    if let Some(limit) = parameter.minimum
        && actual < limit
    {
        return Err(ValidationError::BoundsError {
            key: key.to_string(),
            bound: Bound::Minimum,
            limit,
            actual,
        });
    }
    if let Some(limit) = parameter.maximum
        && actual > limit
    {
        return Err(ValidationError::BoundsError {
            key: key.to_string(),
            bound: Bound::Maximum,
            limit,
            actual,
        });
    }
    Ok(())
}

/// Minimum/maximum on a single value: character count for strings, the
/// value itself for numbers. Other shapes are unbounded.
pub(super) fn check_value_bounds(
    key: &str,
    parameter: &Parameter,
    value: &Value,
) -> Result<(), ValidationError> {
    if parameter.minimum.is_none() && parameter.maximum.is_none() {
        return Ok(());
    }
    match value {
        Value::String(s) => check_bound(key, parameter, s.chars().count() as f64),
        Value::Number(n) => match n.as_f64() {
            Some(f) => check_bound(key, parameter, f),
            None => Ok(()),
        },
        _ => Ok(()),
    }
}

/// Minimum/maximum on a list's length.
pub(super) fn check_length_bounds(
    key: &str,
    parameter: &Parameter,
    len: usize,
) -> Result<(), ValidationError> {
    check_bound(key, parameter, len as f64)
}

/// Match a string against the parameter regex, anchored at the start.
pub(super) fn check_regex(
    key: &str,
    parameter: &Parameter,
    value: &Value,
) -> Result<(), ValidationError> {
    let (Some(pattern), Value::String(s)) = (&parameter.regex, value) else {
        return Ok(());
    };
    let regex = Regex::new(&format!("^(?:{pattern})")).map_err(|e| ValidationError::RegexError {
        key: key.to_string(),
        pattern: pattern.clone(),
        reason: format!("invalid pattern: {e}"),
    })?;
    if regex.is_match(s) {
        Ok(())
    } else {
        Err(ValidationError::RegexError {
            key: key.to_string(),
            pattern: pattern.clone(),
            reason: format!("'{s}' does not match"),
        })
    }
}
