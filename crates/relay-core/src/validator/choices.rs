// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Choices expressions and allowed-value resolution.
//!
//! Expressions:
//!
//! - url: `http://host/path?arg=${reference}&other=literal`
//! - command: `command_name(arg=${reference}, other=literal)`
//!
//! A `${reference}` names another request parameter or the literal
//! `instance_name`. Static maps select their entry through
//! `details.key_reference`.

use std::sync::LazyLock;

use regex::Regex;
use relay_model::{Choices, ChoicesDetails, ChoicesType, Command, Parameter, Request, RequestStatus};
use serde_json::Value;
use tracing::debug;

use super::{RequestValidator, ValidationContext, ValidationError};

static COMMAND_EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([\w.-]+)\s*(?:\((.*)\))?\s*$").expect("valid regex")
});

static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$\{\s*([\w.-]+)\s*\}$").expect("valid regex"));

fn parse_args(raw: &str, separator: char) -> Result<Vec<(String, String)>, String> {
    raw.split(separator)
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                Ok((k.trim().to_string(), v.trim().to_string()))
            }
            _ => Err(format!("malformed argument '{pair}'")),
        })
        .collect()
}

fn expression(choices: &Choices, field: &str) -> Result<String, String> {
    match &choices.value {
        Value::String(s) => Ok(s.clone()),
        Value::Object(map) => map
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| format!("choices object needs a '{field}' string")),
        other => Err(format!("unsupported choices value {other}")),
    }
}

/// Parse `url?k=v&...` into an address and arguments.
pub fn parse_url_expression(raw: &str) -> Result<ChoicesDetails, String> {
    let (address, query) = match raw.split_once('?') {
        Some((address, query)) => (address, query),
        None => (raw, ""),
    };
    if address.trim().is_empty() {
        return Err("empty url".to_string());
    }
    Ok(ChoicesDetails {
        address: Some(address.trim().to_string()),
        args: parse_args(query, '&')?,
        ..Default::default()
    })
}

/// Parse `name(k=v, ...)` into a command name and arguments.
pub fn parse_command_expression(raw: &str) -> Result<ChoicesDetails, String> {
    let captures = COMMAND_EXPRESSION
        .captures(raw)
        .ok_or_else(|| format!("malformed command expression '{raw}'"))?;
    Ok(ChoicesDetails {
        name: Some(captures[1].to_string()),
        args: captures
            .get(2)
            .map(|m| parse_args(m.as_str(), ','))
            .transpose()?
            .unwrap_or_default(),
        ..Default::default()
    })
}

/// Parsed details for a choices declaration, reusing the cached form when
/// present.
pub fn parse_choices(choices: &Choices) -> Result<ChoicesDetails, String> {
    if !choices.details.is_empty() {
        return Ok(choices.details.clone());
    }
    match choices.choices_type {
        ChoicesType::Static => Ok(ChoicesDetails::default()),
        ChoicesType::Url => parse_url_expression(&expression(choices, "url")?),
        ChoicesType::Command => parse_command_expression(&expression(choices, "command")?),
    }
}

/// Fill `details` for every dynamic choices declaration of a command, so
/// later validations skip parsing.
pub fn cache_choice_details(command: &mut Command) -> Result<(), String> {
    fn walk(parameters: &mut [Parameter]) -> Result<(), String> {
        for parameter in parameters {
            if let Some(choices) = &mut parameter.choices
                && choices.choices_type != ChoicesType::Static
                && choices.details.is_empty()
            {
                choices.details = parse_choices(choices)
                    .map_err(|e| format!("parameter '{}': {e}", parameter.key))?;
            }
            walk(&mut parameter.parameters)?;
        }
        Ok(())
    }
    walk(&mut command.parameters)
}

/// Value of a `${reference}` or a literal argument.
fn resolve_argument(request: &Request, raw: &str) -> Result<String, String> {
    let Some(captures) = REFERENCE.captures(raw) else {
        return Ok(raw.to_string());
    };
    let name = &captures[1];
    if name == "instance_name" {
        return Ok(request.instance_name.clone());
    }
    match request.parameters.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) | None => Err(format!("reference '{name}' has no value")),
        Some(other) => Ok(other.to_string()),
    }
}

/// Scalars pass through; objects contribute their `value` field.
fn allowed_from_output(values: Value) -> Result<Vec<Value>, String> {
    let Value::Array(items) = values else {
        return Err("choices source did not return a list".to_string());
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(mut map) => map
                .remove("value")
                .ok_or_else(|| "choice object without 'value'".to_string()),
            scalar => Ok(scalar),
        })
        .collect()
}

/// Whether `value` is one of `allowed`, comparing strings by their text so
/// a coerced `"1"` still matches a numeric choice.
pub(super) fn is_allowed(allowed: &[Value], value: &Value) -> bool {
    fn text(v: &Value) -> String {
        match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
    allowed.iter().any(|a| a == value || text(a) == text(value))
}

impl RequestValidator {
    /// Compute the allowed-value set for a strict choices declaration.
    pub(super) async fn allowed_values(
        &self,
        key: &str,
        choices: &Choices,
        ctx: &ValidationContext<'_>,
    ) -> Result<Vec<Value>, ValidationError> {
        let choice_error = |reason: String| ValidationError::ChoiceError {
            key: key.to_string(),
            reason,
        };
        let details = parse_choices(choices).map_err(choice_error)?;

        match choices.choices_type {
            ChoicesType::Static => match &choices.value {
                Value::Array(items) => Ok(items.clone()),
                Value::Object(map) => {
                    let reference = details
                        .key_reference
                        .as_deref()
                        .ok_or_else(|| choice_error("static map without key_reference".into()))?;
                    let selector = resolve_argument(ctx.request, &format!("${{{reference}}}"))
                        .map_err(choice_error)?;
                    match map.get(&selector) {
                        Some(Value::Array(items)) => Ok(items.clone()),
                        Some(other) => Ok(vec![other.clone()]),
                        None => Err(choice_error(format!("no choices for '{selector}'"))),
                    }
                }
                other => Err(choice_error(format!("unsupported static choices {other}"))),
            },

            ChoicesType::Url => {
                let address = details
                    .address
                    .ok_or_else(|| choice_error("url choices without address".into()))?;
                let query = details
                    .args
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), resolve_argument(ctx.request, v)?)))
                    .collect::<Result<Vec<_>, String>>()
                    .map_err(choice_error)?;
                debug!(key, address = %address, "Fetching url choices");
                let body: Value = self
                    .http
                    .get(&address)
                    .query(&query)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| choice_error(format!("GET {address} failed: {e}")))?
                    .json()
                    .await
                    .map_err(|e| choice_error(format!("GET {address} returned invalid JSON: {e}")))?;
                allowed_from_output(body).map_err(choice_error)
            }

            ChoicesType::Command => {
                let Some(source) = ctx.source else {
                    return Err(choice_error("command choices are not available here".into()));
                };
                if ctx.depth + 1 > self.max_depth {
                    return Err(choice_error(format!(
                        "choices recursion deeper than {}",
                        self.max_depth
                    )));
                }
                let name = details
                    .name
                    .ok_or_else(|| choice_error("command choices without a command".into()))?;
                let mut sub = Request::new(
                    &ctx.request.system,
                    &ctx.request.system_version,
                    &ctx.request.instance_name,
                    name,
                );
                for (k, v) in &details.args {
                    let resolved = resolve_argument(ctx.request, v).map_err(choice_error)?;
                    sub.parameters.insert(k.clone(), Value::String(resolved));
                }

                let done = source
                    .run_choices_command(sub, ctx.depth + 1)
                    .await
                    .map_err(|e| choice_error(format!("choices command failed: {e}")))?;
                if done.status != RequestStatus::Success {
                    return Err(choice_error(format!(
                        "choices command finished {}",
                        done.status
                    )));
                }
                let output = done.output.unwrap_or_default();
                let parsed: Value = serde_json::from_str(&output)
                    .map_err(|e| choice_error(format!("choices output is not JSON: {e}")))?;
                allowed_from_output(parsed).map_err(choice_error)
            }
        }
    }
}
