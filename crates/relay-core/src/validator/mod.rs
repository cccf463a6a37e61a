// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request validation.
//!
//! [`RequestValidator::validate`] checks a request against the catalog in a
//! fixed order:
//!
//! 1. system `(name, version)` and instance name
//! 2. command, filling or checking `command_type` and `output_type`
//! 3. parameters: unknown keys, defaults, required and null checks, type
//!    coercion, `multi`, bounds, regex and strict choices
//!
//! Nothing is written or published here. Command-typed choices run a
//! sub-request through a [`CommandChoicesSource`], which re-enters the
//! validator one level deeper; the depth is capped.

mod choices;
mod params;

pub use self::choices::{
    cache_choice_details, parse_choices, parse_command_expression, parse_url_expression,
};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use relay_model::{Parameter, ParameterType, Request};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::catalog::Catalog;

/// Default cap on nested command-choices lookups.
pub const DEFAULT_MAX_DEPTH: usize = 5;

/// Which limit a value broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// Below `minimum`.
    Minimum,
    /// Above `maximum`.
    Maximum,
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minimum => f.write_str("minimum"),
            Self::Maximum => f.write_str("maximum"),
        }
    }
}

/// Validation failures.
#[derive(Debug, Clone, Error, PartialEq)]
#[non_exhaustive]
pub enum ValidationError {
    /// No system with that name and version.
    #[error("unknown system {system}-{version}")]
    UnknownSystem {
        /// System name.
        system: String,
        /// System version.
        version: String,
    },

    /// The system has no instance of that name.
    #[error("system {system} has no instance '{instance}'")]
    UnknownInstance {
        /// `name-version` of the system.
        system: String,
        /// Requested instance.
        instance: String,
    },

    /// The system has no command of that name.
    #[error("system {system} has no command '{command}'")]
    UnknownCommand {
        /// `name-version` of the system.
        system: String,
        /// Requested command.
        command: String,
    },

    /// `command_type` or `output_type` disagrees with the command.
    #[error("{field} mismatch: command declares {expected}, request has {actual}")]
    TypeMismatch {
        /// Field name.
        field: &'static str,
        /// Declared value.
        expected: String,
        /// Supplied value.
        actual: String,
    },

    /// A supplied parameter is not declared.
    #[error("unknown parameter '{key}'")]
    UnknownParameter {
        /// Parameter path.
        key: String,
    },

    /// A required parameter has no value and no default.
    #[error("missing required parameter '{key}'")]
    MissingRequired {
        /// Parameter path.
        key: String,
    },

    /// Null supplied for a non-nullable parameter.
    #[error("parameter '{key}' is not nullable")]
    NullNotAllowed {
        /// Parameter path.
        key: String,
    },

    /// Value cannot be coerced to the declared type.
    #[error("parameter '{key}' expects {expected}, got {value}")]
    TypeError {
        /// Parameter path.
        key: String,
        /// Declared type.
        expected: String,
        /// Offending value.
        value: String,
    },

    /// Value or length outside `minimum`/`maximum`.
    #[error("parameter '{key}' violates {bound} {limit}: got {actual}")]
    BoundsError {
        /// Parameter path.
        key: String,
        /// Which bound.
        bound: Bound,
        /// Declared limit.
        limit: f64,
        /// Value or length checked.
        actual: f64,
    },

    /// String does not match the declared regex.
    #[error("parameter '{key}' fails regex '{pattern}': {reason}")]
    RegexError {
        /// Parameter path.
        key: String,
        /// Declared pattern.
        pattern: String,
        /// What went wrong.
        reason: String,
    },

    /// Choices could not be resolved or the value is not among them.
    #[error("parameter '{key}' choices: {reason}")]
    ChoiceError {
        /// Parameter path.
        key: String,
        /// What went wrong.
        reason: String,
    },
}

impl ValidationError {
    /// Stable error code.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownSystem { .. } => "UNKNOWN_SYSTEM",
            Self::UnknownInstance { .. } => "UNKNOWN_INSTANCE",
            Self::UnknownCommand { .. } => "UNKNOWN_COMMAND",
            _ => "MODEL_VALIDATION_ERROR",
        }
    }
}

/// Runs a choices sub-request to completion.
#[async_trait]
pub trait CommandChoicesSource: Send + Sync {
    /// Validate, dispatch and wait for `request` at recursion `depth`.
    async fn run_choices_command(&self, request: Request, depth: usize) -> crate::Result<Request>;
}

/// State shared by one validation pass.
pub(crate) struct ValidationContext<'a> {
    /// Request as supplied; `${reference}`s resolve against it.
    pub request: &'a Request,
    pub source: Option<&'a dyn CommandChoicesSource>,
    pub depth: usize,
}

/// Schema-driven request validator.
pub struct RequestValidator {
    catalog: Arc<dyn Catalog>,
    http: reqwest::Client,
    max_depth: usize,
}

impl RequestValidator {
    /// Validator reading systems from `catalog`.
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self {
            catalog,
            http: reqwest::Client::new(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Use a preconfigured HTTP client for url choices.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Cap on nested command-choices lookups.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Validate without command-typed choices support.
    pub async fn validate(&self, request: Request) -> crate::Result<Request> {
        self.validate_with(request, None, 0).await
    }

    /// Validate, resolving command choices through `source` at `depth`.
    pub async fn validate_with(
        &self,
        mut request: Request,
        source: Option<&dyn CommandChoicesSource>,
        depth: usize,
    ) -> crate::Result<Request> {
        let system = self
            .catalog
            .find_system(&request.system, &request.system_version)
            .await?
            .ok_or_else(|| ValidationError::UnknownSystem {
                system: request.system.clone(),
                version: request.system_version.clone(),
            })?;

        if !system.has_instance(&request.instance_name) {
            return Err(ValidationError::UnknownInstance {
                system: system.display_key(),
                instance: request.instance_name.clone(),
            }
            .into());
        }

        let command = system
            .command(&request.command)
            .ok_or_else(|| ValidationError::UnknownCommand {
                system: system.display_key(),
                command: request.command.clone(),
            })?;

        match request.command_type {
            None => request.command_type = Some(command.command_type),
            Some(actual) if actual != command.command_type => {
                return Err(ValidationError::TypeMismatch {
                    field: "command_type",
                    expected: command.command_type.to_string(),
                    actual: actual.to_string(),
                }
                .into());
            }
            Some(_) => {}
        }
        match request.output_type {
            None => request.output_type = Some(command.output_type),
            Some(actual) if actual != command.output_type => {
                return Err(ValidationError::TypeMismatch {
                    field: "output_type",
                    expected: command.output_type.to_string(),
                    actual: actual.to_string(),
                }
                .into());
            }
            Some(_) => {}
        }

        let supplied = request.parameters.clone();
        let ctx = ValidationContext {
            request: &request,
            source,
            depth,
        };
        let parameters = self
            .validate_parameters(&ctx, &command.parameters, supplied, String::new())
            .await?;
        request.parameters = parameters;
        Ok(request)
    }

    /// Validate a parameter map against its declarations. Recurses into
    /// dictionaries with nested parameters.
    fn validate_parameters<'a>(
        &'a self,
        ctx: &'a ValidationContext<'a>,
        declared: &'a [Parameter],
        mut supplied: Map<String, Value>,
        prefix: String,
    ) -> BoxFuture<'a, Result<Map<String, Value>, ValidationError>> {
        Box::pin(async move {
            if let Some(unknown) = supplied
                .keys()
                .find(|k| !declared.iter().any(|p| &p.key == *k))
            {
                return Err(ValidationError::UnknownParameter {
                    key: format!("{prefix}{unknown}"),
                });
            }

            let mut validated = Map::new();
            for parameter in declared {
                let path = format!("{prefix}{}", parameter.key);
                let value = match supplied.remove(&parameter.key) {
                    Some(value) => value,
                    None => match &parameter.default {
                        Some(default) => default.clone(),
                        None if parameter.optional => continue,
                        None => return Err(ValidationError::MissingRequired { key: path }),
                    },
                };

                if value.is_null() {
                    if !parameter.nullable {
                        return Err(ValidationError::NullNotAllowed { key: path });
                    }
                    validated.insert(parameter.key.clone(), Value::Null);
                    continue;
                }

                let value = self.validate_value(ctx, parameter, value, &path).await?;
                validated.insert(parameter.key.clone(), value);
            }
            Ok(validated)
        })
    }

    async fn validate_value(
        &self,
        ctx: &ValidationContext<'_>,
        parameter: &Parameter,
        value: Value,
        path: &str,
    ) -> Result<Value, ValidationError> {
        let value = if parameter.multi {
            let Value::Array(items) = value else {
                return Err(ValidationError::TypeError {
                    key: path.to_string(),
                    expected: format!("list of {}", parameter.parameter_type),
                    value: value.to_string(),
                });
            };
            params::check_length_bounds(path, parameter, items.len())?;
            let mut coerced = Vec::with_capacity(items.len());
            for item in items {
                if item.is_null() {
                    if !parameter.nullable {
                        return Err(ValidationError::NullNotAllowed {
                            key: path.to_string(),
                        });
                    }
                    coerced.push(Value::Null);
                    continue;
                }
                let item = self.validate_single(ctx, parameter, item, path).await?;
                params::check_regex(path, parameter, &item)?;
                coerced.push(item);
            }
            Value::Array(coerced)
        } else {
            let value = self.validate_single(ctx, parameter, value, path).await?;
            params::check_value_bounds(path, parameter, &value)?;
            params::check_regex(path, parameter, &value)?;
            value
        };

        if let Some(choices) = &parameter.choices
            && choices.strict
        {
            let allowed = self.allowed_values(path, choices, ctx).await?;
            let members: Vec<&Value> = match &value {
                Value::Array(items) if parameter.multi => items.iter().collect(),
                single => vec![single],
            };
            if let Some(outside) = members
                .into_iter()
                .find(|v| !v.is_null() && !choices::is_allowed(&allowed, v))
            {
                return Err(ValidationError::ChoiceError {
                    key: path.to_string(),
                    reason: format!("{outside} is not a valid choice"),
                });
            }
        }
        Ok(value)
    }

    /// Coerce one element and recurse into nested dictionaries.
    async fn validate_single(
        &self,
        ctx: &ValidationContext<'_>,
        parameter: &Parameter,
        value: Value,
        path: &str,
    ) -> Result<Value, ValidationError> {
        let value = params::coerce(path, parameter.parameter_type, value)?;
        match value {
            Value::Object(map)
                if parameter.parameter_type == ParameterType::Dictionary
                    && !parameter.parameters.is_empty() =>
            {
                let nested = self
                    .validate_parameters(ctx, &parameter.parameters, map, format!("{path}."))
                    .await?;
                Ok(Value::Object(nested))
            }
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::error::Error;
    use relay_model::{
        Choices, ChoicesDetails, ChoicesType, Command, CommandType, Instance, OutputType, System,
    };
    use serde_json::json;

    fn param(key: &str, parameter_type: ParameterType) -> Parameter {
        Parameter {
            key: key.into(),
            parameter_type,
            ..Default::default()
        }
    }

    async fn validator_with(commands: Vec<Command>) -> RequestValidator {
        let catalog = Arc::new(MemoryCatalog::new());
        let mut system = System::new("echo", "1.0.0");
        system.instances.push(Instance::new("default"));
        system.commands = commands;
        catalog.create_system(system).await.unwrap();
        RequestValidator::new(catalog)
    }

    fn command(name: &str, parameters: Vec<Parameter>) -> Command {
        Command {
            name: name.into(),
            parameters,
            ..Default::default()
        }
    }

    fn request(command: &str) -> Request {
        Request::new("echo", "1.0.0", "default", command)
    }

    fn validation(err: Error) -> ValidationError {
        match err {
            Error::Validation(e) => e,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lookup_failures() {
        let v = validator_with(vec![command("say", vec![])]).await;

        let err = v
            .validate(Request::new("nope", "1.0.0", "default", "say"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "UNKNOWN_SYSTEM");

        let err = v
            .validate(Request::new("echo", "1.0.0", "other", "say"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "UNKNOWN_INSTANCE");

        let err = v.validate(request("shout")).await.unwrap_err();
        assert_eq!(err.kind(), "UNKNOWN_COMMAND");
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_types_filled_and_checked() {
        let mut say = command("say", vec![]);
        say.command_type = CommandType::Info;
        say.output_type = OutputType::Json;
        let v = validator_with(vec![say]).await;

        let ok = v.validate(request("say")).await.unwrap();
        assert_eq!(ok.command_type, Some(CommandType::Info));
        assert_eq!(ok.output_type, Some(OutputType::Json));

        let mut wrong = request("say");
        wrong.command_type = Some(CommandType::Action);
        let err = validation(v.validate(wrong).await.unwrap_err());
        assert!(matches!(
            err,
            ValidationError::TypeMismatch {
                field: "command_type",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_required_default_and_unknown() {
        let mut greeting = param("greeting", ParameterType::String);
        greeting.default = Some(json!("hello"));
        let v = validator_with(vec![command(
            "say",
            vec![param("message", ParameterType::String), greeting],
        )])
        .await;

        let err = validation(v.validate(request("say")).await.unwrap_err());
        assert_eq!(
            err,
            ValidationError::MissingRequired {
                key: "message".into()
            }
        );

        let ok = v
            .validate(request("say").with_parameter("message", json!("hi")))
            .await
            .unwrap();
        assert_eq!(ok.parameters["greeting"], json!("hello"));

        let err = validation(
            v.validate(
                request("say")
                    .with_parameter("message", json!("hi"))
                    .with_parameter("volume", json!(11)),
            )
            .await
            .unwrap_err(),
        );
        assert!(matches!(err, ValidationError::UnknownParameter { .. }));
    }

    #[tokio::test]
    async fn test_nullability() {
        let mut nullable = param("note", ParameterType::String);
        nullable.nullable = true;
        let v = validator_with(vec![command(
            "say",
            vec![param("message", ParameterType::String), nullable],
        )])
        .await;

        let err = validation(
            v.validate(request("say").with_parameter("message", Value::Null))
                .await
                .unwrap_err(),
        );
        assert!(matches!(err, ValidationError::NullNotAllowed { .. }));

        let ok = v
            .validate(
                request("say")
                    .with_parameter("message", json!("hi"))
                    .with_parameter("note", Value::Null),
            )
            .await
            .unwrap();
        assert_eq!(ok.parameters["note"], Value::Null);
    }

    #[tokio::test]
    async fn test_multi_and_nested_dictionary() {
        let mut tags = param("tags", ParameterType::Integer);
        tags.multi = true;
        tags.maximum = Some(2.0);

        let mut options = param("options", ParameterType::Dictionary);
        options.parameters = vec![param("depth", ParameterType::Integer)];

        let v = validator_with(vec![command("run", vec![tags, options])]).await;

        let ok = v
            .validate(
                request("run")
                    .with_parameter("tags", json!([1, "2"]))
                    .with_parameter("options", json!({"depth": 3.0})),
            )
            .await
            .unwrap();
        assert_eq!(ok.parameters["tags"], json!([1, 2]));
        assert_eq!(ok.parameters["options"], json!({"depth": 3}));

        let err = validation(
            v.validate(
                request("run")
                    .with_parameter("tags", json!(1))
                    .with_parameter("options", json!({"depth": 1})),
            )
            .await
            .unwrap_err(),
        );
        assert!(matches!(err, ValidationError::TypeError { .. }));

        let err = validation(
            v.validate(
                request("run")
                    .with_parameter("tags", json!([1, 2, 3]))
                    .with_parameter("options", json!({"depth": 1})),
            )
            .await
            .unwrap_err(),
        );
        assert!(matches!(
            err,
            ValidationError::BoundsError {
                bound: Bound::Maximum,
                ..
            }
        ));

        let err = validation(
            v.validate(
                request("run")
                    .with_parameter("tags", json!([]))
                    .with_parameter("options", json!({"depth": 1, "width": 2})),
            )
            .await
            .unwrap_err(),
        );
        assert_eq!(
            err,
            ValidationError::UnknownParameter {
                key: "options.width".into()
            }
        );
    }

    #[tokio::test]
    async fn test_static_list_choices() {
        let mut color = param("color", ParameterType::String);
        color.choices = Some(Choices {
            choices_type: ChoicesType::Static,
            value: json!(["red", "green"]),
            strict: true,
            ..Default::default()
        });
        let mut loose = param("shade", ParameterType::String);
        loose.optional = true;
        loose.choices = Some(Choices {
            value: json!(["dark"]),
            strict: false,
            ..Default::default()
        });
        let v = validator_with(vec![command("paint", vec![color, loose])]).await;

        assert!(
            v.validate(
                request("paint")
                    .with_parameter("color", json!("red"))
                    .with_parameter("shade", json!("light"))
            )
            .await
            .is_ok()
        );
        let err = validation(
            v.validate(request("paint").with_parameter("color", json!("blue")))
                .await
                .unwrap_err(),
        );
        assert!(matches!(err, ValidationError::ChoiceError { .. }));
    }

    #[tokio::test]
    async fn test_instance_keyed_choices() {
        let mut region = param("region", ParameterType::String);
        region.choices = Some(Choices {
            value: json!({"default": ["eu"], "other": ["us"]}),
            strict: true,
            details: ChoicesDetails {
                key_reference: Some("instance_name".into()),
                ..Default::default()
            },
            ..Default::default()
        });
        let v = validator_with(vec![command("deploy", vec![region])]).await;

        assert!(
            v.validate(request("deploy").with_parameter("region", json!("eu")))
                .await
                .is_ok()
        );
        assert!(
            v.validate(request("deploy").with_parameter("region", json!("us")))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_command_choices_need_a_source() {
        let mut item = param("item", ParameterType::String);
        item.choices = Some(Choices {
            choices_type: ChoicesType::Command,
            value: json!("list_items"),
            strict: true,
            ..Default::default()
        });
        let v = validator_with(vec![command("pick", vec![item])]).await;
        let err = validation(
            v.validate(request("pick").with_parameter("item", json!("a")))
                .await
                .unwrap_err(),
        );
        assert!(matches!(err, ValidationError::ChoiceError { .. }));
    }
}
