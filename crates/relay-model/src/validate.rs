// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Structural invariants checked before anything is stored.

use std::collections::HashSet;

use serde_json::Value;

use crate::error::ModelError;
use crate::job::Job;
use crate::request::Request;
use crate::system::{ChoicesType, Parameter, System};

impl System {
    /// Checks names, uniqueness, the instance bound and choices shapes.
    pub fn validate(&self) -> Result<(), ModelError> {
        require("system", "name", &self.name)?;
        require("system", "version", &self.version)?;

        if self.instances.len() > self.max_instances {
            return Err(ModelError::TooManyInstances {
                count: self.instances.len(),
                max: self.max_instances,
            });
        }

        unique("instance", self.instances.iter().map(|i| i.name.as_str()))?;
        for instance in &self.instances {
            require("instance", "name", &instance.name)?;
        }

        unique("command", self.commands.iter().map(|c| c.name.as_str()))?;
        for command in &self.commands {
            require("command", "name", &command.name)?;
            validate_parameters(&command.parameters)?;
        }
        Ok(())
    }
}

fn validate_parameters(parameters: &[Parameter]) -> Result<(), ModelError> {
    unique("parameter", parameters.iter().map(|p| p.key.as_str()))?;
    for parameter in parameters {
        require("parameter", "key", &parameter.key)?;
        if let Some(choices) = &parameter.choices {
            let ok = match choices.choices_type {
                ChoicesType::Static => matches!(choices.value, Value::Array(_) | Value::Object(_)),
                ChoicesType::Url | ChoicesType::Command => {
                    matches!(choices.value, Value::String(_) | Value::Object(_))
                }
            };
            if !ok {
                return Err(ModelError::MalformedChoices {
                    key: parameter.key.clone(),
                    reason: format!(
                        "{} choices cannot be a {}",
                        choices.choices_type,
                        json_kind(&choices.value)
                    ),
                });
            }
        }
        validate_parameters(&parameter.parameters)?;
    }
    Ok(())
}

impl Request {
    /// Checks required fields and the parent flag.
    pub fn validate(&self) -> Result<(), ModelError> {
        require("request", "system", &self.system)?;
        require("request", "system_version", &self.system_version)?;
        require("request", "instance_name", &self.instance_name)?;
        require("request", "command", &self.command)?;
        if self.has_parent != self.parent.is_some() {
            return Err(ModelError::ParentMismatch {
                has_parent: self.has_parent,
            });
        }
        Ok(())
    }
}

impl Job {
    /// Checks the name and the embedded template.
    pub fn validate(&self) -> Result<(), ModelError> {
        require("job", "name", &self.name)?;
        self.request_template.to_request().validate()
    }
}

fn require(entity: &'static str, field: &'static str, value: &str) -> Result<(), ModelError> {
    if value.trim().is_empty() {
        return Err(ModelError::EmptyField { entity, field });
    }
    Ok(())
}

fn unique<'a>(
    entity: &'static str,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), ModelError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ModelError::DuplicateName {
                entity,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{Choices, Command, Instance};
    use serde_json::json;

    fn system() -> System {
        let mut system = System::new("echo", "1.0.0");
        system.commands.push(Command {
            name: "say".into(),
            parameters: vec![Parameter {
                key: "message".into(),
                ..Default::default()
            }],
            ..Default::default()
        });
        system.instances.push(Instance::new("default"));
        system
    }

    #[test]
    fn test_valid_system() {
        assert!(system().validate().is_ok());
    }

    #[test]
    fn test_duplicate_command_rejected() {
        let mut s = system();
        s.commands.push(s.commands[0].clone());
        assert!(matches!(
            s.validate(),
            Err(ModelError::DuplicateName { entity: "command", .. })
        ));
    }

    #[test]
    fn test_too_many_instances() {
        let mut s = system();
        s.instances.push(Instance::new("second"));
        assert_eq!(
            s.validate(),
            Err(ModelError::TooManyInstances { count: 2, max: 1 })
        );
        s.max_instances = 2;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_nested_parameter_keys_unique() {
        let mut s = system();
        let nested = Parameter {
            key: "inner".into(),
            ..Default::default()
        };
        s.commands[0].parameters[0].parameters = vec![nested.clone(), nested];
        assert!(matches!(
            s.validate(),
            Err(ModelError::DuplicateName { entity: "parameter", .. })
        ));
    }

    #[test]
    fn test_static_choices_must_be_list_or_map() {
        let mut s = system();
        s.commands[0].parameters[0].choices = Some(Choices {
            value: json!("a,b"),
            ..Default::default()
        });
        assert!(matches!(
            s.validate(),
            Err(ModelError::MalformedChoices { .. })
        ));
    }

    #[test]
    fn test_request_parent_flag_checked() {
        let mut req = Request::new("echo", "1.0.0", "default", "say");
        req.has_parent = true;
        assert!(matches!(
            req.validate(),
            Err(ModelError::ParentMismatch { has_parent: true })
        ));
    }
}
