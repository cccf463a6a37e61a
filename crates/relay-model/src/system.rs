// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Systems, commands, parameters and instances.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum whose
/// serde names are the given literals.
macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            /// Wire name of the variant.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_uppercase().as_str() {
                    $(n if n.eq_ignore_ascii_case($name) => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($ty), other)),
                }
            }
        }
    };
}

pub(crate) use string_enum;

/// How a command's requests are handled after dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    /// Changes something; kept longest.
    #[default]
    Action,
    /// Reads something; pruned early.
    Info,
    /// Never persisted.
    Ephemeral,
    /// Internal administrative command.
    Admin,
    /// Temporary request, e.g. a choices lookup.
    Temp,
}

string_enum!(CommandType {
    Action => "ACTION",
    Info => "INFO",
    Ephemeral => "EPHEMERAL",
    Admin => "ADMIN",
    Temp => "TEMP",
});

/// Format of a command's output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputType {
    /// Plain text.
    #[default]
    String,
    /// JSON document.
    Json,
    /// XML document.
    Xml,
    /// HTML fragment.
    Html,
    /// JavaScript source.
    Js,
    /// CSS source.
    Css,
}

string_enum!(OutputType {
    String => "STRING",
    Json => "JSON",
    Xml => "XML",
    Html => "HTML",
    Js => "JS",
    Css => "CSS",
});

/// Declared type of a command parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParameterType {
    /// Text.
    #[default]
    String,
    /// Whole number.
    Integer,
    /// Floating point number.
    Float,
    /// `true` or `false`.
    Boolean,
    /// Anything, passed through untouched.
    Any,
    /// JSON object, optionally with nested parameters.
    Dictionary,
    /// Calendar date, stored as epoch milliseconds.
    Date,
    /// Timestamp, stored as epoch milliseconds.
    Datetime,
}

string_enum!(ParameterType {
    String => "STRING",
    Integer => "INTEGER",
    Float => "FLOAT",
    Boolean => "BOOLEAN",
    Any => "ANY",
    Dictionary => "DICTIONARY",
    Date => "DATE",
    Datetime => "DATETIME",
});

/// Where a parameter's allowed values come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChoicesType {
    /// Literal list, or a map selected by another parameter.
    #[default]
    Static,
    /// Fetched with an HTTP GET.
    Url,
    /// Produced by running another command.
    Command,
}

string_enum!(ChoicesType {
    Static => "static",
    Url => "url",
    Command => "command",
});

/// UI hint for rendering choices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChoicesDisplay {
    /// Drop-down list.
    #[default]
    Select,
    /// Free text with suggestions.
    Typeahead,
}

/// Lifecycle state of a plugin instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Registered, queues being prepared.
    #[default]
    Initializing,
    /// Process launched, not yet reporting.
    Starting,
    /// Reporting heartbeats.
    Running,
    /// Administratively paused.
    Paused,
    /// Asked to shut down.
    Stopping,
    /// Shut down cleanly.
    Stopped,
    /// Exited or killed.
    Dead,
    /// Heartbeats overdue.
    Unresponsive,
    /// Not known.
    Unknown,
}

string_enum!(InstanceStatus {
    Initializing => "INITIALIZING",
    Starting => "STARTING",
    Running => "RUNNING",
    Paused => "PAUSED",
    Stopping => "STOPPING",
    Stopped => "STOPPED",
    Dead => "DEAD",
    Unresponsive => "UNRESPONSIVE",
    Unknown => "UNKNOWN",
});

impl InstanceStatus {
    /// `STOPPED` or `DEAD`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Dead)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// A stopping or finished instance cannot be promoted back to
    /// `RUNNING` (or demoted to `UNRESPONSIVE`) without first being
    /// restarted through `STARTING` or `INITIALIZING`.
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        if *self == next {
            return true;
        }
        !matches!(
            (self, next),
            (Stopping, Running | Unresponsive | Paused)
                | (Stopped | Dead, Running | Unresponsive | Paused | Stopping)
        )
    }
}

/// Static or dynamic value constraint on a parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Choices {
    /// Source of the values.
    #[serde(rename = "type", default)]
    pub choices_type: ChoicesType,
    /// UI hint.
    #[serde(default)]
    pub display: ChoicesDisplay,
    /// List, map, URL expression or command expression depending on type.
    #[serde(default)]
    pub value: Value,
    /// Reject values outside the resolved set.
    #[serde(default = "default_true")]
    pub strict: bool,
    /// Parsed form of `value` for dynamic choices.
    #[serde(default)]
    pub details: ChoicesDetails,
}

/// Parsed choices expression.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChoicesDetails {
    /// Parameter (or `instance_name`) selecting a key of a static map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_reference: Option<String>,
    /// URL for url choices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Command name for command choices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Argument name to `${reference}` or literal.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<(String, String)>,
}

impl ChoicesDetails {
    /// True when nothing has been parsed yet.
    pub fn is_empty(&self) -> bool {
        self.key_reference.is_none()
            && self.address.is_none()
            && self.name.is_none()
            && self.args.is_empty()
    }
}

/// One declared input of a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Key in the request's parameter map.
    pub key: String,
    /// Declared type.
    #[serde(rename = "type", default)]
    pub parameter_type: ParameterType,
    /// Value is a list of `parameter_type`.
    #[serde(default)]
    pub multi: bool,
    /// Label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// May be omitted.
    #[serde(default)]
    pub optional: bool,
    /// Used when the request omits the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Free text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Value constraint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Choices>,
    /// May be explicitly null.
    #[serde(default)]
    pub nullable: bool,
    /// Upper bound: length for sequences, value for numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    /// Lower bound: length for sequences, value for numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    /// Pattern strings must match from their start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    /// Nested parameters of a `DICTIONARY`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
}

/// A named operation a system accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Unique within the owning system.
    pub name: String,
    /// Free text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared inputs.
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    /// Retention class.
    #[serde(default)]
    pub command_type: CommandType,
    /// Output format.
    #[serde(default)]
    pub output_type: OutputType,
    /// Custom UI schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    /// Custom UI form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form: Option<Value>,
    /// Custom UI template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Hide from listings.
    #[serde(default)]
    pub hidden: bool,
}

impl Command {
    /// Top-level parameter by key.
    pub fn parameter(&self, key: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.key == key)
    }
}

/// Queue declaration arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueArgs {
    /// Survives broker restarts.
    #[serde(default)]
    pub durable: bool,
    /// Deleted when the last consumer leaves.
    #[serde(default)]
    pub auto_delete: bool,
    /// Broker-specific arguments, e.g. `x-max-priority`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub arguments: BTreeMap<String, Value>,
}

/// A declared queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueDefinition {
    /// Queue name.
    pub name: String,
    /// Declaration arguments.
    #[serde(default)]
    pub args: QueueArgs,
}

/// Broker coordinates handed to an instance at initialisation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueInfo {
    /// Administrative queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<QueueDefinition>,
    /// Request queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<QueueDefinition>,
    /// Broker connection URL for the plugin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Liveness bookkeeping for an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    /// Most recent heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<DateTime<Utc>>,
}

/// One running copy of a system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Catalog id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Unique within the owning system.
    pub name: String,
    /// Free text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Lifecycle state.
    #[serde(default)]
    pub status: InstanceStatus,
    /// Heartbeat bookkeeping.
    #[serde(default)]
    pub status_info: StatusInfo,
    /// Broker kind the queues live on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_type: Option<String>,
    /// Queue coordinates.
    #[serde(default)]
    pub queue_info: QueueInfo,
    /// Icon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_name: Option<String>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Instance {
    /// New instance in `INITIALIZING`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A versioned plugin type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct System {
    /// Catalog id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Name; (name, version) is unique.
    pub name: String,
    /// Version string.
    pub version: String,
    /// Free text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Upper bound on `instances`.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    /// Icon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_name: Option<String>,
    /// Label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Loaded from the local plugin directory.
    #[serde(default)]
    pub local: bool,
    /// Declared commands.
    #[serde(default)]
    pub commands: Vec<Command>,
    /// Running copies.
    #[serde(default)]
    pub instances: Vec<Instance>,
}

impl System {
    /// Empty system with one allowed instance.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            version: version.into(),
            description: None,
            max_instances: default_max_instances(),
            icon_name: None,
            display_name: None,
            metadata: Map::new(),
            local: false,
            commands: Vec::new(),
            instances: Vec::new(),
        }
    }

    /// Command by name.
    pub fn command(&self, name: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.name == name)
    }

    /// Instance by name.
    pub fn instance(&self, name: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.name == name)
    }

    /// Instance by id.
    pub fn instance_by_id(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id.as_deref() == Some(id))
    }

    /// Instance names in declaration order.
    pub fn instance_names(&self) -> Vec<&str> {
        self.instances.iter().map(|i| i.name.as_str()).collect()
    }

    /// Whether an instance with this name exists.
    pub fn has_instance(&self, name: &str) -> bool {
        self.instance(name).is_some()
    }

    /// `name-version`, used in log lines.
    pub fn display_key(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

fn default_max_instances() -> usize {
    1
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_instance_transitions() {
        use InstanceStatus::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Unresponsive.can_transition_to(Running));
        assert!(Running.can_transition_to(Unresponsive));
        assert!(Dead.can_transition_to(Starting));
        assert!(!Stopping.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Dead.can_transition_to(Unresponsive));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopping.can_transition_to(Dead));
    }

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(
            serde_json::to_value(InstanceStatus::Unresponsive).unwrap(),
            json!("UNRESPONSIVE")
        );
        assert_eq!(
            serde_json::to_value(ChoicesType::Url).unwrap(),
            json!("url")
        );
        assert_eq!("info".parse::<CommandType>().unwrap(), CommandType::Info);
        assert!("bogus".parse::<ParameterType>().is_err());
    }

    #[test]
    fn test_system_defaults_from_sparse_document() {
        let system: System = serde_json::from_value(json!({
            "name": "echo",
            "version": "1.0.0",
            "commands": [{
                "name": "say",
                "parameters": [{"key": "message", "type": "STRING"}]
            }]
        }))
        .unwrap();

        assert_eq!(system.max_instances, 1);
        let say = system.command("say").unwrap();
        assert_eq!(say.command_type, CommandType::Action);
        assert_eq!(say.output_type, OutputType::String);
        let message = say.parameter("message").unwrap();
        assert!(!message.optional);
        assert!(!message.nullable);
        assert!(message.choices.is_none());
    }

    #[test]
    fn test_choices_strict_by_default() {
        let choices: Choices =
            serde_json::from_value(json!({"type": "static", "value": ["a", "b"]})).unwrap();
        assert!(choices.strict);
        assert!(choices.details.is_empty());
    }
}
