// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduled jobs.
//!
//! Only the data shape lives here; scheduling is done elsewhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::request::Request;
use crate::system::{CommandType, OutputType};

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trigger_type", rename_all = "lowercase")]
pub enum Trigger {
    /// Fire once.
    Date {
        /// Fire time.
        run_date: DateTime<Utc>,
        /// Zone name for display.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    /// Fire every fixed period.
    Interval {
        /// Weeks component.
        #[serde(default)]
        weeks: u32,
        /// Days component.
        #[serde(default)]
        days: u32,
        /// Hours component.
        #[serde(default)]
        hours: u32,
        /// Minutes component.
        #[serde(default)]
        minutes: u32,
        /// Seconds component.
        #[serde(default)]
        seconds: u32,
        /// First fire no earlier than this.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_date: Option<DateTime<Utc>>,
        /// No fire after this.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_date: Option<DateTime<Utc>>,
        /// Random delay bound in seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter: Option<u32>,
    },
    /// Fire on a cron schedule. Unset fields mean "every".
    Cron {
        /// Year expression.
        #[serde(default = "every")]
        year: String,
        /// Month expression.
        #[serde(default = "every")]
        month: String,
        /// Day-of-month expression.
        #[serde(default = "every")]
        day: String,
        /// ISO week expression.
        #[serde(default = "every")]
        week: String,
        /// Day-of-week expression.
        #[serde(default = "every")]
        day_of_week: String,
        /// Hour expression.
        #[serde(default = "every")]
        hour: String,
        /// Minute expression.
        #[serde(default = "zero")]
        minute: String,
        /// Second expression.
        #[serde(default = "zero")]
        second: String,
        /// First fire no earlier than this.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_date: Option<DateTime<Utc>>,
        /// No fire after this.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_date: Option<DateTime<Utc>>,
        /// Zone name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
        /// Random delay bound in seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter: Option<u32>,
    },
}

impl Trigger {
    /// Total period of an interval trigger in seconds.
    pub fn interval_seconds(&self) -> Option<u64> {
        match self {
            Self::Interval {
                weeks,
                days,
                hours,
                minutes,
                seconds,
                ..
            } => Some(
                u64::from(*weeks) * 604_800
                    + u64::from(*days) * 86_400
                    + u64::from(*hours) * 3_600
                    + u64::from(*minutes) * 60
                    + u64::from(*seconds),
            ),
            _ => None,
        }
    }
}

fn every() -> String {
    "*".to_string()
}

fn zero() -> String {
    "0".to_string()
}

/// Request fields a job fills in each time it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTemplate {
    /// Target system name.
    pub system: String,
    /// Target system version.
    pub system_version: String,
    /// Target instance name.
    pub instance_name: String,
    /// Command name.
    pub command: String,
    /// Parameter values.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Free text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Retention class override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_type: Option<CommandType>,
    /// Output format override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<OutputType>,
}

impl RequestTemplate {
    /// Fresh request built from the template.
    pub fn to_request(&self) -> Request {
        let mut request = Request::new(
            &self.system,
            &self.system_version,
            &self.instance_name,
            &self.command,
        );
        request.parameters = self.parameters.clone();
        request.comment = self.comment.clone();
        request.metadata = self.metadata.clone();
        request.command_type = self.command_type;
        request.output_type = self.output_type;
        request
    }
}

/// Whether a job fires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Scheduled.
    #[default]
    Running,
    /// Suspended.
    Paused,
}

/// A scheduled request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Catalog id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Display name.
    pub name: String,
    /// Schedule.
    pub trigger: Trigger,
    /// What to send.
    pub request_template: RequestTemplate,
    /// Seconds a late fire is still honoured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub misfire_grace_time: Option<u64>,
    /// Collapse missed fires into one.
    #[serde(default)]
    pub coalesce: bool,
    /// Next scheduled fire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_time: Option<DateTime<Utc>>,
    /// Concurrent runs allowed.
    #[serde(default = "default_job_instances")]
    pub max_instances: u32,
    /// Fires that ended in `SUCCESS`.
    #[serde(default)]
    pub success_count: u64,
    /// Fires that ended in `ERROR`.
    #[serde(default)]
    pub error_count: u64,
    /// Running or paused.
    #[serde(default)]
    pub status: JobStatus,
}

fn default_job_instances() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cron_fields_default() {
        let trigger: Trigger =
            serde_json::from_value(json!({"trigger_type": "cron", "hour": "*/2"})).unwrap();
        match trigger {
            Trigger::Cron {
                hour, minute, day, ..
            } => {
                assert_eq!(hour, "*/2");
                assert_eq!(minute, "0");
                assert_eq!(day, "*");
            }
            other => panic!("unexpected trigger {other:?}"),
        }
    }

    #[test]
    fn test_interval_seconds() {
        let trigger: Trigger = serde_json::from_value(
            json!({"trigger_type": "interval", "hours": 1, "minutes": 30}),
        )
        .unwrap();
        assert_eq!(trigger.interval_seconds(), Some(5_400));
    }

    #[test]
    fn test_template_builds_fresh_request() {
        let template = RequestTemplate {
            system: "echo".into(),
            system_version: "1.0.0".into(),
            instance_name: "default".into(),
            command: "say".into(),
            parameters: json!({"message": "hi"}).as_object().cloned().unwrap(),
            comment: None,
            metadata: Map::new(),
            command_type: None,
            output_type: None,
        };
        let request = template.to_request();
        assert!(request.id.is_none());
        assert_eq!(request.parameters["message"], json!("hi"));
    }
}
