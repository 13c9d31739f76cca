//! Invocation triggers.
//!
//! A hook runs because something happened outside the sandbox: an HTTP
//! request arrived, a cron schedule fired, or a record changed.  The trigger
//! is serialized to JSON and handed to the module's `hookbridge_run`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why a hook is being invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// An HTTP request routed to the hook.
    Http {
        method: String,
        path: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        query: BTreeMap<String, String>,
        #[serde(default)]
        body: Value,
    },
    /// A cron schedule fired.
    Cron {
        schedule: String,
        fired_at: DateTime<Utc>,
    },
    /// A record was created, updated or deleted.
    Record {
        collection: String,
        event: RecordEvent,
        record: Value,
    },
}

/// Kind of record change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordEvent {
    Create,
    Update,
    Delete,
}

impl Trigger {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::Cron { .. } => "cron",
            Self::Record { .. } => "record",
        }
    }

    /// A cron trigger firing now.
    pub fn cron(schedule: impl Into<String>) -> Self {
        Self::Cron {
            schedule: schedule.into(),
            fired_at: Utc::now(),
        }
    }
}
