//! Session-scoped working context.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A recorded change to a file during the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    #[serde(rename = "type")]
    pub change_type: String,
    pub diff: String,
    pub timestamp: DateTime<Utc>,
}

/// A decision and the reason for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Scratch record for the current session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkingContext {
    pub session_id: Option<String>,
    pub current_task: Option<serde_json::Value>,
    /// Latest change per path.
    pub file_changes: BTreeMap<String, FileChange>,
    /// In the order they were made.
    pub decisions: Vec<Decision>,
}

impl WorkingContext {
    pub fn record_file_change(
        &mut self,
        path: impl Into<String>,
        change_type: impl Into<String>,
        diff: impl Into<String>,
    ) {
        self.file_changes.insert(
            path.into(),
            FileChange {
                change_type: change_type.into(),
                diff: diff.into(),
                timestamp: Utc::now(),
            },
        );
    }

    pub fn record_decision(&mut self, decision: impl Into<String>, reason: impl Into<String>) {
        self.decisions.push(Decision {
            decision: decision.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
