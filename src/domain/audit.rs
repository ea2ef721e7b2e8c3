use crate::domain::payment_request::PaymentState;
use crate::error::Result;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionSource {
    Callback,
    Sweep,
    Cancellation,
    ProviderError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    Created {
        order_reference: String,
    },
    /// The provider assigned its own reference for a request created under a
    /// locally generated id; subsequent entries use the new id.
    Reassigned {
        previous: String,
    },
    Transition {
        from: PaymentState,
        to: PaymentState,
        source: TransitionSource,
    },
    Duplicate {
        state: PaymentState,
    },
    Conflict {
        recorded: PaymentState,
        reported_success: bool,
    },
    /// A structurally valid callback no known request matches. The payload
    /// is kept here since there is no record to retain it on; resolving
    /// these is a manual job.
    Unmatched {
        payload: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub correlation_id: String,
    pub attempted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

impl AuditEntry {
    pub fn now(correlation_id: impl Into<String>, event: AuditEvent) -> Self {
        AuditEntry {
            correlation_id: correlation_id.into(),
            attempted_at: Utc::now(),
            event,
        }
    }
}

/// Append-only transition log. Append is the only mutation; entries are
/// never edited or removed. With a sink attached, every entry is also
/// written as one JSON line so the record map can be rebuilt after a
/// restart.
pub struct AuditLog {
    entries: Vec<AuditEntry>,
    sink: Option<File>,
}

impl AuditLog {
    pub fn new() -> Self {
        AuditLog {
            entries: Vec::new(),
            sink: None,
        }
    }

    pub fn with_sink<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(AuditLog {
            entries: Vec::new(),
            sink: Some(file),
        })
    }

    pub fn append(&mut self, entry: AuditEntry) -> Result<()> {
        if let Some(sink) = self.sink.as_mut() {
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            sink.write_all(&line)?;
            sink.flush()?;
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn entries_for(&self, correlation_id: &str) -> Vec<&AuditEntry> {
        self.entries
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn replay_states(&self) -> IndexMap<String, PaymentState> {
        replay(&self.entries)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Vec<AuditEntry>> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        AuditLog::new()
    }
}

/// Rebuilds the correlation-id to state map from log entries alone, in the
/// order requests were first seen. Duplicate, conflict, and unmatched
/// entries carry no state change.
pub fn replay(entries: &[AuditEntry]) -> IndexMap<String, PaymentState> {
    let mut states = IndexMap::new();
    for entry in entries {
        match &entry.event {
            AuditEvent::Created { .. } => {
                states.insert(entry.correlation_id.clone(), PaymentState::Pending);
            }
            AuditEvent::Reassigned { previous } => {
                let state = states
                    .shift_remove(previous.as_str())
                    .unwrap_or(PaymentState::Pending);
                states.insert(entry.correlation_id.clone(), state);
            }
            AuditEvent::Transition { to, .. } => {
                states.insert(entry.correlation_id.clone(), *to);
            }
            AuditEvent::Duplicate { .. }
            | AuditEvent::Conflict { .. }
            | AuditEvent::Unmatched { .. } => {}
        }
    }
    states
}
