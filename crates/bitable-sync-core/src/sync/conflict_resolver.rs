//! Conflict resolution between concurrent changes to the same record.

use serde::{Deserialize, Serialize};

use crate::sync::types::{ChangeEvent, ChangeSource};

/// How to pick a winner when both stores changed the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Later `detected_at` wins; ties go to the remote change. Remote changes
    /// are timed by the record's last edit, relational ones by when they
    /// were queued.
    #[default]
    LastWriteWins,
    /// The remote change always wins.
    #[serde(alias = "feishu_priority")]
    RemotePriority,
    /// The relational change always wins.
    #[serde(alias = "database_priority")]
    RelationalPriority,
}

impl ConflictStrategy {
    /// Pick the winning change. Pure; neither event is modified.
    pub fn resolve<'a>(&self, a: &'a ChangeEvent, b: &'a ChangeEvent) -> &'a ChangeEvent {
        let preferred = match self {
            ConflictStrategy::LastWriteWins => None,
            ConflictStrategy::RemotePriority => Some(ChangeSource::Remote),
            ConflictStrategy::RelationalPriority => Some(ChangeSource::Relational),
        };

        if let Some(source) = preferred {
            match (a.source == source, b.source == source) {
                (true, false) => return a,
                (false, true) => return b,
                // Same origin on both sides: fall through to timestamps.
                _ => {}
            }
        }
        last_write_wins(a, b)
    }
}

fn last_write_wins<'a>(a: &'a ChangeEvent, b: &'a ChangeEvent) -> &'a ChangeEvent {
    if a.detected_at > b.detected_at {
        return a;
    }
    if b.detected_at > a.detected_at {
        return b;
    }
    if b.source == ChangeSource::Remote && a.source != ChangeSource::Remote {
        b
    } else {
        a
    }
}
