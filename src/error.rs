use thiserror::Error;

use crate::types::{ExternalCompactionId, TabletExtent};

/// Errors surfaced by the compaction scheduling core.
///
/// The scheduler loop swallows these and backs off; they do surface from the
/// manager constructor (malformed startup configuration) and from the
/// remote-compactor entry points.
#[non_exhaustive]
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("Malformed compaction service configuration: {msg}")]
    Config { msg: String },

    #[error("No planner registered under name '{name}'")]
    PlannerNotFound { name: String },

    #[error("Planner error: {msg}")]
    Planner { msg: String },

    #[error(
        "Unexpected extent for external compaction {ecid}: stored {stored}, caller provided {provided}"
    )]
    ExtentMismatch {
        ecid: ExternalCompactionId,
        stored: TabletExtent,
        provided: TabletExtent,
    },

    #[error("Tablet error: {msg}")]
    Tablet { msg: String },

    #[error("background task panicked")]
    BackgroundTaskPanic,
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config { msg: msg.into() }
    }

    pub(crate) fn planner(msg: impl Into<String>) -> Self {
        Self::Planner { msg: msg.into() }
    }
}
