//! Handler contract (spec §6).
//!
//! Handlers are external collaborators: digest generation, notification
//! delivery, cleanup, health checks and so on are out of scope for this
//! crate (spec §1). The engine only needs a type-tagged `validate`/`handle`
//! pair to dispatch against.
//!
//! Crash recovery demotes interrupted `Running` jobs back to `Queued`
//! (spec §4.1 "Recovery on startup") and re-executes them from scratch.
//! Handlers **must be idempotent** with respect to their `params` — this is
//! an open question in the distillation (spec §9 (b)) resolved here as a
//! documented requirement rather than an enforced one.

use crate::cancel::CancelToken;
use crate::job::Job;
use async_trait::async_trait;
use serde_json::Value;

/// Outcome of a handler's `handle` call.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Ok { data: Option<Value> },
    Err { message: String },
}

impl HandlerOutcome {
    pub fn ok() -> Self {
        HandlerOutcome::Ok { data: None }
    }

    pub fn ok_with(data: Value) -> Self {
        HandlerOutcome::Ok { data: Some(data) }
    }

    pub fn err(message: impl Into<String>) -> Self {
        HandlerOutcome::Err {
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, HandlerOutcome::Ok { .. })
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Pure, fast, no I/O (spec §6). Default accepts everything.
    fn validate(&self, _params: &serde_json::Map<String, Value>) -> bool {
        true
    }

    /// May block or suspend. `cancel` is signalled by `cancelJob` and by the
    /// Processor's `jobTimeout`; well-behaved handlers poll
    /// `cancel.is_cancelled()` (or `.await cancel.cancelled()`) between
    /// logical steps. A handler that ignores it is still counted
    /// Cancelled/Failed once `handle` returns or the timeout elapses.
    async fn handle(&self, job: &Job, cancel: &CancelToken) -> HandlerOutcome;
}
