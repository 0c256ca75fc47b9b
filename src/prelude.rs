//! Convenience re-exports for common use.

pub use crate::config::{EchoSuppression, EngineConfig};
pub use crate::engine::{EngineEvent, EngineEventSink, StreamEngine};
pub use crate::error::TetherError;
pub use crate::events::{DecisionBody, RunStreamEvent};
pub use crate::types::{
    ActiveRunInfo, ConversationMessage, DecisionKind, PendingInterrupt, RunId, RunStatus,
    Sender, ToolEvent, ToolEventStatus, TurnId,
};
