//! Interrupt gate: local validation of human decisions and the approval
//! banner rendered into the message text.

use serde_json::Value;

use crate::error::TetherError;
use crate::events::DecisionBody;
use crate::types::{DecisionKind, PendingInterrupt};

/// Validate a decision against the pending interrupt before any network call.
/// Decisions are checked against the first action request; the server
/// advertises identical constraints for batched requests.
pub(crate) fn validate_decision(
    pending: &PendingInterrupt,
    decision: DecisionKind,
    body: &DecisionBody,
) -> Result<(), TetherError> {
    let allowed = pending
        .action_requests
        .first()
        .map(|request| request.effective_decisions())
        .unwrap_or_else(DecisionKind::all);
    if !allowed.contains(&decision) {
        let allowed = allowed
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(TetherError::InvalidDecision(format!(
            "decision '{decision}' is not allowed here (allowed: {allowed})"
        )));
    }
    if decision == DecisionKind::Edit {
        match &body.edited_action {
            Some(Value::Object(_)) => {}
            _ => {
                return Err(TetherError::InvalidDecision(
                    "edit requires a JSON object of edited arguments".to_string(),
                ))
            }
        }
    }
    Ok(())
}

/// Render the approval banner appended after the flushed stream text.
pub(crate) fn approval_banner(pending: &PendingInterrupt) -> String {
    let mut banner = String::from("\n[Approval required]\n");
    for request in &pending.action_requests {
        let decisions = request
            .effective_decisions()
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("/");
        banner.push_str(&format!("- {} ({decisions})\n", request.name));
    }
    banner
}
