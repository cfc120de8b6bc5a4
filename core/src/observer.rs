//! The UI boundary, expressed as a port interface: five callbacks a caller
//! implements once to receive staged items and answer approval requests.
//! A trait object (rather than five free-standing closures) so the turn
//! engine and exec handler can share one reference without threading five
//! separate callback params through every call.

use async_trait::async_trait;
use codex_apply_patch::Patch;

use crate::protocol::ApprovalDecision;
use crate::protocol::ConversationItem;

#[async_trait]
pub trait TurnObserver: Send + Sync {
    /// A staged item has survived generation-fencing and is ready to show.
    async fn on_item(&self, item: ConversationItem);

    /// Loading-indicator state, toggled at turn start/end.
    async fn on_loading(&self, loading: bool);

    /// The response-id returned by `response.completed`, used to chain the
    /// next turn's request.
    async fn on_last_response_id(&self, response_id: String);

    /// Requests approval for `command` (and, if this call concerns a patch,
    /// the patch itself) from whatever surface the caller presents to the
    /// user.
    async fn get_command_confirmation(
        &self,
        command: &[String],
        patch: Option<&Patch>,
    ) -> ApprovalDecision;

    /// Produces a human-readable explanation of `command`, used when the
    /// user responds to a confirmation prompt with "explain".
    async fn explain_command(&self, command: &[String]) -> String;
}
