//! Post-completion cost reconciliation.
//!
//! Stage costs are recorded as token-based estimates the moment each call
//! finishes. The provider publishes the billed figure for a generation a
//! few seconds later; this task polls the gateway for those figures and
//! patches the completed turn in place. Best-effort throughout: a missing
//! figure keeps the estimate, and any error leaves the conversation
//! untouched.

use crate::gateway::ModelGateway;
use crate::store::ConversationStore;
use crate::types::{Message, StageOutcome};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Fetch billed costs for every generation recorded on a completed turn
/// and write them back through the store. Spawned detached after each
/// completed job; waits `delay` first so the provider has time to bill.
pub async fn reconcile_turn(
    gateway: Arc<dyn ModelGateway>,
    store: ConversationStore,
    conversation_id: String,
    turn_index: usize,
    delay: Duration,
) {
    tokio::time::sleep(delay).await;

    let conversation = match store.get(&conversation_id) {
        Ok(conversation) => conversation,
        // Deleted in the meantime; nothing to reconcile.
        Err(e) => {
            debug!(conversation_id = %conversation_id, error = %e, "Skipping cost reconciliation");
            return;
        }
    };
    let Some(Message::Assistant(turn)) = conversation.messages.get(turn_index) else {
        return;
    };

    let mut generation_ids = Vec::new();
    for result in &turn.stage1 {
        if let StageOutcome::Answered {
            generation_id: Some(gen_id),
            ..
        } = &result.outcome
        {
            generation_ids.push(gen_id.clone());
        }
    }
    for ranking in &turn.stage2 {
        if let Some(gen_id) = &ranking.generation_id {
            generation_ids.push(gen_id.clone());
        }
    }
    if let Some(final_response) = &turn.final_response {
        if let Some(gen_id) = &final_response.generation_id {
            generation_ids.push(gen_id.clone());
        }
    }
    if generation_ids.is_empty() {
        return;
    }

    let mut actual = BTreeMap::new();
    for gen_id in generation_ids {
        match gateway.actual_cost(&gen_id).await {
            Ok(Some(cost)) => {
                actual.insert(gen_id, cost);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(generation_id = %gen_id, error = %e, "Billed cost lookup failed");
            }
        }
    }
    if actual.is_empty() {
        debug!(conversation_id = %conversation_id, "No billed costs available yet");
        return;
    }

    if let Err(e) = store.apply_actual_costs(&conversation_id, turn_index, &actual) {
        warn!(conversation_id = %conversation_id, error = %e, "Could not apply billed costs");
    }
}
