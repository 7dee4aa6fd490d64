//! Conversation Store - sled-backed document store for conversations.
//!
//! One tree, one JSON document per conversation. Writers go through a
//! compare-and-swap loop so a submit (appending messages) and a worker
//! (mutating the pending assistant turn) can never lose each other's
//! update. Reads are lock-free.

use crate::types::{
    AggregateEntry, AssistantTurn, Conversation, ConversationMeta, CostStatus, FinalResponse,
    Message, PeerRanking, StageCosts, StageOneResult, StageOutcome, UserTurn,
};
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

const CONVERSATIONS_TREE: &str = "conversations";

/// Default title until the first exchange derives one.
const NEW_CONVERSATION_TITLE: &str = "New Conversation";

/// Conversation store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Sled-backed conversation document store.
#[derive(Clone)]
pub struct ConversationStore {
    tree: sled::Tree,
}

impl ConversationStore {
    /// Open the conversations tree inside an existing database.
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        let tree = db.open_tree(CONVERSATIONS_TREE)?;
        Ok(Self { tree })
    }

    /// Create a new empty conversation.
    pub fn create(&self) -> Result<Conversation, StoreError> {
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            title: NEW_CONVERSATION_TITLE.to_string(),
            messages: Vec::new(),
            total_cost: 0.0,
        };
        let bytes = serde_json::to_vec(&conversation)?;
        self.tree.insert(conversation.id.as_bytes(), bytes)?;
        self.tree.flush()?;
        info!(conversation_id = %conversation.id, "Conversation created");
        Ok(conversation)
    }

    /// Load a full conversation.
    pub fn get(&self, id: &str) -> Result<Conversation, StoreError> {
        let bytes = self
            .tree
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Metadata for all conversations, newest first.
    pub fn list(&self) -> Result<Vec<ConversationMeta>, StoreError> {
        let mut metas = Vec::new();
        for item in self.tree.iter() {
            let (_key, bytes) = item?;
            match serde_json::from_slice::<Conversation>(&bytes) {
                Ok(conversation) => metas.push(ConversationMeta::from(&conversation)),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping corrupted conversation record");
                }
            }
        }
        metas.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(metas)
    }

    /// Delete a conversation. Errors if it does not exist.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let removed = self.tree.remove(id)?;
        if removed.is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.tree.flush()?;
        info!(conversation_id = %id, "Conversation deleted");
        Ok(())
    }

    /// Append the user's message and the pending assistant placeholder for
    /// a newly submitted job, in one atomic write.
    pub fn append_exchange(&self, id: &str, user_text: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        self.update(id, |conversation| {
            conversation.messages.push(Message::User(UserTurn {
                content: user_text.to_string(),
                created_at: now,
            }));
            conversation
                .messages
                .push(Message::Assistant(AssistantTurn::placeholder(now)));
        })
    }

    /// Record stage-1 results on the pending assistant turn.
    pub fn write_stage1(&self, id: &str, stage1: &[StageOneResult]) -> Result<(), StoreError> {
        self.update(id, |conversation| {
            if let Some(turn) = conversation.pending_assistant_mut() {
                turn.stage1 = stage1.to_vec();
            }
        })
    }

    /// Record stage-2 ballots, the aggregate ranking, and the label map.
    pub fn write_stage2(
        &self,
        id: &str,
        rankings: &[PeerRanking],
        aggregate: &[AggregateEntry],
        label_to_model: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        self.update(id, |conversation| {
            if let Some(turn) = conversation.pending_assistant_mut() {
                turn.stage2 = rankings.to_vec();
                turn.aggregate = aggregate.to_vec();
                turn.label_to_model = label_to_model.clone();
            }
        })
    }

    /// Finalize the pending assistant turn: set the chairman's response and
    /// costs, clear the pending flag, add the job's spend to the
    /// conversation total, and set the title when one was derived. Returns
    /// the index of the finalized message so the cost reconciler can find
    /// it again later.
    pub fn complete(
        &self,
        id: &str,
        final_response: FinalResponse,
        costs: StageCosts,
        title: Option<(String, f64)>,
    ) -> Result<Option<usize>, StoreError> {
        let index = self.update(id, |conversation| {
            let index = conversation
                .messages
                .iter()
                .position(|m| matches!(m, Message::Assistant(t) if t.pending));
            if let Some(turn) = conversation.pending_assistant_mut() {
                turn.final_response = Some(final_response.clone());
                turn.costs = Some(costs);
                turn.pending = false;
                turn.error = None;
            }
            conversation.total_cost += costs.total;
            if let Some((title, title_cost)) = &title {
                conversation.title = title.clone();
                conversation.total_cost += title_cost;
            }
            index
        })?;
        debug!(conversation_id = %id, cost = costs.total, "Exchange completed");
        Ok(index)
    }

    /// Replace estimated costs on a completed assistant turn with the
    /// provider-billed figures in `actual` (keyed by generation id),
    /// recompute the stage totals, and adjust the conversation total by
    /// the difference.
    pub fn apply_actual_costs(
        &self,
        id: &str,
        turn_index: usize,
        actual: &BTreeMap<String, f64>,
    ) -> Result<(), StoreError> {
        if actual.is_empty() {
            return Ok(());
        }
        self.update(id, |conversation| {
            let Some(Message::Assistant(turn)) = conversation.messages.get_mut(turn_index)
            else {
                return;
            };
            if turn.pending {
                return;
            }

            for result in &mut turn.stage1 {
                if let StageOutcome::Answered {
                    cost,
                    generation_id: Some(gen_id),
                    ..
                } = &mut result.outcome
                {
                    if let Some(billed) = actual.get(gen_id) {
                        *cost = *billed;
                    }
                }
            }
            for ranking in &mut turn.stage2 {
                if let Some(billed) = ranking.generation_id.as_ref().and_then(|g| actual.get(g))
                {
                    ranking.cost = *billed;
                }
            }
            if let Some(final_response) = &mut turn.final_response {
                if let Some(billed) = final_response
                    .generation_id
                    .as_ref()
                    .and_then(|g| actual.get(g))
                {
                    final_response.cost = *billed;
                }
            }

            let stage1: f64 = turn
                .stage1
                .iter()
                .map(|r| match &r.outcome {
                    StageOutcome::Answered { cost, .. } => *cost,
                    StageOutcome::Failed { .. } => 0.0,
                })
                .sum();
            let stage2: f64 = turn.stage2.iter().map(|r| r.cost).sum();
            let stage3 = turn.final_response.as_ref().map_or(0.0, |f| f.cost);
            let previous_total = turn.costs.map_or(0.0, |c| c.total);

            let mut costs = StageCosts::new(stage1, stage2, stage3);
            costs.status = CostStatus::Actual;
            turn.costs = Some(costs);
            conversation.total_cost += costs.total - previous_total;
        })?;
        debug!(conversation_id = %id, reconciled = actual.len(), "Applied billed costs");
        Ok(())
    }

    /// Mark the pending assistant turn as failed or cancelled. Partial
    /// stage results already written stay in place.
    pub fn fail_pending(&self, id: &str, error: &str) -> Result<(), StoreError> {
        self.update(id, |conversation| {
            if let Some(turn) = conversation.pending_assistant_mut() {
                turn.pending = false;
                turn.error = Some(error.to_string());
            }
        })
    }

    /// Read-modify-write with a compare-and-swap retry loop.
    fn update<T>(
        &self,
        id: &str,
        mutate: impl Fn(&mut Conversation) -> T,
    ) -> Result<T, StoreError> {
        loop {
            let current = self
                .tree
                .get(id)?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let mut conversation: Conversation = serde_json::from_slice(&current)?;
            let out = mutate(&mut conversation);
            let next = serde_json::to_vec(&conversation)?;

            match self
                .tree
                .compare_and_swap(id.as_bytes(), Some(current), Some(next))?
            {
                Ok(()) => {
                    self.tree.flush()?;
                    return Ok(out);
                }
                // Lost a race with a concurrent writer; reload and retry.
                Err(_) => continue,
            }
        }
    }
}
