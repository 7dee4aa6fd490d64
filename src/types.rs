//! Core data model shared across the pipeline, job manager, store, and API.
//!
//! Every stage of the council pipeline produces an explicit tagged record
//! (no free-form JSON blobs): [`StageOneResult`], [`PeerRanking`],
//! [`AggregateEntry`], [`FinalResponse`], [`StageCosts`]. Conversations and
//! jobs are the two persistent documents; everything else lives inside the
//! assistant turn of a conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Conversations & Messages
// ============================================================================

/// A single conversation: an ordered message history plus accumulated cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub messages: Vec<Message>,
    /// Total spend across all completed jobs in this conversation (USD)
    #[serde(default)]
    pub total_cost: f64,
}

impl Conversation {
    /// The assistant turn a running job should write into: the earliest
    /// turn still marked pending. Jobs for one conversation are serialized
    /// FIFO, so the earliest placeholder always belongs to the oldest
    /// unfinished job.
    pub fn pending_assistant_mut(&mut self) -> Option<&mut AssistantTurn> {
        self.messages.iter_mut().find_map(|m| match m {
            Message::Assistant(turn) if turn.pending => Some(turn),
            _ => None,
        })
    }

    /// True when no assistant turn has completed yet (first exchange).
    pub fn is_first_exchange(&self) -> bool {
        !self.messages.iter().any(|m| match m {
            Message::Assistant(turn) => !turn.pending && turn.error.is_none(),
            Message::User(_) => false,
        })
    }
}

/// Conversation metadata projection for list views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub message_count: usize,
    pub total_cost: f64,
}

impl From<&Conversation> for ConversationMeta {
    fn from(c: &Conversation) -> Self {
        Self {
            id: c.id.clone(),
            created_at: c.created_at,
            title: c.title.clone(),
            message_count: c.messages.len(),
            total_cost: c.total_cost,
        }
    }
}

/// One turn in a conversation, tagged by role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    User(UserTurn),
    Assistant(AssistantTurn),
}

/// A user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTurn {
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// An assistant turn, created as a pending placeholder when the job is
/// enqueued and mutated in place as stages complete. Partial stage results
/// survive even if a later stage fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantTurn {
    /// Stage 1: one entry per configured council model
    #[serde(default)]
    pub stage1: Vec<StageOneResult>,
    /// Stage 2: one entry per ranking model (empty ballot = abstained)
    #[serde(default)]
    pub stage2: Vec<PeerRanking>,
    /// Combined ordering derived from all stage-2 ballots
    #[serde(default)]
    pub aggregate: Vec<AggregateEntry>,
    /// Label -> model mapping, kept for display reassembly only
    #[serde(default)]
    pub label_to_model: BTreeMap<String, String>,
    /// Stage 3: the chairman's synthesized answer
    #[serde(rename = "stage3")]
    pub final_response: Option<FinalResponse>,
    /// Per-stage cost breakdown, set at completion
    pub costs: Option<StageCosts>,
    /// True until the owning job reaches a terminal state
    pub pending: bool,
    /// Human-readable failure reason when the owning job failed or was
    /// cancelled
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AssistantTurn {
    /// A fresh placeholder for a newly enqueued job.
    pub fn placeholder(now: DateTime<Utc>) -> Self {
        Self {
            stage1: Vec::new(),
            stage2: Vec::new(),
            aggregate: Vec::new(),
            label_to_model: BTreeMap::new(),
            final_response: None,
            costs: None,
            pending: true,
            error: None,
            created_at: now,
        }
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// Job lifecycle states.
///
/// `Pending -> Processing -> {Completed | Failed | Cancelled}`. The three
/// terminal states are sinks; transitions are validated by the job store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Processing | Self::Failed | Self::Cancelled),
            Self::Processing => {
                matches!(next, Self::Completed | Self::Failed | Self::Cancelled)
            }
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One durable unit of pipeline work, corresponding to one user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub conversation_id: String,
    /// The user's question as submitted
    pub input: String,
    pub status: JobStatus,
    pub error: Option<String>,
    /// Cooperative cancellation flag, read at stage boundaries
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Pipeline Stage Records
// ============================================================================

/// Outcome of one council model's stage-1 call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StageOutcome {
    /// The model answered
    Answered {
        text: String,
        cost: f64,
        latency_ms: u64,
        /// Provider generation id, kept for post-completion cost
        /// reconciliation
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation_id: Option<String>,
    },
    /// The call failed after gateway-level retries were exhausted
    Failed { error: String },
}

impl StageOutcome {
    pub fn is_answered(&self) -> bool {
        matches!(self, Self::Answered { .. })
    }
}

/// Stage 1 result for a single council model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOneResult {
    pub model: String,
    #[serde(flatten)]
    pub outcome: StageOutcome,
}

/// Stage 2 result for a single ranking model.
///
/// An empty ballot means the model's reply could not be parsed into a valid
/// ordering; the model abstains and contributes no votes to the aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRanking {
    pub model: String,
    /// Labels ordered best to worst; empty when the model abstained
    pub ballot: Vec<String>,
    /// The model's raw justification text
    pub rationale: String,
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<String>,
}

/// One row of the aggregate ranking, already mapped back to a model id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateEntry {
    pub model: String,
    pub label: String,
    /// Mean rank position across all ballots containing this label (0 = best)
    pub mean_rank: f64,
    /// Number of ballots that ranked this label
    pub votes: usize,
}

/// Stage 3: the chairman's synthesized answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResponse {
    pub model: String,
    pub text: String,
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<String>,
}

/// Whether cost figures are token-based estimates or provider-reported
/// actuals (set by the post-completion reconciler).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostStatus {
    #[default]
    Estimated,
    Actual,
}

/// Per-stage cost breakdown for one job (USD).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StageCosts {
    pub stage1: f64,
    pub stage2: f64,
    pub stage3: f64,
    pub total: f64,
    #[serde(default)]
    pub status: CostStatus,
}

impl StageCosts {
    pub fn new(stage1: f64, stage2: f64, stage3: f64) -> Self {
        Self {
            stage1,
            stage2,
            stage3,
            total: stage1 + stage2 + stage3,
            status: CostStatus::Estimated,
        }
    }
}
