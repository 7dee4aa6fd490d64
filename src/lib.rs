//! Conclave: multi-model deliberation engine
//!
//! A user question is answered independently by a council of hosted
//! language models, the answers are anonymized and cross-ranked by the
//! same models, and a chairman model synthesizes the final reply.
//!
//! ## Architecture
//!
//! - **Council Orchestrator**: three-stage pipeline (fan-out, anonymized
//!   peer ranking, chairman synthesis)
//! - **Job Lifecycle Manager**: durable queue, worker loop, status
//!   polling, cooperative cancellation
//! - **Model Gateway**: provider abstraction with transient/permanent
//!   error taxonomy and bounded retry
//! - **Conversation Store**: sled-backed document store

pub mod api;
pub mod config;
pub mod council;
pub mod gateway;
pub mod jobs;
pub mod store;
pub mod types;

// Re-export the API surface
pub use api::{create_app, ApiContext};

// Re-export configuration
pub use config::{AppConfig, CouncilConfig, SharedConfig};

// Re-export commonly used types
pub use types::{
    AggregateEntry, AssistantTurn, Conversation, ConversationMeta, CostStatus, FinalResponse,
    Job, JobStatus, Message, PeerRanking, StageCosts, StageOneResult, StageOutcome, UserTurn,
};

// Re-export pipeline components
pub use council::{CouncilError, CouncilOrchestrator};
pub use gateway::{ChatMessage, GatewayError, ModelGateway, ModelReply, OpenRouterGateway};

// Re-export job management
pub use jobs::{worker, JobError, JobStore};
pub use store::{ConversationStore, StoreError};
