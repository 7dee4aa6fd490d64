//! Council Orchestrator - the three-stage deliberation pipeline.
//!
//! Per job: `stage1 -> stage2 -> stage3 -> done`, with a cooperative
//! cancellation check before stage 2 and before stage 3.
//!
//! - **Stage 1 (fan-out)**: every council model answers the question
//!   concurrently; failures are recorded per model and excluded from later
//!   stages. Zero successes fails the job.
//! - **Stage 2 (peer ranking)**: each successful model ranks the
//!   anonymized answers; unparseable replies count as abstentions.
//! - **Stage 3 (synthesis)**: the chairman synthesizes the final answer
//!   from the attributed responses and the aggregate ranking.
//!
//! Stage results are written to the conversation as each stage completes,
//! so partial work stays visible even when a later stage fails. After a
//! completed job the detached [`reconcile`] task swaps the token-based
//! cost estimates for the provider's billed figures.

pub mod aggregate;
pub mod anonymize;
pub mod prompts;
pub mod reconcile;

use crate::config::{AppConfig, SharedConfig};
use crate::gateway::{ChatMessage, ModelGateway, ModelReply};
use crate::jobs::{JobError, JobStore};
use crate::store::{ConversationStore, StoreError};
use crate::types::{
    FinalResponse, Job, PeerRanking, StageCosts, StageOneResult, StageOutcome,
};
use anonymize::Anonymization;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Job-level pipeline failures. Per-model failures never reach this level;
/// they are absorbed into stage records.
#[derive(Debug, thiserror::Error)]
pub enum CouncilError {
    #[error("all council models failed")]
    AllModelsFailed,

    #[error("chairman synthesis failed: {0}")]
    ChairmanFailed(String),

    #[error("Cancelled by user")]
    Cancelled,

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("job store error: {0}")]
    Jobs(#[from] JobError),
}

/// Runs the council pipeline for one job at a time.
pub struct CouncilOrchestrator {
    gateway: Arc<dyn ModelGateway>,
    store: ConversationStore,
    jobs: JobStore,
    config: SharedConfig,
}

impl CouncilOrchestrator {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        store: ConversationStore,
        jobs: JobStore,
        config: SharedConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            jobs,
            config,
        }
    }

    /// Execute the full pipeline for `job`, writing stage results into the
    /// conversation's pending assistant turn as they land.
    pub async fn run(&self, job: &Job) -> Result<(), CouncilError> {
        // Council membership is read through once per job; a concurrent
        // config update applies from the next job onward.
        let config = self.config.snapshot();
        let call_timeout = Duration::from_secs(config.gateway.request_timeout_secs);

        let conversation = self.store.get(&job.conversation_id)?;
        let first_exchange = conversation.is_first_exchange();
        let history = prompts::stage1_messages(&conversation);

        // Stage 1: fan out to the full council.
        let stage1 = self
            .collect_responses(&config.council.models, &history, call_timeout)
            .await;
        let stage1_cost: f64 = stage1
            .iter()
            .map(|r| match &r.outcome {
                StageOutcome::Answered { cost, .. } => *cost,
                StageOutcome::Failed { .. } => 0.0,
            })
            .sum();
        self.store.write_stage1(&job.conversation_id, &stage1)?;

        let successes: Vec<(String, String)> = stage1
            .iter()
            .filter_map(|r| match &r.outcome {
                StageOutcome::Answered { text, .. } => {
                    Some((r.model.clone(), text.clone()))
                }
                StageOutcome::Failed { .. } => None,
            })
            .collect();
        info!(
            job_id = %job.id,
            answered = successes.len(),
            failed = stage1.len() - successes.len(),
            "Stage 1 complete"
        );
        if successes.is_empty() {
            return Err(CouncilError::AllModelsFailed);
        }

        self.check_cancelled(&job.id)?;

        // Stage 2: anonymize, then collect peer rankings.
        let anonymization = Anonymization::assign(successes, &mut rand::thread_rng());
        let rankings = self
            .collect_rankings(&job.input, &anonymization, call_timeout)
            .await;
        let stage2_cost: f64 = rankings.iter().map(|r| r.cost).sum();
        let voters = rankings.iter().filter(|r| !r.ballot.is_empty()).count();
        info!(
            job_id = %job.id,
            voters = voters,
            abstained = rankings.len() - voters,
            "Stage 2 complete"
        );

        let label_to_model = anonymization.label_to_model();
        let aggregate_ranking = aggregate::aggregate(&rankings, &label_to_model);
        self.store.write_stage2(
            &job.conversation_id,
            &rankings,
            &aggregate_ranking,
            &label_to_model,
        )?;

        self.check_cancelled(&job.id)?;

        // Stage 3: chairman synthesis. A chairman failure is a total
        // stage wipeout, so it escalates to job failure.
        let chairman_prompt = prompts::chairman_prompt(&job.input, &stage1, &aggregate_ranking);
        let reply = self
            .gateway
            .invoke(
                &config.council.chairman,
                &[ChatMessage::user(chairman_prompt)],
                call_timeout,
            )
            .await
            .map_err(|e| CouncilError::ChairmanFailed(e.to_string()))?;
        info!(
            job_id = %job.id,
            chairman = %config.council.chairman,
            latency_ms = reply.latency_ms,
            "Stage 3 complete"
        );

        let costs = StageCosts::new(stage1_cost, stage2_cost, reply.cost);
        let final_response = FinalResponse {
            model: config.council.chairman.clone(),
            text: reply.text,
            cost: reply.cost,
            generation_id: reply.generation_id,
        };

        let title = if first_exchange {
            Some(self.derive_title(&job.input, &config).await)
        } else {
            None
        };

        let turn_index = self
            .store
            .complete(&job.conversation_id, final_response, costs, title)?;

        // The provider bills each generation a few seconds after it
        // finishes; patch the estimates once the figures land.
        if let Some(turn_index) = turn_index {
            let delay = Duration::from_secs(config.gateway.cost_reconcile_delay_secs);
            tokio::spawn(reconcile::reconcile_turn(
                Arc::clone(&self.gateway),
                self.store.clone(),
                job.conversation_id.clone(),
                turn_index,
                delay,
            ));
        }
        Ok(())
    }

    /// Stage 1 fan-out: one concurrent gateway call per council model.
    async fn collect_responses(
        &self,
        models: &[String],
        history: &[ChatMessage],
        timeout: Duration,
    ) -> Vec<StageOneResult> {
        let calls = models.iter().map(|model| {
            let model = model.clone();
            async move {
                let outcome = match self.gateway.invoke(&model, history, timeout).await {
                    Ok(ModelReply {
                        text,
                        cost,
                        latency_ms,
                        generation_id,
                    }) => StageOutcome::Answered {
                        text,
                        cost,
                        latency_ms,
                        generation_id,
                    },
                    Err(e) => {
                        warn!(model = %model, error = %e, "Council model failed in stage 1");
                        StageOutcome::Failed {
                            error: e.to_string(),
                        }
                    }
                };
                StageOneResult { model, outcome }
            }
        });
        join_all(calls).await
    }

    /// Stage 2 fan-out: every successful stage-1 model votes on the
    /// anonymized set. Its own response stays on the ballot; anonymization
    /// prevents self-identification at the prompt level.
    async fn collect_rankings(
        &self,
        question: &str,
        anonymization: &Anonymization,
        timeout: Duration,
    ) -> Vec<PeerRanking> {
        let prompt = prompts::ranking_prompt(question, anonymization.entries());
        let labels = anonymization.labels();

        let calls = anonymization.entries().iter().map(|entry| {
            let model = entry.model.clone();
            let messages = [ChatMessage::user(prompt.clone())];
            let labels = labels.clone();
            async move {
                match self.gateway.invoke(&model, &messages, timeout).await {
                    Ok(reply) => {
                        let ballot = aggregate::parse_ballot(&reply.text, &labels);
                        if ballot.is_none() {
                            warn!(model = %model, "Ranking reply unparseable, voter abstains");
                        }
                        PeerRanking {
                            model,
                            ballot: ballot.unwrap_or_default(),
                            rationale: reply.text,
                            cost: reply.cost,
                            generation_id: reply.generation_id,
                        }
                    }
                    Err(e) => {
                        warn!(model = %model, error = %e, "Ranking call failed, voter abstains");
                        PeerRanking {
                            model,
                            ballot: Vec::new(),
                            rationale: format!("(ranking unavailable: {e})"),
                            cost: 0.0,
                            generation_id: None,
                        }
                    }
                }
            }
        });
        join_all(calls).await
    }

    /// Derive a short conversation title, falling back to the truncated
    /// question when the title model is unavailable. Returns (title, cost).
    async fn derive_title(&self, question: &str, config: &AppConfig) -> (String, f64) {
        let timeout = Duration::from_secs(config.gateway.probe_timeout_secs);
        let messages = [ChatMessage::user(prompts::title_prompt(question))];
        match self
            .gateway
            .invoke(&config.council.title_model, &messages, timeout)
            .await
        {
            Ok(reply) => {
                let title = reply.text.trim().trim_matches('"').to_string();
                if title.is_empty() {
                    (prompts::fallback_title(question), reply.cost)
                } else {
                    (title, reply.cost)
                }
            }
            Err(e) => {
                warn!(error = %e, "Title generation failed, using fallback");
                (prompts::fallback_title(question), 0.0)
            }
        }
    }

    /// Cooperative cancellation checkpoint, hit at stage boundaries only.
    fn check_cancelled(&self, job_id: &str) -> Result<(), CouncilError> {
        if self.jobs.is_cancel_requested(job_id)? {
            info!(job_id = %job_id, "Cancellation observed at stage boundary");
            return Err(CouncilError::Cancelled);
        }
        Ok(())
    }
}
