//! Shared test support: a scripted in-process model gateway and fixture
//! builders, so pipeline and API tests run without any network access.

#![allow(dead_code)]

use async_trait::async_trait;
use conclave::config::{AppConfig, SharedConfig};
use conclave::gateway::{ChatMessage, GatewayError, ModelGateway, ModelReply};
use conclave::types::JobStatus;
use conclave::{ConversationStore, CouncilOrchestrator, JobStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fixed per-call cost charged by the mock gateway.
pub const MOCK_CALL_COST: f64 = 0.001;

type Behavior = Box<dyn Fn(&[ChatMessage]) -> Result<String, GatewayError> + Send + Sync>;

/// One recorded gateway call: target model plus the final prompt message.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: String,
    pub prompt: String,
}

impl RecordedCall {
    pub fn is_ranking(&self) -> bool {
        self.prompt.contains("evaluating anonymized answers")
    }

    pub fn is_chairman(&self) -> bool {
        self.prompt.contains("chairman of a council")
    }

    pub fn is_title(&self) -> bool {
        self.prompt.contains("Generate a short title")
    }

    pub fn is_stage1(&self) -> bool {
        !self.is_ranking() && !self.is_chairman() && !self.is_title()
    }
}

/// Scripted gateway: per-model behaviors plus a shared call log.
pub struct MockGateway {
    behaviors: HashMap<String, Behavior>,
    calls: Mutex<Vec<RecordedCall>>,
    delay: Option<Duration>,
    actual_cost_factor: Option<f64>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            delay: None,
            actual_cost_factor: None,
        }
    }

    /// Sleep this long inside every call (for ordering tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Report a billed cost of `MOCK_CALL_COST * factor` for every
    /// generation (for cost reconciliation tests).
    pub fn with_actual_costs(mut self, factor: f64) -> Self {
        self.actual_cost_factor = Some(factor);
        self
    }

    /// Install an arbitrary behavior for a model.
    pub fn on(
        mut self,
        model: &str,
        behavior: impl Fn(&[ChatMessage]) -> Result<String, GatewayError> + Send + Sync + 'static,
    ) -> Self {
        self.behaviors.insert(model.to_string(), Box::new(behavior));
        self
    }

    /// The model always answers with a fixed string.
    pub fn answer(self, model: &str, text: &str) -> Self {
        let text = text.to_string();
        self.on(model, move |_| Ok(text.clone()))
    }

    /// The model always fails permanently.
    pub fn fail(self, model: &str, message: &str) -> Self {
        let message = message.to_string();
        self.on(model, move |_| Err(GatewayError::Permanent(message.clone())))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&RecordedCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }
}

#[async_trait]
impl ModelGateway for MockGateway {
    async fn invoke(
        &self,
        model: &str,
        messages: &[ChatMessage],
        _timeout: Duration,
    ) -> Result<ModelReply, GatewayError> {
        let prompt = messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let seq = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(RecordedCall {
                model: model.to_string(),
                prompt,
            });
            calls.len()
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let behavior = self
            .behaviors
            .get(model)
            .ok_or_else(|| GatewayError::Permanent(format!("{model}: no such model")))?;
        behavior(messages).map(|text| ModelReply {
            text,
            cost: MOCK_CALL_COST,
            latency_ms: 1,
            generation_id: Some(format!("gen-{seq}")),
        })
    }

    async fn actual_cost(&self, _generation_id: &str) -> Result<Option<f64>, GatewayError> {
        Ok(self.actual_cost_factor.map(|f| MOCK_CALL_COST * f))
    }
}

/// Labels mentioned in a ranking prompt ("### Response X" section
/// headers), in presentation order.
pub fn labels_in_prompt(prompt: &str) -> Vec<String> {
    let mut labels = Vec::new();
    for line in prompt.lines() {
        if let Some(rest) = line.strip_prefix("### Response ") {
            let letters: String = rest.chars().take_while(|c| c.is_ascii_uppercase()).collect();
            if !letters.is_empty() {
                labels.push(format!("Response {letters}"));
            }
        }
    }
    labels
}

/// A ranking behavior that votes for the labels in the order they appear
/// in the prompt.
pub fn vote_in_prompt_order(messages: &[ChatMessage]) -> Result<String, GatewayError> {
    let prompt = messages.last().map(|m| m.content.as_str()).unwrap_or("");
    let labels = labels_in_prompt(prompt);
    Ok(format!("All fine answers.\n\nFINAL RANKING:\n{}", labels.join(", ")))
}

/// A ranking behavior that votes for the labels in reverse prompt order.
pub fn vote_in_reverse_order(messages: &[ChatMessage]) -> Result<String, GatewayError> {
    let prompt = messages.last().map(|m| m.content.as_str()).unwrap_or("");
    let mut labels = labels_in_prompt(prompt);
    labels.reverse();
    Ok(format!("Weakest first deserves last.\n\nFINAL RANKING:\n{}", labels.join(", ")))
}

/// Everything a pipeline test needs, backed by a tempdir sled database.
pub struct Fixture {
    pub store: ConversationStore,
    pub jobs: JobStore,
    pub config: SharedConfig,
    pub gateway: Arc<MockGateway>,
    pub orchestrator: Arc<CouncilOrchestrator>,
    /// Held for the fixture's lifetime so the database directory survives.
    pub dir: tempfile::TempDir,
}

/// Council used throughout the integration tests.
pub const COUNCIL: [&str; 3] = ["mock/alpha", "mock/beta", "mock/gamma"];
pub const CHAIRMAN: &str = "mock/chair";
pub const TITLE_MODEL: &str = "mock/title";

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.council.models = COUNCIL.iter().map(|m| (*m).to_string()).collect();
    config.council.chairman = CHAIRMAN.to_string();
    config.council.title_model = TITLE_MODEL.to_string();
    config.gateway.request_timeout_secs = 5;
    config.gateway.probe_timeout_secs = 5;
    config.gateway.cost_reconcile_delay_secs = 0;
    config
}

pub fn fixture(gateway: MockGateway) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let db = sled::open(tmp.path()).unwrap();
    let store = ConversationStore::open(&db).unwrap();
    let jobs = JobStore::open(&db).unwrap();
    let config = SharedConfig::new(test_config());
    let gateway = Arc::new(gateway);
    let orchestrator = Arc::new(CouncilOrchestrator::new(
        gateway.clone(),
        store.clone(),
        jobs.clone(),
        config.clone(),
    ));
    Fixture {
        store,
        jobs,
        config,
        gateway,
        orchestrator,
        dir: tmp,
    }
}

/// Swap the gateway while keeping the fixture's stores and database.
pub fn rebuild_with_gateway(fx: Fixture, gateway: MockGateway) -> Fixture {
    let gateway = Arc::new(gateway);
    let orchestrator = Arc::new(CouncilOrchestrator::new(
        gateway.clone(),
        fx.store.clone(),
        fx.jobs.clone(),
        fx.config.clone(),
    ));
    Fixture {
        store: fx.store,
        jobs: fx.jobs,
        config: fx.config,
        gateway,
        orchestrator,
        dir: fx.dir,
    }
}

/// Poll a job until it reaches a terminal state.
pub async fn wait_terminal(jobs: &JobStore, job_id: &str) -> JobStatus {
    for _ in 0..200 {
        let job = jobs.get(job_id).unwrap();
        if job.status.is_terminal() {
            return job.status;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {job_id} did not reach a terminal state in time");
}
