//! Response anonymization for the peer-ranking stage.
//!
//! Successful stage-1 responses are shuffled and assigned sequential opaque
//! labels ("Response A", "Response B", ...). The assignment is generated
//! fresh for every job so ranking models cannot correlate labels with
//! authors across requests. The label -> model mapping stays server-side;
//! ranking prompts only ever see the labels.

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;

/// One anonymized response: opaque label, originating model, response text.
#[derive(Debug, Clone)]
pub struct AnonymizedEntry {
    pub label: String,
    pub model: String,
    pub text: String,
}

/// A per-job bijection between labels and the models that produced a
/// successful stage-1 response.
#[derive(Debug, Clone)]
pub struct Anonymization {
    entries: Vec<AnonymizedEntry>,
}

impl Anonymization {
    /// Shuffle `(model, text)` pairs and assign sequential labels.
    pub fn assign<R: Rng>(mut responses: Vec<(String, String)>, rng: &mut R) -> Self {
        responses.shuffle(rng);
        let entries = responses
            .into_iter()
            .enumerate()
            .map(|(i, (model, text))| AnonymizedEntry {
                label: response_label(i),
                model,
                text,
            })
            .collect();
        Self { entries }
    }

    /// Entries in label order.
    pub fn entries(&self) -> &[AnonymizedEntry] {
        &self.entries
    }

    /// All labels, in order.
    pub fn labels(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.label.clone()).collect()
    }

    /// The model behind a label.
    pub fn model_for(&self, label: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.label == label)
            .map(|e| e.model.as_str())
    }

    /// Label -> model map for display reassembly.
    pub fn label_to_model(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|e| (e.label.clone(), e.model.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Sequential label for an index: A..Z, then AA, AB, ...
fn response_label(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(char::from(b'A' + rem as u8));
        n = (n - 1) / 26;
    }
    letters.reverse();
    let suffix: String = letters.into_iter().collect();
    format!("Response {suffix}")
}
