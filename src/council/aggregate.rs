//! Ranking Aggregator - pure functions, no I/O.
//!
//! [`parse_ballot`] extracts an ordered label list from a ranking model's
//! free-form reply; [`aggregate`] combines all ballots into a single
//! deterministic ordering by mean rank position (0 = best). Ties break by
//! total votes received (more is better), then by label order.

use crate::types::{AggregateEntry, PeerRanking};
use regex::Regex;
use std::collections::BTreeMap;

/// Marker the ranking prompt asks models to emit before their ordered list.
pub const RANKING_MARKER: &str = "FINAL RANKING:";

/// Parse a ranking reply into an ordered ballot.
///
/// The reply is expected to end with a `FINAL RANKING:` section listing the
/// labels best to worst. A valid ballot is a permutation of `labels`:
/// every label exactly once. Anything else (missing marker with no
/// recoverable ordering, missing or unknown labels, duplicates beyond the
/// first mention) yields `None` and the voter abstains.
pub fn parse_ballot(text: &str, labels: &[String]) -> Option<Vec<String>> {
    let marker = Regex::new(r"(?i)final\s+ranking\s*:?").ok()?;

    // Prefer the section after the last marker occurrence; fall back to the
    // whole reply when the model ignored the output format.
    let section = marker
        .find_iter(text)
        .last()
        .map_or(text, |m| &text[m.end()..]);

    extract_ordering(section, labels).or_else(|| extract_ordering(text, labels))
}

/// Pull labels out of `section` in order of first mention; valid only if
/// the result is a permutation of `labels`.
fn extract_ordering(section: &str, labels: &[String]) -> Option<Vec<String>> {
    let label_re = Regex::new(r"(?i)response\s+([A-Z]+)").ok()?;

    let mut ordered = Vec::new();
    for cap in label_re.captures_iter(section) {
        let letters = cap.get(1)?.as_str().to_uppercase();
        let label = format!("Response {letters}");
        if labels.contains(&label) && !ordered.contains(&label) {
            ordered.push(label);
        }
    }

    if ordered.len() == labels.len() {
        Some(ordered)
    } else {
        None
    }
}

/// Combine peer rankings into one deterministic ordering.
///
/// Each non-empty ballot contributes rank positions (0 = best) for the
/// labels it orders. Score per label = mean position across the ballots
/// that include it; lower is better. Output covers exactly the labels that
/// appear in at least one ballot, mapped back to model identifiers via
/// `label_to_model`.
pub fn aggregate(
    rankings: &[PeerRanking],
    label_to_model: &BTreeMap<String, String>,
) -> Vec<AggregateEntry> {
    let mut positions: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for ranking in rankings {
        for (pos, label) in ranking.ballot.iter().enumerate() {
            positions.entry(label.as_str()).or_default().push(pos);
        }
    }

    let mut entries: Vec<AggregateEntry> = positions
        .into_iter()
        .filter_map(|(label, ranks)| {
            let model = label_to_model.get(label)?.clone();
            let votes = ranks.len();
            let mean_rank = ranks.iter().sum::<usize>() as f64 / votes as f64;
            Some(AggregateEntry {
                model,
                label: label.to_string(),
                mean_rank,
                votes,
            })
        })
        .collect();

    // BTreeMap iteration already ordered by label, so equal (mean, votes)
    // pairs keep stable label order through the sort.
    entries.sort_by(|a, b| {
        a.mean_rank
            .total_cmp(&b.mean_rank)
            .then_with(|| b.votes.cmp(&a.votes))
            .then_with(|| a.label.cmp(&b.label))
    });
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!("Response {}", char::from(b'A' + i as u8)))
            .collect()
    }

    fn ballot(model: &str, order: &[&str]) -> PeerRanking {
        PeerRanking {
            model: model.to_string(),
            ballot: order.iter().map(|s| (*s).to_string()).collect(),
            rationale: String::new(),
            cost: 0.0,
            generation_id: None,
        }
    }

    fn label_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(l, m)| ((*l).to_string(), (*m).to_string()))
            .collect()
    }

    // ------------------------------------------------------------------
    // parse_ballot
    // ------------------------------------------------------------------

    #[test]
    fn test_parse_well_formed_reply() {
        let text = "Response B is strongest on accuracy, while Response A \
                    is more complete.\n\nFINAL RANKING:\n1. Response B\n2. Response A\n3. Response C\n";
        let parsed = parse_ballot(text, &labels(3)).unwrap();
        assert_eq!(parsed, vec!["Response B", "Response A", "Response C"]);
    }

    #[test]
    fn test_parse_uses_last_marker() {
        let text = "FINAL RANKING: Response A, Response B\n\
                    On reflection, I revise.\n\
                    FINAL RANKING: Response B, Response A";
        let parsed = parse_ballot(text, &labels(2)).unwrap();
        assert_eq!(parsed, vec!["Response B", "Response A"]);
    }

    #[test]
    fn test_parse_case_insensitive_marker_and_labels() {
        let text = "final ranking:\n- response b\n- response a";
        let parsed = parse_ballot(text, &labels(2)).unwrap();
        assert_eq!(parsed, vec!["Response B", "Response A"]);
    }

    #[test]
    fn test_parse_falls_back_to_whole_text() {
        // No marker, but the reply is just an ordered list.
        let text = "1. Response C\n2. Response A\n3. Response B";
        let parsed = parse_ballot(text, &labels(3)).unwrap();
        assert_eq!(parsed, vec!["Response C", "Response A", "Response B"]);
    }

    #[test]
    fn test_parse_rejects_incomplete_ballot() {
        let text = "FINAL RANKING:\n1. Response A\n2. Response B";
        assert!(parse_ballot(text, &labels(3)).is_none());
    }

    #[test]
    fn test_parse_rejects_prose_without_ordering() {
        let text = "I cannot rank these responses.";
        assert!(parse_ballot(text, &labels(2)).is_none());
    }

    #[test]
    fn test_parse_ignores_unknown_labels() {
        let text = "FINAL RANKING: Response Q, Response B, Response A";
        let parsed = parse_ballot(text, &labels(2)).unwrap();
        assert_eq!(parsed, vec!["Response B", "Response A"]);
    }

    #[test]
    fn test_parse_duplicate_mention_keeps_first() {
        let text = "FINAL RANKING: Response A, Response B, Response A";
        let parsed = parse_ballot(text, &labels(2)).unwrap();
        assert_eq!(parsed, vec!["Response A", "Response B"]);
    }

    // ------------------------------------------------------------------
    // aggregate
    // ------------------------------------------------------------------

    #[test]
    fn test_two_agreeing_ballots_one_abstention() {
        // council = {A, B, C}; two ballots rank [A, C, B]; one voter errors.
        let map = label_map(&[
            ("Response A", "model-a"),
            ("Response B", "model-b"),
            ("Response C", "model-c"),
        ]);
        let rankings = vec![
            ballot("model-a", &["Response A", "Response C", "Response B"]),
            ballot("model-b", &["Response A", "Response C", "Response B"]),
            ballot("model-c", &[]), // abstained
        ];

        let agg = aggregate(&rankings, &map);
        assert_eq!(agg.len(), 3);
        assert_eq!(agg[0].model, "model-a");
        assert_eq!(agg[0].mean_rank, 0.0);
        assert_eq!(agg[1].model, "model-c");
        assert_eq!(agg[1].mean_rank, 1.0);
        assert_eq!(agg[2].model, "model-b");
        assert_eq!(agg[2].mean_rank, 2.0);
        assert!(agg.iter().all(|e| e.votes == 2));
    }

    #[test]
    fn test_single_ballot_is_reproduced_exactly() {
        let map = label_map(&[
            ("Response A", "model-a"),
            ("Response B", "model-b"),
            ("Response C", "model-c"),
        ]);
        let rankings = vec![ballot(
            "model-b",
            &["Response C", "Response A", "Response B"],
        )];

        let agg = aggregate(&rankings, &map);
        let order: Vec<&str> = agg.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(order, vec!["Response C", "Response A", "Response B"]);
    }

    #[test]
    fn test_covers_exactly_labels_appearing_in_ballots() {
        let map = label_map(&[
            ("Response A", "model-a"),
            ("Response B", "model-b"),
            ("Response C", "model-c"),
        ]);
        // Response C never appears in any ballot.
        let rankings = vec![
            ballot("model-a", &["Response A", "Response B"]),
            ballot("model-b", &["Response B", "Response A"]),
        ];

        let agg = aggregate(&rankings, &map);
        assert_eq!(agg.len(), 2);
        assert!(agg.iter().all(|e| e.label != "Response C"));
    }

    #[test]
    fn test_invariant_under_ballot_reordering() {
        let map = label_map(&[
            ("Response A", "model-a"),
            ("Response B", "model-b"),
            ("Response C", "model-c"),
        ]);
        let forward = vec![
            ballot("m1", &["Response A", "Response B", "Response C"]),
            ballot("m2", &["Response B", "Response A", "Response C"]),
            ballot("m3", &["Response A", "Response C", "Response B"]),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();

        assert_eq!(aggregate(&forward, &map), aggregate(&reversed, &map));
    }

    #[test]
    fn test_deterministic() {
        let map = label_map(&[("Response A", "model-a"), ("Response B", "model-b")]);
        let rankings = vec![
            ballot("m1", &["Response A", "Response B"]),
            ballot("m2", &["Response B", "Response A"]),
        ];
        let first = aggregate(&rankings, &map);
        for _ in 0..10 {
            assert_eq!(aggregate(&rankings, &map), first);
        }
    }

    #[test]
    fn test_tie_broken_by_votes_then_label() {
        let map = label_map(&[
            ("Response A", "model-a"),
            ("Response B", "model-b"),
            ("Response C", "model-c"),
        ]);
        // A and B both have mean rank 0.5; C has mean 0.0 but fewer votes
        // does not matter (mean is primary). A gets 2 votes, B gets 2; the
        // equal pair falls back to label order.
        let rankings = vec![
            ballot("m1", &["Response A", "Response B"]),
            ballot("m2", &["Response B", "Response A"]),
        ];
        let agg = aggregate(&rankings, &map);
        assert_eq!(agg[0].label, "Response A");
        assert_eq!(agg[1].label, "Response B");

        // More votes wins the tie when vote counts differ.
        let rankings = vec![
            ballot("m1", &["Response A", "Response B"]),
            ballot("m2", &["Response B", "Response A"]),
            ballot("m3", &["Response C"]),
        ];
        let agg = aggregate(&rankings, &map);
        // C: mean 0.0, 1 vote -> best mean, still first.
        assert_eq!(agg[0].label, "Response C");
    }

    #[test]
    fn test_empty_rankings_yield_empty_aggregate() {
        let map = label_map(&[("Response A", "model-a")]);
        assert!(aggregate(&[], &map).is_empty());
        // All abstentions behave like no rankings at all.
        let rankings = vec![ballot("m1", &[]), ballot("m2", &[])];
        assert!(aggregate(&rankings, &map).is_empty());
    }
}
