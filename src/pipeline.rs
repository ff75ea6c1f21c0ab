use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::debug;

use crate::extract::candidates::{generate, RuleCandidate};
use crate::extract::rank::{rank, RankWeights};
use crate::extract::tokens::recognize;
use crate::registry::RuleRegistry;

/// One captured response body. Immutable once captured.
#[derive(Debug, Clone)]
pub struct Document {
    pub source: String,
    pub body: String,
    pub captured_at: DateTime<Utc>,
}

/// What one batch run did to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub source: String,
    pub previous_rule_count: usize,
    pub new_rule_count: usize,
    pub updated: bool,
}

/// Run recognition → generation → ranking over a batch of documents captured
/// from one source, then merge into the registry. Re-running the identical
/// batch yields the identical rule sequence; a malformed or empty document
/// contributes nothing and aborts nothing.
pub fn run_batch(
    registry: &RuleRegistry,
    source: &str,
    docs: &[Document],
    weights: &RankWeights,
) -> BatchReport {
    let previous_rule_count = registry.rule_count(source);

    if docs.is_empty() {
        return BatchReport {
            source: source.to_string(),
            previous_rule_count,
            new_rule_count: previous_rule_count,
            updated: false,
        };
    }

    // Documents yielding no tokens (empty, malformed, maintenance pages)
    // drop out entirely: they contribute no candidates and do not dilute
    // support fractions for the rest of the batch.
    let per_doc: Vec<(usize, Vec<RuleCandidate>)> = docs
        .par_iter()
        .enumerate()
        .filter_map(|(i, doc)| {
            let tokens: Vec<_> = recognize(&doc.body).collect();
            if tokens.is_empty() {
                return None;
            }
            Some((i, generate(&doc.body, &tokens)))
        })
        .collect();
    let bodies: Vec<&str> = per_doc.iter().map(|(i, _)| docs[*i].body.as_str()).collect();
    let candidates: Vec<RuleCandidate> =
        per_doc.into_iter().flat_map(|(_, cands)| cands).collect();
    debug!(
        source,
        documents = docs.len(),
        usable = bodies.len(),
        candidates = candidates.len(),
        "generated candidates"
    );

    let ranked = rank(&bodies, candidates, weights);

    // Deterministic batch timestamp: wall-clock now would break re-run
    // equality. Safe unwrap: docs is non-empty here.
    let batch_timestamp = docs.iter().map(|d| d.captured_at).max().unwrap();

    let updated = registry.merge(source, ranked, batch_timestamp);
    BatchReport {
        source: source.to_string(),
        previous_rule_count,
        new_rule_count: registry.rule_count(source),
        updated,
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 2, h, 0, 0).unwrap()
    }

    fn doc(source: &str, body: &str, h: u32) -> Document {
        Document {
            source: source.to_string(),
            body: body.to_string(),
            captured_at: ts(h),
        }
    }

    #[test]
    fn report_counts_and_update_flag() {
        let reg = RuleRegistry::new();
        let docs = [doc("skyair", "<b class=\"price-tag\">£9</b>", 1)];
        let report = run_batch(&reg, "skyair", &docs, &RankWeights::default());
        assert_eq!(report.previous_rule_count, 0);
        assert!(report.updated);
        assert!(report.new_rule_count > 0);
        assert_eq!(reg.get_rules("skyair").unwrap().last_updated, ts(1));
    }

    #[test]
    fn rerun_is_idempotent() {
        let reg = RuleRegistry::new();
        let docs = [
            doc("skyair", "<b class=\"fare-price\">£123</b> from LHR", 1),
            doc("skyair", r#"{"flights":[{"price":599}]}"#, 2),
        ];
        run_batch(&reg, "skyair", &docs, &RankWeights::default());
        let first = reg.get_rules("skyair").unwrap();
        run_batch(&reg, "skyair", &docs, &RankWeights::default());
        let second = reg.get_rules("skyair").unwrap();
        assert_eq!(first.rules, second.rules);
        assert_eq!(first.last_updated, second.last_updated);
    }

    #[test]
    fn empty_document_changes_nothing() {
        let good = "<b class=\"fare-price\">£123</b>";
        let reg_a = RuleRegistry::new();
        run_batch(
            &reg_a,
            "skyair",
            &[doc("skyair", good, 1), doc("skyair", "", 1)],
            &RankWeights::default(),
        );
        let reg_b = RuleRegistry::new();
        run_batch(&reg_b, "skyair", &[doc("skyair", good, 1)], &RankWeights::default());
        let a = reg_a.get_rules("skyair").unwrap();
        let b = reg_b.get_rules("skyair").unwrap();
        assert_eq!(a.rules, b.rules);
    }

    #[test]
    fn tokenless_batch_reports_not_updated() {
        let reg = RuleRegistry::new();
        let report = run_batch(
            &reg,
            "skyair",
            &[doc("skyair", "<p>maintenance page</p>", 1)],
            &RankWeights::default(),
        );
        assert!(!report.updated);
        assert_eq!(report.new_rule_count, 0);
        assert!(reg.get_rules("skyair").is_none());
    }

    #[test]
    fn skyair_fixtures_end_to_end() {
        let a = std::fs::read_to_string("tests/fixtures/skyair_results.html").unwrap();
        let b = std::fs::read_to_string("tests/fixtures/skyair_results2.html").unwrap();
        let reg = RuleRegistry::new();
        let docs = [doc("skyair", &a, 1), doc("skyair", &b, 2)];
        let report = run_batch(&reg, "skyair", &docs, &RankWeights::default());
        assert!(report.updated);

        let set = reg.get_rules("skyair").unwrap();
        assert_eq!(set.rules[0].candidate.key(), ".price-value");
        assert_eq!(set.rules[0].support, 2);
        for pair in set.rules.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        // First result card of the first capture.
        assert_eq!(set.extract_first(&a).unwrap().value, 123);
    }

    #[test]
    fn brightfare_json_fixture() {
        let body = std::fs::read_to_string("tests/fixtures/brightfare_api.json").unwrap();
        let reg = RuleRegistry::new();
        run_batch(
            &reg,
            "brightfare",
            &[doc("brightfare", &body, 1)],
            &RankWeights::default(),
        );
        let set = reg.get_rules("brightfare").unwrap();
        // Pure JSON: no markup, so every derived rule is textual.
        assert!(set.rules.iter().all(|r| !r.candidate.is_structural()));
        let price_fallback = set
            .rules
            .iter()
            .find(|r| r.candidate.key() == r#""price":\s*"?[£$€]?(\d{1,4})"?"#)
            .unwrap();
        assert_eq!(price_fallback.support, 1);
        let hit = set.extract_first(&body).unwrap();
        assert!([29, 45, 112, 186].contains(&hit.value));
    }

    #[test]
    fn failed_batch_keeps_previous_rules() {
        let reg = RuleRegistry::new();
        run_batch(
            &reg,
            "skyair",
            &[doc("skyair", "<b class=\"price-tag\">£9</b>", 1)],
            &RankWeights::default(),
        );
        let before = reg.get_rules("skyair").unwrap();
        let report = run_batch(
            &reg,
            "skyair",
            &[doc("skyair", "<p>oops empty</p>", 5)],
            &RankWeights::default(),
        );
        assert!(!report.updated);
        assert_eq!(report.previous_rule_count, before.rule_count());
        assert_eq!(reg.get_rules("skyair").unwrap(), before);
    }
}
