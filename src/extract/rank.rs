use std::collections::BTreeMap;

use super::apply;
use super::candidates::{Rule, RuleCandidate, MAX_STRUCTURAL, MAX_TEXTUAL};
use super::contains_price_keyword;
use super::markup::ParsedDoc;

/// Scoring weights. Heuristic constants, not verified optima; callers may
/// tune them per deployment.
#[derive(Debug, Clone, Copy)]
pub struct RankWeights {
    pub specificity: f64,
    pub support: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        RankWeights {
            specificity: 0.6,
            support: 0.4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRule {
    pub candidate: RuleCandidate,
    /// In [0, 1] under the default weights.
    pub score: f64,
    /// Number of batch documents the rule matched a token in.
    pub support: usize,
}

/// Rank the union of candidates from one source's batch. Grouping is keyed by
/// the rendered rule, so the result is independent of candidate input order.
pub fn rank(bodies: &[&str], candidates: Vec<RuleCandidate>, weights: &RankWeights) -> Vec<ScoredRule> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let mut groups: BTreeMap<String, RuleCandidate> = BTreeMap::new();
    for cand in candidates {
        groups.entry(cand.key()).or_insert(cand);
    }

    let parsed: Vec<ParsedDoc> = bodies.iter().map(|b| ParsedDoc::parse(b)).collect();
    let doc_count = bodies.len().max(1);

    let mut scored: Vec<ScoredRule> = groups
        .into_iter()
        .map(|(key, candidate)| {
            let support = support_count(&parsed, &candidate);
            let specificity_bonus = if contains_price_keyword(&key) { 1.0 } else { 0.5 };
            let normalized_support = support as f64 / doc_count as f64;
            let score =
                weights.specificity * specificity_bonus + weights.support * normalized_support;
            ScoredRule {
                candidate,
                score,
                support,
            }
        })
        .collect();

    // Score descending; at equal score structural rules win (cheaper to apply,
    // immune to catastrophic backtracking), fixed JSON fallbacks go last.
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| provenance_rank(&a.candidate).cmp(&provenance_rank(&b.candidate)))
            .then_with(|| a.candidate.key().cmp(&b.candidate.key()))
    });

    truncate_per_kind(scored)
}

fn support_count(parsed: &[ParsedDoc], candidate: &RuleCandidate) -> usize {
    match &candidate.rule {
        Rule::Structural(sel) => parsed
            .iter()
            .filter(|doc| apply::extract_structural(doc, sel).is_some())
            .count(),
        Rule::Textual(tp) => match tp.compile() {
            Some(re) => parsed
                .iter()
                .filter(|doc| apply::extract_compiled(doc.body, &re).is_some())
                .count(),
            None => 0,
        },
    }
}

fn provenance_rank(candidate: &RuleCandidate) -> u8 {
    if candidate.is_structural() {
        0
    } else if candidate.is_fallback() {
        2
    } else {
        1
    }
}

fn truncate_per_kind(scored: Vec<ScoredRule>) -> Vec<ScoredRule> {
    let mut structural = 0usize;
    let mut textual = 0usize;
    scored
        .into_iter()
        .filter(|s| {
            if s.candidate.is_structural() {
                structural += 1;
                structural <= MAX_STRUCTURAL
            } else {
                textual += 1;
                textual <= MAX_TEXTUAL
            }
        })
        .collect()
}

// ── Tests ──
