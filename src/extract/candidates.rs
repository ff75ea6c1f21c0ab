use std::collections::{HashMap, HashSet};

use regex::Regex;

use super::markup::{Element, NodeTest, ParsedDoc};
use super::tokens::TokenSpan;
use super::{contains_price_keyword, PRICE_KEYWORDS};

pub const MAX_STRUCTURAL: usize = 10;
pub const MAX_TEXTUAL: usize = 15;

/// A selector is accepted only when it matches at most this many nodes in the
/// document it came from. Repeated result-card markup legitimately matches a
/// handful of nodes; hundreds means the selector is too generic to trust.
const NEAR_UNIQUE_MAX: usize = 3;

/// Known-good JSON key patterns, appended for every document that produced
/// tokens whether or not they occur verbatim.
pub const JSON_KEY_PATTERNS: &[&str] = &[
    r#""price":\s*"?[£$€]?(\d{1,4})"?"#,
    r#""fare":\s*"?[£$€]?(\d{1,4})"?"#,
    r#""amount":\s*"?[£$€]?(\d{1,4})"?"#,
    r#""total":\s*"?[£$€]?(\d{1,4})"?"#,
    r#""value":\s*(\d{1,4})"#,
    r#"price["\s]*:["\s]*(\d{1,4})"#,
    r#"fare["\s]*:["\s]*(\d{1,4})"#,
];

/// Which heuristic produced a candidate. Order doubles as specificity order
/// for structural tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Heuristic {
    /// Tier 1: class/attribute/id containing a price keyword.
    SemanticAttr,
    /// Tier 2: data-* attribute carrying a price keyword.
    DataAttr,
    /// Tier 3: element id.
    ElementId,
    /// Tier 4: first class.
    FirstClass,
    /// Tier 5: tag plus first attribute name.
    TagFallback,
    /// Pattern generalized from an observed token context.
    ContextPattern,
    /// Fixed JSON-key fallback list.
    JsonKey,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathStep {
    pub tag: String,
    pub predicates: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructuralSelector {
    /// Element chain from document root to the matched node. Never empty.
    pub path: Vec<PathStep>,
    pub test: NodeTest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextPattern {
    /// Regex source with exactly one capture group bound to the digits.
    pub pattern: String,
}

impl TextPattern {
    pub fn compile(&self) -> Option<Regex> {
        Regex::new(&self.pattern).ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    Structural(StructuralSelector),
    Textual(TextPattern),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleCandidate {
    pub rule: Rule,
    pub heuristic: Heuristic,
    /// Raw text the heuristic fired on.
    pub example: String,
}

impl RuleCandidate {
    /// Rendered selector or pattern string; grouping key for the ranker and
    /// the persisted `value` field.
    pub fn key(&self) -> String {
        match &self.rule {
            Rule::Structural(sel) => sel.test.to_string(),
            Rule::Textual(tp) => tp.pattern.clone(),
        }
    }

    pub fn is_structural(&self) -> bool {
        matches!(self.rule, Rule::Structural(_))
    }

    pub fn is_fallback(&self) -> bool {
        self.heuristic == Heuristic::JsonKey
    }
}

/// Produce all rule candidates for one document. Both strategies always run;
/// a document that yielded no tokens yields no candidates.
pub fn generate(body: &str, tokens: &[TokenSpan]) -> Vec<RuleCandidate> {
    if tokens.is_empty() {
        return Vec::new();
    }
    let doc = ParsedDoc::parse(body);
    let mut out = structural_candidates(&doc, tokens);
    out.extend(textual_candidates(tokens));
    out
}

// ── Structural strategy ──

fn structural_candidates(doc: &ParsedDoc, tokens: &[TokenSpan]) -> Vec<RuleCandidate> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut picked: Vec<(Heuristic, RuleCandidate)> = Vec::new();

    for token in tokens {
        let chain = doc.chain_at(token.start);
        if chain.is_empty() {
            continue;
        }
        let Some((heuristic, node_idx, test)) = select_for_chain(doc, &chain, &mut counts) else {
            continue;
        };
        let key = test.to_string();
        if !seen.insert(key) {
            continue;
        }
        let depth = chain.iter().position(|&i| i == node_idx).unwrap_or(0);
        let path = chain[..=depth]
            .iter()
            .map(|&i| path_step(&doc.nodes[i].element))
            .collect();
        picked.push((
            heuristic,
            RuleCandidate {
                rule: Rule::Structural(StructuralSelector { path, test }),
                heuristic,
                example: token.context.clone(),
            },
        ));
    }

    // Most-specific tier first, stable within a tier.
    picked.sort_by_key(|(h, _)| *h);
    picked.truncate(MAX_STRUCTURAL);
    picked.into_iter().map(|(_, c)| c).collect()
}

/// Walk the enclosing chain once per tier, innermost element first, and
/// accept the first selector that near-uniquely identifies its node.
/// Semantic hints are tried before positional ones: redesigns change layout
/// far more often than naming.
fn select_for_chain(
    doc: &ParsedDoc,
    chain: &[usize],
    counts: &mut HashMap<String, usize>,
) -> Option<(Heuristic, usize, NodeTest)> {
    const TIERS: &[Heuristic] = &[
        Heuristic::SemanticAttr,
        Heuristic::DataAttr,
        Heuristic::ElementId,
        Heuristic::FirstClass,
        Heuristic::TagFallback,
    ];
    for &tier in TIERS {
        for &idx in chain.iter().rev() {
            let Some(test) = tier_test(&doc.nodes[idx].element, tier) else {
                continue;
            };
            let key = test.to_string();
            let n = *counts
                .entry(key)
                .or_insert_with(|| doc.matching(&test).len());
            if n <= NEAR_UNIQUE_MAX {
                return Some((tier, idx, test));
            }
        }
    }
    None
}

fn tier_test(el: &Element, tier: Heuristic) -> Option<NodeTest> {
    match tier {
        Heuristic::SemanticAttr => {
            if let Some(cls) = el.classes().find(|c| contains_price_keyword(c)) {
                return Some(NodeTest::Class(cls.to_string()));
            }
            if let Some(id) = el.id().filter(|id| contains_price_keyword(id)) {
                return Some(NodeTest::Id(id.to_string()));
            }
            el.attrs
                .iter()
                .find(|(name, value)| {
                    name.as_str() != "class"
                        && name.as_str() != "id"
                        && name.as_str() != "style"
                        && !name.starts_with("data-")
                        && contains_price_keyword(value)
                })
                .and_then(|(name, value)| {
                    keyword_in(value).map(|kw| NodeTest::AttrContains(name.clone(), kw.to_string()))
                })
        }
        Heuristic::DataAttr => el
            .attrs
            .iter()
            .filter(|(name, _)| name.starts_with("data-"))
            .find_map(|(name, value)| {
                if contains_price_keyword(name) {
                    Some(NodeTest::AttrPresent(name.clone()))
                } else {
                    keyword_in(value).map(|kw| NodeTest::AttrContains(name.clone(), kw.to_string()))
                }
            }),
        Heuristic::ElementId => el.id().map(|id| NodeTest::Id(id.to_string())),
        Heuristic::FirstClass => el.classes().next().map(|c| NodeTest::Class(c.to_string())),
        Heuristic::TagFallback => el
            .attrs
            .first()
            .map(|(name, _)| NodeTest::TagWithAttr(el.tag.clone(), name.clone())),
        _ => None,
    }
}

fn keyword_in(s: &str) -> Option<&'static str> {
    let lower = s.to_lowercase();
    PRICE_KEYWORDS.iter().copied().find(|kw| lower.contains(kw))
}

fn path_step(el: &Element) -> PathStep {
    let predicates = el
        .attrs
        .iter()
        .filter(|(name, _)| {
            name.as_str() == "id" || name.as_str() == "class" || name.starts_with("data-")
        })
        .cloned()
        .collect();
    PathStep {
        tag: el.tag.clone(),
        predicates,
    }
}

// ── Textual strategy ──

fn textual_candidates(tokens: &[TokenSpan]) -> Vec<RuleCandidate> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    let cap = MAX_TEXTUAL - JSON_KEY_PATTERNS.len();

    for token in tokens {
        if out.len() >= cap {
            break;
        }
        let rel_start = token.start - token.context_start;
        let rel_end = token.end - token.context_start;
        let pattern = join_segments(&split_segments(&token.context, rel_start, rel_end));
        if !pattern_is_valid(&pattern) {
            continue;
        }
        if seen.insert(pattern.clone()) {
            out.push(RuleCandidate {
                rule: Rule::Textual(TextPattern { pattern }),
                heuristic: Heuristic::ContextPattern,
                example: token.context.clone(),
            });
        }
    }

    for &pattern in JSON_KEY_PATTERNS {
        if seen.insert(pattern.to_string()) {
            out.push(RuleCandidate {
                rule: Rule::Textual(TextPattern {
                    pattern: pattern.to_string(),
                }),
                heuristic: Heuristic::JsonKey,
                example: String::new(),
            });
        }
    }

    out.truncate(MAX_TEXTUAL);
    out
}

enum Segment<'a> {
    Literal(&'a str),
    Capture { comma: bool },
}

/// Stage one of the pattern builder: cut the context into literal runs around
/// a single capture placeholder for the matched digits.
fn split_segments(context: &str, start: usize, end: usize) -> Vec<Segment<'_>> {
    let mut segments = Vec::with_capacity(3);
    if start > 0 {
        segments.push(Segment::Literal(&context[..start]));
    }
    segments.push(Segment::Capture {
        comma: context[start..end].contains(','),
    });
    if end < context.len() {
        segments.push(Segment::Literal(&context[end..]));
    }
    segments
}

/// Stage two: escape literals and join. Escaping happens per segment, so the
/// placeholder can never be mangled by it.
fn join_segments(segments: &[Segment]) -> String {
    let mut out = String::new();
    for seg in segments {
        match seg {
            Segment::Literal(text) => out.push_str(&regex::escape(text)),
            Segment::Capture { comma: false } => out.push_str(r"(\d{1,4})"),
            Segment::Capture { comma: true } => out.push_str(r"(\d{1,2},\d{3})"),
        }
    }
    out
}

/// A generated pattern must compile and bind exactly one capture group.
fn pattern_is_valid(pattern: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.captures_len() == 2,
        Err(_) => false,
    }
}

// ── Tests ──
