use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::extract::apply::{self, ExtractedPrice};
use crate::extract::candidates::{
    Heuristic, PathStep, Rule, RuleCandidate, StructuralSelector, TextPattern, JSON_KEY_PATTERNS,
};
use crate::extract::markup::{NodeTest, ParsedDoc};
use crate::extract::rank::ScoredRule;

/// The trusted, priority-ordered rules for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteRuleSet {
    /// Highest score first; score is non-increasing through the sequence.
    pub rules: Vec<ScoredRule>,
    pub last_updated: DateTime<Utc>,
}

impl SiteRuleSet {
    pub fn new(rules: Vec<ScoredRule>, last_updated: DateTime<Utc>) -> SiteRuleSet {
        SiteRuleSet {
            rules,
            last_updated,
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Try rules in priority order against a fresh body; first hit wins.
    /// This is what the fetch layer calls after capturing a page.
    pub fn extract_first(&self, body: &str) -> Option<ExtractedPrice> {
        let doc = ParsedDoc::parse(body);
        self.rules
            .iter()
            .find_map(|r| apply::extract_with(&doc, &r.candidate.rule))
    }

    pub fn to_records(&self) -> Vec<RuleRecord> {
        self.rules.iter().map(RuleRecord::from_scored).collect()
    }

    /// Rebuild from persisted records, order preserved. Records that no
    /// longer parse are dropped rather than failing the whole load.
    pub fn from_records(records: Vec<RuleRecord>, last_updated: DateTime<Utc>) -> SiteRuleSet {
        let rules = records
            .into_iter()
            .filter_map(|r| r.into_scored())
            .collect();
        SiteRuleSet {
            rules,
            last_updated,
        }
    }
}

/// Storage shape for one rule, the contract the serving layer persists:
/// `{kind, value, score, support}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRecord {
    pub kind: RuleKind,
    pub value: String,
    pub score: f64,
    pub support: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Structural,
    Textual,
}

impl RuleRecord {
    fn from_scored(rule: &ScoredRule) -> RuleRecord {
        let kind = if rule.candidate.is_structural() {
            RuleKind::Structural
        } else {
            RuleKind::Textual
        };
        RuleRecord {
            kind,
            value: rule.candidate.key(),
            score: rule.score,
            support: rule.support as f64,
        }
    }

    fn into_scored(self) -> Option<ScoredRule> {
        let candidate = match self.kind {
            RuleKind::Structural => {
                let test = NodeTest::parse(&self.value)?;
                let heuristic = heuristic_for_test(&test);
                let path = vec![path_step_for_test(&test)];
                RuleCandidate {
                    rule: Rule::Structural(StructuralSelector { path, test }),
                    heuristic,
                    example: String::new(),
                }
            }
            RuleKind::Textual => {
                let tp = TextPattern {
                    pattern: self.value.clone(),
                };
                tp.compile()?;
                let heuristic = if JSON_KEY_PATTERNS.contains(&self.value.as_str()) {
                    Heuristic::JsonKey
                } else {
                    Heuristic::ContextPattern
                };
                RuleCandidate {
                    rule: Rule::Textual(tp),
                    heuristic,
                    example: String::new(),
                }
            }
        };
        Some(ScoredRule {
            candidate,
            score: self.score,
            support: self.support.max(0.0).round() as usize,
        })
    }
}

fn heuristic_for_test(test: &NodeTest) -> Heuristic {
    match test {
        NodeTest::AttrPresent(name) | NodeTest::AttrContains(name, _)
            if name.starts_with("data-") =>
        {
            Heuristic::DataAttr
        }
        NodeTest::AttrPresent(_) | NodeTest::AttrContains(_, _) => Heuristic::SemanticAttr,
        NodeTest::Id(_) => Heuristic::ElementId,
        NodeTest::Class(_) => Heuristic::FirstClass,
        NodeTest::TagWithAttr(_, _) => Heuristic::TagFallback,
    }
}

fn path_step_for_test(test: &NodeTest) -> PathStep {
    match test {
        NodeTest::Class(cls) => PathStep {
            tag: "*".into(),
            predicates: vec![("class".into(), cls.clone())],
        },
        NodeTest::Id(id) => PathStep {
            tag: "*".into(),
            predicates: vec![("id".into(), id.clone())],
        },
        NodeTest::AttrPresent(name) => PathStep {
            tag: "*".into(),
            predicates: vec![(name.clone(), String::new())],
        },
        NodeTest::AttrContains(name, needle) => PathStep {
            tag: "*".into(),
            predicates: vec![(name.clone(), needle.clone())],
        },
        NodeTest::TagWithAttr(tag, attr) => PathStep {
            tag: tag.clone(),
            predicates: vec![(attr.clone(), String::new())],
        },
    }
}

/// Storage shape for one source's rule set.
#[derive(Debug, Serialize, Deserialize)]
pub struct RuleSetRecord {
    pub rules: Vec<RuleRecord>,
    pub rule_count: usize,
    pub last_updated: DateTime<Utc>,
}

impl RuleSetRecord {
    pub fn from_set(set: &SiteRuleSet) -> RuleSetRecord {
        RuleSetRecord {
            rules: set.to_records(),
            rule_count: set.rule_count(),
            last_updated: set.last_updated,
        }
    }
}

/// In-memory registry of per-source rule sets. Constructed empty and mutated
/// only through `merge` (or `restore` when loading persisted state). Merges
/// for different sources proceed in parallel; per source, writers serialize
/// on the slot mutex and replacement is all-or-nothing.
pub struct RuleRegistry {
    sites: RwLock<HashMap<String, Mutex<SiteRuleSet>>>,
}

impl Default for RuleRegistry {
    fn default() -> Self {
        RuleRegistry::new()
    }
}

impl RuleRegistry {
    pub fn new() -> RuleRegistry {
        RuleRegistry {
            sites: RwLock::new(HashMap::new()),
        }
    }

    /// Atomically replace the rule set for `source`. An empty `new_rules` is
    /// a no-op: no signal, not an instruction to clear. A transiently empty
    /// batch must never cost a working rule. Returns whether a replace
    /// happened.
    pub fn merge(
        &self,
        source: &str,
        new_rules: Vec<ScoredRule>,
        batch_timestamp: DateTime<Utc>,
    ) -> bool {
        if new_rules.is_empty() {
            return false;
        }
        {
            let sites = self.sites.read().unwrap();
            if let Some(slot) = sites.get(source) {
                let mut set = slot.lock().unwrap();
                *set = SiteRuleSet::new(new_rules, batch_timestamp);
                return true;
            }
        }
        let mut sites = self.sites.write().unwrap();
        match sites.get(source) {
            // Lost the race to another writer inserting the same source.
            Some(slot) => {
                let mut set = slot.lock().unwrap();
                *set = SiteRuleSet::new(new_rules, batch_timestamp);
            }
            None => {
                sites.insert(
                    source.to_string(),
                    Mutex::new(SiteRuleSet::new(new_rules, batch_timestamp)),
                );
            }
        }
        true
    }

    /// Install a rule set loaded from storage, bypassing merge semantics.
    pub fn restore(&self, source: &str, set: SiteRuleSet) {
        let mut sites = self.sites.write().unwrap();
        sites.insert(source.to_string(), Mutex::new(set));
    }

    pub fn get_rules(&self, source: &str) -> Option<SiteRuleSet> {
        let sites = self.sites.read().unwrap();
        sites.get(source).map(|slot| slot.lock().unwrap().clone())
    }

    pub fn rule_count(&self, source: &str) -> usize {
        let sites = self.sites.read().unwrap();
        sites
            .get(source)
            .map(|slot| slot.lock().unwrap().rule_count())
            .unwrap_or(0)
    }

    /// Advisory only: the registry never expires rules itself. A source with
    /// no rules at all reports stale.
    pub fn is_stale(&self, source: &str, max_age: Duration, now: DateTime<Utc>) -> bool {
        match self.get_rules(source) {
            Some(set) => set.last_updated < now - max_age,
            None => true,
        }
    }

    pub fn sources(&self) -> Vec<String> {
        let sites = self.sites.read().unwrap();
        let mut out: Vec<String> = sites.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn snapshot(&self) -> Vec<(String, SiteRuleSet)> {
        let sites = self.sites.read().unwrap();
        let mut out: Vec<(String, SiteRuleSet)> = sites
            .iter()
            .map(|(k, v)| (k.clone(), v.lock().unwrap().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

// ── Tests ──
