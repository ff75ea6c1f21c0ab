use crate::extract::apply::{self, ExtractedPrice};
use crate::extract::markup::ParsedDoc;
use crate::registry::SiteRuleSet;

/// How many of a source's trusted rules still fire against a fresh capture.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleHealth {
    pub working: usize,
    pub total: usize,
    /// Value extracted by the highest-priority working rule.
    pub sample: Option<ExtractedPrice>,
}

impl RuleHealth {
    pub fn healthy_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.working as f64 / self.total as f64
    }
}

/// Apply every rule of a set to one fresh body. Pure; the caller decides what
/// ratio warrants re-deriving rules.
pub fn check_rules(set: &SiteRuleSet, body: &str) -> RuleHealth {
    let doc = ParsedDoc::parse(body);
    let mut working = 0;
    let mut sample = None;
    for rule in &set.rules {
        if let Some(hit) = apply::extract_with(&doc, &rule.candidate.rule) {
            working += 1;
            if sample.is_none() {
                sample = Some(hit);
            }
        }
    }
    RuleHealth {
        working,
        total: set.rules.len(),
        sample,
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::candidates::generate;
    use crate::extract::rank::{rank, RankWeights};
    use crate::extract::tokens::recognize;
    use chrono::{TimeZone, Utc};

    fn rule_set(body: &str) -> SiteRuleSet {
        let tokens: Vec<_> = recognize(body).collect();
        let ranked = rank(&[body], generate(body, &tokens), &RankWeights::default());
        SiteRuleSet::new(ranked, Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn supported_rules_fire_on_unchanged_markup() {
        let body = "<b class=\"price-tag\">£9</b>";
        let set = rule_set(body);
        // Every rule that had batch support still matches the same markup;
        // the zero-support JSON fallbacks are the only ones that do not.
        let supported = set.rules.iter().filter(|r| r.support > 0).count();
        let health = check_rules(&set, body);
        assert_eq!(health.working, supported);
        assert_eq!(health.sample.as_ref().unwrap().value, 9);
    }

    #[test]
    fn pruned_set_reports_full_health() {
        let body = "<b class=\"price-tag\">£9</b>";
        let mut set = rule_set(body);
        set.rules.retain(|r| r.support > 0);
        let health = check_rules(&set, body);
        assert_eq!(health.working, health.total);
        assert!((health.healthy_ratio() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn redesign_drops_ratio() {
        let set = rule_set("<b class=\"price-tag\">£9</b>");
        let health = check_rules(&set, "<div class=\"cost-chip\">£9</div>");
        assert!(health.working < health.total);
        assert!(health.healthy_ratio() < 1.0);
    }

    #[test]
    fn skyair_redesign_guts_the_rule_set() {
        let original = std::fs::read_to_string("tests/fixtures/skyair_results.html").unwrap();
        let redesign = std::fs::read_to_string("tests/fixtures/skyair_redesign.html").unwrap();
        let set = rule_set(&original);
        let health = check_rules(&set, &redesign);
        assert!(health.healthy_ratio() < 0.5);
    }

    #[test]
    fn empty_set_reports_zero() {
        let set = SiteRuleSet::new(
            Vec::new(),
            Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap(),
        );
        let health = check_rules(&set, "<b class=\"price-tag\">£9</b>");
        assert_eq!(health.total, 0);
        assert_eq!(health.healthy_ratio(), 0.0);
    }
}
