use std::collections::{BTreeSet, HashMap};

use sha2::{Digest, Sha256};

use crate::extract::markup::ParsedDoc;

/// Structural fingerprint of a capture: the markup features that matter for
/// selector survival, not the text content. Prices change hourly; class
/// names, data attributes, search forms, and script bundles change when the
/// site is redesigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub digest: String,
    pub features: BTreeSet<String>,
}

pub fn fingerprint(body: &str) -> Fingerprint {
    let doc = ParsedDoc::parse(body);
    let mut features: BTreeSet<String> = BTreeSet::new();
    let mut form_inputs: HashMap<usize, Vec<String>> = HashMap::new();

    for (idx, node) in doc.nodes.iter().enumerate() {
        let el = &node.element;
        for class in el.classes() {
            features.insert(class.to_string());
        }
        for (name, value) in &el.attrs {
            if name.starts_with("data-") {
                features.insert(format!("{}={}", name, value));
            }
        }
        if el.tag == "script" {
            if let Some(src) = el.attr("src").filter(|s| !s.is_empty()) {
                let file = src.rsplit('/').next().unwrap_or(src);
                let file = file.split('?').next().unwrap_or(file);
                features.insert(format!("script:{}", file));
            }
        }
        if el.tag == "input" {
            if let Some(form) = enclosing_form(&doc, idx) {
                form_inputs
                    .entry(form)
                    .or_default()
                    .push(el.attr("name").unwrap_or("").to_string());
            }
        }
    }

    for (_, names) in form_inputs {
        features.insert(format!("form:{}", names.join("-")));
    }

    let joined = features.iter().cloned().collect::<Vec<_>>().join("|");
    let digest = hex::encode(Sha256::digest(joined.as_bytes()));
    Fingerprint { digest, features }
}

fn enclosing_form(doc: &ParsedDoc, idx: usize) -> Option<usize> {
    let mut cur = doc.nodes[idx].parent;
    while let Some(i) = cur {
        if doc.nodes[i].element.tag == "form" {
            return Some(i);
        }
        cur = doc.nodes[i].parent;
    }
    None
}

/// Jaccard similarity over the feature sets; 1.0 for identical fingerprints,
/// including the two-empty-sets case.
pub fn similarity(a: &Fingerprint, b: &Fingerprint) -> f64 {
    if a.digest == b.digest {
        return 1.0;
    }
    let intersection = a.features.intersection(&b.features).count();
    let union = a.features.union(&b.features).count();
    if union == 0 {
        return 1.0;
    }
    intersection as f64 / union as f64
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = concat!(
        "<html><head><script src=\"/assets/app.3f2a.js?v=9\"></script></head>",
        "<body><form action=\"/search\">",
        "<input name=\"from\"><input name=\"to\"><input name=\"date\">",
        "</form>",
        "<div class=\"results\"><span class=\"price-value\" data-testid=\"price-total\">£123</span></div>",
        "</body></html>",
    );

    #[test]
    fn captures_expected_features() {
        let fp = fingerprint(PAGE);
        assert!(fp.features.contains("price-value"));
        assert!(fp.features.contains("data-testid=price-total"));
        assert!(fp.features.contains("script:app.3f2a.js"));
        assert!(fp.features.contains("form:from-to-date"));
    }

    #[test]
    fn identical_bodies_identical_digest() {
        let a = fingerprint(PAGE);
        let b = fingerprint(PAGE);
        assert_eq!(a.digest, b.digest);
        assert_eq!(similarity(&a, &b), 1.0);
    }

    #[test]
    fn text_changes_do_not_move_the_needle() {
        let other = PAGE.replace("£123", "£999");
        let a = fingerprint(PAGE);
        let b = fingerprint(&other);
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn redesign_lowers_similarity() {
        let redesigned = PAGE
            .replace("price-value", "fare-chip")
            .replace("app.3f2a.js", "bundle.9c1d.js");
        let a = fingerprint(PAGE);
        let b = fingerprint(&redesigned);
        let sim = similarity(&a, &b);
        assert!(sim < 1.0);
        assert!(sim > 0.0);
    }

    #[test]
    fn skyair_redesign_fixture_flags_change() {
        let original = std::fs::read_to_string("tests/fixtures/skyair_results.html").unwrap();
        let redesign = std::fs::read_to_string("tests/fixtures/skyair_redesign.html").unwrap();
        let a = fingerprint(&original);
        let b = fingerprint(&redesign);
        assert!(a.features.contains("price-value"));
        assert!(a.features.contains("form:from-to-depart"));
        assert!(similarity(&a, &b) < 0.7);
        assert_eq!(similarity(&a, &fingerprint(&original)), 1.0);
    }

    #[test]
    fn empty_bodies_are_identical() {
        let a = fingerprint("");
        let b = fingerprint("");
        assert_eq!(similarity(&a, &b), 1.0);
    }
}
