use std::sync::LazyLock;

use regex::Regex;

use super::candidates::{Rule, StructuralSelector, TextPattern};
use super::markup::{NodeTest, ParsedDoc};
use super::tokens;

// Loose price shape for checking a selected node's text, same set the
// recognizer accepts next to a symbol.
static PRICE_IN_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[£$€]\s?(\d{1,2},\d{3}|\d{1,4})|(\d{1,2},\d{3}|\d{1,4})\s?[£$€]").unwrap()
});

static BARE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,2},\d{3}|\d{1,4})").unwrap());

/// A price pulled out of a body by one rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedPrice {
    pub value: u32,
    /// The text fragment the rule matched.
    pub matched: String,
}

/// Apply a rule to a raw body. `doc` must be the parse of the same body.
pub fn extract_with(doc: &ParsedDoc, rule: &Rule) -> Option<ExtractedPrice> {
    match rule {
        Rule::Structural(sel) => extract_structural(doc, sel),
        Rule::Textual(tp) => extract_textual(doc.body, tp),
    }
}

pub fn extract_structural(doc: &ParsedDoc, sel: &StructuralSelector) -> Option<ExtractedPrice> {
    extract_by_test(doc, &sel.test)
}

pub fn extract_by_test(doc: &ParsedDoc, test: &NodeTest) -> Option<ExtractedPrice> {
    let semantic = super::contains_price_keyword(&test.to_string());
    for idx in doc.matching(test) {
        let text = doc.inner_text(idx);
        if text.is_empty() {
            continue;
        }
        // A node counts as matching when its text holds a recognizable price
        // token; for a price-semantic selector a bare digit run is enough.
        let token_value = tokens::recognize(&text).next().map(|token| token.value);
        if let Some(value) = token_value {
            return Some(ExtractedPrice {
                value,
                matched: text,
            });
        }
        if PRICE_IN_TEXT.is_match(&text) {
            if let Some(value) = first_run_value(&text) {
                return Some(ExtractedPrice { value, matched: text });
            }
        }
        if semantic {
            if let Some(value) = first_run_value(&text) {
                return Some(ExtractedPrice { value, matched: text });
            }
        }
    }
    None
}

pub fn extract_textual(body: &str, tp: &TextPattern) -> Option<ExtractedPrice> {
    let re = tp.compile()?;
    extract_compiled(body, &re)
}

/// Textual extraction with a pre-compiled pattern; the ranker uses this to
/// avoid recompiling per document.
pub fn extract_compiled(body: &str, re: &Regex) -> Option<ExtractedPrice> {
    let caps = re.captures(body)?;
    let whole = caps.get(0)?.as_str().to_string();
    let digits = caps.get(1)?.as_str();
    let value: u32 = digits.replace(',', "").parse().ok()?;
    (value <= 9999).then_some(ExtractedPrice {
        value,
        matched: whole,
    })
}

fn first_run_value(text: &str) -> Option<u32> {
    let m = BARE_RUN.find(text)?;
    let value: u32 = m.as_str().replace(',', "").parse().ok()?;
    (value <= 9999).then_some(value)
}

// ── Tests ──
