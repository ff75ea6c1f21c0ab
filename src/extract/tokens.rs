use std::sync::LazyLock;

use regex::Regex;

/// Bytes of surrounding text kept on each side of a recognized digit run.
const CONTEXT_WINDOW: usize = 24;

/// Largest value a 1–4 digit price token can carry.
const MAX_VALUE: u32 = 9999;

// One alternation per adjacency rule; `captures_iter` walks them lazily and
// non-overlapping. Digit runs allow a single thousands separator; bare runs
// only match through the keyword arms, so unmarked years never emit.
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r#"(?P<sym_pre>[£$€])\s?(?P<n1>\d{1,2},\d{3}|\d{1,4})"#,
        r#"|(?P<n2>\d{1,2},\d{3}|\d{1,4})\s?(?P<sym_post>[£$€])"#,
        r#"|(?P<code_pre>GBP|USD|EUR)["':\s]{1,3}(?P<n3>\d{1,2},\d{3}|\d{1,4})"#,
        r#"|(?P<n4>\d{1,2},\d{3}|\d{1,4})\s?(?P<code_post>GBP|USD|EUR)"#,
        r#"|(?P<kw_pre>(?i:price|fare|cost|amount|total|value))["'>\s:=-]{0,8}(?P<n5>\d{1,2},\d{3}|\d{1,4})"#,
        r#"|(?P<n6>\d{1,2},\d{3}|\d{1,4})["'\s:=-]{0,8}(?P<kw_post>(?i:price|fare|cost|amount|total|value))"#,
    ))
    .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Currency {
    Gbp,
    Usd,
    Eur,
}

impl Currency {
    pub fn as_code(&self) -> &'static str {
        match self {
            Currency::Gbp => "GBP",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
        }
    }

    fn from_symbol(sym: &str) -> Option<Currency> {
        match sym {
            "£" => Some(Currency::Gbp),
            "$" => Some(Currency::Usd),
            "€" => Some(Currency::Eur),
            _ => None,
        }
    }

    fn from_code(code: &str) -> Option<Currency> {
        match code {
            "GBP" => Some(Currency::Gbp),
            "USD" => Some(Currency::Usd),
            "EUR" => Some(Currency::Eur),
            _ => None,
        }
    }
}

/// A substring recognized as a plausible price, with enough surrounding
/// context for the candidate generator to work from.
#[derive(Debug, Clone)]
pub struct TokenSpan {
    /// Byte span of the digit run within the document body.
    pub start: usize,
    pub end: usize,
    pub value: u32,
    /// Bounded context window around the digit run.
    pub context: String,
    /// Absolute byte offset of `context` within the body.
    pub context_start: usize,
    pub currency: Option<Currency>,
}

/// Scan a document body for price tokens. Lazy, deterministic, no side
/// effects; a body yielding nothing recognizable yields an empty sequence.
pub fn recognize(body: &str) -> impl Iterator<Item = TokenSpan> + '_ {
    TOKEN_RE
        .captures_iter(body)
        .filter_map(|caps| token_from(body, &caps))
}

fn token_from(body: &str, caps: &regex::Captures) -> Option<TokenSpan> {
    let digits = ["n1", "n2", "n3", "n4", "n5", "n6"]
        .iter()
        .find_map(|name| caps.name(name))?;
    let (start, end) = (digits.start(), digits.end());

    // Maximality: the run must not continue on either side.
    let bytes = body.as_bytes();
    if start > 0 && bytes[start - 1].is_ascii_digit() {
        return None;
    }
    if end < bytes.len() && bytes[end].is_ascii_digit() {
        return None;
    }

    let value: u32 = digits.as_str().replace(',', "").parse().ok()?;
    if value > MAX_VALUE {
        return None;
    }

    let currency = caps
        .name("sym_pre")
        .or_else(|| caps.name("sym_post"))
        .and_then(|m| Currency::from_symbol(m.as_str()))
        .or_else(|| {
            caps.name("code_pre")
                .or_else(|| caps.name("code_post"))
                .and_then(|m| Currency::from_code(m.as_str()))
        });

    let context_start = floor_char(body, start.saturating_sub(CONTEXT_WINDOW));
    let context_end = ceil_char(body, (end + CONTEXT_WINDOW).min(body.len()));

    Some(TokenSpan {
        start,
        end,
        value,
        context: body[context_start..context_end].to_string(),
        context_start,
        currency,
    })
}

fn floor_char(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn all(body: &str) -> Vec<TokenSpan> {
        recognize(body).collect()
    }

    #[test]
    fn pound_prefix() {
        let tokens = all("Fly to Rome from £123 return");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].value, 123);
        assert_eq!(tokens[0].currency, Some(Currency::Gbp));
    }

    #[test]
    fn symbol_suffix() {
        let tokens = all("ab 450 € cd");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].value, 450);
        assert_eq!(tokens[0].currency, Some(Currency::Eur));
    }

    #[test]
    fn thousands_separator() {
        let tokens = all("Business class $1,299 one way");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].value, 1299);
        assert_eq!(tokens[0].currency, Some(Currency::Usd));
    }

    #[test]
    fn currency_code() {
        let tokens = all("total due USD 450 today");
        assert!(tokens.iter().any(|t| t.value == 450 && t.currency == Some(Currency::Usd)));
    }

    #[test]
    fn json_key_context() {
        let tokens = all(r#"{"flights":[{"price":599,"stops":0}]}"#);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].value, 599);
        assert_eq!(tokens[0].currency, None);
    }

    #[test]
    fn quoted_price_with_symbol() {
        let tokens = all(r#"{"fare":"£59"}"#);
        assert_eq!(tokens[0].value, 59);
        assert_eq!(tokens[0].currency, Some(Currency::Gbp));
    }

    #[test]
    fn bare_year_excluded() {
        assert!(all("Founded in 1999. Copyright 2024.").is_empty());
    }

    #[test]
    fn keyword_rescues_bare_number() {
        let tokens = all("Total: 1999");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].value, 1999);
    }

    #[test]
    fn five_digit_run_rejected() {
        assert!(all("£12345 is not a fare").is_empty());
    }

    #[test]
    fn digit_run_maximality_before_symbol() {
        assert!(all("id 90210 $ suffix").is_empty());
    }

    #[test]
    fn offsets_point_at_digits() {
        let body = "<span class=\"price-value\">£123</span>";
        let tokens = all(body);
        assert_eq!(&body[tokens[0].start..tokens[0].end], "123");
        assert!(tokens[0].context.contains("£123"));
        assert!(tokens[0].context_start <= tokens[0].start);
    }

    #[test]
    fn empty_and_garbage_bodies() {
        assert!(all("").is_empty());
        assert!(all("<<<>>> \u{fffd}\u{fffd}").is_empty());
    }

    #[test]
    fn deterministic() {
        let body = "£123 then $45 then \"amount\": 7";
        let a: Vec<u32> = recognize(body).map(|t| t.value).collect();
        let b: Vec<u32> = recognize(body).map(|t| t.value).collect();
        assert_eq!(a, b);
    }
}
