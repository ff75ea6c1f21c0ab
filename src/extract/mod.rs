pub mod apply;
pub mod candidates;
pub mod markup;
pub mod rank;
pub mod tokens;

/// Words that mark a class, attribute, key, or nearby text as price-bearing.
/// Shared by the recognizer, the candidate tiers, and the specificity bonus.
pub const PRICE_KEYWORDS: &[&str] = &["price", "fare", "cost", "amount", "total", "value"];

pub fn contains_price_keyword(s: &str) -> bool {
    let lower = s.to_lowercase();
    PRICE_KEYWORDS.iter().any(|kw| lower.contains(kw))
}
