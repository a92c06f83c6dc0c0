//! Metadata derived from a post's Markdown body.

use std::collections::BTreeSet;
use std::sync::LazyLock;

/// A hashtag: `#` followed by word characters, at the start of the text or after whitespace.
/// Markdown headings (`# Title`) do not match because of the space after `#`.
static TAG_REGEX: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?:^|\s)#(\w+)").expect("Invalid tag regex"));

/// Average adult reading speed used for the estimate.
const WORDS_PER_MINUTE: usize = 265;

/// Extracts the unique hashtags from a Markdown body.
pub fn extract_tags(body: &str) -> BTreeSet<String> {
    TAG_REGEX
        .captures_iter(body)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Estimated reading time in whole minutes, rounded up.
///
/// Zero only for a blank body; any other body takes at least a minute.
pub fn reading_time_minutes(body: &str) -> u32 {
    if body.trim().is_empty() {
        return 0;
    }
    let words = body
        .split_whitespace()
        .filter(|token| token.chars().any(char::is_alphanumeric))
        .count();
    u32::try_from(words.div_ceil(WORDS_PER_MINUTE).max(1)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_tags() {
        let tags = extract_tags("#rust is fun\nsee also #tokio, and #rust again");
        assert_eq!(
            tags.into_iter().collect::<Vec<_>>(),
            vec!["rust".to_string(), "tokio".to_string()]
        );
    }

    #[test]
    fn test_headings_and_anchors_are_not_tags() {
        let tags = extract_tags("# Heading\n## Sub\nhttp://example.com/page#anchor");
        assert!(tags.is_empty());
    }

    #[test]
    fn test_reading_time() {
        assert_eq!(reading_time_minutes(""), 0);
        assert_eq!(reading_time_minutes(" \n\t "), 0);
        // Markup without words still counts as a non-empty body.
        assert_eq!(reading_time_minutes("  --- ***  "), 1);
        assert_eq!(reading_time_minutes("hello world"), 1);
        let long = "word ".repeat(266);
        assert_eq!(reading_time_minutes(&long), 2);
    }
}
