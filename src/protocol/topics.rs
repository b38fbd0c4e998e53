//! MQTT topic filters
//!
//! A [`TopicFilter`] is compiled once from a filter string into a list of
//! segments and then matched against concrete topics. Only two tokens are
//! special, and only when they make up a whole segment:
//!
//! - `+` matches exactly one non-empty level
//! - `#` (final segment only) matches one or more remaining levels
//!
//! A filter of exactly `#` matches every topic. Everything else, including
//! spaces, `*`, `;` or non-ASCII text, is compared literally and case-sensitively.

use crate::error::{RxMqttError, RxMqttResult};

const LEVEL_SEPARATOR: char = '/';
const SINGLE_LEVEL_WILDCARD: &str = "+";
const MULTI_LEVEL_WILDCARD: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

/// A compiled MQTT topic filter
///
/// # Examples
/// ```
/// use rxmqtt::protocol::TopicFilter;
///
/// let filter = TopicFilter::new("sensors/+/temperature").unwrap();
/// assert!(filter.is_match("sensors/kitchen/temperature"));
/// assert!(!filter.is_match("sensors/kitchen/humidity"));
///
/// let all = TopicFilter::new("sensors/#").unwrap();
/// assert!(all.is_match("sensors/kitchen/temperature"));
/// assert!(!all.is_match("sensors"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pattern: String,
    segments: Vec<Segment>,
}

impl TopicFilter {
    /// Compile a filter string
    ///
    /// Fails with [`RxMqttError::InvalidArgument`] when the string is empty or
    /// whitespace, or when `#` appears anywhere but the last segment.
    pub fn new(pattern: &str) -> RxMqttResult<Self> {
        validate_topic_argument("topic", pattern)?;

        let levels: Vec<&str> = pattern.split(LEVEL_SEPARATOR).collect();
        let last = levels.len() - 1;
        let mut segments = Vec::with_capacity(levels.len());
        for (index, level) in levels.into_iter().enumerate() {
            let segment = match level {
                SINGLE_LEVEL_WILDCARD => Segment::SingleLevel,
                MULTI_LEVEL_WILDCARD if index == last => Segment::MultiLevel,
                MULTI_LEVEL_WILDCARD => {
                    return Err(RxMqttError::invalid_argument(
                        "topic",
                        format!("'#' is only valid as the final segment of '{pattern}'"),
                    ));
                }
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            pattern: pattern.to_string(),
            segments,
        })
    }

    /// The filter string this filter was built from
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the filter contains `+` or `#`
    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| !matches!(segment, Segment::Literal(_)))
    }

    /// Check a concrete topic against the filter
    pub fn is_match(&self, topic: &str) -> bool {
        if self.segments == [Segment::MultiLevel] {
            return true;
        }

        let mut levels = topic.split(LEVEL_SEPARATOR);
        for segment in &self.segments {
            match segment {
                Segment::Literal(expected) => match levels.next() {
                    Some(level) if level == expected => {}
                    _ => return false,
                },
                Segment::SingleLevel => match levels.next() {
                    Some(level) if is_wildcard_level(level) => {}
                    _ => return false,
                },
                Segment::MultiLevel => return matches_remaining(levels.collect()),
            }
        }

        levels.next().is_none()
    }
}

impl std::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.pattern)
    }
}

impl std::str::FromStr for TopicFilter {
    type Err = RxMqttError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Reject empty or whitespace-only topic arguments
pub fn validate_topic_argument(name: &'static str, value: &str) -> RxMqttResult<()> {
    if value.trim().is_empty() {
        return Err(RxMqttError::invalid_argument(
            name,
            "cannot be empty or whitespace",
        ));
    }
    Ok(())
}

// A level a wildcard may stand in for: non-empty and not itself a wildcard token
fn is_wildcard_level(level: &str) -> bool {
    !level.is_empty() && level != SINGLE_LEVEL_WILDCARD && level != MULTI_LEVEL_WILDCARD
}

// `#` needs at least one real level; a single trailing separator is tolerated
fn matches_remaining(levels: Vec<&str>) -> bool {
    match levels.split_last() {
        None => false,
        Some((last, init)) if last.is_empty() => {
            !init.is_empty() && init.iter().all(|level| is_wildcard_level(level))
        }
        Some((last, init)) => {
            is_wildcard_level(last) && init.iter().all(|level| is_wildcard_level(level))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn matches(filter: &str, topic: &str) -> bool {
        TopicFilter::new(filter).unwrap().is_match(topic)
    }

    #[test]
    fn test_wildcards() {
        assert!(matches("Test/#", "Test/P/Te/T"));
        assert!(matches("Test/Pre/#", "Test/Pre/Te/T"));
        assert!(matches("P/+/Test", "P/T/Test"));
        assert!(!matches("P/+/Test", "Pre/T/Test"));
        assert!(matches("Pre/+/Test", "Pre/T/Test"));
        assert!(!matches("Pre/+/Test", "P/T/Test"));
    }

    #[test]
    fn test_exact_topics() {
        assert!(matches("Test/Pre", "Test/Pre"));
        assert!(!matches("Test/Pre", "Test/Pre/Te/T"));
        assert!(matches("Test/Te/T/Pre", "Test/Te/T/Pre"));
        assert!(!matches("Test/Te/T/Pre", "Test/Te/T/"));
    }

    #[test]
    fn test_multi_level_requires_a_level() {
        assert!(!matches("Test/#", "Test"));
        assert!(!matches("Test/#", "Test/"));
        assert!(matches("Test/#", "Test/a"));
        assert!(matches("Test/#", "Test/a/"));
        assert!(!matches("Test/#", "Other/a"));
    }

    #[test]
    fn test_hash_alone_matches_everything() {
        assert!(matches("#", "a"));
        assert!(matches("#", "a/b/c/d/e/f"));
        assert!(matches("#", "/leading/slash"));
        assert!(matches("#", "Test/#"));
    }

    #[test]
    fn test_single_level_segment_count() {
        assert!(matches("Pre/+/Test/+/Test", "Pre/a/Test/b/Test"));
        assert!(!matches("Pre/+/Test/+/Test", "Pre/a/Test/b"));
        assert!(!matches("Pre/+/Test/+/Test", "Pre/a/Test/b/Test/c"));
        assert!(!matches("Pre/+/Test", "Pre//Test"));
    }

    #[test]
    fn test_single_level_at_edges() {
        assert!(matches("+/b", "a/b"));
        assert!(matches("a/+", "a/b"));
        assert!(!matches("a/+", "a/b/c"));
        assert!(matches("+", "a"));
        assert!(!matches("+", "a/b"));
    }

    #[test]
    fn test_wildcards_do_not_stand_in_for_reserved_tokens() {
        assert!(!matches("Test/#", "Test/#"));
        assert!(!matches("Test/#", "Test/a/+"));
        assert!(!matches("Test/+/x", "Test/+/x"));
    }

    #[test]
    fn test_special_characters_are_literal() {
        assert!(matches("a b/c*d", "a b/c*d"));
        assert!(!matches("a b/c*d", "a b/cxd"));
        assert!(matches("größe/;-/+", "größe/;-/wert"));
        assert!(matches("a.b/+", "a.b/c"));
        assert!(!matches("a.b/+", "axb/c"));
        assert!(matches("x/+/y", "x/with space/y"));
    }

    #[test]
    fn test_case_sensitive() {
        assert!(!matches("Test/Pre", "test/pre"));
    }

    #[test]
    fn test_invalid_filters() {
        assert!(matches!(
            TopicFilter::new(""),
            Err(RxMqttError::InvalidArgument { .. })
        ));
        assert!(matches!(
            TopicFilter::new("   "),
            Err(RxMqttError::InvalidArgument { .. })
        ));
        assert!(matches!(
            TopicFilter::new("\t\n"),
            Err(RxMqttError::InvalidArgument { .. })
        ));
        assert!(matches!(
            TopicFilter::new("a/#/b"),
            Err(RxMqttError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_pattern_is_kept() {
        let filter = TopicFilter::new("Topic").unwrap();
        assert_eq!(filter.pattern(), "Topic");
        assert_eq!(filter.to_string(), "Topic");
        assert!(!filter.has_wildcards());
        assert!("a/+".parse::<TopicFilter>().unwrap().has_wildcards());
    }

    proptest! {
        #[test]
        fn hash_matches_any_topic(topic in ".+") {
            prop_assert!(matches("#", &topic));
        }

        #[test]
        fn literal_filter_matches_itself(topic in "[a-zA-Z0-9 _.-]{1,12}(/[a-zA-Z0-9 _.-]{1,12}){0,5}") {
            prop_assume!(!topic.trim().is_empty());
            prop_assert!(matches(&topic, &topic));
        }

        #[test]
        fn matching_is_deterministic(
            filter in "[ab+]{1,2}(/[ab+]{1,2}){0,3}(/#)?",
            topic in "[ab]{1,2}(/[ab]{1,2}){0,4}",
        ) {
            let compiled = TopicFilter::new(&filter).unwrap();
            let first = compiled.is_match(&topic);
            prop_assert_eq!(first, compiled.is_match(&topic));
            prop_assert_eq!(first, TopicFilter::new(&filter).unwrap().is_match(&topic));
        }

        #[test]
        fn single_level_wildcard_fills_any_level(
            prefix in "[a-z]{1,8}",
            level in "[a-zA-Z0-9]{1,8}",
            suffix in "[a-z]{1,8}",
        ) {
            let filter = format!("{prefix}/+/{suffix}");
            let topic = format!("{prefix}/{level}/{suffix}");
            prop_assert!(matches(&filter, &topic));
        }
    }
}
