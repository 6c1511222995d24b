//! Topic name and filter validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must occupy the last level
//! - Single-level wildcard (+) must occupy an entire level

/// Validate a topic name (used in PUBLISH)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > u16::MAX as usize {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if topic.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
///
/// Shared-subscription prefixes must already be stripped.
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > u16::MAX as usize {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Check if a topic filter matches a topic name
///
/// - `/` is the level separator
/// - `+` matches exactly one level
/// - `#` matches the remaining levels, including none, so `a/#` matches `a`
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("a/+/c", "a/b/c", true ; "plus middle")]
    #[test_case("a/#", "a/b/c", true ; "hash suffix")]
    #[test_case("a/+", "a/b/c", false ; "plus is one level")]
    #[test_case("a/#", "a", true ; "hash matches parent")]
    #[test_case("#", "a/b", true ; "hash root")]
    #[test_case("+", "a", true ; "plus single")]
    #[test_case("+", "a/b", false ; "plus root too short")]
    #[test_case("a/b", "a/b", true ; "literal")]
    #[test_case("a/b", "a/c", false ; "literal mismatch")]
    #[test_case("a/b/c", "a/b", false ; "filter longer")]
    #[test_case("a/+/#", "a/b", true ; "plus then hash")]
    #[test_case("+/+", "/a", true ; "empty first level")]
    #[test_case("a//b", "a//b", true ; "empty middle level")]
    fn test_topic_matches_filter(filter: &str, topic: &str, expected: bool) {
        assert_eq!(topic_matches_filter(topic, filter), expected);
    }

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("a/b/c").is_ok());
        assert!(validate_topic_name("/").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("a/+").is_err());
        assert!(validate_topic_name("a/#").is_err());
        assert!(validate_topic_name("a\0b").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("a/+/c").is_ok());
        assert!(validate_topic_filter("a/#").is_ok());
        assert!(validate_topic_filter("+/+/+").is_ok());
        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("a/#/c").is_err());
        assert!(validate_topic_filter("a/b#").is_err());
        assert!(validate_topic_filter("a/b+").is_err());
        assert!(validate_topic_filter("a+/b").is_err());
    }
}
