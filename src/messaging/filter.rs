//! # MQTT-style topic filters.
//!
//! A filter is a `/`-separated list of levels. Each level is either:
//! - `+` matching exactly one non-empty level,
//! - `#` matching everything that remains (one or more characters, `/` included),
//! - a literal free of `/`, `+` and `#`.
//!
//! The filter compiles to one anchored regular expression. `#` is expanded in
//! place wherever it appears, so `home/#/top-light` matches
//! `home/upstairs/parental-room/top-light`.

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::error::RuntimeError;

/// A level is a lone wildcard or free of `/`, `+` and `#` (`^([+#]|[^/+#]*)$`).
fn is_valid_level(level: &str) -> bool {
    matches!(level, "+" | "#") || !level.contains(['/', '+', '#'])
}

/// Compiled, immutable topic filter.
///
/// # Example
/// ```
/// use taskmesh::TopicFilter;
///
/// let f = TopicFilter::new("home/+/top-light").unwrap();
/// assert!(f.matches("home/garage/top-light"));
/// assert!(!f.matches("home/upstairs/parental-room/top-light"));
///
/// assert!(TopicFilter::new("home+").is_err());
/// ```
#[derive(Clone)]
pub struct TopicFilter {
    filter: Arc<str>,
    regex: Regex,
}

impl TopicFilter {
    /// Validates and compiles `filter`.
    pub fn new(filter: &str) -> Result<Self, RuntimeError> {
        let invalid = |level: &str| RuntimeError::InvalidTopicFilter {
            filter: filter.to_string(),
            level: level.to_string(),
        };

        let mut pattern = String::with_capacity(filter.len() * 2 + 2);
        pattern.push('^');
        for (i, level) in filter.split('/').enumerate() {
            if !is_valid_level(level) {
                return Err(invalid(level));
            }
            if i > 0 {
                pattern.push('/');
            }
            match level {
                "+" => pattern.push_str("([^/]+)"),
                "#" => pattern.push_str("(.+)"),
                literal => pattern.push_str(&regex::escape(literal)),
            }
        }
        pattern.push('$');

        let regex = Regex::new(&pattern).map_err(|_| invalid(filter))?;
        Ok(Self {
            filter: Arc::from(filter),
            regex,
        })
    }

    /// The filter string as given.
    pub fn as_str(&self) -> &str {
        &self.filter
    }

    /// True when `topic` matches the whole filter.
    pub fn matches(&self, topic: &str) -> bool {
        self.regex.is_match(topic)
    }

    /// The compiled expression.
    pub fn regex(&self) -> &Regex {
        &self.regex
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filter)
    }
}

impl fmt::Debug for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TopicFilter").field(&self.filter).finish()
    }
}

impl PartialEq for TopicFilter {
    fn eq(&self, other: &Self) -> bool {
        self.filter == other.filter
    }
}

impl Eq for TopicFilter {}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(s: &str) -> TopicFilter {
        TopicFilter::new(s).unwrap()
    }

    #[test]
    fn test_root_separator() {
        assert!(f("/").matches("/"));
        assert!(!f("/").matches("toto/"));
        assert!(!f("/toto").matches("toto"));
        assert!(f("/toto").matches("/toto"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let filter = f("/toto.*");
        assert!(filter.matches("/toto.*"));
        assert!(!filter.matches("/toto1"));
        assert!(!filter.matches("/totoX*"));
        assert!(f("a(b)|c").matches("a(b)|c"));
    }

    #[test]
    fn test_single_level_wildcard() {
        let filter = f("home/+/top-light");
        assert!(filter.matches("home/garage/top-light"));
        assert!(!filter.matches("home/upstairs/parental-room/top-light"));
        assert!(!filter.matches("home//top-light"));
        assert!(f("+/matching/topic").matches("the/matching/topic"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(f("home/#/top-light").matches("home/upstairs/parental-room/top-light"));
        assert!(f("#").matches("the/matching/topic"));
        assert!(f("the/#").matches("the/matching/topic"));
        assert!(!f("the/#").matches("the"));
        assert!(!f("the/#").matches("other/matching/topic"));
    }

    #[test]
    fn test_invalid_levels_rejected() {
        for bad in ["home+", "home/foo#", "++", "a/#b/c", "+#"] {
            match TopicFilter::new(bad) {
                Err(RuntimeError::InvalidTopicFilter { filter, .. }) => assert_eq!(filter, bad),
                other => panic!("{bad:?} should be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_reports_offending_level() {
        let err = TopicFilter::new("ok/bad+/fine").unwrap_err();
        assert_eq!(
            err,
            RuntimeError::InvalidTopicFilter {
                filter: "ok/bad+/fine".into(),
                level: "bad+".into()
            }
        );
    }

    #[test]
    fn test_display_and_equality() {
        assert_eq!(f("a/+/c").to_string(), "a/+/c");
        assert_eq!(f("a/#"), f("a/#"));
        assert_ne!(f("a/#"), f("a/+"));
    }
}
