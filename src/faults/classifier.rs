//! Pattern-based classification of runtime failures.
//!
//! Operators configure patterns describing faults that are the caller's
//! doing (malformed payloads, rejected credentials, policy violations).
//! Anything unmatched is a system fault and follows the retry/reconnect
//! path instead of being bounced back to the requester.

use regex::Regex;
use std::fmt;

/// A runtime failure reduced to its classifiable parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Failure kind, e.g. `rejected`, `connection-lost`, `timeout`.
    pub kind: String,
    /// Optional human-readable detail.
    pub message: Option<String>,
}

impl Fault {
    pub fn new(kind: impl Into<String>, message: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            message,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.kind, message),
            None => f.write_str(&self.kind),
        }
    }
}

/// How a pattern constrains the fault message.
#[derive(Debug, Clone)]
pub enum MessageMatcher {
    /// Any message, including none.
    Any,
    /// Only faults that carry no message at all.
    Absent,
    /// Faults whose message matches the regex.
    Pattern(Regex),
}

impl MessageMatcher {
    pub fn pattern(raw: &str) -> Result<Self, regex::Error> {
        Regex::new(raw).map(Self::Pattern)
    }

    fn matches(&self, message: Option<&str>) -> bool {
        match (self, message) {
            (Self::Any, _) => true,
            (Self::Absent, None) => true,
            (Self::Absent, Some(_)) => false,
            (Self::Pattern(regex), Some(message)) => regex.is_match(message),
            (Self::Pattern(_), None) => false,
        }
    }
}

/// One configured user-indicated fault pattern.
#[derive(Debug, Clone)]
pub struct FaultPattern {
    pub kind: String,
    pub matcher: MessageMatcher,
}

impl FaultPattern {
    pub fn any_message(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            matcher: MessageMatcher::Any,
        }
    }

    pub fn message_absent(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            matcher: MessageMatcher::Absent,
        }
    }

    pub fn message_matching(
        kind: impl Into<String>,
        pattern: &str,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            kind: kind.into(),
            matcher: MessageMatcher::pattern(pattern)?,
        })
    }

    fn matches(&self, fault: &Fault) -> bool {
        self.kind == fault.kind && self.matcher.matches(fault.message.as_deref())
    }
}

/// Terminal classification of a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Matches a configured pattern: the caller's fault, not retried,
    /// converted to a structured error response.
    UserIndicated,
    /// Unmatched: a system fault, surfaced as `Failed` and possibly
    /// triggering reconnection.
    System,
}

/// Classifier over an ordered list of user-indicated patterns.
#[derive(Debug, Clone, Default)]
pub struct FaultClassifier {
    patterns: Vec<FaultPattern>,
}

impl FaultClassifier {
    pub fn new(patterns: Vec<FaultPattern>) -> Self {
        Self { patterns }
    }

    pub fn push(&mut self, pattern: FaultPattern) {
        self.patterns.push(pattern);
    }

    /// Classify a fault against the configured patterns.
    ///
    /// Patterns are evaluated in configured order and the first match wins;
    /// later, possibly more specific patterns are not consulted.
    pub fn classify(&self, fault: &Fault) -> FaultClass {
        if self.patterns.iter().any(|p| p.matches(fault)) {
            FaultClass::UserIndicated
        } else {
            FaultClass::System
        }
    }

    /// First matching pattern, if any, for diagnostics.
    pub fn matching_pattern(&self, fault: &Fault) -> Option<&FaultPattern> {
        self.patterns.iter().find(|p| p.matches(fault))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault(kind: &str, message: Option<&str>) -> Fault {
        Fault::new(kind, message.map(str::to_string))
    }

    #[test]
    fn test_kind_pattern_matches_any_message() {
        let classifier = FaultClassifier::new(vec![FaultPattern::any_message("invalid-state")]);
        assert_eq!(
            classifier.classify(&fault("invalid-state", Some("whatever"))),
            FaultClass::UserIndicated
        );
        assert_eq!(
            classifier.classify(&fault("invalid-state", None)),
            FaultClass::UserIndicated
        );
        assert_eq!(
            classifier.classify(&fault("other", None)),
            FaultClass::System
        );
    }

    #[test]
    fn test_message_regex_pattern() {
        let classifier = FaultClassifier::new(vec![FaultPattern::message_matching(
            "rejected",
            "^quota",
        )
        .unwrap()]);
        assert_eq!(
            classifier.classify(&fault("rejected", Some("quota exceeded"))),
            FaultClass::UserIndicated
        );
        assert_eq!(
            classifier.classify(&fault("rejected", Some("malformed frame"))),
            FaultClass::System
        );
        assert_eq!(
            classifier.classify(&fault("rejected", None)),
            FaultClass::System
        );
    }

    #[test]
    fn test_message_absent_pattern_only_matches_messageless() {
        let classifier =
            FaultClassifier::new(vec![FaultPattern::message_absent("access-denied")]);
        assert_eq!(
            classifier.classify(&fault("access-denied", None)),
            FaultClass::UserIndicated
        );
        assert_eq!(
            classifier.classify(&fault("access-denied", Some("detail"))),
            FaultClass::System
        );
    }

    #[test]
    fn test_first_match_in_configured_order_wins() {
        let classifier = FaultClassifier::new(vec![
            FaultPattern::any_message("rejected"),
            FaultPattern::message_matching("rejected", "^never-reached").unwrap(),
        ]);
        let f = fault("rejected", Some("anything"));
        assert_eq!(classifier.classify(&f), FaultClass::UserIndicated);
        let hit = classifier.matching_pattern(&f).unwrap();
        assert!(matches!(hit.matcher, MessageMatcher::Any));
    }

    #[test]
    fn test_empty_classifier_is_all_system() {
        let classifier = FaultClassifier::default();
        assert_eq!(
            classifier.classify(&fault("anything", Some("x"))),
            FaultClass::System
        );
    }
}
