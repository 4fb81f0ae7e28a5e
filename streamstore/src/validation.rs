//! Shared validation predicates for domain types and query inputs.

/// Validation predicate: metadata keys are spliced into SQL as quoted
/// literals, so they are restricted to a conservative character set. Dots
/// separate the segments of a nested path; no segment may be empty.
pub(crate) fn is_metadata_key(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && s.split('.').all(|segment| !segment.is_empty())
}

/// Validation predicate: reject control characters in catalog names.
pub(crate) fn no_control_characters(s: &str) -> bool {
    !s.chars().any(char::is_control)
}
