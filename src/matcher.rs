//! # Topic Filter Matching
//!
//! Pure wildcard matching of subscription filters against concrete topics,
//! plus the validation rules the facade applies before accepting a filter
//! or a publish topic.

/// Returns whether `filter` matches `topic` under MQTT wildcard semantics.
///
/// Matching walks both strings segment by segment, left to right:
/// `+` consumes exactly one `/`-delimited segment, `#` (legal only as the
/// final segment) consumes the remainder of the topic including the empty
/// remainder, so `a/#` matches both `a/b/c` and `a` itself. Anything else
/// requires both sides to be fully consumed.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut filter_segments = filter.split('/');
    let mut topic_segments = topic.split('/');
    loop {
        match (filter_segments.next(), topic_segments.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Returns whether `filter` is a well-formed subscription filter.
///
/// `+` and `#` must stand alone in their segment, and `#` may only be the
/// last segment.
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let mut segments = filter.split('/').peekable();
    while let Some(segment) = segments.next() {
        if segment == "#" {
            return segments.peek().is_none();
        }
        if segment != "+" && segment.contains(['+', '#']) {
            return false;
        }
    }
    true
}

/// Returns whether `topic` is a valid publish topic: non-empty and free of
/// wildcard characters.
pub fn valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#', '\0'])
}
