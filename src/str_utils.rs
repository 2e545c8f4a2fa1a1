/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Safely returns a suffix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn suffix_chars(s: &str, max_chars: usize) -> &str {
    let char_count = s.chars().count();
    if char_count <= max_chars {
        return s;
    }
    match s.char_indices().nth(char_count - max_chars) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Short, single-line preview of a frame or body for log messages.
pub fn snippet(s: &str, max_chars: usize) -> String {
    let head = prefix_chars(s, max_chars);
    let flat = head.replace(['\n', '\r'], " ");
    if head.len() < s.len() {
        format!("{}...", flat)
    } else {
        flat
    }
}

/// Keeps the last `max_chars` characters of a log, noting how much was dropped.
pub fn log_tail(log: &str, max_chars: usize) -> String {
    let total = log.chars().count();
    if total <= max_chars {
        return log.to_string();
    }
    format!(
        "[... {} earlier characters omitted ...]\n{}",
        total - max_chars,
        suffix_chars(log, max_chars)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_and_suffix_respect_char_boundaries() {
        let s = "héllo wörld";
        assert_eq!(prefix_chars(s, 2), "hé");
        assert_eq!(suffix_chars(s, 3), "rld");
        assert_eq!(prefix_chars(s, 100), s);
    }

    #[test]
    fn test_snippet_flattens_and_marks_truncation() {
        assert_eq!(snippet("a\nb", 10), "a b");
        assert_eq!(snippet("abcdef", 3), "abc...");
    }

    #[test]
    fn test_log_tail_keeps_end() {
        let tail = log_tail("0123456789", 4);
        assert!(tail.ends_with("6789"));
        assert!(tail.contains("6 earlier characters omitted"));
        assert_eq!(log_tail("short", 10), "short");
    }
}
