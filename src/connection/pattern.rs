use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use regex::Regex;

use crate::core::{OrmError, Result};

const REGEX_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(200) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

lazy_static::lazy_static! {
    static ref LIKE_REGEX_CACHE: Mutex<LruCache<String, Arc<Regex>>> =
        Mutex::new(LruCache::new(REGEX_CACHE_CAPACITY));
}

/// Translate a LIKE pattern into an anchored regex. `\` escapes the next char.
/// Wildcards match line breaks too.
fn like_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 6);
    regex.push_str("(?s)^");

    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => regex.push_str(&regex::escape(&escaped.to_string())),
                None => regex.push_str(&regex::escape("\\")),
            },
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }

    regex.push('$');
    regex
}

/// Patterns with at most a leading and a trailing `%` never need a regex.
fn fast_path(text: &str, pattern: &str) -> Option<bool> {
    if pattern.contains('_') || pattern.contains('\\') {
        return None;
    }
    let inner = pattern.trim_start_matches('%').trim_end_matches('%');
    if inner.contains('%') {
        return None;
    }
    let leading = pattern.starts_with('%');
    let trailing = pattern.len() > inner.len() + usize::from(leading);

    Some(match (leading, trailing) {
        (false, false) => text == pattern,
        (false, true) => text.starts_with(inner),
        (true, false) => text.ends_with(inner),
        (true, true) => text.contains(inner),
    })
}

fn compiled(pattern: &str) -> Result<Arc<Regex>> {
    if let Some(regex) = LIKE_REGEX_CACHE.lock()?.get(pattern) {
        return Ok(Arc::clone(regex));
    }

    let regex = Regex::new(&like_to_regex(pattern))
        .map(Arc::new)
        .map_err(|e| OrmError::Query(format!("Invalid LIKE pattern: {}", e)))?;
    LIKE_REGEX_CACHE
        .lock()?
        .put(pattern.to_string(), Arc::clone(&regex));
    Ok(regex)
}

/// Case-sensitive SQL LIKE.
pub fn like(text: &str, pattern: &str) -> Result<bool> {
    if let Some(matched) = fast_path(text, pattern) {
        return Ok(matched);
    }
    Ok(compiled(pattern)?.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_paths() {
        assert!(like("Alice", "Alice").unwrap());
        assert!(like("Alice", "Al%").unwrap());
        assert!(like("Alice", "%ice").unwrap());
        assert!(like("Alice", "%lic%").unwrap());
        assert!(!like("Alice", "alice").unwrap());
        assert!(like("", "%").unwrap());
    }

    #[test]
    fn test_regex_paths() {
        assert!(like("Alice", "A_ice").unwrap());
        assert!(like("a.b", "a.b").unwrap());
        assert!(!like("axb", "a.b").unwrap());
        assert!(like("A%B", "A\\%B").unwrap());
        assert!(!like("AxB", "A\\%B").unwrap());
        assert!(like("Al(ice)", "Al(%)").unwrap());
    }

    #[test]
    fn test_wildcards_match_line_breaks() {
        assert!(like("first\nsecond", "first%second").unwrap());
        assert!(like("a\nb", "a_b").unwrap());
        assert!(like("line\nbreak", "%ne_br%").unwrap());
    }
}
