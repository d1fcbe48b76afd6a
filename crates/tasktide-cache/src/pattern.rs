//! Glob patterns for bulk invalidation.
//!
//! `*` is the only wildcard. Every other character is literal, in both tiers:
//! when the pattern is handed to Redis, its own metacharacters (`?`, `[`, `]`,
//! `\`) are escaped so `SCAN MATCH` selects exactly the keys [`GlobPattern::matches`]
//! selects locally.

/// A compiled `*`-only glob pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobPattern {
    raw: String,
    parts: Vec<String>,
}

impl GlobPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        let raw = pattern.into();
        let parts = raw.split('*').map(str::to_string).collect();
        Self { raw, parts }
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns `true` if the pattern contains a wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.parts.len() > 1
    }

    /// Check whether a key matches the pattern.
    pub fn matches(&self, key: &str) -> bool {
        if self.parts.len() == 1 {
            return key == self.raw;
        }

        let first = &self.parts[0];
        let last = &self.parts[self.parts.len() - 1];
        if key.len() < first.len() + last.len()
            || !key.starts_with(first.as_str())
            || !key.ends_with(last.as_str())
        {
            return false;
        }

        // Leftmost match of each middle literal is sufficient for `*`-only globs.
        let mut rest = &key[first.len()..key.len() - last.len()];
        for middle in &self.parts[1..self.parts.len() - 1] {
            if middle.is_empty() {
                continue;
            }
            match rest.find(middle.as_str()) {
                Some(pos) => rest = &rest[pos + middle.len()..],
                None => return false,
            }
        }
        true
    }

    /// Render the pattern for Redis `SCAN MATCH` / `KEYS`.
    pub fn to_redis_pattern(&self) -> String {
        let mut out = String::with_capacity(self.raw.len() + 4);
        for ch in self.raw.chars() {
            if matches!(ch, '?' | '[' | ']' | '\\') {
                out.push('\\');
            }
            out.push(ch);
        }
        out
    }
}

impl std::fmt::Display for GlobPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_pattern() {
        let pattern = GlobPattern::new("user_tasks:*");
        assert!(pattern.matches("user_tasks:1"));
        assert!(pattern.matches("user_tasks:"));
        assert!(!pattern.matches("other:1"));
        assert!(!pattern.matches("user_task:1"));
    }

    #[test]
    fn test_literal_pattern() {
        let pattern = GlobPattern::new("task:42");
        assert!(!pattern.is_wildcard());
        assert!(pattern.matches("task:42"));
        assert!(!pattern.matches("task:420"));
    }

    #[test]
    fn test_middle_wildcards() {
        let pattern = GlobPattern::new("user:*:tasks:*:summary");
        assert!(pattern.matches("user:7:tasks:open:summary"));
        assert!(!pattern.matches("user:7:tasks:open:detail"));
        assert!(GlobPattern::new("*").matches(""));
        assert!(GlobPattern::new("a*a").matches("aa"));
        assert!(!GlobPattern::new("ab*ba").matches("aba"));
    }

    #[test]
    fn test_question_mark_is_literal() {
        let pattern = GlobPattern::new("search?q=*");
        assert!(pattern.matches("search?q=open"));
        assert!(!pattern.matches("searchXq=open"));
        assert_eq!(pattern.to_redis_pattern(), "search\\?q=*");
        assert_eq!(GlobPattern::new("k[1]").to_redis_pattern(), "k\\[1\\]");
    }
}
