//! Path and tag filters with `*` wildcards.

use serde::{Deserialize, Serialize};

/// Match `text` against `pattern`, where `*` matches any run of characters
/// (including `/`) and every other character matches itself.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// Selects paths by include/exclude patterns.
///
/// An empty include list selects everything. Excludes always win. A pattern
/// without a wildcard also matches everything below it when it names a
/// directory (`/home/me/docs` selects `/home/me/docs/a.txt`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl PathFilter {
    /// Selects every path.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn including<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: patterns.into_iter().map(Into::into).collect(),
            exclude: Vec::new(),
        }
    }

    pub fn excluding<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn is_all(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.exclude.iter().any(|p| pattern_matches(p, path)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| pattern_matches(p, path))
    }
}

fn pattern_matches(pattern: &str, path: &str) -> bool {
    if pattern.contains('*') {
        return wildcard_match(pattern, path);
    }
    let dir = pattern.trim_end_matches('/');
    path == pattern || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}
