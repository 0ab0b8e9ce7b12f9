//! # Table filtering
//!
//! Include/exclude lists of glob patterns matched against `database.table`
//! (or the bare table name), compiled once to case-insensitive regexes.
//!
//! ```rust
//! use cdcrepl::filter::TableFilter;
//!
//! let filter = TableFilter::new(&["shop.*".into()], &["*.audit_*".into()]).unwrap();
//! assert!(filter.accepts("shop", "orders"));
//! assert!(!filter.accepts("shop", "audit_log"));
//! assert!(!filter.accepts("crm", "contacts"));
//! ```

use regex::{Regex, RegexBuilder};

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("Invalid table pattern: {0}")]
    InvalidRegex(#[from] regex::Error),
    #[error("Empty table pattern")]
    EmptyPattern,
}

/// One compiled glob (`*` any run, `?` one character).
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    pattern: String,
    regex: Regex,
    is_wildcard: bool,
}

impl PatternMatcher {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::EmptyPattern);
        }
        let regex = RegexBuilder::new(&glob_to_regex(pattern))
            .case_insensitive(true)
            .build()?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            is_wildcard: pattern == "*",
        })
    }

    /// Matches `database.table` or, for unqualified patterns, the table alone.
    pub fn matches_qualified(&self, database: &str, table: &str) -> bool {
        self.is_wildcard
            || self.regex.is_match(&format!("{database}.{table}"))
            || self.regex.is_match(table)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let escaped = regex::escape(pattern);
    format!("^{}$", escaped.replace(r"\*", ".*").replace(r"\?", "."))
}

/// Include/exclude table filter. An empty include list accepts everything.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    include: Vec<PatternMatcher>,
    exclude: Vec<PatternMatcher>,
}

impl TableFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, PatternError> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| PatternMatcher::new(p))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Accept-all filter.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn accepts(&self, database: &str, table: &str) -> bool {
        if self
            .exclude
            .iter()
            .any(|p| p.matches_qualified(database, table))
        {
            return false;
        }
        self.include.is_empty()
            || self
                .include
                .iter()
                .any(|p| p.matches_qualified(database, table))
    }

    pub fn is_pass_through(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(p: &[&str]) -> Vec<String> {
        p.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_glob_matching() {
        let m = PatternMatcher::new("shop.order?").unwrap();
        assert!(m.matches_qualified("shop", "orders"));
        assert!(m.matches_qualified("SHOP", "ORDERS"));
        assert!(!m.matches_qualified("shop", "order_items"));

        let m = PatternMatcher::new("users").unwrap();
        assert!(m.matches_qualified("any", "users"));

        // Dots are literal
        let m = PatternMatcher::new("a.b").unwrap();
        assert!(!m.matches_qualified("axb", "c"));
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(matches!(
            PatternMatcher::new(""),
            Err(PatternError::EmptyPattern)
        ));
    }

    #[test]
    fn test_include_exclude() {
        let filter = TableFilter::new(&patterns(&["shop.*"]), &patterns(&["shop.tmp_*"])).unwrap();
        assert!(filter.accepts("shop", "orders"));
        assert!(!filter.accepts("shop", "tmp_import"));
        assert!(!filter.accepts("crm", "orders"));
    }

    #[test]
    fn test_pass_through() {
        let filter = TableFilter::all();
        assert!(filter.is_pass_through());
        assert!(filter.accepts("any", "thing"));

        let filter = TableFilter::new(&[], &patterns(&["mysql.*"])).unwrap();
        assert!(!filter.accepts("mysql", "user"));
        assert!(filter.accepts("shop", "orders"));
    }
}
