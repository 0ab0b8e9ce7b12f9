//! # Named-server routing filter
//!
//! Sends queries matching a pattern to a named backend instead of letting
//! the router choose. Rules are tried in order; the first rule whose
//! pattern matches and that has a running target wins.
//!
//! ```rust
//! use cdcrepl_route::named_server::{NamedServerFilter, RouteDecision, RouteRule, ServerStatus};
//!
//! let filter = NamedServerFilter::new(vec![
//!     RouteRule::new("^SELECT", vec!["server2".into(), "server3".into()]).unwrap(),
//! ]);
//! let servers = [ServerStatus::down("server2"), ServerStatus::running("server3")];
//!
//! assert_eq!(
//!     filter.route("SELECT @@server_id", &servers),
//!     RouteDecision::Target("server3".into())
//! );
//! assert_eq!(filter.route("INSERT INTO t VALUES (1)", &servers), RouteDecision::Default);
//! ```

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid match pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("rule '{0}' has no targets")]
    NoTargets(String),
}

/// Where a query should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Target(String),
    /// No rule applies; the router picks as usual
    Default,
}

/// A candidate backend as seen by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub name: String,
    pub running: bool,
}

impl ServerStatus {
    pub fn running(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: true,
        }
    }

    pub fn down(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: false,
        }
    }
}

/// Serialized form of one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRuleConfig {
    #[serde(rename = "match")]
    pub pattern: String,
    pub targets: Vec<String>,
    #[serde(default)]
    pub ignore_case: bool,
}

#[derive(Debug, Clone)]
pub struct RouteRule {
    pattern: Regex,
    targets: Vec<String>,
}

impl RouteRule {
    pub fn new(pattern: &str, targets: Vec<String>) -> Result<Self, RouteError> {
        Self::build(pattern, targets, false)
    }

    pub fn from_config(config: &RouteRuleConfig) -> Result<Self, RouteError> {
        Self::build(&config.pattern, config.targets.clone(), config.ignore_case)
    }

    fn build(pattern: &str, targets: Vec<String>, ignore_case: bool) -> Result<Self, RouteError> {
        if targets.is_empty() {
            return Err(RouteError::NoTargets(pattern.to_string()));
        }
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(ignore_case)
            .build()
            .map_err(|source| RouteError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
        Ok(Self { pattern, targets })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// First configured target that is running among `candidates`.
    fn pick<'a>(&'a self, candidates: &[ServerStatus]) -> Option<&'a str> {
        self.targets
            .iter()
            .find(|target| {
                candidates
                    .iter()
                    .any(|c| c.running && c.name == target.as_str())
            })
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NamedServerFilter {
    rules: Vec<RouteRule>,
}

impl NamedServerFilter {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    pub fn from_config(rules: &[RouteRuleConfig]) -> Result<Self, RouteError> {
        rules
            .iter()
            .map(RouteRule::from_config)
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn route(&self, query: &str, candidates: &[ServerStatus]) -> RouteDecision {
        for rule in &self.rules {
            if !rule.pattern.is_match(query) {
                continue;
            }
            if let Some(target) = rule.pick(candidates) {
                trace!(pattern = rule.pattern(), target, "Routing to named server");
                return RouteDecision::Target(target.to_string());
            }
        }
        RouteDecision::Default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers(states: &[(&str, bool)]) -> Vec<ServerStatus> {
        states
            .iter()
            .map(|(name, running)| ServerStatus {
                name: name.to_string(),
                running: *running,
            })
            .collect()
    }

    #[test]
    fn test_routes_to_first_running_target() {
        let filter = NamedServerFilter::new(vec![RouteRule::new(
            "SELECT",
            vec!["server2".into(), "server3".into()],
        )
        .unwrap()]);

        let all_up = servers(&[
            ("server1", true),
            ("server2", true),
            ("server3", true),
            ("server4", true),
        ]);
        assert_eq!(
            filter.route("SELECT @@server_id", &all_up),
            RouteDecision::Target("server2".into())
        );

        let two_down = servers(&[("server2", false), ("server3", true)]);
        assert_eq!(
            filter.route("SELECT @@server_id", &two_down),
            RouteDecision::Target("server3".into())
        );
    }

    #[test]
    fn test_default_without_match_or_running_target() {
        let filter =
            NamedServerFilter::new(vec![RouteRule::new("^SELECT", vec!["server2".into()]).unwrap()]);

        let up = servers(&[("server2", true)]);
        assert_eq!(filter.route("UPDATE t SET a = 1", &up), RouteDecision::Default);

        let down = servers(&[("server2", false)]);
        assert_eq!(filter.route("SELECT 1", &down), RouteDecision::Default);
        assert_eq!(filter.route("SELECT 1", &[]), RouteDecision::Default);
    }

    #[test]
    fn test_falls_through_to_later_rule() {
        let filter = NamedServerFilter::new(vec![
            RouteRule::new("SELECT", vec!["server2".into()]).unwrap(),
            RouteRule::new(".*", vec!["server1".into()]).unwrap(),
        ]);
        let states = servers(&[("server1", true), ("server2", false)]);
        assert_eq!(
            filter.route("SELECT 1", &states),
            RouteDecision::Target("server1".into())
        );
    }

    #[test]
    fn test_from_config() {
        let rules: Vec<RouteRuleConfig> = serde_json::from_str(
            r#"[{"match": "select", "targets": ["server3"], "ignore_case": true}]"#,
        )
        .unwrap();
        let filter = NamedServerFilter::from_config(&rules).unwrap();
        assert_eq!(
            filter.route("SELECT 1", &servers(&[("server3", true)])),
            RouteDecision::Target("server3".into())
        );
    }

    #[test]
    fn test_invalid_rules() {
        assert!(matches!(
            RouteRule::new("(", vec!["a".into()]),
            Err(RouteError::InvalidPattern { .. })
        ));
        assert!(matches!(
            RouteRule::new("SELECT", vec![]),
            Err(RouteError::NoTargets(_))
        ));
    }
}
