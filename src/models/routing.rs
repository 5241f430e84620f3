//! Routing modes and the persisted routing-config singleton

use serde::{Deserialize, Serialize};

/// How the routing engine scores candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    /// Weight plus bandit bonus, penalized by normalized cost and latency.
    Normal,
    /// Lowest estimated cost wins.
    Cheap,
    /// Lowest rolling provider latency wins.
    Fast,
    /// Largest context window wins.
    Large,
    /// Budget-relative cost and latency, ties broken by weight.
    Budget,
}

impl RouteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteMode::Normal => "normal",
            RouteMode::Cheap => "cheap",
            RouteMode::Fast => "fast",
            RouteMode::Large => "large",
            RouteMode::Budget => "budget",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(RouteMode::Normal),
            "cheap" => Some(RouteMode::Cheap),
            "fast" => Some(RouteMode::Fast),
            "large" => Some(RouteMode::Large),
            "budget" => Some(RouteMode::Budget),
            _ => None,
        }
    }
}

impl std::fmt::Display for RouteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for RouteMode {
    fn default() -> Self {
        RouteMode::Normal
    }
}

/// Persisted routing defaults; a singleton row in the store.
///
/// Hot reloads replace the whole struct atomically; in-flight requests keep
/// the snapshot they were admitted with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub default_mode: RouteMode,
    /// 0 means no budget ceiling.
    pub default_max_budget_usd: f64,
    pub default_max_latency_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_mode: RouteMode::Normal,
            default_max_budget_usd: 0.0,
            default_max_latency_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_all_variants() {
        for mode in [
            RouteMode::Normal,
            RouteMode::Cheap,
            RouteMode::Fast,
            RouteMode::Large,
            RouteMode::Budget,
        ] {
            assert_eq!(RouteMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(RouteMode::parse("bogus"), None);
    }
}
