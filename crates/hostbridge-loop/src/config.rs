//! Loop tuning knobs, with `HOSTBRIDGE_*` environment overrides.

use std::time::Duration;

use tracing::warn;

pub const ENV_MAX_PARK_MS: &str = "HOSTBRIDGE_MAX_PARK_MS";
pub const ENV_EVENT_CAPACITY: &str = "HOSTBRIDGE_EVENT_CAPACITY";
pub const ENV_REMOTE_BUDGET: &str = "HOSTBRIDGE_REMOTE_BUDGET";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Upper bound on a single reactor wait.
    pub max_park: Duration,
    /// Capacity of the readiness event buffer handed to the poller.
    pub event_capacity: usize,
    /// Remote items (wakes and scheduled closures) drained per tick.
    pub remote_budget: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_park: Duration::from_millis(10),
            event_capacity: 1024,
            remote_budget: 4096,
        }
    }
}

impl LoopConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `HOSTBRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_MAX_PARK_MS) {
            config.max_park = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, ENV_EVENT_CAPACITY) {
            config.event_capacity = capacity.max(1);
        }
        if let Some(budget) = parse_var::<usize>(&lookup, ENV_REMOTE_BUDGET) {
            config.remote_budget = budget.max(1);
        }
        config
    }

    pub fn with_max_park(mut self, max_park: Duration) -> Self {
        self.max_park = max_park;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn with_remote_budget(mut self, budget: usize) -> Self {
        self.remote_budget = budget.max(1);
        self
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable loop setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = LoopConfig::from_lookup(lookup(&[]));
        assert_eq!(config, LoopConfig::default());
        assert_eq!(config.max_park, Duration::from_millis(10));
    }

    #[test]
    fn env_overrides() {
        let config = LoopConfig::from_lookup(lookup(&[
            (ENV_MAX_PARK_MS, "25"),
            (ENV_EVENT_CAPACITY, " 64 "),
            (ENV_REMOTE_BUDGET, "0"),
        ]));
        assert_eq!(config.max_park, Duration::from_millis(25));
        assert_eq!(config.event_capacity, 64);
        // Zero budget would starve the remote queue.
        assert_eq!(config.remote_budget, 1);
    }

    #[test]
    fn garbage_falls_back_to_default() {
        let config = LoopConfig::from_lookup(lookup(&[(ENV_MAX_PARK_MS, "soon")]));
        assert_eq!(config.max_park, LoopConfig::default().max_park);
    }
}
