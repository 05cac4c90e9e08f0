//! Balancer configuration.

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::error::BalancerError;

/// Per-worker ingress depth used when nothing else is configured.
pub const DEFAULT_INGRESS_PER_WORKER: usize = 10;

/// Per-worker inbound queue depth used when nothing else is configured.
pub const DEFAULT_INBOUND_CAPACITY: usize = 5000;

/// Largest queue depth tokio's bounded channels accept.
pub const MAX_QUEUE_DEPTH: usize = usize::MAX >> 3;

/// Sizes of the balancer and its queues.
///
/// - ingress depth = `workers * ingress_per_worker`
/// - completion queue depth = `workers`
/// - each worker's inbound depth = `inbound_capacity`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub workers: usize,
    pub ingress_per_worker: usize,
    pub inbound_capacity: usize,
}

impl Default for BalancerConfig {
    /// One worker per available CPU.
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        Self {
            workers,
            ingress_per_worker: DEFAULT_INGRESS_PER_WORKER,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }
}

impl BalancerConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    /// Read `BALLAST_WORKERS`, `BALLAST_INGRESS_PER_WORKER` and
    /// `BALLAST_INBOUND_CAPACITY`; unset variables keep their defaults.
    pub fn from_env() -> Result<Self, BalancerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`BalancerConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, BalancerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = parse_var(&lookup, "BALLAST_WORKERS")? {
            config.workers = value;
        }
        if let Some(value) = parse_var(&lookup, "BALLAST_INGRESS_PER_WORKER")? {
            config.ingress_per_worker = value;
        }
        if let Some(value) = parse_var(&lookup, "BALLAST_INBOUND_CAPACITY")? {
            config.inbound_capacity = value;
        }
        Ok(config)
    }

    /// Reject anything that could not produce a working balancer.
    pub fn validate(&self) -> Result<(), BalancerError> {
        if self.workers == 0 {
            return Err(BalancerError::InvalidWorkerCount(self.workers));
        }
        if self.ingress_per_worker == 0 {
            return Err(BalancerError::InvalidConfig(
                "ingress_per_worker must be positive".to_string(),
            ));
        }
        if self.inbound_capacity == 0 || self.inbound_capacity > MAX_QUEUE_DEPTH {
            return Err(BalancerError::InvalidConfig(format!(
                "inbound_capacity must be in 1..={MAX_QUEUE_DEPTH}, got {}",
                self.inbound_capacity
            )));
        }
        match self.workers.checked_mul(self.ingress_per_worker) {
            Some(depth) if depth <= MAX_QUEUE_DEPTH => Ok(()),
            _ => Err(BalancerError::InvalidConfig(format!(
                "ingress depth {} x {} is too large",
                self.workers, self.ingress_per_worker
            ))),
        }
    }

    pub fn ingress_capacity(&self) -> usize {
        self.workers * self.ingress_per_worker
    }

    /// At most one outstanding completion per worker matters at a time.
    pub fn completion_capacity(&self) -> usize {
        self.workers
    }
}

fn parse_var<F>(lookup: &F, key: &str) -> Result<Option<usize>, BalancerError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e| BalancerError::InvalidConfig(format!("{key}={raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn default_has_at_least_one_worker() {
        let config = BalancerConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.ingress_per_worker, DEFAULT_INGRESS_PER_WORKER);
        assert_eq!(config.inbound_capacity, DEFAULT_INBOUND_CAPACITY);
        config.validate().unwrap();
    }

    #[test]
    fn queue_depths_follow_worker_count() {
        let config = BalancerConfig::with_workers(4);
        assert_eq!(config.ingress_capacity(), 40);
        assert_eq!(config.completion_capacity(), 4);
    }

    #[test]
    fn from_lookup_overrides_defaults() {
        let config = BalancerConfig::from_lookup(lookup(&[
            ("BALLAST_WORKERS", "3"),
            ("BALLAST_INBOUND_CAPACITY", " 16 "),
        ]))
        .unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.ingress_per_worker, DEFAULT_INGRESS_PER_WORKER);
        assert_eq!(config.inbound_capacity, 16);
    }

    #[test]
    fn from_lookup_rejects_garbage() {
        let err = BalancerConfig::from_lookup(lookup(&[("BALLAST_WORKERS", "many")])).unwrap_err();
        assert!(err.to_string().contains("BALLAST_WORKERS"));
    }

    #[test]
    fn zero_workers_is_invalid_worker_count() {
        let err = BalancerConfig::with_workers(0).validate().unwrap_err();
        assert!(matches!(err, BalancerError::InvalidWorkerCount(0)));
    }

    #[rstest]
    #[case::no_ingress(BalancerConfig { workers: 2, ingress_per_worker: 0, inbound_capacity: 8 })]
    #[case::no_inbound(BalancerConfig { workers: 2, ingress_per_worker: 1, inbound_capacity: 0 })]
    #[case::overflow(BalancerConfig { workers: usize::MAX, ingress_per_worker: 2, inbound_capacity: 8 })]
    fn bad_queue_sizes_are_invalid_config(#[case] config: BalancerConfig) {
        assert!(matches!(
            config.validate(),
            Err(BalancerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn deserializes_partial_config() {
        let config: BalancerConfig = serde_json::from_str(r#"{ "workers": 6 }"#).unwrap();
        assert_eq!(config.workers, 6);
        assert_eq!(config.inbound_capacity, DEFAULT_INBOUND_CAPACITY);
    }
}
