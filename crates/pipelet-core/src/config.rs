//! Graph configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::value::Key;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Identity attributes shared by stateful pipelets unless they declare their own.
    pub key: Vec<String>,

    /// Transaction timeout in milliseconds. `None` means unbounded.
    pub tx_timeout_ms: Option<u64>,

    /// Values per fetch chunk.
    pub fetch_chunk_size: usize,

    /// Upper bound on queued deliveries per propagation run (guards feedback loops).
    pub max_propagation_steps: usize,

    /// Remote endpoint address used by crossover nodes that do not name one.
    pub crossover_address: Option<String>,

    /// Transports in preference order; the first one this build supports wins.
    pub transports: Vec<String>,

    /// Runtime timer resolution (transaction expiry, reconnect polling).
    pub tick_interval_ms: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            key: vec!["id".to_string()],
            tx_timeout_ms: None,
            fetch_chunk_size: 256,
            max_propagation_steps: 100_000,
            crossover_address: None,
            transports: vec!["memory".to_string()],
            tick_interval_ms: 50,
        }
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

impl GraphConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `PIPELET_KEY`: identity attributes, comma separated
    /// - `PIPELET_TX_TIMEOUT_MS`: transaction timeout
    /// - `PIPELET_FETCH_CHUNK_SIZE`: values per fetch chunk
    /// - `PIPELET_MAX_PROPAGATION_STEPS`: propagation step cap
    /// - `PIPELET_CROSSOVER_ADDRESS`: default remote address
    /// - `PIPELET_TRANSPORTS`: transport preference list, comma separated
    /// - `PIPELET_TICK_INTERVAL_MS`: runtime tick interval
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("PIPELET_KEY") {
            let key = split_list(&s);
            if !key.is_empty() {
                cfg.key = key;
            }
        }

        if let Ok(s) = std::env::var("PIPELET_TX_TIMEOUT_MS") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.tx_timeout_ms = Some(v);
            }
        }

        if let Ok(s) = std::env::var("PIPELET_FETCH_CHUNK_SIZE") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.fetch_chunk_size = v;
            }
        }

        if let Ok(s) = std::env::var("PIPELET_MAX_PROPAGATION_STEPS") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.max_propagation_steps = v;
            }
        }

        if let Ok(s) = std::env::var("PIPELET_CROSSOVER_ADDRESS") {
            cfg.crossover_address = Some(s);
        }

        if let Ok(s) = std::env::var("PIPELET_TRANSPORTS") {
            let transports = split_list(&s);
            if !transports.is_empty() {
                cfg.transports = transports;
            }
        }

        if let Ok(s) = std::env::var("PIPELET_TICK_INTERVAL_MS") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.tick_interval_ms = v;
            }
        }

        cfg
    }

    pub fn key(&self) -> Key {
        Key::new(self.key.iter().cloned())
    }

    pub fn tx_timeout(&self) -> Option<Duration> {
        self.tx_timeout_ms.map(Duration::from_millis)
    }

    /// Chunk size used by fetch; zero is treated as one.
    pub fn chunk_size(&self) -> usize {
        self.fetch_chunk_size.max(1)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}
