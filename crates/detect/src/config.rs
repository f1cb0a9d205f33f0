use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Worker config ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectConfig {
    /// Name this node reports as the source system on linked events.
    pub node_name: String,
    /// Directory of rule definition files (one JSON file per rule).
    pub rules_dir: PathBuf,
    /// JSONL file the event source reads from.
    pub events_file: PathBuf,
    /// JSON file the execution tracker persists its state to.
    pub state_file: PathBuf,
    /// Directory detection feeds are written into (one JSONL file per
    /// destination).
    pub output_dir: PathBuf,
    /// Root directory for per-rule duplicate-check stores.
    pub dedup_dir: PathBuf,
    /// Seconds between execution cycles.
    pub interval_secs: u64,
    /// Execution cycles between duplicate-store reconcile sweeps.
    pub reconcile_every: u64,
}

impl DetectConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        let data_dir = PathBuf::from(env_or("ARGUS_DATA_DIR", "data"));
        Self {
            node_name: env_or("ARGUS_NODE_NAME", "argus"),
            rules_dir: PathBuf::from(env_or(
                "ARGUS_RULES_DIR",
                data_dir.join("rules").to_str().unwrap_or("data/rules"),
            )),
            events_file: PathBuf::from(env_or(
                "ARGUS_EVENTS_FILE",
                data_dir.join("events.jsonl").to_str().unwrap_or("data/events.jsonl"),
            )),
            state_file: PathBuf::from(env_or(
                "ARGUS_STATE_FILE",
                data_dir.join("state.json").to_str().unwrap_or("data/state.json"),
            )),
            output_dir: PathBuf::from(env_or(
                "ARGUS_OUTPUT_DIR",
                data_dir.join("detections").to_str().unwrap_or("data/detections"),
            )),
            dedup_dir: PathBuf::from(env_or(
                "ARGUS_DEDUP_DIR",
                data_dir.join("dedup").to_str().unwrap_or("data/dedup"),
            )),
            interval_secs: env_u64("ARGUS_INTERVAL_SECS", 10),
            reconcile_every: env_u64("ARGUS_RECONCILE_EVERY", 60).max(1),
        }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  node:       {}", self.node_name);
        tracing::info!("  rules:      {}", self.rules_dir.display());
        tracing::info!("  events:     {}", self.events_file.display());
        tracing::info!("  state:      {}", self.state_file.display());
        tracing::info!("  output:     {}", self.output_dir.display());
        tracing::info!("  dedup:      {}", self.dedup_dir.display());
        tracing::info!("  interval:   {}s", self.interval_secs);
        tracing::info!("  reconcile:  every {} cycles", self.reconcile_every);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_hang_off_the_data_dir() {
        // Only meaningful when the env is clean, which tests run under.
        let config = DetectConfig::from_env();
        assert_eq!(config.rules_dir, PathBuf::from("data/rules"));
        assert_eq!(config.dedup_dir, PathBuf::from("data/dedup"));
        assert!(config.reconcile_every >= 1);
    }
}
