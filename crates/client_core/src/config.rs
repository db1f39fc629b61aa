use std::{collections::HashMap, fs, path::Path, time::Duration};

use tracing::warn;

use crate::store::{DedupStrategy, MergePolicy};

pub const DEFAULT_SETTINGS_FILE: &str = "devsync.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub api_url: String,
    pub ws_url: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// How long a pending entry stays eligible for optimistic matching.
    pub optimistic_window: Duration,
    /// Creation-time tolerance used by content-based duplicate detection.
    pub duplicate_tolerance: Duration,
    pub dedup_strategy: DedupStrategy,
    pub event_capacity: usize,
}

impl ClientSettings {
    pub fn merge_policy(&self) -> MergePolicy {
        MergePolicy {
            optimistic_window: self.optimistic_window,
            duplicate_tolerance: self.duplicate_tolerance,
            dedup: self.dedup_strategy,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080/api/v1".into(),
            ws_url: "ws://localhost:8080/ws".into(),
            reconnect_delay: Duration::from_secs(3),
            max_reconnect_attempts: 3,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            optimistic_window: Duration::from_secs(10),
            duplicate_tolerance: Duration::from_secs(5),
            dedup_strategy: DedupStrategy::ContentWindow,
            event_capacity: 256,
        }
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => apply_overrides(&mut settings, |key| file_cfg.get(key).cloned()),
            Err(err) => warn!(
                path = %path.display(),
                "config: ignoring unreadable settings file: {err}"
            ),
        }
    }

    apply_overrides(&mut settings, |key| {
        std::env::var(format!("DEVSYNC_{}", key.to_ascii_uppercase())).ok()
    });

    settings
}

fn apply_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("api_url") {
        settings.api_url = v.trim_end_matches('/').to_string();
    }
    if let Some(v) = lookup("ws_url") {
        settings.ws_url = v;
    }
    if let Some(ms) = lookup("reconnect_delay_ms").and_then(|v| v.parse::<u64>().ok()) {
        settings.reconnect_delay = Duration::from_millis(ms);
    }
    if let Some(attempts) = lookup("max_reconnect_attempts").and_then(|v| v.parse::<u32>().ok()) {
        settings.max_reconnect_attempts = attempts;
    }
    if let Some(ms) = lookup("connect_timeout_ms").and_then(|v| v.parse::<u64>().ok()) {
        settings.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = lookup("request_timeout_ms").and_then(|v| v.parse::<u64>().ok()) {
        settings.request_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = lookup("optimistic_window_ms").and_then(|v| v.parse::<u64>().ok()) {
        settings.optimistic_window = Duration::from_millis(ms);
    }
    if let Some(raw) = lookup("dedup_strategy") {
        match DedupStrategy::parse(&raw) {
            Some(strategy) => settings.dedup_strategy = strategy,
            None => warn!(
                "config: unknown dedup_strategy {raw:?}, keeping {:?}",
                settings.dedup_strategy
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let settings = ClientSettings::default();
        assert_eq!(settings.reconnect_delay, Duration::from_secs(3));
        assert_eq!(settings.max_reconnect_attempts, 3);
        assert_eq!(settings.request_timeout, Duration::from_secs(10));
        assert_eq!(settings.dedup_strategy, DedupStrategy::ContentWindow);
    }

    #[test]
    fn file_values_override_defaults_and_bad_numbers_are_ignored() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("devsync_settings_{suffix}.toml"));
        fs::write(
            &path,
            "api_url = \"http://chat.example/api/v1/\"\nreconnect_delay_ms = \"250\"\nmax_reconnect_attempts = \"many\"\ndedup_strategy = \"durable_id\"\n",
        )
        .expect("write settings");

        let settings = load_settings_from(&path);
        assert_eq!(settings.api_url, "http://chat.example/api/v1");
        assert_eq!(settings.reconnect_delay, Duration::from_millis(250));
        assert_eq!(settings.max_reconnect_attempts, 3);
        assert_eq!(
            settings.merge_policy().dedup,
            DedupStrategy::DurableId
        );

        fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let settings = load_settings_from(Path::new("/nonexistent/devsync.toml"));
        assert_eq!(settings.ws_url, ClientSettings::default().ws_url);
    }
}
