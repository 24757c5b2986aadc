use std::collections::HashMap;
use std::path::PathBuf;

fn config_path(filename: &str) -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("patchmirror")
        .join(filename)
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Preferences {
    /// Name of the JACK client opened by the native source
    #[serde(default = "Preferences::default_client_name")]
    pub client_name: String,

    #[serde(default = "Preferences::default_enable_native")]
    pub enable_native: bool,

    /// Mirror the graph through jackdbus
    #[serde(default = "Preferences::default_enable_bus")]
    pub enable_bus: bool,

    /// Ask a2jmidid for its client name so bridge ports are recognized
    #[serde(default = "Preferences::default_enable_bridge")]
    pub enable_bridge: bool,

    #[serde(default = "Preferences::default_enable_alsa")]
    pub enable_alsa: bool,

    #[serde(default = "Preferences::default_alsa_poll_interval_ms")]
    pub alsa_poll_interval_ms: u64,

    #[serde(default = "Preferences::default_aconnect_path")]
    pub aconnect_path: String,

    /// ALSA client name → name used by the JACK side
    #[serde(default = "Preferences::default_alsa_canonical_names")]
    pub alsa_canonical_names: HashMap<String, String>,

    /// 0 shows port short names; 1 or 2 shows that JACK alias
    #[serde(default = "Preferences::default_port_alias_index")]
    pub port_alias_index: usize,

    #[serde(default = "Preferences::default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,

    #[serde(default = "Preferences::default_reconnect_initial_backoff_ms")]
    pub reconnect_initial_backoff_ms: u64,

    #[serde(default = "Preferences::default_reconnect_max_backoff_ms")]
    pub reconnect_max_backoff_ms: u64,
}

impl Preferences {
    pub const MIN_POLL_INTERVAL_MS: u64 = 100;

    fn default_client_name() -> String {
        "patchmirror".to_string()
    }
    fn default_enable_native() -> bool {
        true
    }
    fn default_enable_bus() -> bool {
        false
    }
    fn default_enable_bridge() -> bool {
        true
    }
    fn default_enable_alsa() -> bool {
        true
    }
    fn default_alsa_poll_interval_ms() -> u64 {
        1000
    }
    fn default_aconnect_path() -> String {
        "aconnect".to_string()
    }
    fn default_alsa_canonical_names() -> HashMap<String, String> {
        HashMap::from([("System".to_string(), "system".to_string())])
    }
    fn default_port_alias_index() -> usize {
        0
    }
    fn default_reconnect_max_attempts() -> u32 {
        8
    }
    fn default_reconnect_initial_backoff_ms() -> u64 {
        500
    }
    fn default_reconnect_max_backoff_ms() -> u64 {
        30_000
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.alsa_poll_interval_ms.max(Self::MIN_POLL_INTERVAL_MS))
    }

    /// Clamp values that would make the runtime misbehave.
    fn sanitize(mut self) -> Self {
        if self.alsa_poll_interval_ms < Self::MIN_POLL_INTERVAL_MS {
            log::warn!(
                "alsa_poll_interval_ms {} too small, using {}",
                self.alsa_poll_interval_ms,
                Self::MIN_POLL_INTERVAL_MS
            );
            self.alsa_poll_interval_ms = Self::MIN_POLL_INTERVAL_MS;
        }
        if self.port_alias_index > 2 {
            log::warn!("port_alias_index {} out of range, aliases disabled", self.port_alias_index);
            self.port_alias_index = 0;
        }
        self
    }
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            client_name: Self::default_client_name(),
            enable_native: Self::default_enable_native(),
            enable_bus: Self::default_enable_bus(),
            enable_bridge: Self::default_enable_bridge(),
            enable_alsa: Self::default_enable_alsa(),
            alsa_poll_interval_ms: Self::default_alsa_poll_interval_ms(),
            aconnect_path: Self::default_aconnect_path(),
            alsa_canonical_names: Self::default_alsa_canonical_names(),
            port_alias_index: Self::default_port_alias_index(),
            reconnect_max_attempts: Self::default_reconnect_max_attempts(),
            reconnect_initial_backoff_ms: Self::default_reconnect_initial_backoff_ms(),
            reconnect_max_backoff_ms: Self::default_reconnect_max_backoff_ms(),
        }
    }
}

fn parse_preferences(text: &str) -> Preferences {
    match serde_json::from_str::<Preferences>(text) {
        Ok(prefs) => prefs.sanitize(),
        Err(e) => {
            log::warn!("Invalid preferences, using defaults: {}", e);
            Preferences::default()
        }
    }
}

/// Load preferences; a missing file yields defaults and is written back.
pub fn load_preferences() -> Preferences {
    let path = config_path("preferences.json");
    match std::fs::read_to_string(&path) {
        Ok(s) => parse_preferences(&s),
        Err(_) => {
            let prefs = Preferences::default();
            save_preferences(&prefs);
            prefs
        }
    }
}

pub fn save_preferences(prefs: &Preferences) {
    let path = config_path("preferences.json");
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let json = serde_json::to_string_pretty(prefs).unwrap_or_default();
    if let Err(e) = std::fs::write(&path, &json) {
        log::error!("Failed to save preferences to {:?}: {}", path, e);
    } else {
        log::debug!("save_preferences: written to {:?}", path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let prefs = parse_preferences(r#"{ "enable_alsa": false, "client_name": "mirror" }"#);
        assert!(!prefs.enable_alsa);
        assert_eq!(prefs.client_name, "mirror");
        assert_eq!(prefs.alsa_poll_interval_ms, 1000);
        assert_eq!(
            prefs.alsa_canonical_names.get("System").map(String::as_str),
            Some("system")
        );
    }

    #[test]
    fn test_invalid_file_yields_defaults() {
        assert_eq!(parse_preferences("not json"), Preferences::default());
    }

    #[test]
    fn test_values_are_clamped() {
        let prefs = parse_preferences(r#"{ "alsa_poll_interval_ms": 5, "port_alias_index": 7 }"#);
        assert_eq!(prefs.alsa_poll_interval_ms, Preferences::MIN_POLL_INTERVAL_MS);
        assert_eq!(prefs.port_alias_index, 0);
    }

    #[test]
    fn test_round_trip_through_json() {
        let prefs = Preferences::default();
        let json = serde_json::to_string_pretty(&prefs).unwrap();
        assert_eq!(parse_preferences(&json), prefs);
    }
}
