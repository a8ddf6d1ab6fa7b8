//! Node liveness: probe policy and the debounced up/down state machine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on probe attempts per check.
pub const MAX_TRIES: u32 = 10;

/// Upper bound on the delay between two probe attempts.
pub const MAX_TRY_DELAY: Duration = Duration::from_secs(60);

/// Consecutive-result thresholds required before a state may flip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub count_up: u32,
    pub count_down: u32,
}

impl Thresholds {
    pub fn new(count_up: u32, count_down: u32) -> Self {
        Self {
            count_up: count_up.max(1),
            count_down: count_down.max(1),
        }
    }
}

/// Debounced up/down state of a node or IP address.
///
/// A success extends the up streak and clears the down streak (failures do
/// the reverse). The visible state only changes once the streak in the new
/// direction reaches its threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpDownCounter {
    pub is_up: bool,
    pub count_up: u32,
    pub count_down: u32,
}

impl UpDownCounter {
    pub fn new(is_up: bool) -> Self {
        Self {
            is_up,
            count_up: 0,
            count_down: 0,
        }
    }

    /// Record one probe outcome. Returns the new state when it flipped.
    pub fn record(&mut self, ok: bool, thresholds: Thresholds) -> Option<bool> {
        let thresholds = Thresholds::new(thresholds.count_up, thresholds.count_down);
        if ok {
            self.count_up = self.count_up.saturating_add(1);
            self.count_down = 0;
            if self.count_up >= thresholds.count_up && !self.is_up {
                self.is_up = true;
                return Some(true);
            }
        } else {
            self.count_down = self.count_down.saturating_add(1);
            self.count_up = 0;
            if self.count_down >= thresholds.count_down && self.is_up {
                self.is_up = false;
                return Some(false);
            }
        }
        None
    }
}

/// HTTP probe policy of a cluster.
///
/// Stored as JSON on the cluster row; the server's configured policy applies
/// when a cluster has none.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckPolicy {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Overrides any port in the IP address.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_tries")]
    pub tries: u32,
    #[serde(default = "default_try_delay_ms")]
    pub try_delay_ms: u64,
    /// Accepted status codes. Empty accepts any 2xx.
    #[serde(default)]
    pub status_codes: Vec<u16>,
    #[serde(default = "default_count_up")]
    pub count_up: u32,
    #[serde(default = "default_count_down")]
    pub count_down: u32,
    /// Also debounce the state of the probed IP address.
    #[serde(default)]
    pub track_ip_health: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_tries() -> u32 {
    1
}

fn default_try_delay_ms() -> u64 {
    1000
}

fn default_count_up() -> u32 {
    1
}

fn default_count_down() -> u32 {
    3
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            scheme: default_scheme(),
            port: None,
            path: default_path(),
            timeout_secs: default_timeout_secs(),
            tries: default_tries(),
            try_delay_ms: default_try_delay_ms(),
            status_codes: Vec::new(),
            count_up: default_count_up(),
            count_down: default_count_down(),
            track_ip_health: false,
        }
    }
}

impl HealthCheckPolicy {
    /// Clamp every field into its supported range.
    pub fn normalized(mut self) -> Self {
        self.tries = self.tries.clamp(1, MAX_TRIES);
        self.try_delay_ms = self.try_delay_ms.min(MAX_TRY_DELAY.as_millis() as u64);
        self.timeout_secs = self.timeout_secs.max(1);
        self.count_up = self.count_up.max(1);
        self.count_down = self.count_down.max(1);
        if self.scheme != "http" && self.scheme != "https" {
            self.scheme = default_scheme();
        }
        if !self.path.starts_with('/') {
            self.path.insert(0, '/');
        }
        self
    }

    /// Reject values that cannot be normalised into something meaningful.
    pub fn validate(&self) -> crate::Result<()> {
        if self.scheme != "http" && self.scheme != "https" {
            return Err(crate::Error::InvalidPolicy(format!(
                "unsupported scheme: {}",
                self.scheme
            )));
        }
        if let Some(code) = self.status_codes.iter().find(|c| !(100..600).contains(*c)) {
            return Err(crate::Error::InvalidPolicy(format!(
                "invalid status code: {code}"
            )));
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds::new(self.count_up, self.count_down)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn try_delay(&self) -> Duration {
        Duration::from_millis(self.try_delay_ms).min(MAX_TRY_DELAY)
    }

    pub fn accepts(&self, status: u16) -> bool {
        if self.status_codes.is_empty() {
            (200..300).contains(&status)
        } else {
            self.status_codes.contains(&status)
        }
    }

    /// Probe URL for an address, which may carry its own port.
    pub fn url_for(&self, ip: &str) -> String {
        let host = match self.port {
            Some(port) => format!("{}:{port}", strip_port(ip)),
            None => ip.to_string(),
        };
        format!("{}://{}{}", self.scheme, host, self.path)
    }
}

fn strip_port(addr: &str) -> &str {
    // Bracketed IPv6 with port: "[::1]:80"
    if let Some(rest) = addr.strip_prefix('[')
        && let Some(end) = rest.find(']')
    {
        return &addr[..end + 2];
    }
    match addr.rsplit_once(':') {
        // A bare IPv6 address has more than one colon.
        Some((host, _)) if !host.contains(':') => host,
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debounce_down_after_exact_count_down() {
        let thresholds = Thresholds::new(3, 2);
        let mut state = UpDownCounter::new(true);

        assert_eq!(state.record(false, thresholds), None);
        assert!(state.is_up);
        assert_eq!(state.record(false, thresholds), Some(false));
        assert!(!state.is_up);
        // Further failures do not flip again.
        assert_eq!(state.record(false, thresholds), None);
    }

    #[test]
    fn test_debounce_up_after_exact_count_up() {
        let thresholds = Thresholds::new(3, 2);
        let mut state = UpDownCounter::new(false);

        assert_eq!(state.record(true, thresholds), None);
        assert_eq!(state.record(true, thresholds), None);
        assert_eq!(state.record(true, thresholds), Some(true));
        assert!(state.is_up);
    }

    #[test]
    fn test_debounce_streak_resets_on_opposite_result() {
        let thresholds = Thresholds::new(3, 2);
        let mut state = UpDownCounter::new(true);

        assert_eq!(state.record(false, thresholds), None);
        assert_eq!(state.record(true, thresholds), None);
        assert_eq!(state.count_down, 0);
        assert_eq!(state.record(false, thresholds), None);
        assert!(state.is_up, "alternating results must not flip");
    }

    #[test]
    fn test_policy_normalization_caps() {
        let policy = HealthCheckPolicy {
            tries: 50,
            try_delay_ms: 10 * 60 * 1000,
            timeout_secs: 0,
            count_up: 0,
            path: "health".to_string(),
            ..Default::default()
        }
        .normalized();

        assert_eq!(policy.tries, MAX_TRIES);
        assert_eq!(policy.try_delay(), MAX_TRY_DELAY);
        assert_eq!(policy.timeout_secs, 1);
        assert_eq!(policy.count_up, 1);
        assert_eq!(policy.path, "/health");
    }

    #[test]
    fn test_policy_accepts_any_2xx_by_default() {
        let policy = HealthCheckPolicy::default();
        assert!(policy.accepts(200));
        assert!(policy.accepts(204));
        assert!(!policy.accepts(301));
        assert!(!policy.accepts(503));

        let strict = HealthCheckPolicy {
            status_codes: vec![200, 301],
            ..Default::default()
        };
        assert!(strict.accepts(301));
        assert!(!strict.accepts(204));
    }

    #[test]
    fn test_policy_url_port_override() {
        let policy = HealthCheckPolicy {
            port: Some(8080),
            path: "/status".to_string(),
            ..Default::default()
        };
        assert_eq!(policy.url_for("10.0.0.1"), "http://10.0.0.1:8080/status");
        assert_eq!(
            policy.url_for("10.0.0.1:9000"),
            "http://10.0.0.1:8080/status"
        );
        assert_eq!(
            HealthCheckPolicy::default().url_for("127.0.0.1:9000"),
            "http://127.0.0.1:9000/"
        );
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: HealthCheckPolicy = serde_json::from_str(r#"{"count_down": 5}"#).unwrap();
        assert_eq!(policy.count_down, 5);
        assert_eq!(policy.count_up, 1);
        assert!(policy.enabled);
    }
}
