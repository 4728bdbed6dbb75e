//! The configuration value tree the core consumes.
//!
//! This is already-validated and secret-free by the time it reaches the
//! core — env-var interpolation and secret resolution happen upstream,
//! outside this crate. `Config::load` only does the mechanical YAML
//! parse plus the structural validation the gateway design calls out
//! explicitly: rejecting a `conflict_resolution.strategy` of `manual`,
//! and requiring backend names to match `[A-Za-z0-9_-]+`.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration value tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,

    #[serde(default)]
    pub conflict_resolution: ConflictResolutionConfig,

    #[serde(default)]
    pub incoming_auth: IncomingAuthConfig,

    #[serde(default)]
    pub authorization: AuthorizationConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub session: SessionTrackerConfig,
}

/// Per-backend descriptor. Immutable once built; a changed descriptor
/// means remove-then-readd, never in-place mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub transport: Transport,

    #[serde(default)]
    pub connect: ConnectParams,

    #[serde(default)]
    pub auth: OutgoingAuth,

    #[serde(default)]
    pub filters: FiltersConfig,

    #[serde(default)]
    pub tool_overrides: HashMap<String, ToolOverride>,

    #[serde(default)]
    pub timeouts: TimeoutOverrides,

    #[serde(default = "default_group")]
    pub group: String,
}

fn default_group() -> String {
    "default".to_string()
}

/// Transport kind for a backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    Stdio,
    Sse,
    StreamableHttp,
}

/// Transport-specific connect parameters. Only the fields relevant to
/// the descriptor's `transport` are expected to be populated — this is
/// validated at load time rather than modeled as an internally tagged
/// enum, so a single flat `connect:` block covers stdio command/args/env
/// as well as the url/headers pair that sse and streamable-http share.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectParams {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,

    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Outgoing authentication strategy used when talking to a backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutgoingAuth {
    #[default]
    None,
    /// Fixed key-value header set, values already resolved from secrets
    /// before reaching this crate.
    Static { headers: HashMap<String, String> },
    /// OAuth2 client-credentials token fetch, cached and refreshed ahead
    /// of expiry via single-flight.
    ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scopes: Vec<String>,
        #[serde(default = "default_refresh_buffer", with = "humantime_duration")]
        refresh_buffer: Duration,
    },
}

fn default_refresh_buffer() -> Duration {
    Duration::from_secs(30)
}

/// Per-kind allow/deny glob filters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FiltersConfig {
    #[serde(default)]
    pub tools: KindFilter,
    #[serde(default)]
    pub resources: KindFilter,
    #[serde(default)]
    pub prompts: KindFilter,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KindFilter {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Per-tool exposed-name / description override.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOverride {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Per-backend timeout overrides. `None` falls back to the global default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TimeoutOverrides {
    #[serde(default, with = "option_humantime_duration")]
    pub init: Option<Duration>,
    #[serde(default, with = "option_humantime_duration")]
    pub cap_fetch: Option<Duration>,
    #[serde(default, with = "option_humantime_duration")]
    pub sse_startup: Option<Duration>,
}

impl TimeoutOverrides {
    pub fn init_or(&self, default: Duration) -> Duration {
        self.init.unwrap_or(default)
    }
    pub fn cap_fetch_or(&self, default: Duration) -> Duration {
        self.cap_fetch.unwrap_or(default)
    }
    pub fn sse_startup_or(&self, default: Duration) -> Duration {
        self.sse_startup.unwrap_or(default)
    }
}

/// Conflict resolution strategy selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictResolutionConfig {
    #[serde(default)]
    pub strategy: ConflictStrategy,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default)]
    pub order: Vec<String>,
}

impl Default for ConflictResolutionConfig {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::default(),
            separator: default_separator(),
            order: Vec::new(),
        }
    }
}

fn default_separator() -> String {
    "_".to_string()
}

/// The four supported conflict strategies. A `manual` mode is
/// deliberately not a variant here: a config naming it fails to
/// deserialize, and `Config::load` surfaces that as a load error rather
/// than silently falling back to something else.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    #[default]
    FirstWins,
    Prefix,
    Priority,
    Error,
}

/// Incoming (upstream-client-facing) authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum IncomingAuthConfig {
    Anonymous,
    Local {
        token: String,
    },
    Jwt {
        jwks_uri: String,
        issuer: String,
        audience: String,
        #[serde(default = "default_algorithms")]
        allowed_algorithms: Vec<String>,
    },
    Oidc {
        jwks_uri: String,
        issuer: String,
        audience: String,
        #[serde(default = "default_algorithms")]
        allowed_algorithms: Vec<String>,
    },
}

fn default_algorithms() -> Vec<String> {
    vec!["RS256".to_string()]
}

impl Default for IncomingAuthConfig {
    fn default() -> Self {
        IncomingAuthConfig::Anonymous
    }
}

/// Authorization policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthorizationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub default_effect: PolicyEffect,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_effect: PolicyEffect::Deny,
            policies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PolicyEffect {
    Allow,
    Deny,
}

impl Default for PolicyEffect {
    fn default() -> Self {
        PolicyEffect::Deny
    }
}

/// One ordered `{effect, roles, resources}` rule. Resources are
/// `kind:name-glob` patterns; the first matching policy wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    pub effect: PolicyEffect,
    pub roles: Vec<String>,
    pub resources: Vec<String>,
}

/// Audit sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_audit_file")]
    pub file: String,
    #[serde(default = "default_audit_max_size")]
    pub max_size: u64,
    #[serde(default = "default_audit_backup_count")]
    pub backup_count: u32,
    /// Bounded queue depth before the sink drops the oldest entry.
    #[serde(default = "default_audit_queue_depth")]
    pub queue_depth: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file: default_audit_file(),
            max_size: default_audit_max_size(),
            backup_count: default_audit_backup_count(),
            queue_depth: default_audit_queue_depth(),
        }
    }
}

fn default_audit_file() -> String {
    "audit.jsonl".to_string()
}
fn default_audit_max_size() -> u64 {
    10 * 1024 * 1024
}
fn default_audit_backup_count() -> u32 {
    5
}
fn default_audit_queue_depth() -> usize {
    4096
}

/// Global health-check configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval", with = "humantime_duration")]
    pub interval: Duration,

    #[serde(default = "default_health_timeout", with = "humantime_duration")]
    pub timeout: Duration,

    /// Consecutive probe failures before Ready -> Degraded.
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: u32,

    /// Consecutive probe failures before a transition to Failed.
    #[serde(default = "default_failed_threshold")]
    pub failed_threshold: u32,

    /// Probe latency above which the "slow" counter increments.
    #[serde(default = "default_latency_threshold", with = "humantime_duration")]
    pub latency_threshold: Duration,

    /// Consecutive slow probes before a transition to Degraded.
    #[serde(default = "default_slow_threshold")]
    pub slow_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            degraded_threshold: default_degraded_threshold(),
            failed_threshold: default_failed_threshold(),
            latency_threshold: default_latency_threshold(),
            slow_threshold: default_slow_threshold(),
        }
    }
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_degraded_threshold() -> u32 {
    1
}
fn default_failed_threshold() -> u32 {
    3
}
fn default_latency_threshold() -> Duration {
    Duration::from_secs(5)
}
fn default_slow_threshold() -> u32 {
    3
}

/// Management REST API configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_admin_listen(),
        }
    }
}

fn default_admin_listen() -> String {
    "127.0.0.1:19999".to_string()
}

/// Upstream session tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionTrackerConfig {
    #[serde(default = "default_session_ttl", with = "humantime_duration")]
    pub ttl: Duration,
    #[serde(default = "default_sweep_interval", with = "humantime_duration")]
    pub sweep_interval: Duration,
}

impl Default for SessionTrackerConfig {
    fn default() -> Self {
        Self {
            ttl: default_session_ttl(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Config {
    /// Load and structurally validate a configuration file.
    ///
    /// Env-var expansion and secret resolution happen upstream of this
    /// crate; the tree deserialized here is already resolved.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&raw)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for name in self.backends.keys() {
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                bail!("invalid backend name '{name}': must match [A-Za-z0-9_-]+");
            }
        }
        for (name, backend) in &self.backends {
            match backend.transport {
                Transport::Stdio => {
                    if backend.connect.command.is_none() {
                        bail!("backend '{name}': stdio transport requires connect.command");
                    }
                }
                Transport::Sse | Transport::StreamableHttp => {
                    if backend.connect.url.is_none() {
                        bail!("backend '{name}': {:?} transport requires connect.url", backend.transport);
                    }
                }
            }
        }
        if self.conflict_resolution.strategy == ConflictStrategy::Priority
            && self.conflict_resolution.order.is_empty()
        {
            bail!("conflict_resolution.strategy = priority requires a non-empty order list");
        }
        Ok(())
    }

    /// Diff two backend maps by name and content hash, used by the
    /// reload coordinator to classify backends as added/removed/changed.
    pub fn diff_backends(&self, new: &Config) -> BackendDiff {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut changed = Vec::new();

        for (name, new_config) in &new.backends {
            match self.backends.get(name) {
                None => added.push((name.clone(), new_config.clone())),
                Some(old_config) if old_config != new_config => {
                    changed.push((name.clone(), new_config.clone()));
                }
                _ => {}
            }
        }
        for name in self.backends.keys() {
            if !new.backends.contains_key(name) {
                removed.push(name.clone());
            }
        }

        BackendDiff {
            added,
            removed,
            changed,
        }
    }
}

/// Result of comparing two backend maps across a reload.
pub struct BackendDiff {
    pub added: Vec<(String, BackendConfig)>,
    pub removed: Vec<String>,
    pub changed: Vec<(String, BackendConfig)>,
}

impl BackendDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Serde helper: durations as humantime-like strings ("30s", "5m", "1h").
mod humantime_duration {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn format_duration(d: &Duration) -> String {
        let secs = d.as_secs();
        if secs != 0 && secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(n) = s.strip_suffix("ms") {
            return n
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| format!("invalid duration '{s}': {e}"));
        }
        if let Some(n) = s.strip_suffix('s') {
            n.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('m') {
            n.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('h') {
            n.parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| format!("invalid duration '{s}': expected e.g. '30s', '5m', '1h'"))
        }
    }
}

/// Same helper, for `Option<Duration>` fields — per-backend timeout
/// overrides that fall back to a global default when absent.
mod option_humantime_duration {
    use super::humantime_duration::{format_duration, parse_duration};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&format_duration(d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt = Option::<String>::deserialize(deserializer)?;
        match opt {
            Some(s) => parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_backend() -> BackendConfig {
        BackendConfig {
            transport: Transport::Stdio,
            connect: ConnectParams {
                command: Some("echo".to_string()),
                ..Default::default()
            },
            auth: OutgoingAuth::None,
            filters: FiltersConfig::default(),
            tool_overrides: HashMap::new(),
            timeouts: TimeoutOverrides::default(),
            group: default_group(),
        }
    }

    fn minimal_config() -> Config {
        Config {
            log_level: default_log_level(),
            backends: HashMap::new(),
            conflict_resolution: ConflictResolutionConfig::default(),
            incoming_auth: IncomingAuthConfig::Anonymous,
            authorization: AuthorizationConfig::default(),
            audit: AuditConfig::default(),
            health: HealthConfig::default(),
            admin: AdminConfig::default(),
            session: SessionTrackerConfig::default(),
        }
    }

    #[test]
    fn rejects_manual_strategy() {
        let yaml = r#"
backends: {}
conflict_resolution:
  strategy: manual
"#;
        let result: std::result::Result<Config, _> = serde_yaml_ng::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn priority_without_order_fails_validation() {
        let mut config = minimal_config();
        config.conflict_resolution.strategy = ConflictStrategy::Priority;
        assert!(config.validate().is_err());
        config.conflict_resolution.order.push("a".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_invalid_backend_name() {
        let mut config = minimal_config();
        config.backends.insert("bad name!".to_string(), minimal_backend());
        assert!(config.validate().is_err());
    }

    #[test]
    fn stdio_backend_requires_command() {
        let mut config = minimal_config();
        let mut backend = minimal_backend();
        backend.connect.command = None;
        config.backends.insert("broken".to_string(), backend);
        assert!(config.validate().is_err());
    }

    #[test]
    fn http_backend_requires_url() {
        let mut config = minimal_config();
        let backend = BackendConfig {
            transport: Transport::StreamableHttp,
            ..minimal_backend()
        };
        config.backends.insert("broken".to_string(), backend);
        assert!(config.validate().is_err());
    }

    #[test]
    fn diff_classifies_added_removed_changed() {
        let mut old = minimal_config();
        old.backends.insert("exa".to_string(), minimal_backend());
        old.backends.insert("tavily".to_string(), minimal_backend());

        let mut new = minimal_config();
        let mut exa_changed = minimal_backend();
        exa_changed.connect.args.push("--new-flag".to_string());
        new.backends.insert("exa".to_string(), exa_changed);
        new.backends.insert("firecrawl".to_string(), minimal_backend());

        let diff = old.diff_backends(&new);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].0, "firecrawl");
        assert_eq!(diff.removed, vec!["tavily".to_string()]);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].0, "exa");
    }

    #[test]
    fn diff_of_identical_config_is_empty() {
        let mut config = minimal_config();
        config.backends.insert("exa".to_string(), minimal_backend());
        let diff = config.diff_backends(&config.clone());
        assert!(diff.is_empty());
    }

    #[test]
    fn duration_roundtrip() {
        assert_eq!(
            humantime_duration::parse_duration("30s").unwrap(),
            Duration::from_secs(30)
        );
        assert_eq!(
            humantime_duration::parse_duration("5m").unwrap(),
            Duration::from_secs(300)
        );
        assert_eq!(
            humantime_duration::format_duration(&Duration::from_secs(120)),
            "2m"
        );
    }

    #[test]
    fn defaults_are_sane() {
        let yaml = "{}";
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.log_level, "info");
        assert!(config.backends.is_empty());
        assert_eq!(config.health.interval, Duration::from_secs(30));
        assert!(!config.admin.enabled);
        assert!(matches!(config.incoming_auth, IncomingAuthConfig::Anonymous));
    }
}
