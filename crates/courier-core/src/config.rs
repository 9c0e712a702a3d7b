//! Configuration.
//!
//! One [`Config`] is loaded at startup and its sections are handed to the
//! component constructors. Nothing reads configuration after that.

use crate::{CoreError, CoreResult, EventKind, ExportMode, Paths};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Overrides the database location from [`Paths::database_file`].
    pub database_path: Option<PathBuf>,
    pub outbox: OutboxConfig,
    pub auto_replay: AutoReplayConfig,
    pub idempotency: IdempotencyConfig,
    pub url_policy: UrlPolicyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            database_path: None,
            outbox: OutboxConfig::default(),
            auto_replay: AutoReplayConfig::default(),
            idempotency: IdempotencyConfig::default(),
            url_policy: UrlPolicyConfig::default(),
        }
    }
}

/// Delivery processor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Attempts before an event goes dead.
    pub max_attempts: u32,
    /// Rows claimed per sweep.
    pub batch_size: u32,
    /// Lease on a claimed row. A crashed sweep's rows are reclaimable after this.
    /// Renewed per row before each adapter call.
    pub claim_ttl_seconds: u64,
    /// Upper bound on a single adapter call. Must be shorter than the lease.
    pub adapter_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    /// How long a skipped event waits before it is claimed again.
    pub skip_backoff_seconds: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            batch_size: 50,
            claim_ttl_seconds: 300,
            adapter_timeout_ms: 10_000,
            sweep_interval_ms: 5_000,
            skip_backoff_seconds: 300,
        }
    }
}

/// Which queue the auto-replay budget is spent on first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPriority {
    #[default]
    OutboxFirst,
    ExportFirst,
}

/// Dead-letter auto-replay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoReplayConfig {
    pub auto_replay_enabled: bool,
    pub allowed_outbox_kinds: Vec<EventKind>,
    pub allowed_export_modes: Vec<ExportMode>,
    /// Dwell time in the dead state before an event is eligible.
    pub min_age_minutes: i64,
    /// Replay budget per org per run, shared by outbox and export events.
    pub max_per_org: u32,
    /// Consecutive failures that stop a run.
    pub failure_streak_limit: u32,
    pub export_replay_limit: u32,
    pub export_cooldown_minutes: i64,
    /// Dead outbox events at or beyond this many attempts are never replayed.
    pub outbox_attempt_ceiling: u32,
    pub priority: ReplayPriority,
    pub replay_interval_secs: u64,
    /// A dead row skipped by policy is not eligible again for this long.
    pub skip_cooldown_minutes: i64,
}

impl Default for AutoReplayConfig {
    fn default() -> Self {
        Self {
            auto_replay_enabled: true,
            allowed_outbox_kinds: vec![EventKind::Webhook],
            allowed_export_modes: vec![ExportMode::Webhook],
            min_age_minutes: 60,
            max_per_org: 25,
            failure_streak_limit: 5,
            export_replay_limit: 3,
            export_cooldown_minutes: 60,
            outbox_attempt_ceiling: 10,
            priority: ReplayPriority::OutboxFirst,
            replay_interval_secs: 900,
            skip_cooldown_minutes: 240,
        }
    }
}

/// HTTP idempotency ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub header_name: String,
    /// Lease on a pending claim. An expired claim may be taken over.
    pub claim_ttl_seconds: u64,
    /// `Retry-After` sent while the original request is still running.
    pub retry_after_seconds: u64,
    /// Completed records older than this are purged.
    pub retention_hours: u64,
    pub max_body_bytes: usize,
    pub sweep_interval_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            header_name: "Idempotency-Key".to_string(),
            claim_ttl_seconds: 600,
            retry_after_seconds: 1,
            retention_hours: 24,
            max_body_bytes: 1024 * 1024,
            sweep_interval_secs: 60,
        }
    }
}

/// Outbound URL rules applied before every webhook send or replay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlPolicyConfig {
    /// Permit plain `http` targets.
    pub allow_http: bool,
    /// When non-empty, only these hosts (and their subdomains) are allowed.
    pub allowed_hosts: Vec<String>,
    pub denied_hosts: Vec<String>,
}

impl Config {
    /// Load from `<base>/config.json` if present, then apply environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Database location, honouring `database_path`.
    pub fn database_file(&self, paths: &Paths) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| paths.database_file())
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.outbox.max_attempts == 0 {
            return Err(CoreError::Config("outbox.max_attempts must be > 0".into()));
        }
        if self.outbox.batch_size == 0 {
            return Err(CoreError::Config("outbox.batch_size must be > 0".into()));
        }
        if self.auto_replay.max_per_org == 0 {
            return Err(CoreError::Config(
                "auto_replay.max_per_org must be > 0".into(),
            ));
        }
        if self.auto_replay.failure_streak_limit == 0 {
            return Err(CoreError::Config(
                "auto_replay.failure_streak_limit must be > 0".into(),
            ));
        }
        if self.outbox.adapter_timeout_ms >= self.outbox.claim_ttl_seconds.saturating_mul(1000) {
            return Err(CoreError::Config(format!(
                "outbox.adapter_timeout_ms ({}) must be shorter than outbox.claim_ttl_seconds ({}s)",
                self.outbox.adapter_timeout_ms, self.outbox.claim_ttl_seconds
            )));
        }
        if self.auto_replay.skip_cooldown_minutes < 0 {
            return Err(CoreError::Config(
                "auto_replay.skip_cooldown_minutes must be >= 0".into(),
            ));
        }
        if self.auto_replay.outbox_attempt_ceiling < self.outbox.max_attempts {
            return Err(CoreError::Config(format!(
                "auto_replay.outbox_attempt_ceiling ({}) must be >= outbox.max_attempts ({})",
                self.auto_replay.outbox_attempt_ceiling, self.outbox.max_attempts
            )));
        }
        if self.idempotency.header_name.trim().is_empty() {
            return Err(CoreError::Config(
                "idempotency.header_name must not be empty".into(),
            ));
        }
        Ok(())
    }

    fn load_from_env(&mut self) {
        self.apply_env(|name| std::env::var(name).ok());
    }

    /// Apply `COURIER_*` overrides resolved through `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup("COURIER_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(path) = lookup("COURIER_DATABASE_PATH").filter(|p| !p.trim().is_empty()) {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(enabled) = lookup("COURIER_AUTO_REPLAY_ENABLED") {
            match enabled.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.auto_replay.auto_replay_enabled = true,
                "0" | "false" | "no" | "off" => self.auto_replay.auto_replay_enabled = false,
                other => tracing::warn!(value = other, "ignoring COURIER_AUTO_REPLAY_ENABLED"),
            }
        }
        if let Some(raw) = lookup("COURIER_MAX_ATTEMPTS") {
            match raw.trim().parse::<u32>() {
                Ok(n) => self.outbox.max_attempts = n,
                Err(_) => tracing::warn!(value = %raw, "ignoring COURIER_MAX_ATTEMPTS"),
            }
        }
    }
}
