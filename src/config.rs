//! Engine configuration
//!
//! Loaded from a JSON file; every section and field has a default so a
//! partial file (or none at all) works.
//!
//! ```json
//! {
//!   "catalogDir": "/etc/opgate/catalog",
//!   "audit": { "dir": "/var/lib/opgate/audit", "retentionSecs": 2592000,
//!              "retentionAction": { "archive": "/var/lib/opgate/archive" } },
//!   "provider": { "timeoutMs": 30000, "scriptsDir": "/etc/opgate/scripts",
//!                 "requirePinnedScripts": true }
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audit::{AuditSettings, RetentionAction};
use crate::engine::EngineSettings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditConfig {
    pub dir: PathBuf,
    pub key_file: PathBuf,
    pub max_segment_bytes: u64,
    pub max_segment_age_secs: u64,
    pub retention_secs: Option<u64>,
    pub retention_action: RetentionAction,
    pub fsync: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("audit"),
            key_file: PathBuf::from("audit.key"),
            max_segment_bytes: 8 * 1024 * 1024,
            max_segment_age_secs: 24 * 60 * 60,
            retention_secs: None,
            retention_action: RetentionAction::Delete,
            fsync: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockConfig {
    pub default_ttl_ms: u64,
    pub wait_poll_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 120_000,
            wait_poll_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfirmationConfig {
    pub window_secs: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self { window_secs: 300 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub timeout_ms: u64,
    /// Enables the script provider
    pub scripts_dir: Option<PathBuf>,
    /// Block scripts whose operation pins no `scriptSha256`
    pub require_pinned_scripts: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            scripts_dir: None,
            require_pinned_scripts: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowConfig {
    pub max_parallel: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self { max_parallel: 4 }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub catalog_dir: PathBuf,
    pub audit: AuditConfig,
    pub locks: LockConfig,
    pub rate_limit: RateLimitConfig,
    pub confirmation: ConfirmationConfig,
    pub provider: ProviderConfig,
    pub workflow: WorkflowConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            catalog_dir: PathBuf::from("catalog"),
            audit: AuditConfig::default(),
            locks: LockConfig::default(),
            rate_limit: RateLimitConfig::default(),
            confirmation: ConfirmationConfig::default(),
            provider: ProviderConfig::default(),
            workflow: WorkflowConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;
        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.audit.max_segment_bytes == 0 {
            anyhow::bail!("audit.maxSegmentBytes must be greater than zero");
        }
        if self.audit.max_segment_age_secs == 0 {
            anyhow::bail!("audit.maxSegmentAgeSecs must be greater than zero");
        }
        if self.audit.retention_secs == Some(0) {
            anyhow::bail!("audit.retentionSecs must be greater than zero when set");
        }
        if self.locks.default_ttl_ms == 0 {
            anyhow::bail!("locks.defaultTtlMs must be greater than zero");
        }
        if self.locks.wait_poll_ms == 0 {
            anyhow::bail!("locks.waitPollMs must be greater than zero");
        }
        if self.rate_limit.window_secs == 0 {
            anyhow::bail!("rateLimit.windowSecs must be greater than zero");
        }
        if self.rate_limit.sweep_interval_secs == 0 {
            anyhow::bail!("rateLimit.sweepIntervalSecs must be greater than zero");
        }
        if self.confirmation.window_secs == 0 {
            anyhow::bail!("confirmation.windowSecs must be greater than zero");
        }
        if self.provider.timeout_ms == 0 {
            anyhow::bail!("provider.timeoutMs must be greater than zero");
        }
        if self.workflow.max_parallel == 0 {
            anyhow::bail!("workflow.maxParallel must be greater than zero");
        }
        if self.locks.default_ttl_ms < self.provider.timeout_ms {
            anyhow::bail!(
                "locks.defaultTtlMs ({}) must not be shorter than provider.timeoutMs ({})",
                self.locks.default_ttl_ms,
                self.provider.timeout_ms
            );
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            lock_ttl: Duration::from_millis(self.locks.default_ttl_ms),
            lock_poll: Duration::from_millis(self.locks.wait_poll_ms),
            provider_timeout: Duration::from_millis(self.provider.timeout_ms),
            rate_limit_window: Duration::from_secs(self.rate_limit.window_secs),
            confirmation_window: Duration::from_secs(self.confirmation.window_secs),
            maintenance_interval: Duration::from_secs(self.rate_limit.sweep_interval_secs),
            max_parallel: self.workflow.max_parallel,
        }
    }

    pub fn audit_settings(&self) -> AuditSettings {
        AuditSettings {
            dir: self.audit.dir.clone(),
            max_segment_bytes: self.audit.max_segment_bytes,
            max_segment_age: Duration::from_secs(self.audit.max_segment_age_secs),
            retention: self.audit.retention_secs.map(Duration::from_secs),
            retention_action: self.audit.retention_action.clone(),
            fsync: self.audit.fsync,
        }
    }
}
