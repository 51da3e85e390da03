//! Script-backed provider
//!
//! Runs `<scripts_dir>/<operation_id>.sh` under bash for each request. The
//! request is passed through the environment:
//!
//! | Variable                | Value                               |
//! |-------------------------|-------------------------------------|
//! | `OPGATE_OPERATION`      | operation id                        |
//! | `OPGATE_TARGET`         | target id                           |
//! | `OPGATE_CORRELATION_ID` | correlation id                      |
//! | `OPGATE_ACTOR`          | actor id                            |
//! | `OPGATE_ARG_<NAME>`     | argument (strings raw, others JSON) |
//!
//! Exit code 0 is success. Stdout becomes `raw_output`; stderr is appended
//! on failure.
//!
//! # Pinned Scripts
//!
//! An operation may pin its script to a SHA-256 digest (`scriptSha256` in the
//! catalog). The engine puts the current catalog's pin on every request as
//! `expected_sha256`, so a reloaded catalog is enforced on the next call.
//! The script is read once, hashed, and those exact bytes are fed to bash on
//! stdin; bash reads them fully and then points stdin at `/dev/null` before
//! running them, so the script sees an empty stdin as before and size is not
//! bounded by the argument limit. A mismatch blocks execution. Unpinned
//! scripts run with a warning unless [`ScriptProvider::require_pins`] is set.

use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::process_guard::{ChildRegistry, CommandProcessGroup, terminate_group};
use crate::provider::{ExecutionResult, Provider, ProviderError, ProviderRequest};

/// Environment variable name for an argument key
pub fn argument_env_name(name: &str) -> String {
    let normalized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("OPGATE_ARG_{}", normalized)
}

fn argument_env_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Operation ids become file names; keep them inside the scripts directory
fn is_safe_script_name(operation_id: &str) -> bool {
    !operation_id.is_empty()
        && !operation_id.starts_with('.')
        && operation_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Reads the whole script from stdin, detaches stdin, then runs it
const SCRIPT_LOADER: &str = r#"IFS= read -r -d '' __opgate_src; exec </dev/null; eval "$__opgate_src""#;

/// Provider that runs one bash script per operation
#[derive(Debug)]
pub struct ScriptProvider {
    scripts_dir: PathBuf,
    grace_period: Duration,
    require_pins: bool,
    /// Process group of each in-flight request
    running: DashMap<String, u32>,
}

impl ScriptProvider {
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            grace_period: Duration::from_secs(2),
            require_pins: false,
            running: DashMap::new(),
        }
    }

    /// Refuse to run scripts that have no pinned digest
    pub fn require_pins(mut self, require: bool) -> Self {
        self.require_pins = require;
        self
    }

    /// Time a timed-out script gets between SIGTERM and SIGKILL
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    pub fn script_path(&self, operation_id: &str) -> Result<PathBuf, ProviderError> {
        if !is_safe_script_name(operation_id) {
            return Err(ProviderError::Unavailable {
                reason: format!("operation id '{}' is not a valid script name", operation_id),
            });
        }
        let path = self.scripts_dir.join(format!("{}.sh", operation_id));
        if !path.is_file() {
            return Err(ProviderError::Unavailable {
                reason: format!("no script for '{}' at {}", operation_id, path.display()),
            });
        }
        Ok(path)
    }

    /// Read the script and check it against `expected_sha256`
    pub fn load_script(
        &self,
        operation_id: &str,
        expected_sha256: Option<&str>,
    ) -> Result<(PathBuf, Vec<u8>), ProviderError> {
        let path = self.script_path(operation_id)?;
        let source = std::fs::read(&path).map_err(|e| ProviderError::Unavailable {
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        if source.contains(&0) {
            return Err(ProviderError::Unavailable {
                reason: format!("{} contains a NUL byte", path.display()),
            });
        }

        match expected_sha256 {
            Some(expected) => {
                let expected = expected.trim().to_ascii_lowercase();
                let actual = hex::encode(Sha256::digest(&source));
                if actual != expected {
                    warn!(
                        operation = operation_id,
                        expected = %expected,
                        actual = %actual,
                        "Script hash mismatch, execution blocked"
                    );
                    return Err(ProviderError::Unavailable {
                        reason: format!(
                            "script hash mismatch for {}: expected {}, found {}",
                            path.display(),
                            expected,
                            actual
                        ),
                    });
                }
                debug!(operation = operation_id, "Script hash verified");
            }
            None if self.require_pins => {
                return Err(ProviderError::Unavailable {
                    reason: format!("script for '{}' has no pinned sha256", operation_id),
                });
            }
            None => warn!(operation = operation_id, "No sha256 pinned for script; running unverified"),
        }
        Ok((path, source))
    }

    fn running_key(request: &ProviderRequest) -> String {
        format!(
            "{}/{}/{}",
            request.correlation_id, request.operation_id, request.target_id
        )
    }
}

impl Provider for ScriptProvider {
    fn name(&self) -> &str {
        "script"
    }

    fn execute(&self, request: &ProviderRequest) -> Result<ExecutionResult, ProviderError> {
        let (script, source) =
            self.load_script(&request.operation_id, request.expected_sha256.as_deref())?;

        // Run the bytes that were hashed; $0 is still the script path
        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(SCRIPT_LOADER)
            .arg(&script)
            .current_dir(&self.scripts_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("OPGATE_OPERATION", &request.operation_id)
            .env("OPGATE_TARGET", &request.target_id)
            .env("OPGATE_CORRELATION_ID", &request.correlation_id)
            .env("OPGATE_ACTOR", &request.actor_id)
            .in_new_process_group();
        if let Value::Object(arguments) = &request.arguments {
            for (name, value) in arguments {
                cmd.env(argument_env_name(name), argument_env_value(value));
            }
        }

        info!(
            "Running script {} for target {} (correlation {})",
            script.display(),
            request.target_id,
            request.correlation_id
        );
        let mut child = cmd.spawn().map_err(|e| ProviderError::Unavailable {
            reason: format!("failed to spawn {}: {}", script.display(), e),
        })?;
        let pid = child.id();
        // bash drains stdin before running anything, but a separate writer
        // keeps a loader that died early from blocking us
        let feeder = child.stdin.take().map(|mut stdin| {
            std::thread::spawn(move || {
                if let Err(e) = stdin.write_all(&source) {
                    debug!("Script loader closed stdin early: {}", e);
                }
            })
        });
        let key = Self::running_key(request);
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(pid);
        }
        self.running.insert(key.clone(), pid);

        let output = child.wait_with_output();
        if let Some(feeder) = feeder {
            let _ = feeder.join();
        }

        self.running.remove(&key);
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(pid);
        }

        let output = output.map_err(|e| ProviderError::Execution {
            reason: format!("failed waiting for {}: {}", script.display(), e),
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        let exit_info = match output.status.code() {
            Some(code) => format!("exit code {}", code),
            None => {
                use std::os::unix::process::ExitStatusExt;
                format!("killed by signal {}", output.status.signal().unwrap_or(0))
            }
        };

        if output.status.success() {
            debug!("Script {} succeeded", script.display());
            Ok(ExecutionResult::succeeded(stdout).with_exit_info(exit_info))
        } else {
            warn!("Script {} failed: {}", script.display(), exit_info);
            let raw_output = if stderr.trim().is_empty() {
                stdout
            } else {
                format!("{}{}", stdout, stderr)
            };
            Ok(ExecutionResult::failed(raw_output).with_exit_info(exit_info))
        }
    }

    fn abort(&self, request: &ProviderRequest) {
        let key = Self::running_key(request);
        if let Some((_, pid)) = self.running.remove(&key) {
            warn!(
                "Killing process group {} for timed-out {} on {}",
                pid, request.operation_id, request.target_id
            );
            terminate_group(pid, self.grace_period);
        }
    }
}
