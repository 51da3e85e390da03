//! Provider contract
//!
//! A provider is the opaque adapter that actually talks to a target. The
//! engine only sees [`Provider::execute`]; how the provider reaches the device
//! is its own business.
//!
//! Calls run on a worker thread so a hung provider cannot hold the pipeline
//! (or the target lock) past its timeout. See [`run_with_timeout`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while executing against a target
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider ran but reported an error
    #[error("Provider execution failed: {reason}")]
    Execution { reason: String },

    /// The call did not finish within its timeout
    #[error("Provider timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// The provider could not be reached or started
    #[error("Provider unavailable: {reason}")]
    Unavailable { reason: String },

    /// The provider thread panicked
    #[error("Provider panicked")]
    Panicked,
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        ProviderError::Unavailable {
            reason: err.to_string(),
        }
    }
}

/// What the engine hands to a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRequest {
    pub operation_id: String,
    pub target_id: String,
    pub arguments: Value,
    pub correlation_id: String,
    pub actor_id: String,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// SHA-256 (hex) the operation's catalog record pins its script to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sha256: Option<String>,
}

/// Outcome reported by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub raw_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_info: Option<String>,
}

impl ExecutionResult {
    pub fn succeeded(raw_output: impl Into<String>) -> Self {
        Self {
            success: true,
            raw_output: raw_output.into(),
            exit_info: None,
        }
    }

    pub fn failed(raw_output: impl Into<String>) -> Self {
        Self {
            success: false,
            raw_output: raw_output.into(),
            exit_info: None,
        }
    }

    pub fn with_exit_info(mut self, info: impl Into<String>) -> Self {
        self.exit_info = Some(info.into());
        self
    }
}

/// Adapter that performs operations against targets
pub trait Provider: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str {
        "provider"
    }

    /// Run the operation. Blocking is fine; the engine calls this off-thread.
    fn execute(&self, request: &ProviderRequest) -> Result<ExecutionResult, ProviderError>;

    /// Called once when a request exceeds its timeout.
    ///
    /// Providers holding external resources (child processes, sessions)
    /// should tear them down here. The default does nothing.
    fn abort(&self, _request: &ProviderRequest) {}
}

/// Provider backed by a closure
pub struct FnProvider<F> {
    name: String,
    func: F,
}

impl<F> FnProvider<F>
where
    F: Fn(&ProviderRequest) -> Result<ExecutionResult, ProviderError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Provider for FnProvider<F>
where
    F: Fn(&ProviderRequest) -> Result<ExecutionResult, ProviderError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, request: &ProviderRequest) -> Result<ExecutionResult, ProviderError> {
        (self.func)(request)
    }
}

/// Execute on a worker thread and give up after `request.timeout`.
///
/// On timeout the worker is detached and [`Provider::abort`] is called. A
/// panic inside the provider is reported as [`ProviderError::Panicked`].
pub fn run_with_timeout(
    provider: Arc<dyn Provider>,
    request: ProviderRequest,
) -> Result<ExecutionResult, ProviderError> {
    let (tx, rx) = mpsc::channel();
    let worker_provider = Arc::clone(&provider);
    let worker_request = request.clone();

    std::thread::Builder::new()
        .name(format!("provider-{}", request.operation_id))
        .spawn(move || {
            let result = worker_provider.execute(&worker_request);
            // Receiver is gone if we already timed out
            let _ = tx.send(result);
        })?;

    match rx.recv_timeout(request.timeout) {
        Ok(result) => {
            debug!(
                provider = provider.name(),
                operation = %request.operation_id,
                ok = result.is_ok(),
                "Provider call finished"
            );
            result
        }
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                provider = provider.name(),
                operation = %request.operation_id,
                target = %request.target_id,
                timeout_ms = request.timeout.as_millis() as u64,
                "Provider timed out"
            );
            provider.abort(&request);
            Err(ProviderError::Timeout {
                after_ms: request.timeout.as_millis() as u64,
            })
        }
        Err(RecvTimeoutError::Disconnected) => {
            warn!(provider = provider.name(), operation = %request.operation_id, "Provider panicked");
            Err(ProviderError::Panicked)
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn request(timeout: Duration) -> ProviderRequest {
        ProviderRequest {
            operation_id: "device.reboot".to_string(),
            target_id: "X".to_string(),
            arguments: Value::Null,
            correlation_id: "c-1".to_string(),
            actor_id: "alice".to_string(),
            timeout,
            expected_sha256: None,
        }
    }

    #[test]
    fn test_fast_provider_returns_result() {
        let provider = Arc::new(FnProvider::new("echo", |req: &ProviderRequest| {
            Ok(ExecutionResult::succeeded(format!("rebooted {}", req.target_id)))
        }));
        let result = run_with_timeout(provider, request(Duration::from_secs(1))).unwrap();
        assert!(result.success);
        assert_eq!(result.raw_output, "rebooted X");
    }

    #[test]
    fn test_slow_provider_times_out_and_is_aborted() {
        struct Slow {
            aborted: AtomicBool,
        }
        impl Provider for Slow {
            fn execute(&self, _: &ProviderRequest) -> Result<ExecutionResult, ProviderError> {
                std::thread::sleep(Duration::from_millis(500));
                Ok(ExecutionResult::succeeded("late"))
            }
            fn abort(&self, _: &ProviderRequest) {
                self.aborted.store(true, Ordering::SeqCst);
            }
        }

        let provider = Arc::new(Slow {
            aborted: AtomicBool::new(false),
        });
        let result = run_with_timeout(provider.clone(), request(Duration::from_millis(30)));
        assert_eq!(result, Err(ProviderError::Timeout { after_ms: 30 }));
        assert!(provider.aborted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_provider_reports_panic() {
        let provider = Arc::new(FnProvider::new("boom", |_: &ProviderRequest| -> Result<ExecutionResult, ProviderError> {
            panic!("device exploded")
        }));
        let result = run_with_timeout(provider, request(Duration::from_secs(1)));
        assert_eq!(result, Err(ProviderError::Panicked));
    }

    #[test]
    fn test_request_serializes_timeout_as_millis() {
        let json = serde_json::to_value(request(Duration::from_millis(1500))).unwrap();
        assert_eq!(json["timeout"], 1500);
        assert_eq!(json["operationId"], "device.reboot");
    }
}
