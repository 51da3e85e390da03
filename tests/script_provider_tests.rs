//! Tests for the bash script provider
//!
//! These tests verify:
//! - Request fields and arguments reach the script through the environment
//! - Exit codes map to success and failure
//! - Pinned scripts only run when their SHA-256 matches
//! - A reloaded catalog's pins are what the next execution enforces
//! - Scripts larger than a single exec argument still run
//! - A timed-out script's whole process group is killed

use opgate::audit::{AuditEntry, AuditError, AuditRecord, AuditTrail, GENESIS_HASH};
use opgate::catalog::{OperationCatalog, OperationSpec};
use opgate::engine::{Engine, OperationRequest};
use opgate::envelope::OperationStatus;
use opgate::process_guard::is_process_alive;
use opgate::provider::{Provider, ProviderError, ProviderRequest};
use opgate::script_provider::ScriptProvider;
use opgate::types::{Actor, Role};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Default)]
struct MemoryAudit {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditTrail for MemoryAudit {
    fn append(&self, record: AuditRecord) -> Result<AuditEntry, AuditError> {
        let mut entries = self.entries.lock().unwrap();
        let previous = entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let entry = AuditEntry::seal(entries.len() as u64 + 1, chrono::Utc::now(), previous, record).unwrap();
        entries.push(entry.clone());
        Ok(entry)
    }
}

fn write_script(dir: &Path, operation: &str, body: &str) {
    fs::write(dir.join(format!("{}.sh", operation)), format!("#!/bin/bash\n{}\n", body)).unwrap();
}

fn request(operation: &str) -> ProviderRequest {
    ProviderRequest {
        operation_id: operation.to_string(),
        target_id: "host-7".to_string(),
        arguments: json!({"method": "quick", "passes": 3}),
        correlation_id: "corr-1".to_string(),
        actor_id: "alice".to_string(),
        timeout: Duration::from_secs(10),
        expected_sha256: None,
    }
}

fn pinned_request(operation: &str, digest: &str) -> ProviderRequest {
    ProviderRequest {
        expected_sha256: Some(digest.to_string()),
        ..request(operation)
    }
}

#[test]
fn test_script_sees_request_environment() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        "disk.wipe",
        r#"echo "$OPGATE_OPERATION $OPGATE_TARGET $OPGATE_ACTOR $OPGATE_CORRELATION_ID $OPGATE_ARG_METHOD $OPGATE_ARG_PASSES""#,
    );
    let provider = ScriptProvider::new(dir.path());

    let result = provider.execute(&request("disk.wipe")).unwrap();
    assert!(result.success);
    assert_eq!(result.raw_output.trim(), "disk.wipe host-7 alice corr-1 quick 3");
    assert_eq!(result.exit_info.as_deref(), Some("exit code 0"));
}

#[test]
fn test_nonzero_exit_is_failure_with_stderr() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "device.reboot", "echo starting\necho 'device busy' >&2\nexit 4");
    let provider = ScriptProvider::new(dir.path());

    let result = provider.execute(&request("device.reboot")).unwrap();
    assert!(!result.success);
    assert!(result.raw_output.contains("starting"));
    assert!(result.raw_output.contains("device busy"));
    assert_eq!(result.exit_info.as_deref(), Some("exit code 4"));
}

#[test]
fn test_script_stdin_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "device.reboot", "if read -r line; then echo \"got $line\"; else echo eof; fi");
    let provider = ScriptProvider::new(dir.path());

    let result = provider.execute(&request("device.reboot")).unwrap();
    assert!(result.success);
    assert_eq!(result.raw_output.trim(), "eof");
}

#[test]
fn test_script_larger_than_arg_limit_runs() {
    let dir = tempfile::tempdir().unwrap();
    // Well past the 128 KiB per-argument exec limit
    let mut body = "# padding line for a long provisioning script\n".repeat(6000);
    body.push_str("echo \"done $OPGATE_TARGET from $0\"\nexit 0");
    write_script(dir.path(), "firmware.flash", &body);
    let script = dir.path().join("firmware.flash.sh");
    assert!(fs::metadata(&script).unwrap().len() > 256 * 1024);
    let provider = ScriptProvider::new(dir.path()).require_pins(true);

    let result = provider
        .execute(&pinned_request("firmware.flash", &digest_of(&script)))
        .unwrap();
    assert!(result.success, "output: {}", result.raw_output);
    assert_eq!(
        result.raw_output.trim(),
        format!("done host-7 from {}", script.display())
    );
}

#[test]
fn test_script_with_nul_byte_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("device.reboot.sh"), b"echo a\0echo b\n").unwrap();
    let provider = ScriptProvider::new(dir.path());
    match provider.execute(&request("device.reboot")) {
        Err(ProviderError::Unavailable { reason }) => assert!(reason.contains("NUL")),
        other => panic!("expected the script to be refused, got {:?}", other),
    }
}

#[test]
fn test_unknown_script_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptProvider::new(dir.path());
    assert!(matches!(
        provider.execute(&request("device.reboot")),
        Err(ProviderError::Unavailable { .. })
    ));
}

// =============================================================================
// Script Pinning
// =============================================================================

fn digest_of(path: &Path) -> String {
    hex::encode(Sha256::digest(fs::read(path).unwrap()))
}

#[test]
fn test_pinned_script_with_matching_hash_runs() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "device.reboot", "echo rebooting $OPGATE_TARGET");
    let digest = digest_of(&dir.path().join("device.reboot.sh"));
    let provider = ScriptProvider::new(dir.path()).require_pins(true);

    let result = provider
        .execute(&pinned_request("device.reboot", &digest.to_ascii_uppercase()))
        .unwrap();
    assert!(result.success);
    assert_eq!(result.raw_output.trim(), "rebooting host-7");
}

#[test]
fn test_modified_script_is_blocked() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    write_script(dir.path(), "disk.wipe", &format!("touch {}", marker.display()));
    let digest = digest_of(&dir.path().join("disk.wipe.sh"));
    let provider = ScriptProvider::new(dir.path());

    // Tamper after pinning
    write_script(dir.path(), "disk.wipe", &format!("touch {}\necho extra", marker.display()));
    match provider.execute(&pinned_request("disk.wipe", &digest)) {
        Err(ProviderError::Unavailable { reason }) => assert!(reason.contains("hash mismatch")),
        other => panic!("expected a hash mismatch, got {:?}", other),
    }
    assert!(!marker.exists());
}

#[test]
fn test_unpinned_script_blocked_when_pins_required() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "device.reboot", "echo ok");

    let strict = ScriptProvider::new(dir.path()).require_pins(true);
    assert!(matches!(
        strict.execute(&request("device.reboot")),
        Err(ProviderError::Unavailable { .. })
    ));

    let lenient = ScriptProvider::new(dir.path());
    assert!(lenient.execute(&request("device.reboot")).unwrap().success);
}

#[test]
fn test_catalog_pins_gate_engine_execution() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "device.reboot", "echo ok");
    let catalog = OperationCatalog::from_specs([OperationSpec::builder("device.reboot")
        .allow(Role::Admin)
        .script_sha256("0".repeat(64))
        .build()
        .unwrap()])
    .unwrap();
    let provider = Arc::new(ScriptProvider::new(dir.path()));
    let engine = Engine::builder(catalog, Arc::new(MemoryAudit::default()), provider)
        .without_maintenance()
        .build();

    let envelope = engine
        .submit(OperationRequest::new("device.reboot", "board", Actor::new("a", Role::Admin)))
        .unwrap();
    assert_eq!(envelope.status(), OperationStatus::Failure);
    assert!(engine.locks().holder("board").is_none());
}

fn write_pinned_record(dir: &Path, operation: &str, digest: &str) {
    fs::write(
        dir.join(format!("{}.json", operation)),
        format!(
            r#"{{"id": "{}", "allowedRoles": ["admin"], "scriptSha256": "{}"}}"#,
            operation, digest
        ),
    )
    .unwrap();
}

#[test]
fn test_reloaded_catalog_pins_are_enforced() {
    let scripts = tempfile::tempdir().unwrap();
    let records = tempfile::tempdir().unwrap();
    let script = scripts.path().join("device.reboot.sh");

    write_script(scripts.path(), "device.reboot", "echo v1");
    let v1 = digest_of(&script);
    write_pinned_record(records.path(), "device.reboot", &v1);
    let load = OperationCatalog::load_from_directory(records.path()).unwrap();
    let provider = Arc::new(ScriptProvider::new(scripts.path()).require_pins(true));
    let engine = Engine::builder(load.catalog, Arc::new(MemoryAudit::default()), provider)
        .without_maintenance()
        .build();
    let submit = |engine: &Engine| {
        engine
            .submit(OperationRequest::new("device.reboot", "board", Actor::new("a", Role::Admin)))
            .unwrap()
    };
    assert_eq!(submit(&engine).status(), OperationStatus::Success);

    // New script, re-pinned in the catalog and reloaded
    write_script(scripts.path(), "device.reboot", "echo v2");
    let v2 = digest_of(&script);
    assert_ne!(v1, v2);
    write_pinned_record(records.path(), "device.reboot", &v2);
    assert!(engine.reload_catalog(records.path()).unwrap().is_empty());

    let envelope = submit(&engine);
    assert_eq!(envelope.status(), OperationStatus::Success);

    // Rolling the script back without re-pinning is now blocked
    write_script(scripts.path(), "device.reboot", "echo v1");
    assert_eq!(submit(&engine).status(), OperationStatus::Failure);
    assert!(engine.locks().holder("board").is_none());
}

#[test]
fn test_timed_out_script_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("sleeper.pid");
    write_script(
        dir.path(),
        "firmware.flash",
        &format!("sleep 30 &\necho $! > {}\nwait", pid_file.display()),
    );

    let catalog = OperationCatalog::from_specs([OperationSpec::builder("firmware.flash")
        .allow(Role::Admin)
        .timeout_ms(300)
        .build()
        .unwrap()])
    .unwrap();
    let provider =
        Arc::new(ScriptProvider::new(dir.path()).with_grace_period(Duration::from_millis(200)));
    let engine = Engine::builder(catalog, Arc::new(MemoryAudit::default()), provider)
        .without_maintenance()
        .build();

    let envelope = engine
        .submit(OperationRequest::new("firmware.flash", "board", Actor::new("a", Role::Admin)))
        .unwrap();
    assert_eq!(envelope.status(), OperationStatus::Failure);
    assert_eq!(envelope.data["failureReason"], "ProviderTimeout");
    assert!(engine.locks().holder("board").is_none());

    let pid: u32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while is_process_alive(pid) {
        assert!(Instant::now() < deadline, "background sleep {} survived the timeout", pid);
        thread::sleep(Duration::from_millis(20));
    }
}
