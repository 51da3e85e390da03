//! opgate - command-line entry point
//!
//! Envelopes and reports go to stdout as pretty JSON; logs go to stderr.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use opgate::audit::{AuditCipher, AuditFilter, SegmentId, ShadowAuditLog};
use opgate::catalog::OperationCatalog;
use opgate::cli::{AuditCommands, CallerArgs, CatalogCommands, Cli, Commands};
use opgate::config::EngineConfig;
use opgate::engine::{Engine, OperationRequest};
use opgate::envelope::Envelope;
use opgate::error::EngineError;
use opgate::process_guard::{self, ProcessGuard};
use opgate::provider::{FnProvider, Provider, ProviderError, ProviderRequest};
use opgate::script_provider::ScriptProvider;
use opgate::types::Actor;
use opgate::workflow::{Workflow, WorkflowContext};

/// Time child scripts get between SIGTERM and SIGKILL on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Initialize tracing; `RUST_LOG` overrides the default `info` level
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref())?;
    // Child scripts die with us whichever way we leave
    let _guard = ProcessGuard::new(SHUTDOWN_GRACE);

    match cli.command {
        Commands::Validate { file } => {
            let config = EngineConfig::load_from_file(&file)?;
            config.validate()?;
            info!("Configuration validation successful");
            println!("✓ Configuration file is valid: {}", file.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Catalog { action } => run_catalog(&config, action),
        Commands::Audit { action } => run_audit(&config, action),
        Commands::Run {
            op,
            target,
            caller,
            args,
            confirm,
            simulate,
            wait_ms,
        } => {
            let engine = start_engine(&config)?;
            let mut request = OperationRequest::new(op, target, actor(&caller));
            if !args.is_empty() {
                request = request.with_arguments(Value::Object(args.into_iter().collect::<Map<_, _>>()));
            }
            for capability in caller.capabilities {
                request = request.with_capability(capability);
            }
            if let Some(token) = confirm {
                request = request.with_confirmation(token);
            }
            if simulate {
                request = request.simulate();
            }
            if let Some(ms) = wait_ms {
                request = request.with_lock_wait(Duration::from_millis(ms));
            }

            match engine.submit(request) {
                Ok(envelope) => {
                    print_json(&envelope)?;
                    Ok(envelope_exit(&envelope))
                }
                Err(EngineError::LockConflict(conflict)) => {
                    warn!("{}", conflict);
                    eprintln!("✗ {}", conflict);
                    Ok(ExitCode::from(3))
                }
                Err(e) => Err(e.into()),
            }
        }
        Commands::Workflow {
            file,
            caller,
            target,
            confirmations,
            simulate,
        } => {
            let workflow = Workflow::from_file(&file)?;
            let engine = start_engine(&config)?;
            let mut context = WorkflowContext::new(actor(&caller));
            if let Some(target) = target {
                context = context.with_target(target);
            }
            for capability in caller.capabilities {
                context = context.with_capability(capability);
            }
            for (step, token) in confirmations {
                context = context.with_confirmation(step, token);
            }
            if simulate {
                context = context.simulate();
            }

            let run = engine.execute_workflow(&workflow, &context);
            let envelope = run.envelope(context.mode);
            print_json(&envelope)?;
            Ok(envelope_exit(&envelope))
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            EngineConfig::load_from_file(path)?
        }
        None => {
            debug!("No configuration file given, using defaults");
            EngineConfig::default()
        }
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn actor(caller: &CallerArgs) -> Actor {
    Actor::new(caller.actor.clone(), caller.role)
}

fn open_audit(config: &EngineConfig) -> Result<ShadowAuditLog> {
    let cipher = AuditCipher::load_or_create(&config.audit.key_file).with_context(|| {
        format!(
            "Failed to load audit key from {}",
            config.audit.key_file.display()
        )
    })?;
    let log = ShadowAuditLog::open(config.audit_settings(), cipher)
        .with_context(|| format!("Failed to open audit log in {}", config.audit.dir.display()))?;
    Ok(log)
}

fn start_engine(config: &EngineConfig) -> Result<Arc<Engine>> {
    let load = OperationCatalog::load_from_directory(&config.catalog_dir).with_context(|| {
        format!("Failed to load catalog from {}", config.catalog_dir.display())
    })?;
    for rejected in &load.rejected {
        warn!(
            source = %rejected.source.display(),
            id = rejected.id.as_deref().unwrap_or("-"),
            "Rejected catalog record: {}", rejected.reason
        );
    }

    let audit = Arc::new(open_audit(config)?);
    let provider: Arc<dyn Provider> = match &config.provider.scripts_dir {
        Some(dir) => Arc::new(
            ScriptProvider::new(dir)
                .with_grace_period(SHUTDOWN_GRACE)
                .require_pins(config.provider.require_pinned_scripts),
        ),
        None => {
            warn!("No provider.scriptsDir configured; executions will fail as unavailable");
            Arc::new(FnProvider::new("unconfigured", |_: &ProviderRequest| {
                Err(ProviderError::Unavailable {
                    reason: "no scripts directory configured".to_string(),
                })
            }))
        }
    };

    let engine = Arc::new(
        Engine::builder(load.catalog, audit, provider)
            .settings(config.engine_settings())
            .build(),
    );

    let cancel_target = Arc::downgrade(&engine);
    if let Err(e) = process_guard::init_signal_handlers(
        move || {
            if let Some(engine) = cancel_target.upgrade() {
                engine.cancel_all();
            }
        },
        SHUTDOWN_GRACE,
    ) {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    Ok(engine)
}

fn run_catalog(config: &EngineConfig, action: CatalogCommands) -> Result<ExitCode> {
    match action {
        CatalogCommands::List { role } => {
            let load = OperationCatalog::load_from_directory(&config.catalog_dir)
                .with_context(|| format!("Failed to load catalog from {}", config.catalog_dir.display()))?;
            let audit = Arc::new(open_audit(config)?);
            let provider: Arc<dyn Provider> = Arc::new(FnProvider::new("inspect", |_: &ProviderRequest| {
                Err(ProviderError::Unavailable {
                    reason: "inspection only".to_string(),
                })
            }));
            let engine = Engine::builder(load.catalog, audit, provider)
                .settings(config.engine_settings())
                .without_maintenance()
                .build();
            print_json(&engine.inspect_catalog(role))?;
            Ok(ExitCode::SUCCESS)
        }
        CatalogCommands::Validate { dir } => {
            let load = OperationCatalog::load_from_directory(&dir)
                .with_context(|| format!("Failed to load catalog from {}", dir.display()))?;
            let report = serde_json::json!({
                "directory": dir,
                "operations": load.catalog.len(),
                "rejected": load.rejected,
            });
            print_json(&report)?;
            if load.rejected.is_empty() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(1))
            }
        }
    }
}

fn run_audit(config: &EngineConfig, action: AuditCommands) -> Result<ExitCode> {
    let log = open_audit(config)?;
    match action {
        AuditCommands::Verify { segment } => {
            let results = match segment {
                Some(name) => {
                    let id: SegmentId = name
                        .parse()
                        .with_context(|| format!("Invalid segment name '{}'", name))?;
                    vec![log.verify_chain(id)?]
                }
                None => log.verify_all()?,
            };
            print_json(&results)?;
            if results.iter().all(|r| r.valid) {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(1))
            }
        }
        AuditCommands::Read {
            correlation,
            actor,
            operation,
            target,
        } => {
            let mut filter = AuditFilter::new();
            if let Some(id) = correlation {
                filter = filter.correlation(id);
            }
            if let Some(id) = actor {
                filter = filter.actor(id);
            }
            if let Some(id) = operation {
                filter = filter.operation(id);
            }
            if let Some(id) = target {
                filter = filter.target(id);
            }
            print_json(&log.read(&filter)?)?;
            Ok(ExitCode::SUCCESS)
        }
        AuditCommands::Retain => {
            print_json(&log.apply_retention(SystemTime::now())?)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn envelope_exit(envelope: &Envelope) -> ExitCode {
    if envelope.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}
