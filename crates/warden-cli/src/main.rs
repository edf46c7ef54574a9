//! MCP Warden CLI - security inspection gateway for the Model Context Protocol.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use warden_catalog::{Catalog, CatalogOptions};
use warden_core::Warden;
use warden_gateway::{
    AuditSink, Gateway, GatewayConfig, GatewaySettings, JsonlWriter, StdioUpstream, TracingWriter,
    UpstreamFile, UpstreamHandle,
};

/// Exit codes: 0 normal, 2 configuration error, 3 unrecoverable runtime
/// error, 130 interrupted.
const EXIT_CONFIG: u8 = 2;
const EXIT_RUNTIME: u8 = 3;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "MCP Warden - Security inspection gateway for the Model Context Protocol")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Start the gateway on stdio
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "config/warden.toml")]
        config: String,
    },
    /// Check configuration and technique descriptors
    Check {
        /// Configuration file path
        #[arg(short, long, default_value = "config/warden.toml")]
        config: String,
    },
    /// Show gateway configuration summary
    Status {
        /// Configuration file path
        #[arg(short, long, default_value = "config/warden.toml")]
        config: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(Commands::Start { config }) => run_start(&config),
        Some(Commands::Check { config }) => run_check(&config),
        Some(Commands::Status { config }) => run_status(&config),
        None => {
            println!("MCP Warden v{} - Use --help for commands", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
    }
}

fn load_settings(path: &str) -> Result<GatewaySettings, warden_gateway::GatewayError> {
    if Path::new(path).is_file() {
        GatewaySettings::load(path)
    } else {
        warn!(path, "config file not found; using defaults and environment");
        GatewaySettings::from_env()
    }
}

fn run_start(config_path: &str) -> ExitCode {
    let settings = match load_settings(config_path) {
        Ok(settings) => settings,
        Err(err) => {
            error!("configuration error: {}", err);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to start runtime: {}", err);
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    runtime.block_on(async move {
        let warden = match Warden::load(&settings.techniques_dir, settings.core.clone()) {
            Ok(warden) => Arc::new(warden),
            Err(err) => {
                error!("failed to load technique catalogue: {}", err);
                return ExitCode::from(EXIT_CONFIG);
            }
        };

        let writer: Box<dyn warden_gateway::AuditWriter> = match &settings.audit_log {
            Some(path) => match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => Box::new(JsonlWriter::new(file)),
                Err(err) => {
                    error!(path = %path.display(), "cannot open audit log: {}", err);
                    return ExitCode::from(EXIT_CONFIG);
                }
            },
            None => Box::new(TracingWriter),
        };
        let audit = AuditSink::new(settings.audit_queue_size, writer);

        let gateway_config = GatewayConfig {
            upstream_timeout: settings.upstream_timeout(),
            ..Default::default()
        };
        let gateway = Arc::new(Gateway::new(warden, gateway_config, audit));

        if let Err(err) = start_upstreams(&gateway, &settings).await {
            error!("failed to start upstream servers: {}", err);
            return ExitCode::from(EXIT_RUNTIME);
        }

        // Periodic sweep of idle sessions.
        {
            let warden = gateway.warden().clone();
            let period = settings.core.session_inactivity().max(std::time::Duration::from_secs(60));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    let evicted = warden.expire_idle_sessions();
                    if evicted > 0 {
                        info!(evicted, "idle sessions evicted");
                    }
                }
            });
        }

        info!(
            session = gateway.session_id(),
            "MCP Warden gateway ready on stdio"
        );

        let stdin = tokio::io::stdin();
        let stdout = tokio::io::stdout();
        let serving = gateway.clone().serve(stdin, stdout);

        tokio::select! {
            result = serving => match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    error!("gateway failed: {}", err);
                    ExitCode::from(EXIT_RUNTIME)
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; draining");
                gateway.drain().await;
                ExitCode::from(EXIT_INTERRUPTED)
            }
        }
    })
}

async fn start_upstreams(gateway: &Arc<Gateway>, settings: &GatewaySettings) -> anyhow::Result<()> {
    use anyhow::Context;

    if !settings.servers_file.is_file() {
        warn!(
            path = %settings.servers_file.display(),
            "no upstream configuration; gateway starts with an empty tool table"
        );
        return Ok(());
    }

    let raw = std::fs::read_to_string(&settings.servers_file)
        .with_context(|| format!("cannot read {}", settings.servers_file.display()))?;
    let file: UpstreamFile = serde_json::from_str(&raw)
        .with_context(|| format!("invalid {}", settings.servers_file.display()))?;

    for (index, config) in file.servers.iter().enumerate() {
        if !config.enabled {
            info!(server = %config.name, "upstream disabled, skipping");
            continue;
        }
        match StdioUpstream::spawn(config) {
            Ok(upstream) => match upstream.initialize(settings.upstream_timeout()).await {
                Ok(init_result) => {
                    let capabilities = init_result
                        .get("capabilities")
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    let handle = Arc::new(UpstreamHandle::new(
                        format!("upstream-{}", index),
                        config.name.clone(),
                        upstream,
                        capabilities,
                    ));
                    if let Err(err) = gateway.attach_upstream(handle).await {
                        warn!(server = %config.name, "tool discovery failed: {}", err);
                    }
                }
                Err(err) => warn!(server = %config.name, "initialize failed: {}", err),
            },
            Err(err) => warn!(server = %config.name, "spawn failed: {}", err),
        }
    }
    Ok(())
}

fn run_check(config_path: &str) -> ExitCode {
    let settings = match load_settings(config_path) {
        Ok(settings) => settings,
        Err(err) => {
            error!("configuration error: {}", err);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let options = CatalogOptions {
        strict: settings.core.strict_catalog,
        mitigations_path: None,
    };
    match Catalog::load(&settings.techniques_dir, options) {
        Ok(catalog) => {
            let snapshot = catalog.snapshot();
            println!(
                "Configuration OK: {} technique(s) loaded, {} rejected",
                snapshot.len(),
                snapshot.rejected().len()
            );
            for rejected in snapshot.rejected() {
                println!("  rejected {}: {}", rejected.path.display(), rejected.reason);
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("catalogue check failed: {}", err);
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

fn run_status(config_path: &str) -> ExitCode {
    match load_settings(config_path) {
        Ok(settings) => {
            println!("MCP Warden v{}", env!("CARGO_PKG_VERSION"));
            println!("  combiner:        {:?}", settings.core.combiner);
            println!("  block threshold: {}", settings.core.block_threshold);
            println!("  warn threshold:  {}", settings.core.warn_threshold);
            println!("  budget:          {}ms", settings.core.inspection_budget_ms);
            println!("  techniques dir:  {}", settings.techniques_dir.display());
            println!("  servers file:    {}", settings.servers_file.display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("configuration error: {}", err);
            ExitCode::from(EXIT_CONFIG)
        }
    }
}
