//! `flowd`: a declarative, configuration-driven MQTT message-processing fabric.
//!
//! Reads a YAML flow configuration, builds every client/rule/task/pool/queue
//! it describes, and runs until a shutdown signal arrives.

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{error, info};

mod client;
mod config_loader;
mod context;
mod executor;
mod orchestrator;
mod persistence;
mod pool;
mod queue;
mod rule;
mod task;

use orchestrator::Orchestrator;
use shared::config::LoggingConfig;

/// Command-line arguments for the flow engine.
#[derive(Parser, Debug)]
#[command(name = "flowd")]
#[command(about = "Declarative MQTT message-processing fabric: clients, rules, tasks, and durable store-and-forward")]
struct CliArgs {
    /// Path to the flow configuration YAML file.
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// `!VAR` substitution in `KEY=VALUE` form; may be repeated.
    #[arg(long = "var", value_name = "KEY=VALUE")]
    vars: Vec<String>,
}

fn parse_vars(raw: &[String]) -> anyhow::Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("--var entries must be KEY=VALUE, got '{entry}'"))?;
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Build the fallback `EnvFilter` directive string from the configuration
/// record's `logging` block: `default_level` sets the global floor,
/// and each `loggers` entry adds a per-module override. Only used when
/// `RUST_LOG` is not set — the environment variable always wins.
fn logging_directives(logging: &LoggingConfig) -> String {
    let mut directives = logging.default_level.clone();
    for (module, logger) in &logging.loggers {
        directives.push_str(&format!(",{module}={}", logger.level));
    }
    directives
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        info!("received Ctrl+C");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli_args = CliArgs::parse();

    let vars = parse_vars(&cli_args.vars)?;
    let config = match config_loader::load(&cli_args.config_file, &vars) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load flow configuration from {}: {e}", cli_args.config_file.display());
            std::process::exit(1);
        }
    };

    let file_appender = tracing_appender::rolling::daily("./logs", "flowd.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(logging_directives(&config.logging)));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    info!(config_file = %cli_args.config_file.display(), "flowd starting up");

    info!(
        clients = config.mqtt_clients.len(),
        rules = config.rules.len(),
        tasks_queues = config.tasks_queues.len(),
        "configuration loaded"
    );

    let orchestrator = match Orchestrator::build(config).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %e, "failed to build flow orchestrator");
            std::process::exit(1);
        }
    };

    info!(clients = orchestrator.clients().len(), "flow orchestrator running");

    shutdown_signal().await;
    info!("shutdown signal received, stopping orchestrator");
    orchestrator.stop().await;
    info!("flowd shutdown complete");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_vars_splits_key_value_pairs() {
        let vars = parse_vars(&["HOST=broker.local".to_string(), "PORT=1883".to_string()]).unwrap();
        assert_eq!(vars.get("HOST"), Some(&"broker.local".to_string()));
        assert_eq!(vars.get("PORT"), Some(&"1883".to_string()));
    }

    #[test]
    fn parse_vars_rejects_entries_without_equals() {
        assert!(parse_vars(&["NOEQUALS".to_string()]).is_err());
    }

    #[test]
    fn logging_directives_combines_default_and_per_module_levels() {
        let mut loggers = HashMap::new();
        loggers.insert("rumqttc".to_string(), shared::config::LoggerConfig { level: "warn".to_string() });
        let logging = LoggingConfig { default_level: "info".to_string(), loggers };
        let directives = logging_directives(&logging);
        assert!(directives.starts_with("info"));
        assert!(directives.contains("rumqttc=warn"));
    }
}
