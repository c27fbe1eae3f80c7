//! Terminal Agent CLI
//!
//! Serves the terminal tool as JSON lines on stdin/stdout.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use terminal_agent_lib::{
    DockerSandbox, LocalSandbox, Sandbox, TerminalAgentServer, TerminalConfig, TerminalManager,
    TerminalToolHandler,
};
use tracing_subscriber::EnvFilter;

/// Terminal Agent CLI - persistent shell sessions for agents
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scope (conversation or chat id) the sessions belong to
    #[arg(short, long)]
    scope: Option<String>,

    /// Configuration file (.toml, .json, .yaml or .yml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Run commands in this Docker container instead of on the host
    #[arg(long, value_name = "CONTAINER")]
    docker: Option<String>,

    /// Write live output lines while commands run
    #[arg(long)]
    stream: bool,
}

fn load_config(path: &Path) -> Result<TerminalConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    let config = match extension.as_deref() {
        Some("toml") => toml::from_str(&text)
            .with_context(|| format!("Invalid TOML in {}", path.display()))?,
        Some("json") => TerminalConfig::from_json(&text)
            .with_context(|| format!("Invalid JSON in {}", path.display()))?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&text)
            .with_context(|| format!("Invalid YAML in {}", path.display()))?,
        _ => bail!(
            "Unsupported config format for {} (expected .toml, .json, .yaml or .yml)",
            path.display()
        ),
    };
    Ok(config)
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::new(level);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_sandbox(docker: Option<&str>) -> Result<Arc<dyn Sandbox>> {
    match docker {
        Some(container) => {
            let sandbox = DockerSandbox::new(container);
            let status = sandbox.check_docker().await;
            if !status.available {
                bail!(
                    "Docker is not available: {}",
                    status.error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
            if !sandbox.is_container_running().await {
                bail!("Container {} is not running", container);
            }
            tracing::info!(
                "Using Docker container {} ({})",
                container,
                status.version.unwrap_or_default()
            );
            Ok(Arc::new(sandbox))
        }
        None => Ok(Arc::new(LocalSandbox::new())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => TerminalConfig::default(),
    };
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.log_level, cli.log_json);

    let scope = cli
        .scope
        .clone()
        .unwrap_or_else(|| ulid::Ulid::new().to_string().to_lowercase());
    let sandbox = build_sandbox(cli.docker.as_deref()).await?;
    let manager = TerminalManager::new(scope.clone(), sandbox, config)
        .context("Failed to create terminal manager")?;
    tracing::info!("Serving terminal sessions for scope {}", scope);

    let server =
        TerminalAgentServer::new(TerminalToolHandler::new(manager)).with_streaming(cli.stream);
    server.start_with_shutdown().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::parse_from([
            "terminal-agent",
            "--scope",
            "chat-7",
            "--docker",
            "sandbox",
            "--stream",
            "--log-json",
        ]);
        assert_eq!(cli.scope.as_deref(), Some("chat-7"));
        assert_eq!(cli.docker.as_deref(), Some("sandbox"));
        assert!(cli.stream);
        assert!(cli.log_json);
        assert!(cli.config.is_none());
    }

    fn write_config(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_toml_config() {
        let file = write_config(
            ".toml",
            "session_prefix = \"agent\"\n\n[polling]\nbatch_interval_ms = 200\n",
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.session_prefix, "agent");
        assert_eq!(config.polling.batch_interval_ms, 200);
        assert_eq!(config.polling.stream_interval_ms, 100);
    }

    #[test]
    fn test_load_yaml_config() {
        let file = write_config(".yaml", "limits:\n  max_timeout_secs: 120\n");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.limits.max_timeout_secs, 120);
    }

    #[test]
    fn test_load_json_config_with_file_store() {
        let file = write_config(".json", r#"{"state": {"store": "file", "dir": "/tmp/ta-state"}}"#);
        let config = load_config(file.path()).unwrap();
        assert_eq!(
            config.state,
            terminal_agent_lib::config::StateStoreConfig::File {
                dir: PathBuf::from("/tmp/ta-state")
            }
        );
    }

    #[test]
    fn test_unknown_config_extension() {
        let file = write_config(".ini", "x=1");
        assert!(load_config(file.path()).is_err());
    }
}
