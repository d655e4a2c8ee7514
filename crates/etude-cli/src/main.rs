use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use etude_auth::AuthConfig;
use etude_core::{LogFormat, Server, ServerConfig};
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "etude")]
#[command(about = "Event-driven HTTP/1.1 static file server")]
#[command(version)]
struct Cli {
    /// Address to bind (e.g. 0.0.0.0)
    addr: String,
    /// Port to listen on
    port: u16,
    /// Document root (overrides ETUDE_DOC_ROOT)
    #[arg(long)]
    root: Option<PathBuf>,
    /// Worker threads (overrides ETUDE_WORKERS)
    #[arg(long)]
    workers: Option<usize>,
    /// Idle timeout in ticks (overrides ETUDE_IDLE_TIMEOUT)
    #[arg(long)]
    idle_timeout: Option<u64>,
    /// Credential file (overrides ETUDE_STORE_PATH)
    #[arg(long)]
    store: Option<PathBuf>,
    /// Log output: compact, pretty or json
    #[arg(long, default_value = "compact")]
    log_format: LogFormat,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version are not failures.
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if let Err(e) = etude_core::logging::init(cli.log_format) {
        eprintln!("etude: {e}");
        return ExitCode::from(1);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{e:#}"), "etude failed");
            ExitCode::from(1)
        }
    }
}

fn server_config(cli: &Cli) -> anyhow::Result<ServerConfig> {
    let mut config = ServerConfig::from_env().context("loading server configuration")?;
    if let Some(root) = &cli.root {
        config.doc_root = root.clone();
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(ticks) = cli.idle_timeout {
        config.idle_timeout = ticks;
    }
    config.validate().context("invalid command-line override")?;
    Ok(config)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = server_config(&cli)?;

    let mut auth = AuthConfig::from_env().context("loading credential configuration")?;
    if let Some(store) = &cli.store {
        auth.store_path = store.clone();
    }
    let credentials = etude_auth::open(&auth)
        .with_context(|| format!("opening credential store {}", auth.store_path.display()))?;

    let stats = Server::new(config)
        .credentials(credentials)
        .serve(&cli.addr, cli.port)
        .with_context(|| format!("serving on {}:{}", cli.addr, cli.port))?;

    info!(
        requests = stats.requests,
        bytes_sent = stats.bytes_sent,
        "shutdown complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_address_and_port() {
        let cli = Cli::try_parse_from(["etude", "0.0.0.0", "9006"]).unwrap();
        assert_eq!(cli.addr, "0.0.0.0");
        assert_eq!(cli.port, 9006);
        assert_eq!(cli.log_format, LogFormat::Compact);
        assert!(cli.root.is_none());
    }

    #[test]
    fn overrides() {
        let cli = Cli::try_parse_from([
            "etude",
            "127.0.0.1",
            "8080",
            "--root",
            "/srv/www",
            "--workers",
            "4",
            "--idle-timeout",
            "30",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.root, Some(PathBuf::from("/srv/www")));
        assert_eq!(cli.workers, Some(4));
        assert_eq!(cli.idle_timeout, Some(30));
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn missing_or_bad_arguments() {
        assert!(Cli::try_parse_from(["etude", "0.0.0.0"]).is_err());
        assert!(Cli::try_parse_from(["etude", "0.0.0.0", "http"]).is_err());
        let help = Cli::try_parse_from(["etude", "--help"]).unwrap_err();
        assert!(!help.use_stderr());
    }
}
