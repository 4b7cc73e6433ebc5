//! `moat`: credential vault, injecting TLS proxy, and run lifecycle manager
//! for sandboxed coding agents.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::Layer as _;

use moat::backends::{DockerBackend, ExecutionBackend as _};
use moat::config::Config;
use moat::core::attach;
use moat::core::session::RunConfig;
use moat::core::RunManager;
use moat::error::MoatError;
use moat::proxy::daemon::{self, DaemonRequest, DaemonResponse};
use moat::proxy::{CertificateAuthority, InjectionProxy, Registry};
use moat::utils::{self, paths};
use moat::vault::{Credential, Vault};

#[derive(Parser)]
#[command(name = "moat")]
#[command(version)]
#[command(about = "Credential vault and injecting TLS proxy for sandboxed coding agents")]
#[command(long_about = "\
moat grants an agent network access without ever giving it your credentials.

It provides:
  - A credential vault, encrypted at rest
  - A TLS-intercepting proxy that injects credentials into matched requests
  - A run lifecycle manager (create, start, attach, stop, destroy, wait)
  - A hash-chained audit log of every proxied request

A background daemon hosts the proxy and is started automatically the first
time it is needed.")]
#[command(after_long_help = "\
QUICK START:
    moat grant github --token ghp_...
    moat create --workspace . --agent claude-code -- claude
    moat start <run-id>
    moat attach <run-id>

ENVIRONMENT VARIABLES:
    RUST_LOG                Log level filter (default: moat=info)
    MOAT_STATE_ROOT         Root directory for persisted state (default: ~/.moat)
    MOAT_MASTER_KEY         Vault encryption key override (hex or base64)
    MOAT_LOG_FORMAT         Set to 'json' for structured daemon logs
    MOAT_SENTRY_DSN         Sentry DSN for error reporting, if set")]
struct Cli {
    /// Override the state root (default: `~/.moat`).
    #[arg(long, global = true)]
    state_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grant (store) a credential for a provider.
    Grant {
        /// Provider identifier, e.g. "github" or "anthropic".
        provider: String,
        /// The secret token.
        #[arg(long)]
        token: String,
        /// Scopes the token was granted with.
        #[arg(long, value_delimiter = ',')]
        scopes: Vec<String>,
        /// Skip the provider's grant-time validation probe.
        #[arg(long)]
        skip_probe: bool,
    },
    /// Revoke a stored credential.
    Revoke {
        /// Provider identifier.
        provider: String,
    },
    /// List stored credentials (never prints secrets).
    Credentials,
    /// Create a new run in state `Created`.
    Create {
        /// Run name; generated if omitted.
        #[arg(long)]
        name: Option<String>,
        /// Workspace directory, mounted at `/workspace`.
        #[arg(long)]
        workspace: PathBuf,
        /// Agent identifier, recorded for logging.
        #[arg(long)]
        agent: String,
        /// Provider grants this run may use.
        #[arg(long = "grant", value_delimiter = ',')]
        grants: Vec<String>,
        /// Allocate a pseudo-tty for this run.
        #[arg(long)]
        tty: bool,
        /// Whether the run accepts interactive input.
        #[arg(long)]
        interactive: bool,
        /// Keep the container after `Stop`.
        #[arg(long)]
        keep_container: bool,
        /// Command to execute inside the container.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// `Created -> Starting -> Running`.
    Start {
        /// Run id.
        run_id: String,
    },
    /// Stream a running run's stdio until detached.
    Attach {
        /// Run id.
        run_id: String,
    },
    /// `Running -> Stopping -> Stopped`.
    Stop {
        /// Run id.
        run_id: String,
    },
    /// Remove a stopped or failed run's container and private directory.
    Destroy {
        /// Run id.
        run_id: String,
    },
    /// Block until the run reaches a terminal state.
    Wait {
        /// Run id.
        run_id: String,
    },
    /// List known runs.
    Ls,
    /// Audit log operations.
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
    /// Proxy daemon operations.
    Proxy {
        #[command(subcommand)]
        command: ProxyCommands,
    },
}

#[derive(Subcommand)]
enum AuditCommands {
    /// Replay a run's audit log and check the hash chain.
    Verify {
        /// Run id.
        run_id: String,
    },
    /// Export a run's audit log as a portable, independently verifiable bundle.
    Export {
        /// Run id.
        run_id: String,
        /// Output path for the bundle JSON.
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum ProxyCommands {
    /// Run the daemon in the foreground. Normally spawned automatically by
    /// the first command that needs it.
    Serve,
}

fn initialize_cli_logging() {
    let env_filter =
        tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "moat=warn".into()));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(env_filter))
        .init();
}

fn initialize_daemon_logging(state_root: &std::path::Path) -> anyhow::Result<()> {
    let logs_dir = state_root.join("logs");
    std::fs::create_dir_all(&logs_dir)?;

    let cleanup_result = utils::log_cleanup::cleanup_old_logs(&logs_dir, None);

    let timestamp = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S");
    let log_filename = format!("moat.{timestamp}.log");
    let file_appender = tracing_appender::rolling::never(&logs_dir, &log_filename);

    #[cfg(unix)]
    {
        use std::os::unix::fs::symlink;
        let _ = std::fs::remove_file(logs_dir.join("latest.log"));
        let _ = symlink(&log_filename, logs_dir.join("latest.log"));
    }

    let json_format = std::env::var("MOAT_LOG_FORMAT").map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false);
    let rust_log_value = std::env::var("RUST_LOG").unwrap_or_else(|_| "moat=info".into());

    let console_filter = tracing_subscriber::EnvFilter::new(&rust_log_value);
    let file_filter = tracing_subscriber::EnvFilter::new(&rust_log_value);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);

    if json_format {
        tracing_subscriber::registry()
            .with(console_layer.with_filter(console_filter))
            .with(tracing_subscriber::fmt::layer().json().with_writer(file_appender).with_filter(file_filter))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(console_layer.with_filter(console_filter))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_filter(file_filter),
            )
            .init();
    }

    if let Ok(result) = cleanup_result {
        tracing::info!(removed = result.removed, failed = result.failed.len(), "cleaned up old logs");
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "moat daemon starting");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _sentry_guard = std::env::var("MOAT_SENTRY_DSN").ok().filter(|dsn| !dsn.is_empty()).map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: Some(env!("CARGO_PKG_VERSION").into()),
                environment: Some(if cfg!(debug_assertions) { "development" } else { "production" }.into()),
                ..Default::default()
            },
        ))
    });

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(state_root) = cli.state_root.clone() {
        config.state_root = state_root;
    }
    std::fs::create_dir_all(&config.state_root)?;

    let is_daemon = matches!(cli.command, Commands::Proxy { command: ProxyCommands::Serve });
    if is_daemon {
        initialize_daemon_logging(&config.state_root)?;
    } else {
        initialize_cli_logging();
    }

    let exit_code = match run(cli, config).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err}");
            err.downcast_ref::<MoatError>().map_or(1, MoatError::exit_code)
        }
    };

    std::process::exit(exit_code);
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    match cli.command {
        Commands::Grant { provider, token, scopes, skip_probe } => {
            let vault = Vault::open(paths::credentials_dir(&config.state_root))?;
            let credential = Credential {
                provider,
                token,
                scopes,
                expires_at: None,
                created_at: Utc::now(),
                metadata: HashMap::new(),
            };
            vault.grant(credential, !skip_probe).await?;
            println!("granted");
        }
        Commands::Revoke { provider } => {
            let vault = Vault::open(paths::credentials_dir(&config.state_root))?;
            vault.revoke(&provider)?;
            println!("revoked");
        }
        Commands::Credentials => {
            let vault = Vault::open(paths::credentials_dir(&config.state_root))?;
            for credential in vault.list()? {
                let expiry = credential.expires_at.map_or("never".to_string(), |t| t.to_rfc3339());
                println!("{}\texpires={}", credential.provider, expiry);
            }
        }
        Commands::Create { name, workspace, agent, grants, tty, interactive, keep_container, command } => {
            utils::ensure_daemon_running(&config.state_root).await?;
            let run_config = RunConfig {
                name: name.unwrap_or_default(),
                workspace_path: workspace,
                agent,
                grants,
                command,
                env: HashMap::new(),
                interactive,
                tty,
                worktree: None,
                keep_container,
            };
            let response = daemon::request(&config.state_root, &DaemonRequest::CreateRun(run_config)).await?;
            print_run_response(response)?;
        }
        Commands::Start { run_id } => {
            utils::ensure_daemon_running(&config.state_root).await?;
            let response = daemon::request(&config.state_root, &DaemonRequest::StartRun { run_id }).await?;
            print_run_response(response)?;
        }
        Commands::Stop { run_id } => {
            utils::ensure_daemon_running(&config.state_root).await?;
            let response = daemon::request(&config.state_root, &DaemonRequest::StopRun { run_id }).await?;
            print_run_response(response)?;
        }
        Commands::Destroy { run_id } => {
            utils::ensure_daemon_running(&config.state_root).await?;
            let response = daemon::request(&config.state_root, &DaemonRequest::DestroyRun { run_id }).await?;
            if let DaemonResponse::Error { message } = response {
                anyhow::bail!(message);
            }
            println!("destroyed");
        }
        Commands::Wait { run_id } => {
            utils::ensure_daemon_running(&config.state_root).await?;
            loop {
                let response = daemon::request(&config.state_root, &DaemonRequest::GetRun { run_id: run_id.clone() }).await?;
                let DaemonResponse::Run(run) = response else {
                    print_run_response(response)?;
                    break;
                };
                match run.state {
                    moat::core::RunState::Stopped => {
                        println!("stopped exit_code={}", run.exit_code.unwrap_or(0));
                        break;
                    }
                    moat::core::RunState::Failed => {
                        anyhow::bail!(run.error_message.unwrap_or_else(|| "unknown failure".to_string()));
                    }
                    _ => tokio::time::sleep(std::time::Duration::from_millis(500)).await,
                }
            }
        }
        Commands::Attach { run_id } => {
            utils::ensure_daemon_running(&config.state_root).await?;
            let response = daemon::request(&config.state_root, &DaemonRequest::GetRun { run_id }).await?;
            let DaemonResponse::Run(run) = response else {
                return print_run_response(response);
            };
            let Some(container_id) = run.container_id.clone() else {
                anyhow::bail!("run has no container to attach to");
            };
            let backend = DockerBackend::new();
            let handle = attach::attach(&backend.attach_command(&container_id), run.tty).await?;
            tokio::signal::ctrl_c().await?;
            handle.detach();
        }
        Commands::Ls => {
            utils::ensure_daemon_running(&config.state_root).await?;
            let response = daemon::request(&config.state_root, &DaemonRequest::ListRuns).await?;
            let DaemonResponse::Runs(runs) = response else {
                return print_run_response(response);
            };
            for run in runs {
                println!("{}\t{}\t{}", run.id, run.name, run.state);
            }
        }
        Commands::Audit { command } => match command {
            AuditCommands::Verify { run_id } => {
                let audit = moat::audit::AuditLog::open(&paths::run_audit_db_path(&config.state_root, &run_id)).await?;
                let report = audit.verify().await?;
                println!("valid={} count={}", report.valid, report.count);
                if !report.valid {
                    anyhow::bail!("audit chain invalid at seq {:?}", report.first_invalid_seq);
                }
            }
            AuditCommands::Export { run_id, out } => {
                let audit = moat::audit::AuditLog::open(&paths::run_audit_db_path(&config.state_root, &run_id)).await?;
                let bundle = moat::audit::AuditBundle::export(&audit).await?;
                std::fs::write(&out, serde_json::to_vec_pretty(&bundle)?)?;
                println!("exported to {}", out.display());
            }
        },
        Commands::Proxy { command: ProxyCommands::Serve } => {
            run_daemon(&config).await?;
        }
    }

    Ok(())
}

fn print_run_response(response: DaemonResponse) -> anyhow::Result<()> {
    match response {
        DaemonResponse::Run(run) => {
            println!("{}\t{}\t{}", run.id, run.name, run.state);
            Ok(())
        }
        DaemonResponse::Error { message } => anyhow::bail!(message),
        other => {
            println!("{other:?}");
            Ok(())
        }
    }
}

async fn run_daemon(config: &Config) -> anyhow::Result<()> {
    let vault = Arc::new(Vault::open(paths::credentials_dir(&config.state_root))?);
    let registry = Arc::new(Registry::new(config.proxy.idle_timeout()));
    let ca = Arc::new(CertificateAuthority::load_or_generate(&config.state_root.join("proxy"))?);
    let backend = Arc::new(DockerBackend::new());

    let addr: SocketAddr = config.proxy.bind_addr.parse()?;
    let rcgen_authority = ca.to_rcgen_authority()?;
    let proxy = InjectionProxy::new(addr, rcgen_authority, Arc::clone(&registry));
    let proxy_port = proxy.addr().port();

    let (manager, report) = RunManager::new(
        config.state_root.clone(),
        vault,
        Arc::clone(&registry),
        Arc::clone(&ca),
        backend,
        config.runtime.stop_grace(),
        proxy_port,
    )
    .await?;
    if !report.recovered.is_empty() {
        tracing::warn!(recovered = ?report.recovered, orphaned = ?report.orphaned, "reconciled runs interrupted by a crash");
    }
    let manager = Arc::new(manager);

    let proxy_task = tokio::spawn(proxy.run());
    let control_task = daemon::serve(&config.state_root, proxy_port, manager);

    tokio::select! {
        result = proxy_task => { result??; }
        result = control_task => { result?; }
    }

    Ok(())
}
