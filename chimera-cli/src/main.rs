use anyhow::{bail, Context, Result};
use chimera_core::{
    config::Config,
    core_backend::SimulatedBackend,
    core_session::{FileStorage, Navigator, SessionFlags},
    logging::{init_logging_with_config, LogConfig, LogLevel},
    shutdown::{install_signal_handlers, ShutdownCoordinator},
    ChimeraClient, RealtimeContext,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Exit code used when another client ended the session during `watch`
const EXIT_SESSION_INVALIDATED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "chimera")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; `CHIMERA_*` variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and store the session for every client on this machine
    Login {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
    },
    /// Sign out everywhere
    Logout,
    /// Show the stored session
    Status,
    /// Poll for changes and print events until interrupted or signed out
    Watch {
        /// Workspace to follow
        #[arg(short, long)]
        workspace: Option<String>,
        /// Conversation to follow
        #[arg(long)]
        conversation: Option<String>,
        /// Stop after this many seconds
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Write the default configuration to a file
    InitConfig {
        #[arg(short, long, default_value = "chimera.toml")]
        output: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Navigator for a terminal: a redirect to the login route ends `watch`
#[derive(Default)]
struct CliNavigator {
    redirected: Notify,
}

impl Navigator for CliNavigator {
    fn replace(&self, route: &str) {
        warn!(%route, "Session ended by another client");
        self.redirected.notify_one();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = load_config(args.config.as_ref())?;

    let mut log_config = LogConfig::try_from(&config.logging)?;
    if let Some(level) = &args.log_level {
        log_config.level = level
            .parse::<LogLevel>()
            .with_context(|| format!("invalid --log-level '{level}'"))?;
    }
    if args.json_logs {
        log_config = log_config.json_format(true);
    }
    init_logging_with_config(log_config)?;
    chimera_core::metrics::init_metrics();

    match args.command {
        Command::Login { email, password } => {
            let client = build_client(&config, Arc::new(CliNavigator::default()))?;
            let user = client
                .login(&email, &password)
                .await
                .context("login failed")?;
            println!("Signed in as {} <{}>", user.name, user.email);
        }
        Command::Logout => {
            let client = build_client(&config, Arc::new(CliNavigator::default()))?;
            client.logout().await?;
            println!("Signed out");
        }
        Command::Status => {
            let client = build_client(&config, Arc::new(CliNavigator::default()))?;
            let user = client.restore_session().await?;
            let status = json!({
                "authenticated": user.is_some(),
                "user": user,
                "storage": config.storage.path,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Watch { workspace, conversation, duration_secs } => {
            let navigator = Arc::new(CliNavigator::default());
            let client = build_client(&config, navigator.clone())?;
            let context = watch_context(workspace, conversation);
            let invalidated =
                watch(&client, &navigator, context, duration_secs.map(Duration::from_secs)).await?;
            if invalidated {
                return Ok(ExitCode::from(EXIT_SESSION_INVALIDATED));
            }
        }
        Command::InitConfig { output, force } => init_config(&output, force)?,
    }

    Ok(ExitCode::SUCCESS)
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::from_env()?);
    };
    let mut config = Config::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn build_client(config: &Config, navigator: Arc<dyn Navigator>) -> Result<ChimeraClient> {
    let backend = SimulatedBackend::new().with_latency(config.backend.latency);
    let client = ChimeraClient::new(
        config.clone(),
        Arc::new(backend),
        Arc::new(FileStorage::new(&config.storage.path)),
        navigator,
        SessionFlags::new(),
    )?;
    Ok(client)
}

fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!("{} already exists, pass --force to overwrite", output.display());
    }
    Config::default().save_to_file(output)?;
    println!("Wrote default configuration to {}", output.display());
    Ok(())
}

fn watch_context(workspace: Option<String>, conversation: Option<String>) -> RealtimeContext {
    let mut context = RealtimeContext::signed_in();
    context.workspace_id = workspace;
    context.conversation_id = conversation;
    context
}

/// Returns whether the session was invalidated by another client
async fn watch(
    client: &ChimeraClient,
    navigator: &CliNavigator,
    context: RealtimeContext,
    limit: Option<Duration>,
) -> Result<bool> {
    if client.restore_session().await?.is_none() {
        bail!("not signed in, run `chimera login` first");
    }

    let shutdown = Arc::new(ShutdownCoordinator::new(Duration::from_millis(200)));
    install_signal_handlers(shutdown.clone());
    let session_watch = client.spawn_session_watch(shutdown.listener());

    let _events = client.bus().subscribe_all(|event| match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "Could not encode event"),
    });
    client.set_context(context)?;
    info!("Watching for changes");

    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    let invalidated = tokio::select! {
        _ = navigator.redirected.notified() => true,
        _ = shutdown.wait_for_shutdown() => false,
        _ = deadline => false,
    };

    client.connection().disconnect();
    shutdown.shutdown().await;
    if let Err(e) = session_watch.await {
        warn!(error = %e, "Session watch task failed");
    }

    if invalidated {
        eprintln!("Session ended in another client, sign in again with `chimera login`");
    }
    Ok(invalidated)
}
