//! Tally CLI - portal report automation
//!
//! Usage:
//!   tally init                  Write a default tally.toml
//!   tally serve                 Run the HTTP API
//!   tally generate [--date D]   Generate one report and print where it was stored
//!   tally cookies               Log into the cookie portal and print its cookies
//!   tally debug list            List recorded debug sessions
//!   tally debug show <id>       Show one debug session

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tally_browser::{ChromeConfig, ChromeLauncher, SessionLauncher};
use tally_core::{
    parse_report_date, portal_today, Credentials, ReportRequest, TallyConfig, DEFAULT_CONFIG_PATH,
};
use tally_workflow::{
    ArtifactRegistry, DebugStore, Orchestrator, OrchestratorConfig, PortalProfile, RunFailure,
};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "tally")]
#[command(author, version, about = "Browser-driven report generation for login-gated portals")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run the HTTP API
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Generate one report without the HTTP layer
    Generate {
        /// Report date (YYYY-MM-DD), today by default
        #[arg(short, long)]
        date: Option<String>,

        #[arg(long)]
        company_code: Option<String>,

        #[arg(long)]
        username: Option<String>,

        #[arg(long)]
        password: Option<String>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Log into the cookie portal and print its session cookies
    Cookies {
        #[arg(long)]
        email: Option<String>,

        #[arg(long)]
        password: Option<String>,

        /// Page to open after login (overrides config)
        #[arg(long)]
        url: Option<String>,
    },

    /// Inspect recorded debug sessions
    Debug {
        #[command(subcommand)]
        action: DebugCommands,
    },
}

#[derive(Subcommand)]
enum DebugCommands {
    /// List debug sessions, newest first
    List {
        /// Show at most this many
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show one debug session
    Show {
        /// Debug id from a failure response
        debug_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins when set
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { force } => cmd_init(&cli.config, force),
        Commands::Serve { port } => cmd_serve(&cli.config, port).await,
        Commands::Generate {
            date,
            company_code,
            username,
            password,
            json,
        } => cmd_generate(&cli.config, date, company_code, username, password, json).await,
        Commands::Cookies {
            email,
            password,
            url,
        } => cmd_cookies(&cli.config, email, password, url).await,
        Commands::Debug { action } => cmd_debug(&cli.config, action),
    }
}

fn load_config(path: &Path) -> Result<TallyConfig> {
    TallyConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn launcher(config: &TallyConfig) -> Arc<dyn SessionLauncher> {
    Arc::new(ChromeLauncher::new(ChromeConfig::from(&config.browser)))
}

fn report_failure(failure: &RunFailure) -> anyhow::Error {
    eprintln!("Run {} failed while {}: {}", failure.run_id, failure.stage, failure.reason);
    eprintln!("  kind:     {}", failure.kind);
    eprintln!("  debug_id: {}", failure.debug_id());
    for file in &failure.debug.files {
        eprintln!("  captured: {}", file.path.display());
    }
    for missing in &failure.debug.failures {
        eprintln!("  not captured: {} ({})", missing.kind, missing.error);
    }
    anyhow!("{}", failure.kind)
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    TallyConfig::write_default(path)?;
    println!("Wrote {}", path.display());
    println!("Set credentials under [defaults] or via TALLY_COMPANY_CODE / TALLY_USERNAME / TALLY_PASSWORD");
    Ok(())
}

async fn cmd_serve(config_path: &Path, port: Option<u16>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(port) = port {
        config.server.port = port;
    }
    let launcher = launcher(&config);
    tally_server::serve(config, launcher).await
}

async fn cmd_generate(
    config_path: &Path,
    date: Option<String>,
    company_code: Option<String>,
    username: Option<String>,
    password: Option<String>,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let defaults = &config.defaults;
    let credentials = Credentials::new(
        company_code.unwrap_or_else(|| defaults.company_code.clone()),
        username.unwrap_or_else(|| defaults.username.clone()),
        password.unwrap_or_else(|| defaults.password.clone()),
    );
    let report_date = match date {
        Some(raw) => parse_report_date(&raw)
            .ok_or_else(|| anyhow!("Invalid date format {:?}. Use YYYY-MM-DD", raw))?,
        None => portal_today(config.workflow.portal_utc_offset_minutes),
    };

    let profile = PortalProfile::from_selection(&config.portal)?;
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::new(&config, profile),
        launcher(&config),
        Arc::new(ArtifactRegistry::new()),
        DebugStore::shared(config.storage.debug_dir()),
    );

    info!("Generating report for {}", report_date);
    let receipt = orchestrator
        .run(ReportRequest::new(credentials, report_date))
        .await
        .map_err(|failure| report_failure(&failure))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&receipt)?);
    } else {
        println!("Report:   {}", receipt.artifact.path.display());
        println!("Size:     {} bytes", receipt.artifact.size_bytes);
        println!("Detected: {:?} (tried {})", receipt.detection.outcome, receipt.detection.tried().join(", "));
    }
    Ok(())
}

async fn cmd_cookies(
    config_path: &Path,
    email: Option<String>,
    password: Option<String>,
    url: Option<String>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let settings = config
        .cookie_portal
        .clone()
        .context("No [cookie_portal] section in the configuration")?;

    let credentials = Credentials::new(
        "",
        email.unwrap_or(settings.email),
        password.unwrap_or(settings.password),
    );
    let target_url = url.unwrap_or(settings.target_url);

    let orchestrator = Orchestrator::new(
        OrchestratorConfig::new(&config, PortalProfile::builtin(&settings.profile)?),
        launcher(&config),
        Arc::new(ArtifactRegistry::new()),
        DebugStore::shared(config.storage.debug_dir()),
    );

    let capture = orchestrator
        .capture_cookies(&credentials, &target_url)
        .await
        .map_err(|failure| report_failure(&failure))?;

    info!("Captured {} cookies from {}", capture.cookie_names.len(), capture.url);
    println!("{}", capture.cookie_header);
    Ok(())
}

fn cmd_debug(config_path: &Path, action: DebugCommands) -> Result<()> {
    let config = load_config(config_path)?;
    let store = DebugStore::new(config.storage.debug_dir());

    match action {
        DebugCommands::List { limit } => {
            let sessions = store.list();
            if sessions.is_empty() {
                println!("No debug sessions in {}", store.debug_dir().display());
                return Ok(());
            }
            for session in sessions.iter().take(limit) {
                println!(
                    "{}  {}  {:<14} {:<20} {}",
                    session.debug_id,
                    session.created_at.format("%Y-%m-%d %H:%M:%S"),
                    session.context.stage.to_string(),
                    session.context.kind.to_string(),
                    session.context.reason
                );
            }
            if sessions.len() > limit {
                println!("... {} more", sessions.len() - limit);
            }
        }
        DebugCommands::Show { debug_id } => {
            let session = store
                .get(&debug_id)
                .with_context(|| format!("Debug session {} not found", debug_id))?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
    }
    Ok(())
}
