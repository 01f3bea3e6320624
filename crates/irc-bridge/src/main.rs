mod agents;

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use {
    anyhow::{Context, bail},
    async_trait::async_trait,
    clap::{Parser, Subcommand},
    moltis_channels::{ChannelEvent, ChannelEventSink, MemoryMessageLog, MemoryPairingStore},
    moltis_config::{MoltisConfig, Severity, ValidationResult},
    moltis_irc::{IrcAgent, IrcPlugin, TcpDialer, probe_account, resolve_accounts},
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use crate::agents::{EchoAgent, LogAgent};

#[derive(Parser)]
#[command(name = "moltis-irc", about = "Moltis IRC bridge")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: moltis.{toml,yaml,yml,json} in ./ then ~/.config/moltis/).
    #[arg(long, global = true, env = "MOLTIS_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect every enabled account and serve until interrupted.
    Run {
        /// Answer every accepted message with its own text.
        #[arg(long)]
        echo: bool,
    },
    /// Validate the `channels.irc` section and report errors/warnings.
    Check,
    /// Connect, register and disconnect once per account.
    Probe {
        /// Only probe this account.
        #[arg(long)]
        account: Option<String>,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load(cli: &Cli) -> anyhow::Result<(MoltisConfig, Option<PathBuf>)> {
    match &cli.config {
        Some(path) => {
            let config = moltis_config::load_config(path)
                .with_context(|| format!("loading {}", path.display()))?;
            Ok((config, Some(path.clone())))
        },
        None => Ok(moltis_config::discover_and_load()?),
    }
}

/// Logs channel events.
struct LogEvents;

#[async_trait]
impl ChannelEventSink for LogEvents {
    async fn emit(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::AccountStateChanged {
                account_id, state, ..
            } => info!(account_id = %account_id, state = %state, "irc account state"),
            ChannelEvent::AccountDegraded {
                account_id,
                reason,
                restarts,
                ..
            } => warn!(account_id = %account_id, reason = %reason, restarts, "irc account degraded"),
            ChannelEvent::InboundMessage { .. } => {},
        }
    }
}

async fn run(config: MoltisConfig, echo: bool) -> anyhow::Result<()> {
    let agent: Arc<dyn IrcAgent> = if echo {
        Arc::new(EchoAgent)
    } else {
        Arc::new(LogAgent)
    };
    let mut plugin = IrcPlugin::new(agent)
        .with_message_log(Arc::new(MemoryMessageLog::default()))
        .with_pairings(Arc::new(MemoryPairingStore::new()))
        .with_event_sink(Arc::new(LogEvents));

    if let Err(e) = plugin.apply_config(&config.channels.irc).await {
        warn!(error = %e, "some irc accounts did not start");
    }
    if plugin.account_ids().is_empty() {
        bail!("no irc accounts are enabled");
    }
    info!(accounts = ?plugin.account_ids(), "moltis-irc running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    plugin.stop_all().await;
    Ok(())
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(config: &MoltisConfig, path: Option<PathBuf>) -> anyhow::Result<()> {
    let mut result = ValidationResult {
        config_path: path,
        ..Default::default()
    };
    result.extend(moltis_irc::validate_irc_config(&config.channels.irc));

    if let Some(ref path) = result.config_path {
        eprintln!("Checking {}\n", path.display());
    } else {
        eprintln!("No config file found; checking defaults.\n");
    }

    for d in &result.diagnostics {
        let color = match d.severity {
            Severity::Error => RED,
            Severity::Warning | Severity::Info => YELLOW,
        };
        eprintln!("  {BOLD}{color}{}{RESET} {}: {}", d.severity, d.path, d.message);
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);
    if !result.diagnostics.is_empty() {
        eprintln!();
    }
    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if result.has_errors() {
        bail!("configuration has errors");
    }
    Ok(())
}

async fn probe(config: &MoltisConfig, only: Option<&str>) -> anyhow::Result<()> {
    let accounts = resolve_accounts(&config.channels.irc)?;
    if let Some(id) = only
        && !accounts.contains_key(id)
    {
        bail!("unknown irc account: {id}");
    }

    let dialer = TcpDialer::default();
    let mut failed = 0;
    for (account_id, account) in accounts {
        if only.is_some_and(|id| id != account_id) {
            continue;
        }
        let result = probe_account(&dialer, &account_id, Arc::new(account)).await;
        if !result.ok {
            failed += 1;
        }
        let report = BTreeMap::from([(account_id, result)]);
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    if failed > 0 {
        bail!("{failed} account(s) failed the probe");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let (config, path) = load(&cli)?;
    match cli.command {
        Commands::Run { echo } => run(config, echo).await,
        Commands::Check => check(&config, path),
        Commands::Probe { ref account } => probe(&config, account.as_deref()).await,
    }
}
