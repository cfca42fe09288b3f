//! slotwatch - watches sports-facility booking sites and reserves open slots.

mod agent;
mod backoff;
mod config;
mod error;
mod gateway;
mod lock;
mod metrics;
mod notify;
mod reservation;
mod session;
mod site;
mod store;
mod target;

use std::io::{self, Write as _};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::agent::{Agent, AgentDeps, AgentHub, AgentSettings, AgentState};
use crate::config::loader::{
    get_config_path, get_data_dir, get_store_path, load_config, save_config,
};
use crate::config::schema::Config;
use crate::gateway::{AllowedTarget, GatewayPolicy, ReqwestTransport, SafetyPatch};
use crate::metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::site::{Credentials, JsonApiAdapter, SiteRegistry};
use crate::store::{FileStore, KvStore};
use crate::target::{JapaneseHolidays, MonitoringTarget};

const VERSION: &str = "0.1.0";

#[derive(Parser)]
#[command(name = "slotwatch", about = "slotwatch - booking slot watcher", version = VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the default configuration.
    Onboard,
    /// Run every persisted agent until Ctrl+C.
    Run,
    /// Show configuration and agent overview.
    Status,
    /// Manage an agent's monitoring targets.
    Targets {
        #[command(subcommand)]
        action: TargetsAction,
    },
    /// Print an agent's full state as JSON.
    Show {
        #[command(flatten)]
        agent: AgentArgs,
    },
    /// Check one target right now and print what the site reports.
    Check {
        #[command(flatten)]
        agent: AgentArgs,
        /// Target ID.
        target: String,
    },
    /// Clear a login halt.
    Resume {
        #[command(flatten)]
        agent: AgentArgs,
    },
    /// Wipe all persisted state for an agent.
    Reset {
        #[command(flatten)]
        agent: AgentArgs,
    },
    /// Change an agent's safety switches.
    Safety {
        #[command(flatten)]
        agent: AgentArgs,
        /// Allow booking calls for this agent.
        #[arg(long)]
        execution: Option<bool>,
        /// Answer every call with canned responses.
        #[arg(long)]
        mock: Option<bool>,
        /// Replace the allow-list; each entry is FACILITY/YYYY-MM-DD/SLOT.
        #[arg(long = "allow")]
        allow: Vec<String>,
        /// Minutes each allow-list entry stays valid.
        #[arg(long, default_value_t = 60)]
        allow_minutes: i64,
        /// Empty the allow-list.
        #[arg(long)]
        clear_allow: bool,
    },
    /// Pause or resume every agent.
    Maintenance {
        #[command(subcommand)]
        action: MaintenanceAction,
    },
}

#[derive(clap::Args)]
struct AgentArgs {
    /// User ID.
    #[arg(short, long)]
    user: String,
    /// Site ID.
    #[arg(short, long)]
    site: String,
}

#[derive(Subcommand)]
enum TargetsAction {
    /// Replace targets (and optionally credentials) from a JSON file.
    Set {
        #[command(flatten)]
        agent: AgentArgs,
        /// JSON array of targets.
        file: PathBuf,
        /// Site login name.
        #[arg(long)]
        username: Option<String>,
        /// Site password.
        #[arg(long)]
        password: Option<String>,
    },
}

#[derive(Subcommand)]
enum MaintenanceAction {
    /// Skip every tick until turned off.
    On,
    Off,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let result = match cli.command {
        Commands::Onboard => cmd_onboard(),
        Commands::Run => block_on(cmd_run()),
        Commands::Status => block_on(cmd_status()),
        Commands::Targets { action } => match action {
            TargetsAction::Set {
                agent,
                file,
                username,
                password,
            } => block_on(cmd_targets_set(agent, file, username, password)),
        },
        Commands::Show { agent } => block_on(cmd_show(agent)),
        Commands::Check { agent, target } => block_on(cmd_check(agent, target)),
        Commands::Resume { agent } => block_on(cmd_resume(agent)),
        Commands::Reset { agent } => block_on(cmd_reset(agent)),
        Commands::Safety {
            agent,
            execution,
            mock,
            allow,
            allow_minutes,
            clear_allow,
        } => block_on(cmd_safety(agent, execution, mock, allow, allow_minutes, clear_allow)),
        Commands::Maintenance { action } => {
            block_on(cmd_maintenance(matches!(action, MaintenanceAction::On)))
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn block_on<F: std::future::Future<Output = Result<()>>>(future: F) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    runtime.block_on(future)
}

// ============================================================================
// Onboard
// ============================================================================

fn cmd_onboard() -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
        print!("Overwrite? [y/N] ");
        io::stdout().flush().ok();
        let mut input = String::new();
        io::stdin().read_line(&mut input).ok();
        if !input.trim().eq_ignore_ascii_case("y") {
            return Ok(());
        }
    }

    let config = Config::default();
    save_config(&config, None)?;
    println!("  Created config at {}", config_path.display());

    let data_dir = get_data_dir(&config);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    println!("  Created data directory at {}", data_dir.display());

    println!("\nslotwatch is ready!");
    println!("\nNext steps:");
    println!("  1. Add your booking sites under \"sites\" in {}", config_path.display());
    println!(
        "  2. slotwatch targets set -u <user> -s <site> targets.json \
         --username <login> --password <pw>"
    );
    println!("  3. slotwatch run");
    Ok(())
}

// ============================================================================
// Run
// ============================================================================

async fn cmd_run() -> Result<()> {
    let config = load_config(None);
    let metrics = Arc::new(InMemoryMetrics::new());
    let hub = build_hub(&config, metrics.clone())?;

    let started = hub.restore_all().await?;
    println!("slotwatch {} running {} agent(s)", VERSION, started);
    for agent in hub.agents().await {
        let next = agent
            .next_alarm()
            .await
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "idle".to_string());
        println!("  {}:{} next wake {}", agent.user_id(), agent.site_id(), next);
    }
    if !config.safety.platform_execution_enabled {
        println!("  Booking execution is disabled platform-wide (safety.platformExecutionEnabled)");
    }

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    hub.shutdown().await;
    info!("Counters: {}", metrics.snapshot());
    Ok(())
}

// ============================================================================
// Status
// ============================================================================

async fn cmd_status() -> Result<()> {
    let config_path = get_config_path();
    let config = load_config(None);
    let store_path = get_store_path(&config);

    println!("slotwatch Status\n");
    println!(
        "Config: {} [{}]",
        config_path.display(),
        if config_path.exists() { "ok" } else { "missing" }
    );
    println!(
        "Store: {} [{}]",
        store_path.display(),
        if store_path.exists() { "ok" } else { "missing" }
    );
    println!(
        "Platform booking execution: {}",
        if config.safety.platform_execution_enabled { "enabled" } else { "disabled" }
    );
    if config.sites.is_empty() {
        println!("Sites: none configured");
    } else {
        for (id, site) in &config.sites {
            println!("Site {}: {}", id, site.base_url);
        }
    }

    let kv = open_store(&config);
    println!(
        "Maintenance: {}",
        if store::maintenance_enabled(kv.as_ref()).await? { "on" } else { "off" }
    );

    let keys = kv.list(store::AGENT_PREFIX).await?;
    if keys.is_empty() {
        println!("\nNo agents.");
        return Ok(());
    }

    println!(
        "\n{:<24} {:<8} {:<8} {:<6} {}",
        "Agent", "Targets", "Active", "Mode", "Next wake"
    );
    println!("{}", "-".repeat(70));
    for key in keys {
        let Some(state) = store::get_json::<AgentState>(kv.as_ref(), &key).await? else {
            continue;
        };
        let active = state.targets.iter().filter(|t| t.is_active()).count();
        let next = state
            .next_alarm
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<8} {:<8} {:<6} {}",
            format!("{}:{}", state.user_id, state.site_id),
            state.targets.len(),
            active,
            format!("{:?}", state.mode()).to_lowercase(),
            next
        );
    }
    Ok(())
}

// ============================================================================
// Agent control
// ============================================================================

async fn cmd_targets_set(
    args: AgentArgs,
    file: PathBuf,
    username: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;
    let targets = parse_targets(&content, &args.user, &args.site)
        .with_context(|| format!("parsing {}", file.display()))?;

    let config = load_config(None);
    let kv = open_store(&config);
    let key = store::agent_key(&args.user, &args.site);
    let existing = store::get_json::<AgentState>(kv.as_ref(), &key)
        .await?
        .map(|s| s.credentials)
        .unwrap_or_default();
    let credentials = Credentials {
        username: username.unwrap_or(existing.username),
        password: password.unwrap_or(existing.password),
    };
    if credentials.username.is_empty() {
        warn!("No site credentials set for {}:{}", args.user, args.site);
    }

    let count = targets.len();
    let agent = load_agent(&config, &args).await?;
    agent.initialize(targets, credentials).await?;
    println!("  Saved {} target(s) for {}:{}", count, args.user, args.site);
    Ok(())
}

/// Parse a JSON array of targets, filling in the owning user and site.
fn parse_targets(content: &str, user_id: &str, site_id: &str) -> Result<Vec<MonitoringTarget>> {
    let raw: Vec<serde_json::Value> = serde_json::from_str(content)?;
    raw.into_iter()
        .map(|mut value| {
            let obj = value
                .as_object_mut()
                .ok_or_else(|| anyhow!("each target must be a JSON object"))?;
            obj.entry("userId").or_insert_with(|| user_id.into());
            obj.entry("siteId").or_insert_with(|| site_id.into());
            let target: MonitoringTarget = serde_json::from_value(value)?;
            target.validate().map_err(|e| anyhow!(e))?;
            Ok(target)
        })
        .collect()
}

async fn cmd_show(args: AgentArgs) -> Result<()> {
    let config = load_config(None);
    let agent = load_agent(&config, &args).await?;
    let snapshot = agent.snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn cmd_check(args: AgentArgs, target_id: String) -> Result<()> {
    let config = load_config(None);
    let agent = load_agent(&config, &args).await?;
    let reports = agent.force_check(&target_id).await?;

    println!("{:<12} {:<8} {:<10} {}", "Date", "Slot", "Available", "Status");
    println!("{}", "-".repeat(50));
    for r in &reports {
        let available = match r.available {
            Some(true) => "yes",
            Some(false) => "no",
            None => "error",
        };
        let status = match (&r.status, &r.error) {
            (_, Some(e)) => e.clone(),
            (Some(s), None) if r.contested => format!("{} (contested)", s),
            (Some(s), None) => s.clone(),
            (None, None) => String::new(),
        };
        println!("{:<12} {:<8} {:<10} {}", r.date, r.time_slot, available, status);
    }
    Ok(())
}

async fn cmd_resume(args: AgentArgs) -> Result<()> {
    let config = load_config(None);
    let agent = load_agent(&config, &args).await?;
    agent.resume_login().await?;
    println!("  Login resumed for {}:{}", args.user, args.site);
    Ok(())
}

async fn cmd_reset(args: AgentArgs) -> Result<()> {
    print!("Wipe all state for {}:{}? [y/N] ", args.user, args.site);
    io::stdout().flush().ok();
    let mut input = String::new();
    io::stdin().read_line(&mut input).ok();
    if !input.trim().eq_ignore_ascii_case("y") {
        return Ok(());
    }

    let config = load_config(None);
    let agent = load_agent(&config, &args).await?;
    agent.reset().await?;
    println!("  Reset {}:{}", args.user, args.site);
    Ok(())
}

async fn cmd_safety(
    args: AgentArgs,
    execution: Option<bool>,
    mock: Option<bool>,
    allow: Vec<String>,
    allow_minutes: i64,
    clear_allow: bool,
) -> Result<()> {
    let expires_at = Utc::now() + chrono::Duration::minutes(allow_minutes);
    let allow_list = if clear_allow {
        Some(Vec::new())
    } else if allow.is_empty() {
        None
    } else {
        Some(
            allow
                .iter()
                .map(|entry| parse_allow_entry(entry, expires_at))
                .collect::<Result<Vec<_>>>()?,
        )
    };

    let config = load_config(None);
    let agent = load_agent(&config, &args).await?;
    let safety = agent
        .apply_safety(SafetyPatch {
            execution_enabled: execution,
            mock_mode: mock,
            allow_list,
        })
        .await?;

    println!("  Safety v{} for {}:{}", safety.version, args.user, args.site);
    println!("    execution: {}", safety.execution_enabled);
    println!("    mock mode: {}", safety.mock_mode);
    for a in &safety.allow_list {
        println!(
            "    allow: {} {} {} (until {})",
            a.facility_id,
            a.date,
            a.time_slot,
            a.expires_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn parse_allow_entry(entry: &str, expires_at: chrono::DateTime<Utc>) -> Result<AllowedTarget> {
    let mut parts = entry.splitn(3, '/');
    let (Some(facility_id), Some(date), Some(time_slot)) =
        (parts.next(), parts.next(), parts.next())
    else {
        anyhow::bail!("allow entry '{}' must be FACILITY/YYYY-MM-DD/SLOT", entry);
    };
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .with_context(|| format!("bad date in allow entry '{}'", entry))?;
    Ok(AllowedTarget {
        facility_id: facility_id.to_string(),
        date,
        time_slot: time_slot.to_string(),
        expires_at,
    })
}

async fn cmd_maintenance(enabled: bool) -> Result<()> {
    let config = load_config(None);
    let kv = open_store(&config);
    store::set_maintenance(kv.as_ref(), enabled).await?;
    println!("  Maintenance {}", if enabled { "on" } else { "off" });
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn open_store(config: &Config) -> Arc<dyn KvStore> {
    Arc::new(FileStore::new(get_store_path(config)))
}

fn build_registry(config: &Config) -> Result<SiteRegistry> {
    let mut sites = SiteRegistry::new();
    for (id, site) in &config.sites {
        let adapter = JsonApiAdapter::new(id, &site.base_url)
            .with_context(|| format!("site '{}' has an invalid baseUrl", id))?;
        sites.register(Arc::new(adapter));
    }
    Ok(sites)
}

fn build_deps(config: &Config, metrics: Arc<dyn MetricsSink>) -> Result<AgentDeps> {
    let policy = GatewayPolicy::from_config(config).context("unsafe safety configuration")?;
    let notifier: Arc<dyn Notifier> = match config.notify.webhook_url.as_deref() {
        Some(url) if !url.is_empty() => Arc::new(WebhookNotifier::new(url)),
        _ => Arc::new(LogNotifier),
    };
    Ok(AgentDeps {
        store: open_store(config),
        transport: Arc::new(ReqwestTransport::new()),
        policy,
        notifier,
        metrics,
        calendar: Arc::new(JapaneseHolidays::with_extra(
            config.holidays.extra_dates.clone(),
        )),
        settings: Arc::new(AgentSettings::from_config(config)),
    })
}

fn build_hub(config: &Config, metrics: Arc<dyn MetricsSink>) -> Result<AgentHub> {
    let sites = build_registry(config)?;
    if sites.is_empty() {
        warn!("No sites configured; agents cannot start");
    } else {
        info!("Sites: {}", sites.site_ids().join(", "));
    }
    let deps = build_deps(config, metrics)?;
    Ok(AgentHub::new(deps, Arc::new(sites)))
}

/// Load one agent without starting its driver, for one-shot commands.
async fn load_agent(config: &Config, args: &AgentArgs) -> Result<Agent> {
    let sites = build_registry(config)?;
    let adapter = sites
        .get(&args.site)
        .ok_or_else(|| anyhow!("site '{}' is not configured", args.site))?;
    let deps = build_deps(config, Arc::new(NoopMetrics))?;
    Ok(Agent::load(&args.user, adapter, &deps).await?.with_login_backoff())
}
