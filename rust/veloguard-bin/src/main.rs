use anyhow::{bail, Context, Result};
use clap::Parser;
use parking_lot::RwLock;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use veloguard_sinkhole::{
    Collaborators, Engine, EngineConfig, EngineHandle, FlowQuery, PolicyEngine, ProcNetResolver, RedirectTarget,
    RuleSetPolicy, TunFd,
};
use veloguard_sock2proc::UidResolver;

/// VeloGuard Sinkhole - local VPN firewall engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "sinkhole.yaml")]
    config: PathBuf,

    /// Test configuration and exit
    #[arg(short, long)]
    test_config: bool,

    /// Tun interface to create or attach to
    #[arg(long, default_value = "vg0", conflicts_with = "tun_fd")]
    tun: String,

    /// Adopt an already open tun descriptor instead
    #[arg(long)]
    tun_fd: Option<i32>,

    /// Log file path
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log level, overrides the configuration file
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    engine: EngineConfig,
    rules: RuleSetPolicy,
    log_level: Option<String>,
    /// Seconds between statistics reports, 0 disables them.
    stats_interval: u64,
}

fn load_config(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: FileConfig =
        serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    config.engine.validate()?;
    Ok(config)
}

fn init_logging(level: &str, file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(format!("veloguard_sinkhole={level},veloguard_sock2proc={level},tokio=warn"))
    })?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact();

    match file {
        Some(path) => {
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
                .map_err(|e| anyhow::anyhow!("{}", e))?;
        }
        None => builder.try_init().map_err(|e| anyhow::anyhow!("{}", e))?,
    }
    Ok(())
}

/// Rule set that can be swapped while the engine runs.
struct ReloadablePolicy {
    rules: RwLock<RuleSetPolicy>,
}

impl PolicyEngine for ReloadablePolicy {
    fn is_flow_allowed(&self, query: &FlowQuery) -> Option<RedirectTarget> {
        self.rules.read().is_flow_allowed(query)
    }

    fn is_domain_blocked(&self, name: &str) -> bool {
        self.rules.read().is_domain_blocked(name)
    }
}

fn open_tun(args: &Args) -> Result<TunFd> {
    match args.tun_fd {
        Some(fd) if fd < 0 => bail!("invalid tun descriptor {}", fd),
        // SAFETY: the caller hands over an open tun descriptor it no longer uses.
        Some(fd) => Ok(unsafe { TunFd::from_raw(fd) }),
        None => Ok(TunFd::open(&args.tun)?),
    }
}

async fn wait_for_signals(handle: EngineHandle, policy: Arc<ReloadablePolicy>, config: PathBuf) {
    use futures::StreamExt;
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

    let mut signals = match signal_hook_tokio::Signals::new([SIGINT, SIGTERM, SIGHUP]) {
        Ok(s) => s,
        Err(e) => {
            error!("signal handler setup failed: {}", e);
            return;
        }
    };
    while let Some(signal) = signals.next().await {
        match signal {
            SIGHUP => match load_config(&config) {
                Ok(fresh) => {
                    *policy.rules.write() = fresh.rules;
                    handle.reload_policy();
                    info!("rules reloaded from {}", config.display());
                }
                Err(e) => warn!("keeping previous rules: {:#}", e),
            },
            _ => {
                handle.stop();
                return;
            }
        }
    }
}

async fn report_stats(handle: EngineHandle, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    let mut previous = handle.stats();
    loop {
        ticker.tick().await;
        let now = handle.stats();
        let counts = handle.session_counts();
        info!(
            "sessions icmp {} udp {} tcp {} | {:.1} pkt/s in, {} out, {} dropped, {} denied, dns blocked {}",
            counts.icmp,
            counts.udp,
            counts.tcp,
            now.packets_per_second(&previous, every),
            now.packets_sent,
            now.packets_dropped,
            now.flows_denied,
            now.dns_blocked
        );
        previous = now;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)?;
    let level = args
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level, args.log_file.as_deref())?;

    if args.test_config {
        println!("Configuration test passed!");
        return Ok(());
    }

    let policy = Arc::new(ReloadablePolicy {
        rules: RwLock::new(config.rules),
    });
    let collab = Collaborators::default()
        .with_policy(policy.clone())
        .with_owner(Arc::new(ProcNetResolver::new(UidResolver::new())));

    let tun = open_tun(&args)?;
    let mut engine = Engine::new(config.engine, tun, collab)?;
    let handle = engine.handle();
    info!("max sessions {}", engine.max_sessions());

    tokio::spawn(wait_for_signals(handle.clone(), policy, args.config.clone()));
    if config.stats_interval > 0 {
        tokio::spawn(report_stats(handle.clone(), Duration::from_secs(config.stats_interval)));
    }

    println!("VeloGuard Sinkhole started. Press Ctrl+C to stop.");
    let result = tokio::task::spawn_blocking(move || engine.run()).await?;

    match result {
        Ok(()) => {
            println!("VeloGuard Sinkhole stopped.");
            Ok(())
        }
        Err(e) => {
            error!("engine terminated: {}", e);
            Err(e.into())
        }
    }
}
