use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quotaguard::config::QuotaguardConfig;
use quotaguard::ratelimit::{
    FixedWindowCounter, Identity, Preset, RateLimiter, RuleConfig, UNKNOWN_IP,
};

/// Inspect and exercise rate limit configuration.
#[derive(Debug, Parser)]
#[command(name = "quotaguard", version, about)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the resolved presets and custom rules
    Presets {
        /// YAML configuration file; the environment is used when absent
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run checks against the configured backends and print each decision
    Probe(ProbeArgs),
}

#[derive(Debug, Args)]
struct ProbeArgs {
    /// Preset to check
    #[arg(long, conflicts_with = "rule", required_unless_present = "rule")]
    preset: Option<Preset>,

    /// Custom rule from the configuration file
    #[arg(long)]
    rule: Option<String>,

    /// Client address to check as
    #[arg(long)]
    ip: Option<String>,

    /// Authenticated user to check as
    #[arg(long)]
    user: Option<String>,

    /// Number of checks to run
    #[arg(long, default_value_t = 1)]
    count: u32,

    /// YAML configuration file; the environment is used when absent
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Serialize)]
struct RuleListing<'a> {
    presets: Vec<RuleConfig>,
    rules: &'a [RuleConfig],
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<QuotaguardConfig> {
    let config = match path {
        Some(path) => QuotaguardConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => QuotaguardConfig::from_env().context("loading configuration from environment")?,
    };
    Ok(config)
}

fn print_presets(config: &QuotaguardConfig) -> anyhow::Result<()> {
    let listing = RuleListing {
        presets: Preset::ALL.iter().map(|p| config.preset(*p)).collect(),
        rules: &config.rules,
    };
    print!("{}", serde_yaml::to_string(&listing)?);
    Ok(())
}

async fn probe(args: ProbeArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_ref())?;

    let rule = match (&args.preset, &args.rule) {
        (Some(preset), _) => config.preset(*preset),
        (None, Some(name)) => config
            .rule(name)
            .cloned()
            .ok_or_else(|| anyhow!("no rule named '{}' in configuration", name))?,
        (None, None) => return Err(anyhow!("either --preset or --rule is required")),
    };

    let fallback = Arc::new(FixedWindowCounter::new());
    let sweeper = fallback.spawn_sweeper(config.sweep_interval());
    let backends = config.backends(fallback)?;
    let limiter = RateLimiter::new(rule, backends)?;

    let ip = args.ip.unwrap_or_else(|| UNKNOWN_IP.to_string());
    let identity = match args.user {
        Some(user) => Identity::user(ip, user),
        None => Identity::anonymous(ip),
    };

    info!(
        rule = %limiter.rule().identifier,
        limit = limiter.rule().limit,
        window_secs = limiter.rule().window_secs,
        count = args.count,
        "Probing rate limit"
    );

    for _ in 0..args.count {
        let decision = limiter.check_identity(&identity).await;
        println!("{}", serde_json::to_string(&decision)?);
    }

    sweeper.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Presets { config } => print_presets(&load_config(config.as_ref())?),
        Command::Probe(args) => probe(args).await,
    }
}
