#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod config;
mod logging;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use clap::{Args, Parser, Subcommand};
use modkit_discovery::{
    BalanceConfig, ClientConn, DiscoveryResult, ETCD_SCHEME, EtcdConfig, EtcdResolverBuilder,
    RegisterConfig, Registrar, ResolverRegistry, ResolverState, connect_balanced,
};

use crate::config::AppConfig;

/// Discovery agent - registers service instances in etcd and follows their resolution
#[derive(Parser)]
#[command(name = "discovery-agent")]
#[command(about = "Discovery agent - registers service instances in etcd and follows their resolution")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register this instance and keep it registered until shutdown
    Register(RegisterArgs),
    /// Print the address list of a target every time it changes
    Resolve(ResolveArgs),
    /// Open load-balanced channels to every configured domain
    Dial,
    /// Validate configuration, print it and exit
    Check,
}

#[derive(Args)]
struct RegisterArgs {
    /// Service name (overrides etcd.register.name)
    #[arg(long)]
    name: Option<String>,

    /// Advertised address, host:port (overrides etcd.register.addr)
    #[arg(long)]
    addr: Option<String>,

    #[arg(long)]
    weight: Option<i32>,

    /// Lease TTL in seconds
    #[arg(long)]
    ttl: Option<i64>,
}

impl RegisterArgs {
    fn apply(&self, etcd: &mut EtcdConfig) -> Result<()> {
        let register = match (etcd.register.take(), &self.name, &self.addr) {
            (Some(register), _, _) => register,
            (None, Some(name), Some(addr)) => RegisterConfig {
                name: name.clone(),
                addr: addr.clone(),
                weight: 1,
                version: "v1".to_owned(),
                ttl: 10,
            },
            (None, _, _) => bail!("no etcd.register section: pass --name and --addr"),
        };
        let register = etcd.register.insert(register);
        if let Some(name) = &self.name {
            register.name.clone_from(name);
        }
        if let Some(addr) = &self.addr {
            register.addr.clone_from(addr);
        }
        if let Some(weight) = self.weight {
            register.weight = weight;
        }
        if let Some(ttl) = self.ttl {
            register.ttl = ttl;
        }
        Ok(())
    }
}

#[derive(Args)]
struct ResolveArgs {
    /// Target URI, e.g. etcd:///user/v1
    #[arg(conflicts_with = "domain", required_unless_present = "domain")]
    target: Option<String>,

    /// Alias of a configured domain
    #[arg(long)]
    domain: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1) defaults -> 2) YAML (if provided) -> 3) env (APP__*) -> 4) CLI overrides
    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_verbosity(cli.verbose);
    if let Commands::Register(args) = &cli.command {
        args.apply(&mut config.etcd)?;
    }

    logging::init(&config.logging);

    match cli.command {
        Commands::Register(_) => run_register(&config).await,
        Commands::Resolve(args) => run_resolve(&config, args).await,
        Commands::Dial => run_dial(&config).await,
        Commands::Check => check_config(&config),
    }
}

fn check_config(config: &AppConfig) -> Result<()> {
    tracing::info!("checking configuration");
    config.validate()?;
    println!("Configuration is valid");
    println!("{}", config.to_pretty_json()?);
    Ok(())
}

async fn run_register(config: &AppConfig) -> Result<()> {
    config.validate()?;
    let registrar = Registrar::register(&config.etcd)
        .await
        .context("service registration failed")?;
    tracing::info!(key = %registrar.key(), "registered, waiting for shutdown signal");

    let result = signals::wait_for_shutdown().await;
    registrar.close().await;
    result
}

/// Writes every pushed address list to stdout as one JSON line.
struct PrintConn {
    target: String,
}

impl ClientConn for PrintConn {
    fn update_state(&self, state: ResolverState) -> DiscoveryResult<()> {
        let addresses: Vec<serde_json::Value> = state
            .addresses
            .iter()
            .map(|a| serde_json::json!({ "addr": a.addr, "weight": a.weight }))
            .collect();
        println!(
            "{}",
            serde_json::json!({ "target": self.target, "addresses": addresses })
        );
        Ok(())
    }
}

fn build_registry(etcd: &EtcdConfig) -> ResolverRegistry {
    let mut registry = ResolverRegistry::new();
    registry.register(Arc::new(EtcdResolverBuilder::new(etcd)));
    registry
}

async fn run_resolve(config: &AppConfig, args: ResolveArgs) -> Result<()> {
    config.validate()?;
    let target = match (args.target, args.domain) {
        (Some(target), _) => target,
        (None, Some(alias)) => config
            .domains
            .get(&alias)
            .with_context(|| format!("unknown domain '{alias}'"))?
            .target(ETCD_SCHEME),
        (None, None) => bail!("a target or --domain is required"),
    };

    let registry = build_registry(&config.etcd);
    let conn = Arc::new(PrintConn {
        target: target.clone(),
    });
    let resolver = registry
        .build(&target, conn)
        .await
        .with_context(|| format!("failed to resolve '{target}'"))?;

    let result = signals::wait_for_shutdown().await;
    resolver.close().await;
    result
}

async fn run_dial(config: &AppConfig) -> Result<()> {
    config.validate()?;
    ensure!(!config.domains.is_empty(), "no domains configured");

    let registry = build_registry(&config.etcd);
    let mut channels = Vec::with_capacity(config.domains.len());
    for (alias, domain) in &config.domains {
        let target = domain.target(ETCD_SCHEME);
        let channel = connect_balanced(&registry, &target, BalanceConfig::from(domain))
            .await
            .with_context(|| format!("failed to dial domain '{alias}'"))?;
        tracing::info!(
            domain = %alias,
            target = %target,
            load_balance = domain.load_balance,
            "domain channel ready"
        );
        channels.push(channel);
    }

    let result = signals::wait_for_shutdown().await;
    for channel in channels {
        channel.close().await;
    }
    result
}
