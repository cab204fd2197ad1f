//! swarm-deploy - Docker Swarm bootstrap for cloud VMs
//!
//! This is the main CLI entry point for swarm-deploy.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use swarm_deploy::config::{ClusterSpec, ConfigParser, DeploymentConfig};
use swarm_deploy::error::{DeployError, Result};
use swarm_deploy::provider::{
    GcloudProvider, MemoryProvider, Providers, SecretChannel, SecretOptions,
};
use swarm_deploy::swarm::node::{node_name, zone_for};
use swarm_deploy::swarm::probe::{await_ready, ReadinessProbe, TcpProbe, DEFAULT_PROBE_PORT};
use swarm_deploy::swarm::script::{render, ScriptParams};
use swarm_deploy::swarm::{NodeOutput, SwarmOrchestrator};
use tracing_subscriber::EnvFilter;

/// Private range the dry-run provider allocates node addresses from
const DRY_RUN_SUBNET: &str = "10.154.0.0/20";

/// swarm-deploy - Docker Swarm bootstrap
#[derive(Parser)]
#[command(name = "swarm-deploy")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Bring up a Docker Swarm on cloud VMs", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the swarm
    Up {
        /// Deployment file
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Plan against an in-memory provider instead of the cloud
        #[arg(long)]
        dry_run: bool,
        /// Print outputs as JSON
        #[arg(long)]
        json: bool,
        /// Override the number of nodes
        #[arg(long)]
        instance_count: Option<u32>,
        /// Override the region
        #[arg(long)]
        region: Option<String>,
    },

    /// Print a node startup script
    Render {
        /// Node role
        #[arg(long, value_enum)]
        role: RoleArg,
        /// Deployment file
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Manager private address, required for workers
        #[arg(long)]
        manager_address: Option<String>,
    },

    /// Wait until an address accepts TCP connections
    Probe {
        /// Address to probe
        address: String,
        /// Port to probe
        #[arg(short, long, default_value_t = DEFAULT_PROBE_PORT)]
        port: u16,
        /// Seconds between attempts
        #[arg(short, long, default_value = "10")]
        interval: u64,
        /// Attempt budget
        #[arg(short, long, default_value = "30")]
        attempts: u32,
    },

    /// Validate a deployment file and show the plan
    Validate {
        /// Deployment file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Manager,
    Worker,
}

fn load_config(file: Option<PathBuf>) -> Result<DeploymentConfig> {
    let path = file.or_else(ConfigParser::discover).ok_or_else(|| {
        DeployError::InvalidConfig(
            "no deployment file found (looked for swarm.yaml, swarm-deploy.yaml)".to_string(),
        )
    })?;

    tracing::debug!("Using deployment file {}", path.display());
    ConfigParser::parse_file(&path)
}

fn print_outputs(outputs: &[NodeOutput], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outputs)?);
        return Ok(());
    }

    for output in outputs {
        println!("instance-{}-name: {}", output.index, output.name);
        println!(
            "instance-{}-external_ip: {}",
            output.index,
            output.external_address.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn dry_run_providers(spec: &ClusterSpec) -> Result<(Providers, Arc<dyn ReadinessProbe>)> {
    let provider = Arc::new(MemoryProvider::new(DRY_RUN_SUBNET)?.probe_budget(
        spec.probe.max_attempts,
        spec.probe.poll_interval,
    ));

    // A user-managed secret is assumed to exist already
    if spec.secret_user_managed {
        provider
            .create(&spec.secret_name, &SecretOptions::default())
            .await?;
    }

    let probe: Arc<dyn ReadinessProbe> = provider.clone();
    Ok((Providers::from_backend(provider), probe))
}

fn cloud_providers(
    config: &DeploymentConfig,
    spec: &ClusterSpec,
) -> (Providers, Arc<dyn ReadinessProbe>) {
    let backend = Arc::new(GcloudProvider::new(
        config.provider.gcloud_binary.clone(),
        config.provider.project.clone(),
    ));
    let probe: Arc<dyn ReadinessProbe> = Arc::new(TcpProbe::new(spec.probe.clone()));
    (Providers::from_backend(backend), probe)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Up {
            file,
            dry_run,
            json,
            instance_count,
            region,
        } => {
            let mut config = load_config(file)?;
            if let Some(count) = instance_count {
                config.instance_count = count;
            }
            if let Some(region) = region {
                config.region = region;
            }
            let spec = config.resolve()?;

            let (providers, probe) = if dry_run {
                dry_run_providers(&spec).await?
            } else {
                cloud_providers(&config, &spec)
            };

            let orchestrator = SwarmOrchestrator::new(spec, providers, probe);
            match orchestrator.run().await {
                Ok(deployment) => print_outputs(&deployment.outputs(), json)?,
                Err(failure) => {
                    eprintln!("Error: {}", failure);
                    if !failure.created.is_empty() {
                        eprintln!("\nThe following instances were created and left in place:");
                        for output in &failure.created {
                            eprintln!("    {}", output.name);
                        }
                    }
                    std::process::exit(1);
                }
            }
        }

        Commands::Render {
            role,
            file,
            manager_address,
        } => {
            let spec = load_config(file)?.resolve()?;
            let params = match role {
                RoleArg::Manager => ScriptParams::manager(
                    &spec.secret_name,
                    spec.secret_user_managed,
                    spec.local_users(),
                )
                .address_pool(spec.address_pool.clone()),
                RoleArg::Worker => ScriptParams::worker(
                    &spec.secret_name,
                    manager_address.as_deref().unwrap_or_default(),
                    spec.local_users(),
                ),
            };

            let script = render(&params)?;
            print!("{}", script.text());
        }

        Commands::Probe {
            address,
            port,
            interval,
            attempts,
        } => {
            let outcome = await_ready(&address, port, Duration::from_secs(interval), attempts).await;
            if !outcome.is_ready() {
                return Err(DeployError::ReadinessTimeout {
                    address,
                    port,
                    attempts: outcome.attempts,
                    elapsed: outcome.elapsed,
                });
            }
            println!(
                "{}:{} accepted a connection after {} attempts",
                address, port, outcome.attempts
            );
        }

        Commands::Validate { file } => {
            let config = load_config(file)?;
            let spec = config.resolve()?;

            print!("{}", serde_yaml::to_string(&config)?);
            println!("\nPlan:");
            println!("{:<32} {:<10} {:<20}", "NAME", "ROLE", "ZONE");
            for index in 0..spec.instance_count as usize {
                let role = if index == 0 { "manager" } else { "worker" };
                println!(
                    "{:<32} {:<10} {:<20}",
                    node_name(&spec.name, index),
                    role,
                    zone_for(index, &spec.zones).unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}
