//! `fps` — command-line front end for the array controller.
//!
//! Connects with the configured profile, runs one operation and shuts
//! down. Long-lived supervision belongs to the host system, not this
//! binary.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use fps_controller::positioner::GotoParams;
use fps_controller::{Fps, FpsConfig};

#[derive(Parser)]
#[command(name = "fps", about = "Fibre positioner array controller")]
struct Cli {
    /// Path to the TOML configuration (defaults to $FPS_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Configuration profile to use.
    #[arg(long, global = true)]
    profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover the array and print what was found.
    Init,
    /// Print positioner status as JSON.
    Status {
        /// Restrict to one positioner.
        #[arg(long)]
        positioner: Option<u16>,
    },
    /// Move one positioner to (alpha, beta).
    Goto {
        #[arg(long)]
        positioner: u16,
        #[arg(long)]
        alpha: f64,
        #[arg(long)]
        beta: f64,
        /// Interpret the angles as relative offsets.
        #[arg(long)]
        relative: bool,
        /// Override the motor speed as "alpha_rpm,beta_rpm".
        #[arg(long)]
        speed: Option<String>,
    },
    /// Home (initialise the datums of) one positioner, or all of them.
    Home {
        #[arg(long)]
        positioner: Option<u16>,
    },
}

fn parse_speed(raw: &str) -> anyhow::Result<(u32, u32)> {
    let (alpha, beta) = raw
        .split_once(',')
        .context("speed must be \"alpha_rpm,beta_rpm\"")?;
    let alpha: u32 = alpha.trim().parse().context("bad alpha RPM")?;
    let beta: u32 = beta.trim().parse().context("bad beta RPM")?;
    if alpha >= 3000 || beta >= 3000 {
        bail!("speed must be in the range [0, 3000)");
    }
    Ok((alpha, beta))
}

fn status_json(fps: &Fps, positioner_id: Option<u16>) -> anyhow::Result<serde_json::Value> {
    let mut entries = Vec::new();
    for positioner in fps.positioners() {
        if positioner_id.is_some_and(|pid| pid != positioner.id) {
            continue;
        }
        let (alpha, beta) = positioner.position();
        entries.push(json!({
            "positioner_id": positioner.id,
            "alpha": alpha,
            "beta": beta,
            "firmware": positioner.firmware(),
            "status": format!("{:?}", positioner.status()),
            "state": format!("{:?}", positioner.state()),
            "disabled": positioner.disabled(),
            "last_seen": positioner.last_seen().map(|t| t.to_rfc3339()),
        }));
    }
    if entries.is_empty() {
        bail!("no matching positioners");
    }
    Ok(serde_json::Value::Array(entries))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fps_controller=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => FpsConfig::load(path)?,
        None => FpsConfig::from_env()?,
    };
    if let Some(profile) = cli.profile {
        config.profile = Some(profile);
    }

    let fps = Fps::new(config)?;
    fps.initialise(false).await?;

    let result = run(&fps, cli.command).await;
    fps.shutdown().await?;
    result
}

async fn run(fps: &std::sync::Arc<Fps>, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            info!("{} positioner(s) connected", fps.len());
            for positioner in fps.positioners() {
                let (alpha, beta) = positioner.position();
                info!(
                    "  positioner {:4}  ({alpha:8.3}, {beta:8.3})  firmware {}",
                    positioner.id,
                    positioner.firmware().unwrap_or_else(|| "unknown".into()),
                );
            }
        }
        Commands::Status { positioner } => {
            println!("{}", serde_json::to_string_pretty(&status_json(fps, positioner)?)?);
        }
        Commands::Goto { positioner, alpha, beta, relative, speed } => {
            let params = GotoParams {
                alpha,
                beta,
                relative,
                speed: speed.as_deref().map(parse_speed).transpose()?,
            };
            fps.positioner(positioner)?.goto(params).await?;
            info!("positioner {positioner} arrived");
        }
        Commands::Home { positioner } => match positioner {
            Some(pid) => fps.positioner(pid)?.home().await?,
            None => fps.home().await?,
        },
    }
    Ok(())
}
