//! fps-sim — a hardware-less positioner array.
//!
//! Runs a virtual FPS behind a TCP gateway speaking the ASCII CAN
//! protocol, so the controller (and anything else that talks `cannet`)
//! can be exercised end to end without a focal plate:
//!
//! ```text
//! fps-sim --positioners 10
//! fps --config fps.toml init        # profile pointing at 127.0.0.1:19228
//! ```

mod gateway;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use fps_controller::testing::VirtualFps;
use fps_controller::virtual_bus::VirtualBus;

use gateway::{serve, GatewayConfig};

#[derive(Parser)]
#[command(name = "fps-sim", about = "Virtual positioner array behind an ASCII CAN gateway")]
struct Cli {
    /// Address to listen on for gateway connections.
    #[arg(long, default_value = "0.0.0.0:19228")]
    bind: String,

    /// Gateway CAN channel number served.
    #[arg(long, default_value_t = 1)]
    channel: u8,

    /// Number of positioners, ids 1..=N.
    #[arg(long, default_value_t = 10)]
    positioners: u16,

    /// Motor steps per revolution; must match the controller's
    /// configuration.
    #[arg(long, default_value_t = 1_968_000)]
    motor_steps: u32,

    /// Positioner ids that never answer (comma separated), for timeout
    /// testing.
    #[arg(long, value_delimiter = ',')]
    silent: Vec<u16>,

    /// Disable the per-reply latency jitter.
    #[arg(long)]
    no_jitter: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fps_simulator=info,fps_controller=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let bus = VirtualBus::new();
    let array = VirtualFps::new(&bus, 1..=cli.positioners, cli.motor_steps);
    for pid in &cli.silent {
        array.silence(*pid);
        info!("positioner {pid} silenced");
    }
    info!(
        "virtual array up: {} positioner(s), folded at (0, 180), firmware 10.11.12",
        cli.positioners
    );

    let listener = TcpListener::bind(&cli.bind).await?;
    serve(
        listener,
        bus,
        GatewayConfig { channel_number: cli.channel, jitter: !cli.no_jitter },
    )
    .await
}
