//! gateway.rs — ASCII CAN gateway front end for the virtual array.
//!
//! Accepts TCP connections speaking the `CAN n …` / `M n CED …` line
//! protocol and bridges them onto the in-process virtual bus, so a
//! controller configured with a `cannet` profile can run against the
//! simulator unmodified. Management commands are acknowledged with
//! `R OK`; only extended data frames for the served channel are bridged.

use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fps_controller::channel::{encode_frame_line, parse_frame_line, BusChannel};
use fps_controller::virtual_bus::VirtualBus;

pub struct GatewayConfig {
    pub channel_number: u8,
    /// Add 0–500 µs of random latency per bridged reply, mimicking
    /// gateway scheduling jitter.
    pub jitter: bool,
}

pub async fn serve(listener: TcpListener, bus: VirtualBus, config: GatewayConfig) -> Result<()> {
    info!(
        "gateway: listening on {} (CAN channel {})",
        listener.local_addr()?,
        config.channel_number
    );
    loop {
        let (stream, peer) = listener.accept().await?;
        info!("gateway: controller connected from {peer}");
        let bus = bus.clone();
        let channel_number = config.channel_number;
        let jitter = config.jitter;
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, bus, channel_number, jitter).await {
                warn!("gateway: connection from {peer} ended: {e}");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    bus: VirtualBus,
    channel_number: u8,
    jitter: bool,
) -> Result<()> {
    // One tap per connection: what the controller sends goes onto the
    // bus through it, and — because the bus never echoes a sender its
    // own frames — everything received on it is genuine device traffic.
    let tap = std::sync::Arc::new(bus.channel());
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx_lines, mut rx_lines) = mpsc::unbounded_channel::<String>();

    // Writer: management acknowledgements and bridged frames, in order.
    let writer = tokio::spawn(async move {
        while let Some(line) = rx_lines.recv().await {
            if write_half.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                break;
            }
        }
    });

    // Bus → socket.
    let bridge_tx = tx_lines.clone();
    let bridge = {
        let tap = tap.clone();
        tokio::spawn(async move {
            while let Ok(frame) = tap.receive().await {
                if jitter {
                    let us = rand::thread_rng().gen_range(0..500);
                    tokio::time::sleep(Duration::from_micros(us)).await;
                }
                if bridge_tx.send(encode_frame_line(&frame, channel_number)).is_err() {
                    break;
                }
            }
        })
    };

    // Socket → bus.
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = read_half.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..pos]).trim().to_string();
            if line.is_empty() {
                continue;
            }
            if line.starts_with("CAN ") {
                debug!("gateway: management {line:?}");
                let _ = tx_lines.send("R OK".to_string());
            } else if let Some(frame) = parse_frame_line(&line, channel_number) {
                tap.send(frame).await.ok();
            } else {
                debug!("gateway: ignoring {line:?}");
            }
        }
    }

    writer.abort();
    bridge.abort();
    tap.shutdown().await.ok();
    Ok(())
}
