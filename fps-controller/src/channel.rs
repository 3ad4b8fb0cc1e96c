//! # channel
//!
//! One logical CAN channel. The controller talks to every transport
//! through [`BusChannel`]; implementations must preserve FIFO order on
//! their own wire relative to `send` submission order.
//!
//! `CannetChannel` drives an ASCII-framed TCP gateway:
//!   - management: `CAN n STOP`, `CAN n INIT STD <rate>`, `CAN n FILTER
//!     CLEAR`, `CAN n FILTER ADD EXT 00000000 00000000`, `CAN n START`
//!   - traffic: `M n CED <id-hex> <b0> … <bk>` in both directions, one
//!     frame per newline-terminated line.
//!
//! Received bytes are accumulated until a newline; frames for other
//! gateway channels, standard-id frames and remote frames are ignored.

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fps_types::Frame;

use crate::error::{FpsError, Result};

// ── Trait ─────────────────────────────────────────────────────────────────────

/// One transport attachment to the positioner bus.
///
/// `send` enqueues onto the per-channel transmit queue; the wire order is
/// the submission order. `receive` yields one frame at a time and is the
/// single consumption point (the notifier).
#[async_trait]
pub trait BusChannel: Send + Sync {
    /// Connect and start the channel.
    async fn open(&self) -> Result<()>;

    /// Queue one frame for transmission.
    async fn send(&self, frame: Frame) -> Result<()>;

    /// Await the next frame from the wire.
    async fn receive(&self) -> Result<Frame>;

    /// Stop bus traffic without dropping the transport.
    async fn close(&self) -> Result<()>;

    /// Stop traffic and tear the transport down.
    async fn shutdown(&self) -> Result<()>;

    /// Human-readable identity for logs.
    fn name(&self) -> String;
}

// ── ASCII line codec ──────────────────────────────────────────────────────────

/// Gateway bitrate table: bit/s to the `INIT STD` argument.
const BITRATES: &[(u32, &str)] = &[
    (5_000, "5"),
    (10_000, "10"),
    (20_000, "20"),
    (50_000, "50"),
    (62_500, "62.5"),
    (83_300, "83.3"),
    (100_000, "100"),
    (125_000, "125"),
    (250_000, "250"),
    (500_000, "500"),
    (800_000, "800"),
    (1_000_000, "1000"),
];

fn bitrate_arg(bitrate: u32) -> Result<&'static str> {
    BITRATES
        .iter()
        .find(|(rate, _)| *rate == bitrate)
        .map(|(_, arg)| *arg)
        .ok_or_else(|| {
            FpsError::Config(format!(
                "invalid bitrate {bitrate}, choose one of {}",
                BITRATES.iter().map(|(r, _)| r.to_string()).collect::<Vec<_>>().join(", ")
            ))
        })
}

/// Render one frame as a gateway transmit line (no terminator).
pub fn encode_frame_line(frame: &Frame, channel: u8) -> String {
    use std::fmt::Write;
    let mut line = format!("M {channel} CED {id:08X}", id = frame.identifier);
    for byte in frame.payload() {
        let _ = write!(line, " {byte:02X}");
    }
    line
}

/// Parse one received gateway line. Returns `None` for anything that is
/// not an extended data frame on `channel` (management responses, other
/// channels, standard or remote frames).
pub fn parse_frame_line(line: &str, channel: u8) -> Option<Frame> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "M" {
        return None;
    }
    if parts.next()?.parse::<u8>().ok()? != channel {
        return None;
    }

    let desc = parts.next()?;
    let mut desc_chars = desc.chars();
    if desc_chars.next()? != 'C' {
        // FD frames are not supported.
        return None;
    }
    let extended = match desc_chars.next()? {
        'E' => true,
        'S' => false,
        _ => return None,
    };
    let remote = match desc_chars.next()? {
        'D' => false,
        'R' => true,
        _ => return None,
    };
    if !extended || remote {
        return None;
    }

    let identifier = u32::from_str_radix(parts.next()?, 16).ok()?;
    if identifier >= 1 << 29 {
        warn!("gateway: identifier {identifier:#x} exceeds 29 bits, dropping");
        return None;
    }

    let mut data = [0u8; 8];
    let mut dlc = 0usize;
    for byte in parts {
        if dlc == 8 {
            warn!("gateway: more than 8 data bytes in line {line:?}, dropping");
            return None;
        }
        data[dlc] = u8::from_str_radix(byte, 16).ok()?;
        dlc += 1;
    }

    Some(Frame { identifier, extended: true, dlc: dlc as u8, data })
}

/// Split complete newline-terminated lines out of the receive buffer.
pub(crate) fn split_lines(buf: &mut BytesMut) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let raw = buf.split_to(pos + 1);
        let line = String::from_utf8_lossy(&raw[..pos]).trim().to_string();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

// ── Cannet channel ────────────────────────────────────────────────────────────

enum TxItem {
    Line(String),
    Frame(Frame),
}

/// TCP connection to an ASCII CAN gateway.
pub struct CannetChannel {
    address: String,
    channel: u8,
    bitrate: Option<u32>,
    tx: Mutex<Option<mpsc::UnboundedSender<TxItem>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl CannetChannel {
    /// `address` is `host:port`; the default gateway port is 19228.
    pub fn new(address: impl Into<String>, channel: u8, bitrate: Option<u32>) -> Self {
        Self {
            address: address.into(),
            channel,
            bitrate,
            tx: Mutex::new(None),
            rx: Mutex::new(None),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    async fn queue(&self, item: TxItem) -> Result<()> {
        let tx = self.tx.lock().await;
        let tx = tx.as_ref().ok_or_else(|| FpsError::Bus("channel is not open".into()))?;
        tx.send(item).map_err(|_| FpsError::Bus("transmit queue closed".into()))
    }
}

#[async_trait]
impl BusChannel for CannetChannel {
    async fn open(&self) -> Result<()> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| FpsError::bus(&format!("connect {}", self.address), e))?;
        info!("cannet: connected to {} (channel {})", self.address, self.channel);

        let (mut read_half, mut write_half) = stream.into_split();

        let (tx_items, mut rx_items) = mpsc::unbounded_channel::<TxItem>();
        let (tx_frames, rx_frames) = mpsc::unbounded_channel::<Frame>();

        let channel = self.channel;
        let writer = tokio::spawn(async move {
            while let Some(item) = rx_items.recv().await {
                let line = match item {
                    TxItem::Line(line) => line,
                    TxItem::Frame(frame) => encode_frame_line(&frame, channel),
                };
                debug!("cannet tx: {line}");
                if let Err(e) = write_half.write_all(format!("{line}\n").as_bytes()).await {
                    warn!("cannet: write failed: {e}");
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(4096);
            let mut chunk = [0u8; 1024];
            loop {
                match read_half.read(&mut chunk).await {
                    Ok(0) => {
                        warn!("cannet: gateway closed the connection");
                        break;
                    }
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        for line in split_lines(&mut buf) {
                            match parse_frame_line(&line, channel) {
                                Some(frame) => {
                                    if tx_frames.send(frame).is_err() {
                                        return;
                                    }
                                }
                                None => debug!("cannet rx: {line}"),
                            }
                        }
                    }
                    Err(e) => {
                        warn!("cannet: read failed: {e}");
                        break;
                    }
                }
            }
            // Dropping tx_frames surfaces the bus error to receive().
        });

        {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(writer);
            tasks.push(reader);
        }
        *self.tx.lock().await = Some(tx_items);
        *self.rx.lock().await = Some(rx_frames);

        if let Some(bitrate) = self.bitrate {
            let rate = bitrate_arg(bitrate)?;
            let n = self.channel;
            self.queue(TxItem::Line(format!("CAN {n} STOP"))).await?;
            self.queue(TxItem::Line(format!("CAN {n} INIT STD {rate}"))).await?;
            self.queue(TxItem::Line(format!("CAN {n} FILTER CLEAR"))).await?;
            self.queue(TxItem::Line(format!("CAN {n} FILTER ADD EXT 00000000 00000000")))
                .await?;
        }
        self.queue(TxItem::Line(format!("CAN {} START", self.channel))).await?;

        Ok(())
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        self.queue(TxItem::Frame(frame)).await
    }

    async fn receive(&self) -> Result<Frame> {
        let mut rx = self.rx.lock().await;
        let rx = rx.as_mut().ok_or_else(|| FpsError::Bus("channel is not open".into()))?;
        rx.recv()
            .await
            .ok_or_else(|| FpsError::Bus(format!("connection to {} lost", self.address)))
    }

    async fn close(&self) -> Result<()> {
        self.queue(TxItem::Line(format!("CAN {} STOP", self.channel))).await
    }

    async fn shutdown(&self) -> Result<()> {
        // Best effort: the gateway may already be gone.
        let _ = self.close().await;
        *self.tx.lock().await = None;
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            task.abort();
        }
        Ok(())
    }

    fn name(&self) -> String {
        format!("cannet://{}#{}", self.address, self.channel)
    }
}
