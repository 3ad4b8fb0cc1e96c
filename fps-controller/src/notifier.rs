//! # notifier
//!
//! Single per-process fan-out from the bus channels to the reply
//! listeners. One reader task per channel; all listeners see every frame
//! and their completions are gathered before the next frame is fetched
//! from that channel (back-pressure per channel, parallel across
//! channels).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fps_types::Frame;

use crate::channel::BusChannel;
use crate::error::FpsError;

/// Receives every frame from every registered channel.
#[async_trait]
pub trait FrameListener: Send + Sync {
    /// `channel` is the index the channel was registered under; the
    /// registry uses it to learn which wire each positioner lives on.
    async fn on_frame(&self, channel: usize, frame: Frame);

    /// The channel's receive side failed and will produce no more frames.
    async fn on_channel_error(&self, channel: usize, error: FpsError) {
        let _ = (channel, error);
    }
}

#[derive(Default)]
pub struct Notifier {
    listeners: Arc<RwLock<Vec<Arc<dyn FrameListener>>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_listener(&self, listener: Arc<dyn FrameListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Register a channel and start its reader task.
    pub fn add_channel(&self, index: usize, channel: Arc<dyn BusChannel>) {
        let listeners = self.listeners.clone();
        let name = channel.name();
        let task = tokio::spawn(async move {
            debug!("notifier: monitoring {name}");
            loop {
                match channel.receive().await {
                    Ok(frame) => {
                        let listeners = listeners.read().await;
                        for listener in listeners.iter() {
                            listener.on_frame(index, frame).await;
                        }
                    }
                    Err(error) => {
                        warn!("notifier: {name} receive failed: {error}");
                        let listeners = listeners.read().await;
                        for listener in listeners.iter() {
                            listener
                                .on_channel_error(index, FpsError::Bus(error.to_string()))
                                .await;
                        }
                        break;
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
    }

    /// Cancel all per-channel tasks and await their termination.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        info!("notifier: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_bus::VirtualBus;
    use fps_types::Identifier;
    use tokio::sync::mpsc;

    struct Recorder {
        tx: mpsc::UnboundedSender<(usize, Frame)>,
    }

    #[async_trait]
    impl FrameListener for Recorder {
        async fn on_frame(&self, channel: usize, frame: Frame) {
            let _ = self.tx.send((channel, frame));
        }
    }

    #[tokio::test]
    async fn fans_frames_to_all_listeners() {
        let bus = VirtualBus::new();
        let controller_side = Arc::new(bus.channel());
        let device_side = bus.channel();

        let notifier = Notifier::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        notifier.add_listener(Arc::new(Recorder { tx: tx_a })).await;
        notifier.add_listener(Arc::new(Recorder { tx: tx_b })).await;
        notifier.add_channel(0, controller_side);

        let frame = Frame::new(Identifier::new(7, 3, 20).unwrap(), &[1]).unwrap();
        device_side.send(frame).await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap(), (0, frame));
        assert_eq!(rx_b.recv().await.unwrap(), (0, frame));

        notifier.shutdown().await;
    }
}
