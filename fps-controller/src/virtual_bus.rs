//! # virtual_bus
//!
//! In-process bus for tests and the simulator. Every frame sent on one
//! attached channel is delivered to all *other* attached channels, never
//! back to the sender — the same visibility a real multi-drop bus gives
//! its nodes.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use fps_types::Frame;

use crate::channel::BusChannel;
use crate::error::{FpsError, Result};

#[derive(Default)]
struct Hub {
    taps: Vec<(usize, mpsc::UnboundedSender<Frame>)>,
    next_id: usize,
}

/// The shared medium. Clone it to hand the same bus to several parties.
#[derive(Clone, Default)]
pub struct VirtualBus {
    hub: Arc<StdMutex<Hub>>,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new channel to the bus.
    pub fn channel(&self) -> VirtualChannel {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut hub = self.hub.lock().unwrap();
            let id = hub.next_id;
            hub.next_id += 1;
            hub.taps.push((id, tx));
            id
        };
        VirtualChannel {
            hub: self.hub.clone(),
            id,
            rx: Mutex::new(rx),
        }
    }
}

/// One attachment point on a [`VirtualBus`].
pub struct VirtualChannel {
    hub: Arc<StdMutex<Hub>>,
    id: usize,
    rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
}

#[async_trait]
impl BusChannel for VirtualChannel {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        let mut hub = self.hub.lock().unwrap();
        // Detached receivers are pruned on the way through.
        hub.taps
            .retain(|(id, tx)| *id == self.id || tx.send(frame).is_ok());
        Ok(())
    }

    async fn receive(&self) -> Result<Frame> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| FpsError::Bus("virtual bus detached".into()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut hub = self.hub.lock().unwrap();
        hub.taps.retain(|(id, _)| *id != self.id);
        Ok(())
    }

    fn name(&self) -> String {
        format!("virtual#{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fps_types::Identifier;

    fn frame(code: u8) -> Frame {
        Frame::new(Identifier::new(1, 3, code).unwrap(), &[]).unwrap()
    }

    #[tokio::test]
    async fn delivers_to_all_but_sender() {
        let bus = VirtualBus::new();
        let a = bus.channel();
        let b = bus.channel();
        let c = bus.channel();

        a.send(frame(1)).await.unwrap();

        assert_eq!(b.receive().await.unwrap(), frame(1));
        assert_eq!(c.receive().await.unwrap(), frame(1));

        // The sender must not see its own frame; send something else from
        // b and check a receives only that.
        b.send(frame(2)).await.unwrap();
        assert_eq!(a.receive().await.unwrap(), frame(2));
    }

    #[tokio::test]
    async fn preserves_order_per_sender() {
        let bus = VirtualBus::new();
        let a = bus.channel();
        let b = bus.channel();

        for code in 1..=5 {
            a.send(frame(code)).await.unwrap();
        }
        for code in 1..=5 {
            assert_eq!(b.receive().await.unwrap(), frame(code));
        }
    }

    #[tokio::test]
    async fn shutdown_detaches() {
        let bus = VirtualBus::new();
        let a = bus.channel();
        let b = bus.channel();
        b.shutdown().await.unwrap();
        a.send(frame(1)).await.unwrap();
        assert!(matches!(b.receive().await, Err(FpsError::Bus(_))));
    }
}
