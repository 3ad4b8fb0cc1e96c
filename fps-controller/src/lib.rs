//! # fps-controller
//!
//! Core runtime for a fibre positioner array: several hundred two-axis
//! robots on a shared multi-drop CAN bus, driven from a single tokio
//! event loop.
//!
//! ## Architecture
//!
//! - [`channel`]: one logical bus channel (ASCII TCP gateway or the
//!   in-process virtual bus); FIFO per channel.
//! - [`notifier`]: fans every received frame out to the listeners, with
//!   per-channel back-pressure.
//! - [`registry`]: the in-flight command table — rolling 8-bit tags,
//!   reply correlation, timeouts, broadcast accumulation, the
//!   per-positioner move lock.
//! - [`command`]: typed payload builders and reply decoders per opcode.
//! - [`positioner`]: the live per-robot model and its status machine.
//! - [`trajectory`]: upload, confirm, start, monitor, abort.
//! - [`fps`]: the array controller façade gluing it all together.
//! - [`poller`]: periodic status/position refresh.
//! - [`testing`]: a virtual array for tests and the simulator.
//!
//! ## Invariants
//!
//! - Frames leave each channel in submission order.
//! - At most one move command per positioner is in flight.
//! - Every in-flight command resolves: completed, failed, or timed out.
//! - A trajectory error always broadcasts STOP_TRAJECTORY before it is
//!   surfaced.

pub mod channel;
pub mod command;
pub mod config;
pub mod error;
pub mod fps;
pub mod notifier;
pub mod poller;
pub mod positioner;
pub mod registry;
pub mod testing;
pub mod trajectory;
pub mod virtual_bus;

pub use channel::{BusChannel, CannetChannel};
pub use command::{Command, Reply};
pub use config::{FpsConfig, SafeMode};
pub use error::{FpsError, Result};
pub use fps::Fps;
pub use notifier::{FrameListener, Notifier};
pub use poller::{Poller, PollerSet};
pub use positioner::{GotoParams, Positioner, PositionerState};
pub use registry::CommandRegistry;
pub use trajectory::{SyncLine, Trajectory};
pub use virtual_bus::{VirtualBus, VirtualChannel};
