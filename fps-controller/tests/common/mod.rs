//! Shared setup for the integration tests: a virtual array on an
//! in-process bus, with timings tightened so discovery windows and
//! pollers run at test speed.

use std::sync::Arc;

use fps_controller::channel::BusChannel;
use fps_controller::testing::VirtualFps;
use fps_controller::virtual_bus::VirtualBus;
use fps_controller::{Fps, FpsConfig};

pub fn test_config() -> FpsConfig {
    let mut config = FpsConfig::default();
    config.fps.initialise_timeouts = 0.1;
    config.fps.status_poller_delay = 0.2;
    config.fps.position_poller_delay = 0.2;
    config
}

pub fn virtual_array(ids: &[u16], config: FpsConfig) -> (Arc<Fps>, VirtualFps) {
    let bus = VirtualBus::new();
    let vfps = VirtualFps::new(&bus, ids.iter().copied(), config.positioner.motor_steps);
    let channel: Arc<dyn BusChannel> = Arc::new(bus.channel());
    let fps = Fps::with_channels(config, vec![channel]);
    (fps, vfps)
}
