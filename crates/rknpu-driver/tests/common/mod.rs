//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rknpu_driver::prelude::*;

/// Interrupt mask every fixture task expects.
pub const TASK_INT_MASK: u32 = 0x300;

/// `n` tasks whose register-command streams sit 0x100 bytes apart.
pub fn tasks(n: u32) -> Arc<HostBuffer> {
    let tasks: Vec<Task> = (0..n)
        .map(|i| Task {
            int_mask: TASK_INT_MASK,
            regcfg_amount: 108,
            regcmd_addr: 0x2000_0000 + u64::from(i) * 0x100,
            ..Task::default()
        })
        .collect();
    Arc::new(HostBuffer::from_tasks(&tasks, 0x1000_0000))
}

/// Configuration with short settle times, immediate power-off and no
/// governor thread.
pub fn quick_config() -> DriverConfig {
    DriverConfig {
        abort_settle: Duration::from_millis(5),
        reset_drain_timeout: Duration::from_millis(20),
        devfreq_monitor: false,
        ..DriverConfig::default()
    }
    .with_power_put_delay(Duration::ZERO)
}

/// Simulated device with `options`.
pub fn device(soc: SocConfig, options: SimOptions) -> (NpuDevice, SimulatedNpu) {
    NpuDevice::simulated(soc, quick_config(), options).unwrap()
}

/// Simulated device with a custom configuration.
pub fn device_with(soc: SocConfig, config: DriverConfig, options: SimOptions) -> (NpuDevice, SimulatedNpu) {
    NpuDevice::simulated(soc, config, options).unwrap()
}

/// Poll `cond` until it holds or `within` elapses.
pub fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}
