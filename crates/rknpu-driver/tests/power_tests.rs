//! Power reference counting, rail sequencing and the deferred power-off.

mod common;

use std::thread;
use std::time::Duration;

use common::{device, device_with, eventually, quick_config, tasks};
use rknpu_driver::prelude::*;
use rknpu_driver::sim::SimEvent;

fn rail_events(sim: &SimulatedNpu) -> Vec<SimEvent> {
    sim.events()
        .snapshot()
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                SimEvent::RegulatorOn(_)
                    | SimEvent::RegulatorOff(_)
                    | SimEvent::ClockOn(_)
                    | SimEvent::ClockOff(_)
                    | SimEvent::DomainOn(_)
                    | SimEvent::DomainOff(_)
            )
        })
        .collect()
}

#[test]
fn rails_come_up_in_order_and_go_down_in_reverse() {
    let (npu, sim) = device(SocConfig::RK3568, SimOptions::default());
    sim.events().clear();

    npu.action(Action::PowerOn).unwrap();
    assert!(sim.is_powered());
    assert_eq!(
        rail_events(&sim),
        vec![
            SimEvent::RegulatorOn("vdd"),
            SimEvent::RegulatorOn("mem"),
            SimEvent::ClockOn("clk_npu"),
            SimEvent::ClockOn("aclk"),
            SimEvent::DomainOn("npu0".into()),
        ]
    );

    sim.events().clear();
    npu.action(Action::PowerOff).unwrap();
    assert!(!sim.is_powered());
    assert_eq!(
        rail_events(&sim),
        vec![
            SimEvent::DomainOff("npu0".into()),
            SimEvent::ClockOff("aclk"),
            SimEvent::ClockOff("clk_npu"),
            SimEvent::RegulatorOff("mem"),
            SimEvent::RegulatorOff("vdd"),
        ]
    );
}

#[test]
fn only_the_first_and_last_reference_touch_the_rails() {
    let (npu, sim) = device(SocConfig::RK3568, SimOptions::default());
    npu.action(Action::PowerOn).unwrap();
    npu.action(Action::PowerOn).unwrap();
    assert_eq!(npu.power().refcount(), 2);
    assert_eq!(npu.power().power_cycles(), 1);

    npu.action(Action::PowerOff).unwrap();
    assert!(sim.is_powered());
    npu.action(Action::PowerOff).unwrap();
    assert!(!sim.is_powered());
    assert_eq!(npu.power().refcount(), 0);

    let err = npu.action(Action::PowerOff).unwrap_err();
    assert!(matches!(err, NpuError::Unavailable { .. }));
    assert_eq!(npu.power().refcount(), 0);
}

#[test]
fn last_release_is_debounced() {
    let config = quick_config().with_power_put_delay(Duration::from_millis(60));
    let (npu, sim) = device_with(SocConfig::RK3568, config, SimOptions::default());

    npu.action(Action::PowerOn).unwrap();
    npu.action(Action::PowerOff).unwrap();
    assert!(npu.power().power_off_pending());
    assert!(sim.is_powered());

    assert!(eventually(Duration::from_secs(2), || !sim.is_powered()));
    assert_eq!(npu.power().refcount(), 0);
    assert!(!npu.power().power_off_pending());
}

#[test]
fn reacquire_inside_the_window_keeps_power() {
    let config = quick_config().with_power_put_delay(Duration::from_millis(60));
    let (npu, sim) = device_with(SocConfig::RK3568, config, SimOptions::default());

    npu.action(Action::PowerOn).unwrap();
    npu.action(Action::PowerOff).unwrap();
    npu.submit(SubmitArgs::pc(0, 1).with_task_buffer(tasks(1)))
        .unwrap();
    npu.action(Action::PowerOn).unwrap();
    thread::sleep(Duration::from_millis(120));
    assert!(sim.is_powered());

    npu.action(Action::PowerOff).unwrap();
    assert!(eventually(Duration::from_secs(2), || !sim.is_powered()));
    assert_eq!(npu.power().power_cycles(), 1);
}

#[test]
fn immediate_release_powers_off_at_once() {
    let config = quick_config().with_power_put_delay(Duration::from_secs(30));
    let (npu, sim) = device_with(SocConfig::RK3568, config, SimOptions::default());
    let power = npu.power();

    let a = power.acquire().unwrap();
    let b = power.acquire().unwrap();
    a.release_now().unwrap();
    assert!(sim.is_powered());
    assert_eq!(power.refcount(), 1);

    b.release_now().unwrap();
    assert!(!sim.is_powered());
    assert!(!power.power_off_pending());
    assert_eq!(power.refcount(), 0);
}

#[test]
fn pending_timer_never_takes_a_live_reference() {
    let config = quick_config().with_power_put_delay(Duration::from_millis(50));
    let (npu, sim) = device_with(SocConfig::RK3568, config, SimOptions::default());
    let power = npu.power();

    drop(power.acquire().unwrap());
    assert!(power.power_off_pending());
    let b = power.acquire().unwrap();
    b.release_now().unwrap();
    assert!(sim.is_powered());

    let c = power.acquire().unwrap();
    thread::sleep(Duration::from_millis(150));
    assert!(sim.is_powered());
    assert_eq!(power.refcount(), 1);

    drop(c);
    assert!(eventually(Duration::from_secs(2), || !sim.is_powered()));
    assert_eq!(power.refcount(), 0);
    assert_eq!(power.power_cycles(), 1);
}

#[test]
fn failed_clock_rolls_back_the_supplies() {
    let (npu, sim) = device(
        SocConfig::RK3568,
        SimOptions {
            fail_clock: true,
            ..SimOptions::default()
        },
    );
    npu.action(Action::PowerOn).unwrap_err();
    assert_eq!(npu.power().refcount(), 0);
    assert!(!sim.vdd().is_enabled());
    assert!(!sim.mem().is_enabled());
    assert!(!sim.cru_clock().is_enabled());
}

#[test]
fn failed_power_domain_rolls_back_everything() {
    let (npu, sim) = device(
        SocConfig::RK3588,
        SimOptions {
            power_domains: 3,
            fail_power_domain: true,
            ..SimOptions::default()
        },
    );
    let err = npu
        .submit(SubmitArgs::pc(0, 1).with_task_buffer(tasks(1)))
        .unwrap_err();
    assert!(matches!(err, NpuError::HardwareFault { .. }));
    assert_eq!(sim.total_commits(), 0);
    assert!(!sim.vdd().is_enabled());
    assert!(!sim.cru_clock().is_enabled());
    assert!(sim.power_domains().iter().all(|d| !d.is_on()));
}

#[test]
fn busy_translation_blocks_power_off_until_idle() {
    let (npu, sim) = device(SocConfig::RK3568, SimOptions::default());
    npu.action(Action::PowerOn).unwrap();
    sim.address_domain().set_stuck(true);

    npu.action(Action::PowerOff).unwrap();
    thread::sleep(Duration::from_millis(60));
    assert!(sim.is_powered());

    sim.address_domain().set_stuck(false);
    assert!(eventually(Duration::from_secs(2), || !sim.is_powered()));
    assert_eq!(npu.power().refcount(), 0);
}

#[test]
fn dropping_the_device_fires_a_pending_power_off() {
    let config = quick_config().with_power_put_delay(Duration::from_secs(30));
    let (npu, sim) = device_with(SocConfig::RK3568, config, SimOptions::default());
    npu.action(Action::PowerOn).unwrap();
    npu.action(Action::PowerOff).unwrap();
    assert!(sim.is_powered());

    drop(npu);
    assert!(!sim.is_powered());
}

#[test]
fn load_sample_counts_powered_time() {
    let (npu, _sim) = device(SocConfig::RK3568, SimOptions::default());
    let _ = npu.power().sample_load();
    npu.action(Action::PowerOn).unwrap();
    thread::sleep(Duration::from_millis(20));
    let (busy, total) = npu.power().sample_load();
    assert!(busy >= Duration::from_millis(15), "{busy:?}");
    assert!(busy <= total);

    npu.action(Action::PowerOff).unwrap();
    let _ = npu.power().sample_load();
    thread::sleep(Duration::from_millis(10));
    let (busy, _) = npu.power().sample_load();
    assert!(busy < Duration::from_millis(5), "{busy:?}");
}
