//! Control actions against the simulated NPU.

mod common;

use common::{device, device_with, quick_config, tasks};
use rknpu_chip::opp::MHZ;
use rknpu_chip::regs;
use rknpu_driver::prelude::*;
use rknpu_driver::{Clock, Regulator, SubcoreTask};
use rknpu_driver::sim::{DT_RD_PER_TASK, DT_WR_PER_TASK, SIM_VERSION, SIM_VERSION_NUM, WT_RD_PER_TASK};

#[test]
fn versions() {
    let (npu, _sim) = device(SocConfig::RK3588, SimOptions::default());
    assert_eq!(
        npu.action(Action::HwVersion).unwrap(),
        u64::from(SIM_VERSION) + u64::from(SIM_VERSION_NUM & 0xffff)
    );
    assert_eq!(npu.action(Action::DrvVersion).unwrap(), 908);
}

#[test]
fn register_actions_power_the_device_only_while_running() {
    let (npu, sim) = device(SocConfig::RK3568, SimOptions::default());
    npu.action(Action::HwVersion).unwrap();
    assert_eq!(npu.power().power_cycles(), 1);
    assert!(!sim.is_powered());

    npu.action(Action::GetFreq).unwrap();
    npu.action(Action::IommuEnabled).unwrap();
    assert_eq!(npu.power().power_cycles(), 1);
}

#[test]
fn direct_frequency_and_voltage() {
    let (npu, sim) = device(SocConfig::RK3588, SimOptions::default());
    assert_eq!(npu.action(Action::GetFreq).unwrap(), 600 * MHZ);

    assert_eq!(npu.action(Action::SetFreq(800 * MHZ)).unwrap(), 800 * MHZ);
    assert_eq!(sim.cru_clock().rate(), 800 * MHZ);
    assert_eq!(npu.action(Action::GetFreq).unwrap(), 800 * MHZ);

    assert_eq!(npu.action(Action::SetFreq(2000 * MHZ)).unwrap(), 1000 * MHZ);

    assert_eq!(npu.action(Action::SetVolt(900_000)).unwrap(), 900_000);
    assert_eq!(sim.vdd().voltage(), 900_000);
    assert_eq!(npu.action(Action::GetVolt).unwrap(), 900_000);
}

#[test]
fn bandwidth_registers() {
    let (npu, sim) = device(SocConfig::RK3568, SimOptions::default());
    npu.action(Action::SetBwPriority(3)).unwrap();
    npu.action(Action::SetBwExpect(0x40)).unwrap();
    npu.action(Action::SetBwTw(0x80)).unwrap();
    assert_eq!(npu.action(Action::GetBwPriority).unwrap(), 3);
    assert_eq!(npu.action(Action::GetBwExpect).unwrap(), 0x40);
    assert_eq!(npu.action(Action::GetBwTw).unwrap(), 0x80);
    assert!(sim.bw_window().is_some());

    let (npu, _sim) = device(SocConfig::RK3588, SimOptions::default());
    let err = npu.action(Action::GetBwPriority).unwrap_err();
    assert!(matches!(err, NpuError::Unavailable { .. }));
}

#[test]
fn amount_counters_on_a_single_core_part() {
    let (npu, _sim) = device(SocConfig::RK3568, SimOptions::default());
    npu.submit(SubmitArgs::pc(0, 4).with_task_buffer(tasks(4)))
        .unwrap();

    let wr = u64::from(4 * DT_WR_PER_TASK);
    let rd = u64::from(4 * DT_RD_PER_TASK);
    let wt = u64::from(4 * WT_RD_PER_TASK);
    assert_eq!(npu.action(Action::GetDtWrAmount).unwrap(), wr);
    assert_eq!(npu.action(Action::GetDtRdAmount).unwrap(), rd);
    assert_eq!(npu.action(Action::GetWtRdAmount).unwrap(), wt);
    assert_eq!(npu.action(Action::GetTotalRwAmount).unwrap(), wr + rd + wt);

    npu.action(Action::ClearTotalRwAmount).unwrap();
    assert_eq!(npu.action(Action::GetTotalRwAmount).unwrap(), 0);
}

#[test]
fn amount_counters_sum_top_and_core_blocks_and_scale() {
    let (npu, sim) = device(SocConfig::RK3588, SimOptions::default());
    npu.submit(
        SubmitArgs::pc(0, 4)
            .with_core_mask(core_mask::CORE0)
            .with_subcore_tasks(SubcoreTask::split(0, 4, 1))
            .with_task_buffer(tasks(4)),
    )
    .unwrap();

    // Top block plus core 0's own block, times the SoC scale of 2.
    assert_eq!(
        npu.action(Action::GetDtWrAmount).unwrap(),
        u64::from(4 * DT_WR_PER_TASK) * 2 * 2
    );

    let pc_data_addr = sim.core(0).unwrap().registers().get(regs::PC_DATA_ADDR);
    assert_ne!(pc_data_addr, regs::PC_DATA_ADDR_SLAVE_MODE);
    npu.action(Action::ClearTotalRwAmount).unwrap();
    assert_eq!(npu.action(Action::GetTotalRwAmount).unwrap(), 0);
    assert_eq!(
        sim.core(0).unwrap().registers().get(regs::PC_DATA_ADDR),
        pc_data_addr
    );
}

#[test]
fn translation_flag() {
    let (npu, _sim) = device(SocConfig::RK3588, SimOptions::default());
    assert_eq!(npu.action(Action::IommuEnabled).unwrap(), 1);

    let (npu, _sim) = device(
        SocConfig::RK3588,
        SimOptions {
            translation: false,
            ..SimOptions::default()
        },
    );
    assert_eq!(npu.action(Action::IommuEnabled).unwrap(), 0);
}

#[test]
fn domain_switch() {
    let (npu, sim) = device(
        SocConfig::RK3588,
        SimOptions {
            reject_domain: Some(5),
            ..SimOptions::default()
        },
    );
    assert_eq!(npu.action(Action::GetDomainId).unwrap(), 0);
    assert_eq!(npu.action(Action::SetDomainId(3)).unwrap(), 3);
    assert_eq!(npu.action(Action::GetDomainId).unwrap(), 3);
    assert_eq!(sim.address_domain().holders(), 0);

    let err = npu.action(Action::SetDomainId(5)).unwrap_err();
    assert!(matches!(err, NpuError::DomainError { .. }));
    assert_eq!(npu.action(Action::GetDomainId).unwrap(), 3);
}

#[test]
fn reset_pulses_the_lines() {
    let (npu, sim) = device(SocConfig::RK3588, SimOptions::default());
    assert_eq!(npu.action(Action::Reset).unwrap(), 0);
    assert_eq!(sim.reset_pulses(), 1);
    assert_eq!(npu.scheduler().reset_count(), 1);
}

#[test]
fn bypassed_reset_does_nothing() {
    let (npu, sim) = device_with(
        SocConfig::RK3588,
        quick_config().with_bypass_soft_reset(true),
        SimOptions::default(),
    );
    npu.action(Action::Reset).unwrap();
    assert_eq!(sim.reset_pulses(), 0);
}
