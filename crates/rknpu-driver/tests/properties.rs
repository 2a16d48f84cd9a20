//! Property tests: task splitting, power reference nesting and
//! voltage/rate ordering.

mod common;

use std::time::Duration;

use common::{device, device_with, eventually, quick_config};
use proptest::prelude::*;
use rknpu_chip::opp::{self, MHZ};
use rknpu_chip::soc::MAX_SUBCORE_TASKS;
use rknpu_driver::prelude::*;
use rknpu_driver::sim::SimEvent;
use rknpu_driver::{Regulator, SubcoreTask};

proptest! {
    #[test]
    fn split_covers_the_range_evenly(start in 0u32..100_000, count in 0u32..10_000, cores in 1usize..=3) {
        let table = SubcoreTask::split(start, count, cores);
        let base = if cores == 3 { 2 } else { 0 };
        let used = &table[base..base + cores];

        let mut next = start;
        for slot in used {
            prop_assert_eq!(slot.task_start, next);
            next += slot.task_number;
        }
        prop_assert_eq!(next, start + count);

        let max = used.iter().map(|s| s.task_number).max().unwrap_or(0);
        let min = used.iter().map(|s| s.task_number).min().unwrap_or(0);
        prop_assert!(max - min <= 1);

        for (i, slot) in table.iter().enumerate().take(MAX_SUBCORE_TASKS) {
            if i < base || i >= base + cores {
                prop_assert_eq!(*slot, SubcoreTask::default());
            }
        }
    }
}

/// One step against the power controller.
#[derive(Debug, Clone, Copy)]
enum PowerStep {
    Acquire,
    /// Drop the held reference at this index (modulo the held count).
    Deferred(usize),
    /// Same, without the debounce delay.
    Immediate(usize),
}

fn power_step() -> impl Strategy<Value = PowerStep> {
    prop_oneof![
        2 => Just(PowerStep::Acquire),
        1 => (0usize..8).prop_map(PowerStep::Deferred),
        1 => (0usize..8).prop_map(PowerStep::Immediate),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn references_nest_and_end_unpowered(steps in prop::collection::vec(power_step(), 1..40)) {
        let config = quick_config().with_power_put_delay(Duration::from_millis(3));
        let (npu, sim) = device_with(SocConfig::RK3568, config, SimOptions::default());
        let power = npu.power();
        let mut held = Vec::new();

        for step in steps {
            match step {
                PowerStep::Acquire => held.push(power.acquire().unwrap()),
                PowerStep::Deferred(i) if !held.is_empty() => {
                    drop(held.swap_remove(i % held.len()));
                }
                PowerStep::Immediate(i) if !held.is_empty() => {
                    held.swap_remove(i % held.len()).release_now().unwrap();
                }
                _ => {}
            }
            if !held.is_empty() {
                prop_assert!(sim.is_powered());
                prop_assert!(power.refcount() >= u32::try_from(held.len()).unwrap());
            }
        }

        for (i, r) in held.into_iter().enumerate() {
            if i % 2 == 0 {
                drop(r);
            } else {
                r.release_now().unwrap();
            }
        }
        prop_assert!(eventually(Duration::from_secs(2), || !sim.is_powered()));
        prop_assert_eq!(power.refcount(), 0);
        prop_assert!(!power.power_off_pending());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn supply_never_lags_the_clock(targets in prop::collection::vec(1u64..=11, 1..6)) {
        let (npu, sim) = device(SocConfig::RK3588, SimOptions::default());
        let mut volt = sim.vdd().voltage();

        for t in &targets {
            let got = npu.frequency().set_target(t * 100 * MHZ).unwrap();
            prop_assert!(got <= 1000 * MHZ);
        }

        for event in sim.events().snapshot() {
            match event {
                SimEvent::Voltage { name: "vdd", microvolt } => volt = microvolt,
                SimEvent::Rate { hz, .. } => {
                    prop_assert!(volt >= opp::voltage_for_freq(hz), "{} MHz at {volt} uV", hz / MHZ);
                }
                _ => {}
            }
        }
    }
}
