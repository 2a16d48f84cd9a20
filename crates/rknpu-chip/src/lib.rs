//! Silicon model for Rockchip RKNPU (RK3568 / RK3588).
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the silicon: per-core register offsets, interrupt status
//! normalisation, the task descriptor layout, per-SoC configuration tables
//! and the frequency/voltage operating points.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | Per-core register map, amount counters, status normalisation |
//! | [`task`] | 40-byte packed task descriptor |
//! | [`soc`] | `SocConfig` tables, core-mask bits |
//! | [`opp`] | Operating-point table, CRU/SCMI threshold, frequency limits |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod opp;
pub mod regs;
pub mod soc;
pub mod task;

pub use soc::SocConfig;
pub use task::{Task, TASK_SIZE};
