//! `rknpu`: command-line front end for the RKNPU driver core.
//!
//! Every command runs against the simulated board, so the scheduler,
//! power sequencing and DVFS paths can be exercised without hardware.
//!
//! ```text
//! USAGE:
//!   rknpu socs                         List supported SoC variants
//!   rknpu run   [--soc S] [--tasks N]  Submit jobs and print outcomes
//!   rknpu dvfs  [--soc S] <MHZ>...     Walk the clock through targets
//!   rknpu action [--soc S] <NAME> [V]  Run one control action
//!   rknpu config                       Show the effective configuration
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use rknpu_chip::opp::MHZ;
use rknpu_chip::TASK_SIZE;
use rknpu_driver::prelude::*;
use rknpu_driver::{Fence, Regulator, SubcoreTask};
use tracing_subscriber::EnvFilter;

/// Device address the task buffer is placed at.
const TASK_BUFFER_ADDR: u64 = 0x1000_0000;

#[derive(Parser)]
#[command(name = "rknpu", about = "Rockchip RKNPU driver core (simulated board)", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List supported SoC variants.
    Socs,
    /// Submit jobs to a simulated board and report each outcome.
    Run {
        /// SoC name or compatible string.
        #[arg(long, default_value = "rk3588")]
        soc: String,
        /// Tasks per job. Ignored with --task-file.
        #[arg(long, default_value_t = 8)]
        tasks: u32,
        /// Raw task descriptor array (40 bytes per task).
        #[arg(long)]
        task_file: Option<PathBuf>,
        /// Core mask: 0 = auto, 1/2/4 single core, 3 or 7 split.
        #[arg(long, default_value_t = 0)]
        core_mask: u32,
        /// Number of jobs.
        #[arg(long, default_value_t = 1)]
        jobs: u32,
        /// Submit without blocking and wait on completion fences.
        #[arg(long)]
        nonblock: bool,
        /// Simulated per-chunk latency in milliseconds.
        #[arg(long, default_value_t = 1)]
        latency_ms: u64,
        /// Job timeout in milliseconds.
        #[arg(long, default_value_t = 6000)]
        timeout_ms: u64,
    },
    /// Move the NPU clock through a list of targets.
    Dvfs {
        /// SoC name or compatible string.
        #[arg(long, default_value = "rk3588")]
        soc: String,
        /// Board without the firmware clock.
        #[arg(long)]
        no_scmi: bool,
        /// Targets in MHz.
        #[arg(required = true)]
        targets: Vec<u64>,
    },
    /// Run one control action and print its result.
    Action {
        /// SoC name or compatible string.
        #[arg(long, default_value = "rk3588")]
        soc: String,
        /// Action to run.
        name: ActionName,
        /// Value for set-* actions.
        value: Option<u64>,
    },
    /// Print the configuration after environment overrides.
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionName {
    HwVersion,
    DrvVersion,
    GetFreq,
    SetFreq,
    GetVolt,
    SetVolt,
    Reset,
    GetBwPriority,
    SetBwPriority,
    GetBwExpect,
    SetBwExpect,
    GetBwTw,
    SetBwTw,
    ClearRwAmount,
    GetDtWrAmount,
    GetDtRdAmount,
    GetWtRdAmount,
    GetTotalRwAmount,
    IommuEnabled,
    GetDomainId,
    SetDomainId,
}

impl ActionName {
    fn to_action(self, value: Option<u64>) -> Result<Action> {
        let need = || value.context("this action needs a value");
        let need32 = || -> Result<u32> { Ok(u32::try_from(need()?)?) };
        Ok(match self {
            Self::HwVersion => Action::HwVersion,
            Self::DrvVersion => Action::DrvVersion,
            Self::GetFreq => Action::GetFreq,
            Self::SetFreq => Action::SetFreq(need()?),
            Self::GetVolt => Action::GetVolt,
            Self::SetVolt => Action::SetVolt(need32()?),
            Self::Reset => Action::Reset,
            Self::GetBwPriority => Action::GetBwPriority,
            Self::SetBwPriority => Action::SetBwPriority(need32()?),
            Self::GetBwExpect => Action::GetBwExpect,
            Self::SetBwExpect => Action::SetBwExpect(need32()?),
            Self::GetBwTw => Action::GetBwTw,
            Self::SetBwTw => Action::SetBwTw(need32()?),
            Self::ClearRwAmount => Action::ClearTotalRwAmount,
            Self::GetDtWrAmount => Action::GetDtWrAmount,
            Self::GetDtRdAmount => Action::GetDtRdAmount,
            Self::GetWtRdAmount => Action::GetWtRdAmount,
            Self::GetTotalRwAmount => Action::GetTotalRwAmount,
            Self::IommuEnabled => Action::IommuEnabled,
            Self::GetDomainId => Action::GetDomainId,
            Self::SetDomainId => Action::SetDomainId(i32::try_from(need()?)?),
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Socs => cmd_socs(),
        Cmd::Run {
            soc,
            tasks,
            task_file,
            core_mask,
            jobs,
            nonblock,
            latency_ms,
            timeout_ms,
        } => {
            let sim = SimOptions {
                latency: Duration::from_millis(latency_ms),
                ..SimOptions::default()
            };
            let plan = RunPlan {
                tasks,
                task_file,
                core_mask,
                jobs,
                nonblock,
                timeout: Duration::from_millis(timeout_ms),
            };
            cmd_run(&soc, sim, &plan)?;
        }
        Cmd::Dvfs { soc, no_scmi, targets } => cmd_dvfs(&soc, !no_scmi, &targets)?,
        Cmd::Action { soc, name, value } => cmd_action(&soc, name.to_action(value)?)?,
        Cmd::Config => println!("{:#?}", DriverConfig::from_env()),
    }

    Ok(())
}

fn soc_by_name(name: &str) -> Result<SocConfig> {
    SocConfig::lookup(name)
        .copied()
        .with_context(|| format!("unknown SoC: {name}"))
}

fn open(soc: &str, options: SimOptions) -> Result<(NpuDevice, SimulatedNpu)> {
    let soc = soc_by_name(soc)?;
    let config = DriverConfig::from_env();
    tracing::debug!("simulated {} with {config:?}", soc.name);
    Ok(NpuDevice::simulated(soc, config, options)?)
}

fn cmd_socs() {
    for soc in &SocConfig::ALL {
        println!("{:<8} {}", soc.name, soc.compatible);
        println!("         cores {}  mask {:#x}", soc.core_count, soc.core_mask);
        println!(
            "         max submit {}  amount scale {}",
            soc.max_submit_number, soc.pc_data_amount_scale
        );
        println!(
            "         bw window {}  amount counters {}",
            if soc.bw_priority_addr.is_some() { "yes" } else { "no" },
            match (soc.amount_top, soc.amount_core) {
                (Some(_), Some(_)) => "top + core",
                (Some(_), None) => "top",
                _ => "none",
            }
        );
    }
}

struct RunPlan {
    tasks: u32,
    task_file: Option<PathBuf>,
    core_mask: u32,
    jobs: u32,
    nonblock: bool,
    timeout: Duration,
}

fn task_buffer(plan: &RunPlan) -> Result<(Arc<HostBuffer>, u32)> {
    let Some(path) = &plan.task_file else {
        let tasks: Vec<Task> = (0..plan.tasks)
            .map(|i| Task {
                int_mask: 0x300,
                regcfg_amount: 108,
                regcmd_addr: 0x2000_0000 + u64::from(i) * 0x100,
                ..Task::default()
            })
            .collect();
        return Ok((Arc::new(HostBuffer::from_tasks(&tasks, TASK_BUFFER_ADDR)), plan.tasks));
    };

    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if raw.is_empty() || raw.len() % TASK_SIZE != 0 {
        bail!("{}: {} bytes is not a whole number of tasks", path.display(), raw.len());
    }
    let count = u32::try_from(raw.len() / TASK_SIZE)?;
    Ok((Arc::new(HostBuffer::new(Bytes::from(raw), TASK_BUFFER_ADDR)), count))
}

fn cmd_run(soc: &str, options: SimOptions, plan: &RunPlan) -> Result<()> {
    let (npu, _sim) = open(soc, options)?;
    let (buffer, count) = task_buffer(plan)?;

    let start = Instant::now();
    let mut fences: Vec<(u32, Arc<dyn Fence>)> = Vec::new();
    for i in 0..plan.jobs {
        let mut args = SubmitArgs::pc(0, count)
            .with_core_mask(plan.core_mask)
            .with_timeout(plan.timeout)
            .with_task_buffer(buffer.clone());
        if plan.core_mask != 0 {
            let cores = plan.core_mask.count_ones() as usize;
            args = args.with_subcore_tasks(SubcoreTask::split(0, count, cores));
        }
        if plan.nonblock {
            args = args.with_flags(JobFlags::NONBLOCK | JobFlags::FENCE_OUT);
        }

        let out = npu.submit(args)?;
        match out.fence_out {
            Some(fence) if plan.nonblock => {
                println!("job {i}: queued on mask {:#x}", out.core_mask);
                fences.push((i, fence));
            }
            _ => println!(
                "job {i}: {} tasks on mask {:#x}, hw time {:?}",
                out.task_counter, out.core_mask, out.hw_elapse_time
            ),
        }
    }

    for (i, fence) in fences {
        fence
            .wait(plan.timeout)
            .with_context(|| format!("job {i} did not complete"))?;
        println!("job {i}: done");
    }

    println!("{} jobs in {:?}", plan.jobs, start.elapsed());
    for snap in npu.snapshots() {
        println!(
            "core {}: completed {}  pending {}  outstanding tasks {}",
            snap.core, snap.completed, snap.pending, snap.task_num
        );
    }
    Ok(())
}

fn cmd_dvfs(soc: &str, scmi: bool, targets: &[u64]) -> Result<()> {
    let options = SimOptions {
        scmi_clock: scmi,
        ..SimOptions::default()
    };
    let (npu, sim) = open(soc, options)?;
    let f = npu.frequency();
    println!(
        "start {} MHz at {} uV, scaling max {} MHz",
        f.snapshot().current_freq / MHZ,
        sim.vdd().voltage(),
        f.scaling_max_hz() / MHZ
    );

    for &mhz in targets {
        let got = f.set_target(mhz * MHZ)?;
        let st = f.snapshot();
        println!(
            "{mhz:>5} MHz -> {:>5} MHz  {:>8} uV  [{}]",
            got / MHZ,
            st.current_volt,
            st.source
        );
    }
    Ok(())
}

fn cmd_action(soc: &str, action: Action) -> Result<()> {
    let (npu, _sim) = open(soc, SimOptions::default())?;
    let value = npu.action(action)?;
    println!("{action:?}: {value} ({value:#x})");
    Ok(())
}
