use crate::{config::Config, job::Job};
use anyhow::{Context, Result};
use clap::Args;
use legato_core::{
    AXES, ControllerState, DRIVES,
    sim::{RecordingDriver, ScriptedSource, Simulation},
};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Args)]
pub struct SimulateArgs {
    /// Path to the configuration file (TOML or JSON).
    pub config: PathBuf,

    /// Path to the job file (JSON or TOML).
    pub job: PathBuf,

    /// Give up after this many interrupts.
    #[arg(long, default_value_t = 50_000_000)]
    pub max_ticks: u64,

    /// Pause after this many interrupts, wait for the machine to stop, then resume.
    #[arg(long)]
    pub pause_at: Option<u64>,

    /// Print the summary as JSON.
    #[arg(long)]
    pub json: bool,
}

/// What a simulated run did to the machine.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub ticks: u64,
    /// Simulated time in seconds
    pub seconds: f64,
    pub pulses: [u64; DRIVES],
    /// Final drive positions in steps
    pub position: [i64; DRIVES],
    /// Final position in user coordinates
    pub coords: [f64; DRIVES],
    pub queued: usize,
    pub completed: usize,
    pub homed: [bool; AXES],
    pub probe_height: Option<f64>,
}

impl SimulateArgs {
    pub fn run(&self) -> Result<()> {
        super::init_tracing();

        let config = Config::from_file(&self.config)?;
        config.validate()?;
        let job = Job::from_file(&self.job)?;

        tracing::info!(
            moves = job.moves.len(),
            "simulating {}",
            self.job.display()
        );

        let summary = simulate(&config, job, self.max_ticks, self.pause_at)?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            print_summary(&summary);
        }

        Ok(())
    }
}

/// Run `job` to completion on a simulated machine.
pub fn simulate(
    config: &Config,
    job: Job,
    max_ticks: u64,
    pause_at: Option<u64>,
) -> Result<Summary> {
    let source = ScriptedSource::new(job.moves);
    let mut sim = Simulation::new(config.machine.clone(), source, RecordingDriver::default())
        .context("invalid machine configuration")?;

    *sim.controller.transform_mut() = config.transform()?;
    if let Some(factor) = job.speed_factor {
        sim.controller.set_speed_factor(factor);
    }
    if let Some(factors) = job.extrusion_factors {
        for (extruder, factor) in factors.into_iter().enumerate() {
            sim.controller.set_extrusion_factor(extruder, factor);
        }
    }

    if let Some(pause_at) = pause_at {
        sim.run_until(|_| false, pause_at.min(max_ticks));
        sim.controller.pause();
        let paused = sim.run_until(
            |controller| controller.state() == ControllerState::Paused,
            max_ticks.saturating_sub(sim.ticks),
        );
        if !paused {
            anyhow::bail!("machine did not come to a stop within {max_ticks} interrupts");
        }
        tracing::info!(ticks = sim.ticks, "paused, resuming");
        sim.controller.resume();
    }

    let remaining = max_ticks.saturating_sub(sim.ticks);
    if !sim.run_until_idle(remaining) {
        anyhow::bail!("job did not finish within {max_ticks} interrupts");
    }

    let driver = sim.stepper.driver();
    let source = sim.controller.source();
    Ok(Summary {
        ticks: sim.ticks,
        seconds: sim.clock,
        pulses: driver.pulses,
        position: driver.position,
        coords: sim.controller.live_user_position().coords,
        queued: source.queued,
        completed: source.completed,
        homed: std::array::from_fn(|axis| sim.controller.is_homed(axis)),
        probe_height: sim.controller.last_probe_height(),
    })
}

fn print_summary(summary: &Summary) {
    println!(
        "{} moves completed in {:.3}s ({} interrupts)",
        summary.completed, summary.seconds, summary.ticks
    );
    for drive in 0..DRIVES {
        println!(
            "  drive {drive}: {:>8} pulses, at {:>8} steps ({:.4})",
            summary.pulses[drive], summary.position[drive], summary.coords[drive]
        );
    }
    if let Some(height) = summary.probe_height {
        println!("  probe height: {height:.4}");
    }
}
