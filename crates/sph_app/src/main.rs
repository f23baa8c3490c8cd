//! # sph_app: dam break demo
//!
//! Runs a two-dimensional dam break: a block of fluid resting against a
//! static tank.
//!
//! ## Startup Sequence
//!
//! 1. Parse and validate the command line.
//! 2. Establish the rank context (MPI when built with `--features mpi`).
//! 3. Create the output directory and install logging.
//! 4. Bootstrap, partition, bind, and attach the control transports.
//! 5. Step to the final time and write a final checkpoint.
//!
//! Any failure before the step loop ends the process with a non-zero status;
//! under MPI it aborts every rank.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use sph_app::{Application, Options, RunDefaults, init_logging};
use sph_parallel::RankContext;
use sph_particles::{ArrayFill, FactoryFailure, ParticleArray};

const APP_NAME: &str = "dam_break";

/// Particle spacing.
const DX: f64 = 0.05;
const FLUID_WIDTH: usize = 20;
const FLUID_HEIGHT: usize = 40;
const TANK_WIDTH: usize = 80;
const TANK_HEIGHT: usize = 60;
const WALL_LAYERS: usize = 3;
const RHO0: f64 = 1000.0;

const DEFAULTS: RunDefaults = RunDefaults { dt: 1e-4, tf: 0.05 };

fn block(nx: usize, ny: usize, x0: f64, y0: f64) -> (Vec<f64>, Vec<f64>) {
    let mut x = Vec::with_capacity(nx * ny);
    let mut y = Vec::with_capacity(nx * ny);
    for i in 0..nx {
        for j in 0..ny {
            x.push(x0 + i as f64 * DX);
            y.push(y0 + j as f64 * DX);
        }
    }
    (x, y)
}

fn with_properties(array: ParticleArray, x: Vec<f64>, y: Vec<f64>) -> Result<ParticleArray, FactoryFailure> {
    let n = x.len();
    Ok(array
        .with_field("x", x)?
        .with_field("y", y)?
        .with_field("u", vec![0.0; n])?
        .with_field("v", vec![0.0; n])?
        .with_field("rho", vec![RHO0; n])?
        .with_field("m", vec![RHO0 * DX * DX; n])?
        .with_field("h", vec![1.3 * DX; n])?)
}

/// A fluid column in the lower left corner of a U-shaped tank.
fn dam_break(fill: ArrayFill) -> Result<Vec<ParticleArray>, FactoryFailure> {
    let (fx, fy) = block(FLUID_WIDTH, FLUID_HEIGHT, DX, DX);
    let fluid = with_properties(ParticleArray::new("fluid"), fx, fy)?;

    let layers = WALL_LAYERS as f64 * DX;
    let (mut tx, mut ty) = block(TANK_WIDTH + 2 * WALL_LAYERS, WALL_LAYERS, -layers, -layers);
    for x0 in [-layers, TANK_WIDTH as f64 * DX] {
        let (wx, wy) = block(WALL_LAYERS, TANK_HEIGHT, x0, 0.0);
        tx.extend(wx);
        ty.extend(wy);
    }
    let tank = with_properties(ParticleArray::new_static("tank"), tx, ty)?;

    Ok(match fill {
        ArrayFill::Populated => vec![fluid, tank],
        ArrayFill::Empty => vec![fluid.empty_like(), tank.empty_like()],
    })
}

fn run(options: &Options, ctx: &RankContext) -> Result<()> {
    let options = options.resolve(APP_NAME)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("sph-transport")
        .enable_all()
        .build()
        .context("cannot start the transport runtime")?;

    let logging = init_logging(&options, ctx)?;
    logging.install()?;
    info!(
        rank = ctx.rank(),
        size = ctx.size(),
        output = %options.output_directory.display(),
        "dam break starting"
    );

    let app = Application::new(APP_NAME, &dam_break, DEFAULTS);
    let mut run = app.setup(&options, ctx, runtime.handle().clone())?;
    let summary = run.run()?;

    let state = run.state();
    let checkpoint = state
        .output_directory()
        .join(format!("{}_{}.msgpack", state.output_name(), summary.count));
    run.save_checkpoint(&checkpoint)?;

    if !options.quiet && ctx.is_coordinator() {
        println!(
            "{APP_NAME}: t = {:.6} after {} iterations{}",
            summary.t,
            summary.count,
            if summary.stopped { " (stopped)" } else { "" }
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let options = Options::parse();
    let ctx = RankContext::from_environment();

    if let Err(e) = run(&options, &ctx) {
        error!(rank = ctx.rank(), error = %format!("{e:#}"), "run failed");
        if ctx.in_parallel() {
            eprintln!("rank {}: {e:#}", ctx.rank());
            ctx.abort(1);
        }
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dam_break_arrays() {
        let arrays = dam_break(ArrayFill::Populated).unwrap();
        assert_eq!(arrays.len(), 2);
        assert_eq!(arrays[0].len(), FLUID_WIDTH * FLUID_HEIGHT);
        assert!(!arrays[0].is_static());
        assert_eq!(
            arrays[1].len(),
            (TANK_WIDTH + 2 * WALL_LAYERS) * WALL_LAYERS + 2 * WALL_LAYERS * TANK_HEIGHT
        );
        assert!(arrays[1].is_static());
        for array in &arrays {
            array.validate().unwrap();
            assert_eq!(array.field("rho").unwrap()[0], RHO0);
        }
    }

    #[test]
    fn test_placeholders_match_populated_arrays() {
        let full = dam_break(ArrayFill::Populated).unwrap();
        let empty = dam_break(ArrayFill::Empty).unwrap();
        for (a, b) in full.iter().zip(&empty) {
            assert!(b.is_empty());
            assert_eq!(a.name(), b.name());
            assert_eq!(a.field_names().collect::<Vec<_>>(), b.field_names().collect::<Vec<_>>());
        }
    }
}
