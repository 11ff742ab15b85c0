//! Harmonic oscillator with an error region, optionally aggregated.
//!
//! Run with:
//! ```bash
//! cargo run --release --example oscillator -- --max-time 3.2 --dot dag.dot
//! ```

use std::f64::consts::PI;
use std::fs;
use std::path::PathBuf;

use clap::Parser;

use lhreach_rs::aggstrat::{AggKind, AggType, Aggregated, Unaggregated};
use lhreach_rs::automaton::{HybridAutomaton, LinearConstraint};
use lhreach_rs::core::Core;
use lhreach_rs::counterexample::format_counterexample;
use lhreach_rs::settings::{PlotSettings, ReachSettings};
use lhreach_rs::stateset::StateSet;
use nalgebra::DMatrix;

#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Time horizon.
    #[arg(long, value_name = "FLOAT", default_value = "3.2")]
    max_time: f64,

    /// Number of steps per half period.
    #[arg(long, value_name = "INT", default_value = "4")]
    steps_per_half_period: usize,

    /// Error when `x >= threshold`.
    #[arg(long, value_name = "FLOAT", default_value = "4.0")]
    threshold: f64,

    /// Split the initial box into this many slices per dimension.
    #[arg(long, value_name = "INT", default_value = "1")]
    split: usize,

    /// Aggregate sets entering the same mode.
    #[arg(long)]
    aggregate: bool,

    /// Write the aggregation DAG in DOT format.
    #[arg(long, value_name = "FILE")]
    dot: Option<PathBuf>,
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let time_total = std::time::Instant::now();

    let args = Cli::parse();
    println!("args = {:?}", args);

    let mut ha = HybridAutomaton::new("oscillator");
    let m = ha.new_mode("m");
    ha.set_dynamics(m, DMatrix::from_row_slice(2, 2, &[0.0, 1.0, -1.0, 0.0]))?;
    let err = ha.new_mode("error");
    let t = ha.new_transition(m, err, format!("x >= {}", args.threshold));
    ha.set_guard(t, vec![LinearConstraint::new([-1.0, 0.0], -args.threshold)])?;

    let n = args.split.max(1);
    let width = 1.0 / n as f64;
    let mut init = Vec::new();
    for i in 0..n {
        for j in 0..n {
            let x = -5.0 + i as f64 * width;
            let y = j as f64 * width;
            init.push(StateSet::from_box(&[(x, x + width), (y, y + width)], ha.mode(m))?);
        }
    }
    println!("initial sets: {}", init.len());

    let step_size = PI / args.steps_per_half_period as f64;
    let plot = PlotSettings {
        store_plot_result: true,
        ..PlotSettings::default()
    };
    let mut settings = ReachSettings::new(step_size, args.max_time)
        .with_plot(plot)
        .with_stop_on_aggregated_error(false);
    settings = if args.aggregate {
        settings.with_aggstrat(Box::new(Aggregated::new(AggType::new(AggKind::ArnoldiBox))))
    } else {
        settings.with_aggstrat(Box::new(Unaggregated))
    };

    let mut core = Core::new(ha, settings)?;
    let result = core.run(init)?;

    println!("safe: {}", result.safe);
    println!("aggregated error: {}", result.has_aggregated_error);
    println!("concrete error: {}", result.has_concrete_error);
    println!("popped sets: {}", result.num_popped);
    for (mode, polys) in &result.mode_to_polys {
        println!("mode '{}': {} polygons", mode, polys.len());
    }
    if let Some(cex) = &result.counterexample {
        println!("counterexample:\n{}", format_counterexample(core.automaton(), cex));
    }

    if let Some(path) = &args.dot {
        let dot = core.aggdag().to_dot(core.automaton())?;
        fs::write(path, dot)?;
        println!("wrote DOT to {}", path.display());
    }

    println!("Total time: {:.3} s", time_total.elapsed().as_secs_f64());

    Ok(())
}
