//! The `tschsim` binary: load a run configuration, execute the
//! experiment, and write (or print) the results.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tschsim_runner::{load_config, run_experiment, write_report, RunnerError};

#[derive(Debug, Parser)]
#[command(name = "tschsim", about = "Discrete-event 6TiSCH mesh simulator")]
struct Args {
    /// Run configuration (settings + topology), YAML.
    config: PathBuf,

    /// Directory for result files; prints the summary to stdout when
    /// omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Override the configured seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Override the configured number of runs.
    #[arg(long)]
    runs: Option<u32>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    tschsim_metrics::describe_metrics();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("tschsim: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), RunnerError> {
    let config = load_config(&args.config)?;
    let (mut settings, topology) = config.build()?;
    if let Some(seed) = args.seed {
        settings.seed = seed;
    }
    if let Some(runs) = args.runs {
        settings.num_runs = runs;
    }

    let report = run_experiment(&settings, &topology)?;
    match &args.output {
        Some(dir) => {
            write_report(dir, &report)?;
            eprintln!("results written to {}", dir.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}
