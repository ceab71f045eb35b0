//! Build simulations from a configuration file, run them, and write the
//! result records.
//!
//! An experiment is `num_runs` independent simulations of the same
//! settings and topology, run `k` seeded with `seed + k`. The outputs
//! are deterministic: per-run JSON-line cycle records and a summary
//! document contain only simulation data, so identical configurations
//! produce byte-identical files. Wall-clock metadata lives in a separate
//! `run-info.json`.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use tschsim_model::{ModelError, Settings, Topology};
use tschsim_sim::{RunReport, SimError, Simulation};

pub use tschsim_model::{load_config, load_config_from_str, RunConfig};

/// Errors from loading, running, or writing an experiment.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Bad configuration.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// The simulation failed.
    #[error(transparent)]
    Sim(#[from] SimError),

    /// Writing results failed.
    #[error("failed to write {0}: {1}")]
    Io(String, #[source] std::io::Error),

    /// Serializing results failed.
    #[error("failed to serialize results: {0}")]
    Json(#[from] serde_json::Error),
}

/// All runs of one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    /// The settings shared by every run.
    pub settings: Settings,
    /// One report per run, seed-ascending.
    pub runs: Vec<RunReport>,
}

/// Wall-clock metadata, kept out of the deterministic files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    /// When the experiment started, RFC 3339.
    pub started_at: String,
    /// Number of runs executed.
    pub num_runs: u32,
}

/// Execute every run of the experiment.
pub fn run_experiment(
    settings: &Settings,
    topology: &Topology,
) -> Result<ExperimentReport, RunnerError> {
    let mut runs = Vec::with_capacity(settings.num_runs as usize);
    for k in 0..settings.num_runs {
        let seed = settings.seed + k as u64;
        tracing::info!(run = k, seed, "starting run");
        let mut sim = Simulation::new(settings.clone(), topology.clone(), seed)?;
        let report = sim.run()?;
        tracing::info!(
            run = k,
            delivered = report.totals.app_reaches_root,
            generated = report.totals.app_generated,
            "run finished"
        );
        runs.push(report);
    }
    Ok(ExperimentReport {
        settings: settings.clone(),
        runs,
    })
}

/// Write the experiment results under `dir`:
/// `summary.json`, `run<k>-cycles.jsonl`, and `run-info.json`.
pub fn write_report(dir: &Path, report: &ExperimentReport) -> Result<(), RunnerError> {
    std::fs::create_dir_all(dir).map_err(|e| RunnerError::Io(dir.display().to_string(), e))?;

    let summary_path = dir.join("summary.json");
    let summary = serde_json::to_string_pretty(report)?;
    std::fs::write(&summary_path, summary)
        .map_err(|e| RunnerError::Io(summary_path.display().to_string(), e))?;

    for (k, run) in report.runs.iter().enumerate() {
        let path = dir.join(format!("run{k}-cycles.jsonl"));
        let file =
            std::fs::File::create(&path).map_err(|e| RunnerError::Io(path.display().to_string(), e))?;
        let mut out = std::io::BufWriter::new(file);
        for cycle in &run.cycles {
            let line = serde_json::to_string(cycle)?;
            writeln!(out, "{line}").map_err(|e| RunnerError::Io(path.display().to_string(), e))?;
        }
        out.flush()
            .map_err(|e| RunnerError::Io(path.display().to_string(), e))?;
    }

    let info = RunInfo {
        started_at: chrono::Utc::now().to_rfc3339(),
        num_runs: report.runs.len() as u32,
    };
    let info_path = dir.join("run-info.json");
    std::fs::write(&info_path, serde_json::to_string_pretty(&info)?)
        .map_err(|e| RunnerError::Io(info_path.display().to_string(), e))?;
    Ok(())
}
