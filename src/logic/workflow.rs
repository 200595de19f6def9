use crate::error::ErrorKind;
use crate::logic::subject::Subject;
use crate::models::config::{CohortConfig, PipelineSettings};
use crate::models::results::{PatlakFit, SubjectResults, SuvrSummary};
use crate::progress::{ProgressSink, ProgressSpan};
use crate::registration::RegistrationBackend;
use crate::utils::tables::{
    self, DYNAMIC_PARAMETERS_CSV, TUMOR_PERCENTAGE_CSV, TUMOR_STRIATUM_CSV,
};
use anyhow::{bail, Context, Result};
use chrono::Local;
use serde::Serialize;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

pub const RUN_REPORT_JSON: &str = "run_report.json";

const START_PERCENT: u32 = 10;
const SUBJECTS_PERCENT: u32 = 90;

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubjectOutcome {
    Succeeded(Box<SubjectResults>),
    Failed {
        subject: String,
        kind: ErrorKind,
        error: String,
    },
}

impl SubjectOutcome {
    pub fn subject(&self) -> &str {
        match self {
            Self::Succeeded(results) => &results.subject,
            Self::Failed { subject, .. } => subject,
        }
    }

    pub fn results(&self) -> Option<&SubjectResults> {
        match self {
            Self::Succeeded(results) => Some(results),
            Self::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubjectRun {
    pub started_at: String,
    pub finished_at: String,
    pub outcome: SubjectOutcome,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub started_at: String,
    pub finished_at: String,
    pub output_folder: PathBuf,
    pub subjects: Vec<SubjectRun>,
}

impl RunReport {
    pub fn total(&self) -> usize {
        self.subjects.len()
    }

    pub fn successful(&self) -> usize {
        self.subjects
            .iter()
            .filter(|run| run.outcome.results().is_some())
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, ErrorKind, &str)> {
        self.subjects.iter().filter_map(|run| match &run.outcome {
            SubjectOutcome::Failed {
                subject,
                kind,
                error,
            } => Some((subject.as_str(), *kind, error.as_str())),
            SubjectOutcome::Succeeded(_) => None,
        })
    }

    fn succeeded(&self) -> impl Iterator<Item = &SubjectResults> {
        self.subjects.iter().filter_map(|run| run.outcome.results())
    }
}

/// Run every subject of `config_path` and write the cohort tables.
///
/// A failing subject is recorded and the run moves on, unless `fail_fast`.
pub fn run_pipeline(
    config_path: &Path,
    work_dir: &Path,
    output_folder: &Path,
    settings: &PipelineSettings,
    backend: &dyn RegistrationBackend,
    sink: &dyn ProgressSink,
    fail_fast: bool,
) -> Result<RunReport> {
    if !config_path.exists() {
        bail!("Config file '{}' does not exist", config_path.display());
    }
    if !work_dir.is_dir() {
        bail!("Work directory '{}' does not exist", work_dir.display());
    }
    settings.validate().context("Invalid pipeline settings")?;

    fs::create_dir_all(output_folder)
        .with_context(|| format!("Unable to create output folder {}", output_folder.display()))?;

    let config = CohortConfig::load(config_path)
        .with_context(|| format!("Unable to read config {}", config_path.display()))?;
    if config.is_empty() {
        bail!("Config '{}' lists no subjects", config_path.display());
    }

    let started_at = Local::now().to_rfc3339();
    sink.log_progress(START_PERCENT);
    let per_subject = SUBJECTS_PERCENT / config.len() as u32;
    tracing::info!(subjects = config.len(), backend = backend.name(), "starting run");

    let mut subjects = Vec::with_capacity(config.len());
    for (n, (key, files)) in config.subjects.iter().enumerate() {
        let span = ProgressSpan::new(START_PERCENT + per_subject * n as u32, per_subject);
        let subject_started = Local::now().to_rfc3339();
        sink.log_message(&format!("Processing {key} ({}/{})", n + 1, config.len()));

        let result = Subject::new(key, files, work_dir, output_folder, settings, span)
            .and_then(|subject| subject.process(backend, sink));

        let outcome = match result {
            Ok(results) => {
                sink.log_message(&format!("{key} done"));
                SubjectOutcome::Succeeded(Box::new(results))
            }
            Err(err) => {
                sink.log_error(&format!("{key} failed: {err}"));
                if fail_fast {
                    return Err(anyhow::Error::new(err)
                        .context(format!("Subject {key} failed, aborting run")));
                }
                SubjectOutcome::Failed {
                    subject: key.clone(),
                    kind: err.kind(),
                    error: err.to_string(),
                }
            }
        };
        subjects.push(SubjectRun {
            started_at: subject_started,
            finished_at: Local::now().to_rfc3339(),
            outcome,
        });
    }

    let report = RunReport {
        started_at,
        finished_at: Local::now().to_rfc3339(),
        output_folder: output_folder.to_path_buf(),
        subjects,
    };
    write_cohort_tables(&report).context("Unable to write cohort tables")?;
    write_run_report(&report).context("Unable to write run report")?;
    sink.log_progress(100);
    Ok(report)
}

fn write_cohort_tables(report: &RunReport) -> Result<()> {
    let out = &report.output_folder;

    let suvr: Vec<(&str, &SuvrSummary)> = report
        .succeeded()
        .map(|r| (r.subject.as_str(), &r.static_analysis.summary))
        .collect();
    tables::write_tumor_striatum(&out.join(TUMOR_STRIATUM_CSV), &suvr)?;

    let dynamic: Vec<(&str, &PatlakFit, &PatlakFit)> = report
        .succeeded()
        .filter_map(|r| {
            r.dynamic
                .fitted()
                .map(|(tumor, striatum)| (r.subject.as_str(), tumor, striatum))
        })
        .collect();
    tables::write_dynamic_parameters(&out.join(DYNAMIC_PARAMETERS_CSV), &dynamic)?;

    let percentages: Vec<(&str, f64)> = report
        .succeeded()
        .filter(|r| r.regions.tumor_overlap)
        .map(|r| (r.subject.as_str(), r.regions.tumor_percentage))
        .collect();
    tables::write_tumor_percentages(&out.join(TUMOR_PERCENTAGE_CSV), &percentages)?;
    Ok(())
}

fn write_run_report(report: &RunReport) -> Result<()> {
    let path = report.output_folder.join(RUN_REPORT_JSON);
    let file = File::create(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), report)?;
    Ok(())
}
