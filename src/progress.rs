//! Progress reporting: the sink the pipeline talks to and the stage tracker
//! that turns completed stages into percentages.

use std::fmt;

use owo_colors::OwoColorize;
use serde::Serialize;

use crate::utils::logging::{Level, LogEntry, RunLog};

/// Receiver of operator-facing progress. Calls are fire-and-forget.
pub trait ProgressSink: Send + Sync {
    fn log_progress(&self, percent: u32);
    fn log_message(&self, message: &str);
    fn log_error(&self, message: &str);
}

/// Console renderer, optionally mirrored into `logs.csv`.
#[derive(Default)]
pub struct ConsoleSink {
    run_log: Option<RunLog>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_log(run_log: RunLog) -> Self {
        Self {
            run_log: Some(run_log),
        }
    }

    fn record(&self, level: Level, message: &str) {
        if let Some(log) = &self.run_log {
            if let Err(e) = log.append(&LogEntry::now(level, message)) {
                tracing::warn!(error = %e, "could not append to run log");
            }
        }
    }
}

impl ProgressSink for ConsoleSink {
    fn log_progress(&self, percent: u32) {
        println!("{} Progress: {percent}%", "∙".cyan());
        self.record(Level::Progress, &percent.to_string());
    }

    fn log_message(&self, message: &str) {
        println!("{message}");
        self.record(Level::Info, message);
    }

    fn log_error(&self, message: &str) {
        eprintln!("{} {message}", "✖".red());
        self.record(Level::Error, message);
    }
}

/// Pipeline stages of one subject, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Mri2PetAligned,
    Template2MriAligned,
    TransformComposed,
    BrainMaskResampled,
    TumorResampled,
    AtlasResampled,
    TemplateResampled,
    RegionsSelected,
    StaticAnalysisDefined,
    TacExtracted,
    DynamicParametersFit,
}

impl Stage {
    const STATIC: [Stage; 9] = [
        Stage::Mri2PetAligned,
        Stage::Template2MriAligned,
        Stage::TransformComposed,
        Stage::BrainMaskResampled,
        Stage::TumorResampled,
        Stage::AtlasResampled,
        Stage::TemplateResampled,
        Stage::RegionsSelected,
        Stage::StaticAnalysisDefined,
    ];

    pub fn count(dynamic: bool) -> u32 {
        if dynamic {
            Self::STATIC.len() as u32 + 2
        } else {
            Self::STATIC.len() as u32
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Mri2PetAligned => "MRI aligned to PET",
            Stage::Template2MriAligned => "template aligned to MRI",
            Stage::TransformComposed => "template to PET transform composed",
            Stage::BrainMaskResampled => "brain mask resampled to PET",
            Stage::TumorResampled => "tumor mask resampled to PET",
            Stage::AtlasResampled => "atlas resampled to PET",
            Stage::TemplateResampled => "template resampled to PET",
            Stage::RegionsSelected => "regions selected",
            Stage::StaticAnalysisDefined => "static analysis defined",
            Stage::TacExtracted => "TACs extracted",
            Stage::DynamicParametersFit => "dynamic parameters fit",
        };
        f.write_str(s)
    }
}

/// The `[start, start + span]` share of overall progress given to one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSpan {
    pub start: u32,
    pub span: u32,
}

impl ProgressSpan {
    pub fn new(start: u32, span: u32) -> Self {
        Self { start, span }
    }

    pub fn end(&self) -> u32 {
        self.start + self.span
    }
}

/// Reports `start + per_stage * n` after the n-th stage, independent of timing.
pub struct StageTracker<'a> {
    sink: &'a dyn ProgressSink,
    span: ProgressSpan,
    per_stage: u32,
    completed: u32,
}

impl<'a> StageTracker<'a> {
    pub fn new(sink: &'a dyn ProgressSink, span: ProgressSpan, stages: u32) -> Self {
        Self {
            sink,
            span,
            per_stage: span.span / stages.max(1),
            completed: 0,
        }
    }

    pub fn complete(&mut self, stage: Stage) {
        self.completed += 1;
        tracing::info!(%stage, "stage complete");
        self.sink
            .log_progress(self.span.start + self.per_stage * self.completed);
    }

    pub fn finish(self) {
        self.sink.log_progress(self.span.end());
    }
}
