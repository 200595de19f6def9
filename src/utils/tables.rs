//! CSV tables written per subject and per cohort.

use std::fs::File;
use std::path::Path;

use crate::error::Result;
use crate::models::results::{PatlakFit, SuvrSummary, TacTable};

pub const TUMOR_STRIATUM_CSV: &str = "tumor_striatum_ibrido.csv";
pub const DYNAMIC_PARAMETERS_CSV: &str = "Dynamic_Parameters_ibrido.csv";
pub const TUMOR_PERCENTAGE_CSV: &str = "H_tumor_percentage_ibrido.csv";

const SUVR_HEADER: [&str; 11] = [
    "subject",
    "tumor_mean",
    "tumor_max",
    "tumor_volume_ml",
    "roi_mean",
    "reference_mean",
    "tsr_mean",
    "tsr_max",
    "roi_ratio",
    "tumor_overlap",
    "tumor_percentage",
];

const DYNAMIC_HEADER: [&str; 10] = [
    "subject",
    "tumor_slope",
    "tumor_intercept",
    "tumor_r2",
    "tumor_frames_used",
    "striatum_slope",
    "striatum_intercept",
    "striatum_r2",
    "striatum_frames_used",
    "cutoff_min",
];

const PERCENTAGE_HEADER: [&str; 2] = ["subject", "percentage"];

/// A CSV file whose header is written on creation, so empty tables are header-only.
pub struct TableWriter {
    wtr: csv::Writer<File>,
}

impl TableWriter {
    pub fn create<I, S>(path: &Path, header: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut wtr = csv::Writer::from_path(path)?;
        wtr.write_record(header)?;
        wtr.flush()?;
        Ok(Self { wtr })
    }

    pub fn write_row<I, S>(&mut self, row: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.wtr.write_record(row)?;
        self.wtr.flush()?;
        Ok(())
    }
}

fn num(v: f64) -> String {
    if v.is_finite() {
        format!("{v}")
    } else {
        String::new()
    }
}

fn suvr_row(subject: &str, s: &SuvrSummary) -> Vec<String> {
    vec![
        subject.to_string(),
        num(s.tumor_mean),
        num(s.tumor_max),
        num(s.tumor_volume_ml),
        num(s.roi_mean),
        num(s.reference_mean),
        num(s.tsr_mean),
        num(s.tsr_max),
        num(s.roi_ratio),
        s.tumor_overlap.to_string(),
        num(s.tumor_percentage),
    ]
}

/// `sub-<id>_values.csv`: the static summary of one subject.
pub fn write_values(path: &Path, subject: &str, summary: &SuvrSummary) -> Result<()> {
    let mut table = TableWriter::create(path, SUVR_HEADER)?;
    table.write_row(suvr_row(subject, summary))
}

pub fn write_tumor_striatum(path: &Path, rows: &[(&str, &SuvrSummary)]) -> Result<()> {
    let mut table = TableWriter::create(path, SUVR_HEADER)?;
    for (subject, summary) in rows {
        table.write_row(suvr_row(subject, summary))?;
    }
    Ok(())
}

pub fn write_dynamic_parameters(path: &Path, rows: &[(&str, &PatlakFit, &PatlakFit)]) -> Result<()> {
    let mut table = TableWriter::create(path, DYNAMIC_HEADER)?;
    for (subject, tumor, striatum) in rows {
        table.write_row([
            subject.to_string(),
            num(tumor.slope),
            num(tumor.intercept),
            num(tumor.r_squared),
            tumor.frames_used.to_string(),
            num(striatum.slope),
            num(striatum.intercept),
            num(striatum.r_squared),
            striatum.frames_used.to_string(),
            num(striatum.cutoff_min),
        ])?;
    }
    Ok(())
}

pub fn write_tumor_percentages(path: &Path, rows: &[(&str, f64)]) -> Result<()> {
    let mut table = TableWriter::create(path, PERCENTAGE_HEADER)?;
    for (subject, percentage) in rows {
        table.write_row([subject.to_string(), num(*percentage)])?;
    }
    Ok(())
}

/// Per-label curves: `start_s,duration_s,<label>...`.
pub fn write_tac_sub_regions(path: &Path, tacs: &TacTable) -> Result<()> {
    let header = ["start_s".to_string(), "duration_s".to_string()]
        .into_iter()
        .chain(tacs.labels.iter().map(|l| l.to_string()));
    let mut table = TableWriter::create(path, header)?;
    for frame in &tacs.frames {
        let row = [num(frame.start_s), num(frame.duration_s)]
            .into_iter()
            .chain(frame.values.iter().map(|v| num(*v)));
        table.write_row(row)?;
    }
    Ok(())
}

/// Region curves: `start_s,duration_s,<name>...`.
pub fn write_tac_regions(path: &Path, tacs: &TacTable, regions: &[(&str, Vec<f64>)]) -> Result<()> {
    let header = ["start_s", "duration_s"]
        .into_iter()
        .chain(regions.iter().map(|(name, _)| *name));
    let mut table = TableWriter::create(path, header)?;
    for (t, frame) in tacs.frames.iter().enumerate() {
        let row = [num(frame.start_s), num(frame.duration_s)]
            .into_iter()
            .chain(regions.iter().map(|(_, curve)| num(curve[t])));
        table.write_row(row)?;
    }
    Ok(())
}
