use crate::logic::workflow::run_pipeline;
use crate::models::config::{
    PipelineSettings, DEFAULT_EQUILIBRIUM_CUTOFF_MIN, DEFAULT_OVERLAP_THRESHOLD,
    DEFAULT_TUMOR_LABEL,
};
use crate::models::regions::AtlasConvention;
use crate::progress::{ConsoleSink, ProgressSink};
use crate::registration::{AntsBackend, NativeBackend, RegistrationBackend};
use crate::utils::discovery::discover_subjects;
use crate::utils::logging::RunLog;
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use owo_colors::OwoColorize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    author,
    version,
    about,
    long_about = None,
    args_conflicts_with_subcommands = true,
    subcommand_negates_reqs = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub run: RunArgs,

    /// Show debug diagnostics
    #[arg(long, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a cohort config from a BIDS-like data tree
    Discover {
        /// Root of the data tree
        #[arg(long)]
        data_dir: PathBuf,

        /// Config file to write
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// antsRegistration / antsApplyTransforms
    Ants,
    /// In-process header alignment and affine resampling
    Native,
}

#[derive(Args)]
pub struct RunArgs {
    /// Cohort config (JSON)
    #[arg(long, required = true)]
    pub config: Option<PathBuf>,

    /// Directory the config paths are relative to
    #[arg(long, required = true)]
    pub work_dir: Option<PathBuf>,

    /// Output directory
    #[arg(long, required = true)]
    pub out_dir: Option<PathBuf>,

    /// Stereotaxic template [default: <exe dir>/atlas/...]
    #[arg(long)]
    pub template: Option<PathBuf>,

    /// Atlas in template space [default: <exe dir>/atlas/...]
    #[arg(long)]
    pub atlas: Option<PathBuf>,

    /// Atlas label convention: dka or dka-merged
    #[arg(long, default_value = "dka")]
    pub atlas_convention: String,

    /// Atlas label convention from a JSON file, overrides --atlas-convention
    #[arg(long)]
    pub atlas_convention_file: Option<PathBuf>,

    /// Tumor overlap fraction above which a reference region is dropped
    #[arg(long, default_value_t = DEFAULT_OVERLAP_THRESHOLD)]
    pub overlap_threshold: f64,

    /// Start of the Patlak window in minutes
    #[arg(long, default_value_t = DEFAULT_EQUILIBRIUM_CUTOFF_MIN)]
    pub equilibrium_cutoff: f64,

    /// Label given to tumor voxels in the tumor atlas
    #[arg(long, default_value_t = DEFAULT_TUMOR_LABEL)]
    pub tumor_label: i32,

    /// Registration backend
    #[arg(long, value_enum, default_value_t = BackendKind::Ants)]
    pub backend: BackendKind,

    /// Directory holding the ANTs executables
    #[arg(long)]
    pub ants_bin: Option<PathBuf>,

    /// Worker threads for registration and TAC extraction
    #[arg(long)]
    pub threads: Option<usize>,

    /// Recompute outputs that already exist
    #[arg(long, default_value_t = false)]
    pub clobber: bool,

    /// Skip QC images
    #[arg(long, default_value_t = false)]
    pub no_qc: bool,

    /// Stop at the first failing subject
    #[arg(long, default_value_t = false)]
    pub fail_fast: bool,
}

impl RunArgs {
    fn settings(&self) -> Result<PipelineSettings> {
        let mut settings = match (&self.template, &self.atlas) {
            (Some(template), Some(atlas)) => PipelineSettings::new(template.clone(), atlas.clone()),
            _ => {
                let exe = std::env::current_exe().context("Unable to locate the executable")?;
                let dir = exe.parent().unwrap_or_else(|| Path::new("."));
                let mut settings = PipelineSettings::with_atlas_dir(dir);
                if let Some(template) = &self.template {
                    settings.template = template.clone();
                }
                if let Some(atlas) = &self.atlas {
                    settings.atlas = atlas.clone();
                }
                settings
            }
        };

        settings.convention = match &self.atlas_convention_file {
            Some(file) => AtlasConvention::from_json_file(file)
                .with_context(|| format!("Unable to load atlas convention {}", file.display()))?,
            None => AtlasConvention::preset(&self.atlas_convention)?,
        };
        settings.overlap_threshold = self.overlap_threshold;
        settings.equilibrium_cutoff_min = self.equilibrium_cutoff;
        settings.tumor_label = self.tumor_label;
        settings.clobber = self.clobber;
        settings.threads = self.threads;
        settings.qc = !self.no_qc;
        Ok(settings)
    }

    fn backend(&self) -> Box<dyn RegistrationBackend> {
        match self.backend {
            BackendKind::Ants => Box::new(AntsBackend::new(self.ants_bin.clone(), self.threads)),
            BackendKind::Native => Box::new(NativeBackend),
        }
    }
}

pub fn run_cli(cli: Cli) {
    let result = match cli.command {
        Some(Commands::Discover { data_dir, output }) => discover(&data_dir, &output),
        None => run(&cli.run),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            tracing::error!(error = ?e, "run aborted");
            eprintln!("{} {:#}", "✖".red(), e);
            std::process::exit(1);
        }
    }
}

/// Run the pipeline; `Ok(false)` when some subject failed.
fn run(args: &RunArgs) -> Result<bool> {
    let (Some(config), Some(work_dir), Some(out_dir)) = (&args.config, &args.work_dir, &args.out_dir)
    else {
        bail!("--config, --work-dir and --out-dir are required");
    };

    println!("Starting pipeline...");
    println!("Config: {}", config.display());
    println!("Work dir: {}", work_dir.display());
    println!("Output: {}", out_dir.display());

    fs::create_dir_all(out_dir)
        .with_context(|| format!("Unable to create output folder {}", out_dir.display()))?;
    let sink = ConsoleSink::with_run_log(RunLog::open(out_dir)?);

    let outcome = args.settings().and_then(|settings| {
        let backend = args.backend();
        run_pipeline(
            config,
            work_dir,
            out_dir,
            &settings,
            backend.as_ref(),
            &sink,
            args.fail_fast,
        )
    });
    let report = match outcome {
        Ok(report) => report,
        Err(e) => {
            sink.log_error(&format!("{e:#}"));
            return Err(e);
        }
    };

    println!("Total: {}", report.total());
    println!("Successful: {}", report.successful());
    println!("Failed: {}", report.total() - report.successful());
    println!("Output folder: {:?}", report.output_folder);

    let mut failed = false;
    for (subject, kind, error) in report.failures() {
        failed = true;
        eprintln!("{} {subject} [{kind:?}]: {error}", "✖".red());
    }
    if failed {
        return Ok(false);
    }
    println!("FINISHED: Pipeline completed successfully");
    Ok(true)
}

fn discover(data_dir: &Path, output: &Path) -> Result<bool> {
    if !data_dir.is_dir() {
        bail!("Data directory '{}' does not exist", data_dir.display());
    }
    let report = discover_subjects(data_dir);
    for (subject, reason) in &report.skipped {
        println!("{} Skipping {subject} ({reason})", "∙".cyan());
    }
    if report.config.is_empty() {
        bail!("No complete subject found under {}", data_dir.display());
    }
    report
        .config
        .save(output)
        .with_context(|| format!("Unable to write config {}", output.display()))?;
    println!(
        "Wrote {} subject(s) to {}",
        report.config.len(),
        output.display()
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_are_required_without_a_subcommand() {
        assert!(Cli::try_parse_from(["fdopa-pipeline"]).is_err());
        let cli = Cli::try_parse_from([
            "fdopa-pipeline",
            "--config",
            "c.json",
            "--work-dir",
            "w",
            "--out-dir",
            "o",
            "--backend",
            "native",
        ])
        .unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.run.backend, BackendKind::Native);
        assert_eq!(cli.run.tumor_label, DEFAULT_TUMOR_LABEL);
    }

    #[test]
    fn discover_needs_no_run_flags() {
        let cli = Cli::try_parse_from([
            "fdopa-pipeline",
            "discover",
            "--data-dir",
            "data",
            "--output",
            "config.json",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Commands::Discover { .. })));
    }

    #[test]
    fn settings_follow_the_flags() {
        let cli = Cli::try_parse_from([
            "fdopa-pipeline",
            "--config",
            "c.json",
            "--work-dir",
            "w",
            "--out-dir",
            "o",
            "--template",
            "t.nii.gz",
            "--atlas",
            "a.nii.gz",
            "--atlas-convention",
            "dka-merged",
            "--overlap-threshold",
            "0.2",
            "--no-qc",
        ])
        .unwrap();
        let settings = cli.run.settings().unwrap();
        assert_eq!(settings.template, PathBuf::from("t.nii.gz"));
        assert_eq!(settings.convention.name, "dka-merged");
        assert_eq!(settings.overlap_threshold, 0.2);
        assert!(!settings.qc);
    }
}
