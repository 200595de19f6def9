use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{PipelineError, Result};

use super::{RegistrationBackend, RegistrationRequest, ResampleRequest, TransformMethod};

const REGISTRATION: &str = "antsRegistration";
const APPLY: &str = "antsApplyTransforms";

/// Lines of stderr kept in a registration error.
const STDERR_TAIL: usize = 20;

/// ANTs command-line tools.
///
/// The thread count is handed to each child process; the parent environment
/// is never modified.
#[derive(Debug, Clone, Default)]
pub struct AntsBackend {
    bin_dir: Option<PathBuf>,
    threads: Option<usize>,
}

impl AntsBackend {
    pub fn new(bin_dir: Option<PathBuf>, threads: Option<usize>) -> Self {
        Self { bin_dir, threads }
    }

    fn command(&self, program: &str) -> Command {
        let exe = match &self.bin_dir {
            Some(dir) => dir.join(program),
            None => PathBuf::from(program),
        };
        let mut cmd = Command::new(exe);
        if let Some(n) = self.threads {
            cmd.env("ITK_GLOBAL_DEFAULT_NUMBER_OF_THREADS", n.to_string());
        }
        cmd
    }

    fn run(&self, mut cmd: Command, program: &str, stage: String) -> Result<()> {
        tracing::debug!(command = ?cmd, "spawning ANTs");
        let output = cmd.output().map_err(|source| PipelineError::BackendLaunch {
            program: program.to_string(),
            source,
        })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(STDERR_TAIL)..].join("\n");
        Err(PipelineError::registration(
            stage,
            format!("{program} exited with {}:\n{tail}", output.status),
        ))
    }
}

fn path_arg(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

fn registration_args(request: &RegistrationRequest<'_>) -> Vec<String> {
    let fixed = path_arg(request.fixed);
    let moving = path_arg(request.moving);
    let mi = |bins: u32, sampling: &str| format!("MI[{fixed},{moving},1,{bins}{sampling}]");

    let mut args = vec![
        "--dimensionality".into(),
        "3".into(),
        "--float".into(),
        "1".into(),
        "--output".into(),
        format!(
            "[{},{},{}]",
            path_arg(request.prefix),
            path_arg(&request.outputs.moving_in_fixed),
            path_arg(&request.outputs.fixed_in_moving)
        ),
        "--interpolation".into(),
        "Linear".into(),
        "--winsorize-image-intensities".into(),
        "[0.005,0.995]".into(),
        "--use-histogram-matching".into(),
        "0".into(),
        "--initial-moving-transform".into(),
        format!("[{fixed},{moving},1]"),
        "--write-composite-transform".into(),
        "1".into(),
    ];

    let mut stage = |transform: &str, metric: String, iterations: &str| {
        args.extend([
            "--transform".to_string(),
            transform.to_string(),
            "--metric".to_string(),
            metric,
            "--convergence".to_string(),
            format!("[{iterations},1e-6,10]"),
            "--shrink-factors".to_string(),
            "8x4x2x1".to_string(),
            "--smoothing-sigmas".to_string(),
            "3x2x1x0vox".to_string(),
        ]);
    };

    stage("Rigid[0.1]", mi(32, ",Regular,0.25"), "1000x500x250x100");
    if request.method == TransformMethod::SyNAggro {
        stage("Affine[0.1]", mi(32, ",Regular,0.25"), "1000x500x250x100");
        stage("SyN[0.2,3,0]", mi(32, ""), "100x70x50x20");
    }
    args
}

impl RegistrationBackend for AntsBackend {
    fn name(&self) -> &'static str {
        "ants"
    }

    fn transform_extension(&self) -> &'static str {
        "h5"
    }

    fn register(&self, request: &RegistrationRequest<'_>) -> Result<()> {
        let mut cmd = self.command(REGISTRATION);
        cmd.args(registration_args(request));
        self.run(
            cmd,
            REGISTRATION,
            format!(
                "{} {} -> {}",
                request.method,
                request.moving.display(),
                request.fixed.display()
            ),
        )
    }

    fn apply(&self, request: &ResampleRequest<'_>) -> Result<()> {
        let mut cmd = self.command(APPLY);
        cmd.args(["--dimensionality", "3", "--float", "1"])
            .arg("--input")
            .arg(request.moving)
            .arg("--reference-image")
            .arg(request.reference)
            .arg("--output")
            .arg(request.output)
            .args(["--interpolation", request.interpolator.ants_name()]);
        for t in request.transforms {
            cmd.arg("--transform").arg(t);
        }
        self.run(cmd, APPLY, format!("resampling {}", request.moving.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::Alignment;

    #[test]
    fn syn_adds_affine_and_warp_stages() {
        let outputs = Alignment::at_prefix(Path::new("/o/p_"), "h5");
        let mut request = RegistrationRequest {
            fixed: Path::new("/d/mri.nii.gz"),
            moving: Path::new("/d/stx.nii.gz"),
            method: TransformMethod::Rigid,
            prefix: Path::new("/o/p_"),
            outputs: &outputs,
        };
        let rigid = registration_args(&request);
        assert_eq!(rigid.iter().filter(|a| *a == "--transform").count(), 1);
        assert!(rigid.contains(&"[/o/p_,/o/p_fwd.nii.gz,/o/p_inv.nii.gz]".to_string()));

        request.method = TransformMethod::SyNAggro;
        let syn = registration_args(&request);
        assert_eq!(syn.iter().filter(|a| *a == "--transform").count(), 3);
        assert!(syn.contains(&"SyN[0.2,3,0]".to_string()));
    }

    #[test]
    fn missing_binary_is_a_launch_error() {
        let backend = AntsBackend::new(Some(PathBuf::from("/nonexistent/ants/bin")), Some(2));
        let outputs = Alignment::at_prefix(Path::new("/tmp/x_"), "h5");
        let err = backend
            .register(&RegistrationRequest {
                fixed: Path::new("a.nii.gz"),
                moving: Path::new("b.nii.gz"),
                method: TransformMethod::Rigid,
                prefix: Path::new("/tmp/x_"),
                outputs: &outputs,
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::BackendLaunch { .. }));
    }
}
