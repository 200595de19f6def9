#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fdopa_pipeline_lib::models::config::PipelineSettings;
use fdopa_pipeline_lib::progress::ProgressSink;
use fdopa_pipeline_lib::registration::{
    NativeBackend, RegistrationBackend, RegistrationRequest, ResampleRequest,
};
use fdopa_pipeline_lib::volume::{Volume, Volume4};
use fdopa_pipeline_lib::PipelineError;
use nalgebra::Matrix4;
use ndarray::{Array3, Array4, Axis};
use serde_json::json;

pub const N: usize = 20;

/// 1 mm voxels centred on the world origin, RAS.
pub fn affine() -> Matrix4<f64> {
    let mut m = Matrix4::identity();
    for axis in 0..3 {
        m[(axis, 3)] = -10.0;
    }
    m
}

fn in_box(i: usize, j: usize, k: usize, x: (usize, usize), y: (usize, usize)) -> bool {
    (x.0..x.1).contains(&i) && (y.0..y.1).contains(&j) && (8..12).contains(&k)
}

/// DKA-style labels: striatum and cerebellum on both sides, x < 0 is left.
pub fn atlas_label(i: usize, j: usize, k: usize) -> f32 {
    let regions = [
        (11.0, (4, 7), (10, 13)),
        (12.0, (4, 7), (5, 8)),
        (50.0, (13, 16), (10, 13)),
        (51.0, (13, 16), (5, 8)),
        (8.0, (3, 8), (0, 3)),
        (47.0, (12, 17), (0, 3)),
    ];
    regions
        .iter()
        .find(|(_, x, y)| in_box(i, j, k, *x, *y))
        .map(|(label, _, _)| *label)
        .unwrap_or(0.0)
}

/// Tumour lateral to the left caudate, touching no atlas label.
pub fn in_tumor(i: usize, j: usize, k: usize) -> bool {
    in_box(i, j, k, (1, 4), (10, 13))
}

/// Static uptake: tumour 6, left striatum 4, right striatum 2, elsewhere 1.
pub fn uptake(i: usize, j: usize, k: usize) -> f32 {
    if in_tumor(i, j, k) {
        return 6.0;
    }
    match atlas_label(i, j, k) as i32 {
        11 | 12 => 4.0,
        50 | 51 => 2.0,
        _ => 1.0,
    }
}

pub fn volume(f: impl Fn(usize, usize, usize) -> f32) -> Volume {
    Volume::from_array(Array3::from_shape_fn((N, N, N), |(i, j, k)| f(i, j, k)), affine())
}

pub const FRAME_STARTS: [f64; 6] = [0.0, 300.0, 600.0, 900.0, 1200.0, 1500.0];
pub const FRAME_DURATION: f64 = 300.0;

/// Frame `t` carries `(t + 1) * uptake`.
pub fn series() -> Volume4 {
    let mut data = Array4::<f32>::zeros((N, N, N, FRAME_STARTS.len()));
    for (t, mut frame) in data.axis_iter_mut(Axis(3)).enumerate() {
        frame
            .indexed_iter_mut()
            .for_each(|((i, j, k), v)| *v = (t + 1) as f32 * uptake(i, j, k));
    }
    Volume4::from_array(data, affine())
}

/// Shared template and atlas under `<root>/atlas`.
pub fn settings(root: &Path) -> PipelineSettings {
    let dir = root.join("atlas");
    fs::create_dir_all(&dir).unwrap();
    let settings = PipelineSettings::new(dir.join("template.nii.gz"), dir.join("atlas.nii.gz"));
    volume(|_, _, _| 1.0).save(&settings.template).unwrap();
    volume(atlas_label).save(&settings.atlas).unwrap();
    settings
}

/// Replace a subject's skull-stripped MRI with an x gradient, `1 + i`, on a
/// grid shifted half a voxel towards -x.
pub fn write_gradient_brain(work_dir: &Path, key: &str) {
    let mut shifted = affine();
    shifted[(0, 3)] -= 0.5;
    Volume::from_array(Array3::from_shape_fn((N, N, N), |(i, _, _)| 1.0 + i as f32), shifted)
        .save(work_dir.join(format!("{key}/{key}_brain.nii.gz")))
        .unwrap();
}

pub struct SubjectFixture<'a> {
    pub key: &'a str,
    pub static_pet: bool,
    pub dynamic: bool,
}

/// Write the inputs of a subject under `work_dir/<key>` and return its config entry.
pub fn write_subject(work_dir: &Path, fixture: &SubjectFixture<'_>) -> serde_json::Value {
    let dir = work_dir.join(fixture.key);
    fs::create_dir_all(&dir).unwrap();
    let name = |suffix: &str| format!("{}/{}_{suffix}", fixture.key, fixture.key);

    volume(|_, _, _| 1.0).save(work_dir.join(name("T1w.nii.gz"))).unwrap();
    volume(|_, _, _| 1.0).save(work_dir.join(name("brain.nii.gz"))).unwrap();
    volume(|i, j, k| f32::from(u8::from(in_tumor(i, j, k))))
        .save(work_dir.join(name("tumor.nii.gz")))
        .unwrap();

    let mut entry = json!({
        "tumor_mri": name("tumor.nii.gz"),
        "mri": name("T1w.nii.gz"),
        "mri_str": name("brain.nii.gz"),
    });
    if fixture.static_pet {
        volume(uptake).save(work_dir.join(name("ses-01_pet.nii.gz"))).unwrap();
        entry["pet"] = json!(name("ses-01_pet.nii.gz"));
    }
    if fixture.dynamic {
        series().save(work_dir.join(name("ses-02_pet.nii.gz"))).unwrap();
        let sidecar = json!({
            "FrameTimesStart": FRAME_STARTS,
            "FrameDuration": vec![FRAME_DURATION; FRAME_STARTS.len()],
        });
        fs::write(work_dir.join(name("ses-02_pet.json")), sidecar.to_string()).unwrap();
        entry["pet4d"] = json!(name("ses-02_pet.nii.gz"));
        entry["pet_json"] = json!(name("ses-02_pet.json"));
    }
    entry
}

pub fn write_config(path: &Path, entries: &[(&str, serde_json::Value)]) -> PathBuf {
    let map: serde_json::Map<String, serde_json::Value> = entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    fs::write(path, serde_json::Value::Object(map).to_string()).unwrap();
    path.to_path_buf()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Progress(u32),
    Message(String),
    Error(String),
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn progress(&self) -> Vec<u32> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::Progress(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::Error(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn log_progress(&self, percent: u32) {
        self.events.lock().unwrap().push(Event::Progress(percent));
    }

    fn log_message(&self, message: &str) {
        self.events.lock().unwrap().push(Event::Message(message.to_string()));
    }

    fn log_error(&self, message: &str) {
        self.events.lock().unwrap().push(Event::Error(message.to_string()));
    }
}

/// Native backend whose registrations fail for inputs under `poisoned`.
pub struct FailingBackend {
    pub poisoned: &'static str,
}

impl RegistrationBackend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn transform_extension(&self) -> &'static str {
        NativeBackend.transform_extension()
    }

    fn register(&self, request: &RegistrationRequest<'_>) -> fdopa_pipeline_lib::Result<()> {
        let hit = [request.fixed, request.moving]
            .iter()
            .any(|p| p.to_string_lossy().contains(self.poisoned));
        if hit {
            return Err(PipelineError::Registration {
                stage: "simulated".into(),
                reason: "exit status: 1".into(),
            });
        }
        NativeBackend.register(request)
    }

    fn apply(&self, request: &ResampleRequest<'_>) -> fdopa_pipeline_lib::Result<()> {
        NativeBackend.apply(request)
    }
}
