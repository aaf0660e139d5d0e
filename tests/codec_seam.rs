use ndarray::Array1;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use voxreg::{ErrorKind, RunConfig, Volume, VolumeCodec, VolumeError, execute};

/// Serves volumes from memory by file name and records what gets saved.
#[derive(Default)]
struct MemoryCodec {
    volumes: HashMap<String, Volume>,
    saved: Mutex<Vec<(PathBuf, Vec<f64>)>>,
}

impl MemoryCodec {
    fn with(mut self, name: &str, shape: Vec<usize>, data: Vec<f64>) -> Self {
        self.volumes
            .insert(name.to_string(), Volume::new(shape, Array1::from(data)).unwrap());
        self
    }
}

impl VolumeCodec for MemoryCodec {
    fn load(&self, path: &Path) -> Result<Volume, VolumeError> {
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        self.volumes
            .get(&name)
            .cloned()
            .ok_or_else(|| VolumeError::NotFound(path.to_path_buf()))
    }

    fn save(&self, volume: &Volume, path: &Path) -> Result<(), VolumeError> {
        self.saved
            .lock()
            .unwrap()
            .push((path.to_path_buf(), volume.data().to_vec()));
        Ok(())
    }
}

fn message(root: &Path, covariates: serde_json::Value) -> serde_json::Value {
    json!({
        "state": {
            "baseDirectory": root.join("in"),
            "transferDirectory": root.join("out"),
            "cacheDirectory": root.join("cache")
        },
        "input": {"covariates": covariates, "threshold": 1, "voxel_size": 2, "lambda": 0.5}
    })
}

#[test]
fn average_covers_only_retained_subjects() {
    let dir = tempfile::tempdir().unwrap();
    let codec = MemoryCodec::default()
        .with("a.nii", vec![3], vec![1.0, 2.0, 3.0])
        .with("b.nii", vec![3], vec![0.0, 0.0, 0.0])
        .with("c.nii", vec![3], vec![3.0, 4.0, 5.0])
        .with("d.nii", vec![0], vec![]);
    let covariates = json!({
        "a.nii": {"x": 1}, "b.nii": {"x": 2}, "c.nii": {"x": 3},
        "d.nii": {"x": 4}, "gone.nii": {"x": 5}
    });
    let config = RunConfig {
        avg_name: "mean.nii".to_string(),
        ..RunConfig::default()
    };

    let out = execute(&message(dir.path(), covariates), &codec, &config).unwrap();
    assert_eq!(out["output"]["avg_nifti"], "mean.nii");
    assert_eq!(out["output"]["categorical_dict"], json!({}));

    let saved = codec.saved.lock().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].0, dir.path().join("out").join("mean.nii"));
    assert_eq!(saved[0].1, vec![2.0, 3.0, 4.0]);
}

#[test]
fn disagreeing_grids_are_insufficient_data() {
    let dir = tempfile::tempdir().unwrap();
    let codec = MemoryCodec::default()
        .with("a.nii", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0])
        .with("b.nii", vec![4], vec![1.0, 2.0, 3.0, 4.0]);
    let covariates = json!({"a.nii": {"x": 1}, "b.nii": {"x": 2}});
    let err = execute(&message(dir.path(), covariates), &codec, &RunConfig::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataInsufficiency);
    assert!(codec.saved.lock().unwrap().is_empty());
}

#[test]
fn malformed_initial_input_is_a_protocol_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut msg = message(dir.path(), json!({"a.nii": {"x": 1}}));
    msg["input"]["threshold"] = json!("high");
    let err = execute(&msg, &MemoryCodec::default(), &RunConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);

    let no_state = json!({"input": {"covariates": {}}});
    let err = execute(&no_state, &MemoryCodec::default(), &RunConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
}
