use ndarray::{Array1, Array2, array};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use voxreg::{
    CacheKey, CacheStore, ErrorKind, NiftiCodec, RunConfig, Volume, VolumeCodec, execute,
};

struct Site {
    _root: TempDir,
    base: PathBuf,
    transfer: PathBuf,
    cache: PathBuf,
}

impl Site {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let base = root.path().join("input");
        let transfer = root.path().join("transfer");
        let cache = root.path().join("cache");
        std::fs::create_dir_all(&base).unwrap();
        Self {
            _root: root,
            base,
            transfer,
            cache,
        }
    }

    fn state(&self) -> Value {
        json!({
            "baseDirectory": self.base,
            "transferDirectory": self.transfer,
            "cacheDirectory": self.cache,
            "clientId": "local0"
        })
    }

    fn write_volume(&self, name: &str, shape: Vec<usize>, data: Vec<f64>) {
        let volume = Volume::new(shape, Array1::from(data)).unwrap();
        NiftiCodec::new().save(&volume, &self.base.join(name)).unwrap();
    }

    fn report(&self) -> Value {
        read_json(&self.transfer.join("local_output"))
    }

    fn store(&self) -> CacheStore {
        CacheStore::open(&self.cache).unwrap()
    }
}

fn read_json(path: &Path) -> Value {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

fn as_matrix(value: &Value) -> Array2<f64> {
    let rows: Vec<Vec<f64>> = serde_json::from_value(value.clone()).unwrap();
    let ncols = rows.first().map_or(0, Vec::len);
    Array2::from_shape_vec((rows.len(), ncols), rows.concat()).unwrap()
}

fn init_message(site: &Site, covariates: Value) -> Value {
    json!({
        "state": site.state(),
        "input": {
            "covariates": covariates,
            "threshold": 0.2,
            "voxel_size": 4,
            "lambda": 0.0
        }
    })
}

fn round_0(site: &Site, input: Value) -> Value {
    let mut input = input;
    input["computation_phase"] = json!("remote_0");
    json!({"state": site.state(), "input": input, "cache": {}})
}

#[test]
fn three_subject_design_yields_exact_products() {
    let site = Site::new();
    site.write_volume("s1.nii", vec![1], vec![1.0]);
    site.write_volume("s2.nii", vec![1], vec![2.0]);
    site.write_volume("s3.nii", vec![1], vec![3.0]);
    let covariates = json!({
        "s1.nii": {"a": 0, "b": 1},
        "s2.nii": {"a": 1, "b": 1},
        "s3.nii": {"a": 0, "b": 2}
    });
    let config = RunConfig::default();

    let out = execute(&init_message(&site, covariates), &NiftiCodec::new(), &config).unwrap();
    assert_eq!(out["output"]["computation_phase"], "local_0");
    assert_eq!(out["output"]["avg_nifti"], "avg_nifti.nii");
    assert_eq!(out["output"]["threshold"], json!(0.2));
    let avg = NiftiCodec::new()
        .load(&site.transfer.join("avg_nifti.nii"))
        .unwrap();
    assert_eq!(avg.data(), &array![2.0]);

    let out = execute(&round_0(&site, json!({})), &NiftiCodec::new(), &config).unwrap();
    assert_eq!(out["output"], json!({"computation_phase": "local_1"}));
    assert_eq!(out["cache"]["covariates"], "covariates.vxrm");

    let report = site.report();
    assert_eq!(report["X_labels"], json!(["const", "a", "b"]));
    assert_eq!(
        as_matrix(&report["XtransposeX_local"]),
        array![[3.0, 1.0, 4.0], [1.0, 1.0, 1.0], [4.0, 1.0, 6.0]]
    );
    assert_eq!(
        as_matrix(&report["Xtransposey_local"]),
        array![[6.0], [2.0], [9.0]]
    );
    assert_eq!(report["mean_y_local"], json!([2.0]));
    assert_eq!(report["count_local"], json!([3]));
    assert_eq!(report["lambda"], json!(0.0));
    // Saturated local fit: coefficients exist, inference does not.
    let diag = &report["local_stats_list"][0];
    assert_eq!(diag["t Stat"], json!([null, null, null]));
    assert_eq!(diag["covariate_labels"], json!(["const", "a", "b"]));
}

#[test]
fn invalid_images_never_reach_the_cached_matrices() {
    let site = Site::new();
    site.write_volume("sub-a.nii", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
    site.write_volume("sub-b.nii", vec![2, 2], vec![f64::NAN; 4]);
    site.write_volume("sub-c.nii", vec![2, 2], vec![2.0, 2.0, 2.0, 2.0]);
    site.write_volume("sub-d.nii", vec![2, 2], vec![0.0; 4]);
    let covariates = json!({
        "sub-a.nii": {"age": 30, "group": "ctl"},
        "sub-b.nii": {"age": 40, "group": "pat"},
        "sub-c.nii": {"age": 50, "group": "pat"},
        "sub-d.nii": {"age": 60, "group": "mci"},
        "sub-e.nii": {"age": 70, "group": "mci"}
    });
    let config = RunConfig::default();

    let out = execute(&init_message(&site, covariates), &NiftiCodec::new(), &config).unwrap();
    // Only the retained subjects' levels are reported.
    assert_eq!(out["output"]["categorical_dict"], json!({"group": ["ctl", "pat"]}));
    let retained: Vec<String> = site.store().get_json(CacheKey::RetainedSubjects).unwrap();
    assert_eq!(retained, vec!["sub-a.nii", "sub-c.nii"]);

    execute(&round_0(&site, json!({})), &NiftiCodec::new(), &config).unwrap();
    let store = site.store();
    let x = store.get_matrix(CacheKey::Covariates).unwrap();
    let y = store.get_matrix(CacheKey::Dependents).unwrap();
    assert_eq!(x, array![[1.0, 30.0, 0.0], [1.0, 50.0, 1.0]]);
    assert_eq!(y, array![[1.0, 2.0, 3.0, 4.0], [2.0, 2.0, 2.0, 2.0]]);
    assert_eq!(site.report()["count_local"], json!([2, 2, 2, 2]));
}

#[test]
fn site_terms_mask_and_global_levels_shape_the_final_design() {
    let site = Site::new();
    site.write_volume("x1.nii", vec![3], vec![1.0, 5.0, 9.0]);
    site.write_volume("x2.nii", vec![3], vec![2.0, 6.0, 10.0]);
    site.write_volume("x3.nii", vec![3], vec![4.0, 7.0, 12.0]);
    site.write_volume("mask.nii", vec![3], vec![1.0, 0.0, 1.0]);
    let covariates = json!({
        "x1.nii": {"scanner": "b"},
        "x2.nii": {"scanner": "c"},
        "x3.nii": {"scanner": "b"}
    });
    let config = RunConfig::default();
    execute(&init_message(&site, covariates), &NiftiCodec::new(), &config).unwrap();

    let input = json!({
        "site_covar_list": ["site_local0", "site_local1"],
        "global_dict": {"scanner": ["a", "b", "c"]},
        "mask": "mask.nii",
        "lambda": 5.0
    });
    execute(&round_0(&site, input), &NiftiCodec::new(), &config).unwrap();

    let report = site.report();
    assert_eq!(
        report["X_labels"],
        json!(["const", "scanner_b", "scanner_c", "site_local0", "site_local1"])
    );
    // The cached lambda wins over the aggregator's.
    assert_eq!(report["lambda"], json!(0.0));
    assert_eq!(report["mean_y_local"].as_array().unwrap().len(), 2);

    let x = site.store().get_matrix(CacheKey::Covariates).unwrap();
    assert_eq!(
        x,
        array![
            [1.0, 1.0, 0.0, 1.0, 0.0],
            [1.0, 0.0, 1.0, 1.0, 0.0],
            [1.0, 1.0, 0.0, 1.0, 0.0]
        ]
    );
    let y = site.store().get_matrix(CacheKey::Dependents).unwrap();
    assert_eq!(y, array![[1.0, 9.0], [2.0, 10.0], [4.0, 12.0]]);
}

#[test]
fn decomposition_matches_brute_force_residuals() {
    let site = Site::new();
    site.write_volume("a.nii", vec![2], vec![1.0, 4.0]);
    site.write_volume("b.nii", vec![2], vec![2.0, 3.5]);
    site.write_volume("c.nii", vec![2], vec![3.0, 7.0]);
    site.write_volume("d.nii", vec![2], vec![0.5, 1.0]);
    let covariates = json!({
        "a.nii": {"dose": 0.0},
        "b.nii": {"dose": 1.0},
        "c.nii": {"dose": 2.0},
        "d.nii": {"dose": 0.5}
    });
    let config = RunConfig::default();
    execute(&init_message(&site, covariates), &NiftiCodec::new(), &config).unwrap();
    execute(&round_0(&site, json!({})), &NiftiCodec::new(), &config).unwrap();
    let xtx = as_matrix(&site.report()["XtransposeX_local"]);

    let beta = [[0.5, 1.0], [1.0, 2.0]];
    let mean = [1.6, 3.9];
    let message = json!({
        "state": site.state(),
        "input": {
            "avg_beta_vector": beta,
            "mean_y_global": mean,
            "computation_phase": "remote_1"
        },
        "cache": {"covariates": "covariates.vxrm", "dependents": "dependents.vxrm"}
    });
    let out = execute(&message, &NiftiCodec::new(), &config).unwrap();
    assert_eq!(out, json!({"output": {"computation_phase": "local_2"}, "cache": {}}));

    let report = site.report();
    let dose = [0.0, 1.0, 2.0, 0.5];
    let y = [[1.0, 4.0], [2.0, 3.5], [3.0, 7.0], [0.5, 1.0]];
    for v in 0..2 {
        let mut sse = 0.0;
        let mut sst = 0.0;
        for i in 0..4 {
            let fit = beta[v][0] + beta[v][1] * dose[i];
            sse += (y[i][v] - fit) * (y[i][v] - fit);
            sst += (y[i][v] - mean[v]) * (y[i][v] - mean[v]);
        }
        let got_sse = report["SSE_local"][v].as_f64().unwrap();
        let got_sst = report["SST_local"][v].as_f64().unwrap();
        approx::assert_relative_eq!(got_sse, sse, max_relative = 1e-12);
        approx::assert_relative_eq!(got_sst, sst, max_relative = 1e-12);
    }
    assert_eq!(as_matrix(&report["varX_matrix_local"]), xtx);
}

#[test]
fn statistics_are_bit_identical_across_pool_sizes_and_replays() {
    let site = Site::new();
    let nvox = 700;
    let mut covariates = serde_json::Map::new();
    for s in 0..12 {
        let name = format!("sub-{s:02}.nii");
        let data: Vec<f64> = (0..nvox)
            .map(|v| ((s * 31 + v * 7) % 97) as f64 * 0.013 + (v as f64 * 0.1).sin())
            .collect();
        site.write_volume(&name, vec![nvox], data);
        covariates.insert(name, json!({"age": 20.5 + s as f64 * 1.7, "score": (s % 5) as f64}));
    }
    let config = RunConfig::default();
    execute(
        &init_message(&site, Value::Object(covariates)),
        &NiftiCodec::new(),
        &config,
    )
    .unwrap();

    let run_with = |threads: usize| {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .unwrap();
        pool.install(|| execute(&round_0(&site, json!({})), &NiftiCodec::new(), &config))
            .unwrap();
        std::fs::read(site.transfer.join("local_output")).unwrap()
    };
    // The second run replays identical cache writes, which the store accepts.
    let single = run_with(1);
    let wide = run_with(4);
    assert_eq!(single, wide);

    let report: Value = serde_json::from_slice(&single).unwrap();
    let xtx = as_matrix(&report["XtransposeX_local"]);
    assert_eq!(xtx, xtx.t().to_owned());
    assert_eq!(report["mean_y_local"].as_array().unwrap().len(), nvox);
}

#[test]
fn out_of_order_and_unknown_phases_fail_without_output() {
    let site = Site::new();
    let config = RunConfig::default();

    let err = execute(&round_0(&site, json!({})), &NiftiCodec::new(), &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(!site.transfer.join("local_output").exists());

    let unknown = json!({"state": site.state(), "input": {"computation_phase": "remote_9"}});
    let err = execute(&unknown, &NiftiCodec::new(), &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn all_subjects_excluded_is_insufficient_data() {
    let site = Site::new();
    site.write_volume("z.nii", vec![2], vec![0.0, 0.0]);
    let covariates = json!({"z.nii": {"age": 1}, "missing.nii": {"age": 2}});
    let err = execute(
        &init_message(&site, covariates),
        &NiftiCodec::new(),
        &RunConfig::default(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataInsufficiency);
    assert_eq!(err.exit_code(), 3);
    assert!(!site.store().contains(CacheKey::ArgsFile));
}

#[test]
fn malformed_global_parameters_are_rejected() {
    let site = Site::new();
    site.write_volume("a.nii", vec![1], vec![1.0]);
    site.write_volume("b.nii", vec![1], vec![3.0]);
    let covariates = json!({"a.nii": {"g": true}, "b.nii": {"g": false}});
    let config = RunConfig::default();
    execute(&init_message(&site, covariates), &NiftiCodec::new(), &config).unwrap();
    execute(&round_0(&site, json!({})), &NiftiCodec::new(), &config).unwrap();

    let wrong_width = json!({
        "state": site.state(),
        "input": {"avg_beta_vector": [[1.0]], "mean_y_global": [2.0], "computation_phase": "remote_1"}
    });
    let err = execute(&wrong_width, &NiftiCodec::new(), &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[test]
fn corrupt_headers_exclude_the_subject_instead_of_aborting() {
    let site = Site::new();
    site.write_volume("good.nii", vec![2], vec![1.0, 2.0]);
    site.write_volume("far.nii", vec![2], vec![3.0, 4.0]);
    site.write_volume("huge.nii", vec![2], vec![5.0, 6.0]);

    let far = site.base.join("far.nii");
    let mut bytes = std::fs::read(&far).unwrap();
    bytes[108..112].copy_from_slice(&3.0e38f32.to_le_bytes());
    std::fs::write(&far, bytes).unwrap();

    let huge = site.base.join("huge.nii");
    let mut bytes = std::fs::read(&huge).unwrap();
    bytes[40..42].copy_from_slice(&7i16.to_le_bytes());
    for axis in 1..=7 {
        let at = 40 + 2 * axis;
        bytes[at..at + 2].copy_from_slice(&i16::MAX.to_le_bytes());
    }
    std::fs::write(&huge, bytes).unwrap();

    let covariates = json!({
        "good.nii": {"age": 1}, "far.nii": {"age": 2}, "huge.nii": {"age": 3}
    });
    let config = RunConfig::default();
    execute(&init_message(&site, covariates), &NiftiCodec::new(), &config).unwrap();

    let retained: Vec<String> = site.store().get_json(CacheKey::RetainedSubjects).unwrap();
    assert_eq!(retained, vec!["good.nii"]);
    let avg = NiftiCodec::new()
        .load(&site.transfer.join("avg_nifti.nii"))
        .unwrap();
    assert_eq!(avg.data(), &array![1.0, 2.0]);
}

#[test]
fn non_finite_statistics_leave_cache_and_transfer_untouched() {
    let site = Site::new();
    site.write_volume("a.nii", vec![3], vec![1.0, 2.0, 3.0]);
    site.write_volume("b.nii", vec![3], vec![2.0, f64::NAN, 4.0]);
    site.write_volume("c.nii", vec![3], vec![3.0, 1.0, 2.0]);
    let covariates = json!({"a.nii": {"age": 20}, "b.nii": {"age": 30}, "c.nii": {"age": 45}});
    let config = RunConfig::default();

    execute(&init_message(&site, covariates), &NiftiCodec::new(), &config).unwrap();
    let retained: Vec<String> = site.store().get_json(CacheKey::RetainedSubjects).unwrap();
    assert_eq!(retained.len(), 3);

    let err = execute(&round_0(&site, json!({})), &NiftiCodec::new(), &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataInsufficiency);
    let store = site.store();
    assert!(!store.contains(CacheKey::Covariates));
    assert!(!store.contains(CacheKey::Dependents));
    assert!(!site.transfer.join("local_output").exists());
}
