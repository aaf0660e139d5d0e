//! Protocol documents exchanged with the aggregator: the incoming envelope, the
//! per-phase input schemas, and the documents each phase emits.

use crate::covariates::{CategoricalDictionary, SubjectCovariates};
use crate::diagnostics::VoxelDiagnostics;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// Field that carries a phase tag anywhere in a message.
pub const PHASE_FIELD: &str = "computation_phase";

/// Site directories supplied by the runtime with every invocation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteState {
    pub base_directory: PathBuf,
    pub transfer_directory: PathBuf,
    pub cache_directory: PathBuf,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// The envelope every invocation receives. `input` is validated later by the
/// handler that owns it.
#[derive(Debug, Clone, Deserialize)]
pub struct PhaseMessage {
    pub state: SiteState,
    pub input: Value,
    #[serde(default)]
    pub cache: Map<String, Value>,
}

/// Round-0 local input, cached verbatim for the later phases.
#[derive(Debug, Clone, Deserialize)]
pub struct InitInput {
    pub covariates: SubjectCovariates,
    pub threshold: f64,
    pub voxel_size: f64,
    pub lambda: f64,
}

/// The aggregator's round-0 reply.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatisticsInput {
    #[serde(default)]
    pub site_covar_list: Vec<String>,
    #[serde(default)]
    pub global_dict: Option<CategoricalDictionary>,
    #[serde(default)]
    pub mask: Option<String>,
    #[serde(default)]
    pub lambda: Option<f64>,
}

/// The aggregator's round-1 reply: one coefficient vector and one mean per voxel.
#[derive(Debug, Clone, Deserialize)]
pub struct DecompositionInput {
    pub avg_beta_vector: Vec<Vec<f64>>,
    pub mean_y_global: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitOutput {
    pub categorical_dict: CategoricalDictionary,
    pub threshold: f64,
    pub voxel_size: f64,
    pub avg_nifti: String,
    pub computation_phase: &'static str,
}

/// Stdout output of the two later phases; the bulk numbers travel in the report file.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseTagOutput {
    pub computation_phase: &'static str,
}

/// Bulk numeric document written to the transfer directory by the statistics phase.
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsReport {
    #[serde(rename = "XtransposeX_local")]
    pub xtx_local: Vec<Vec<f64>>,
    #[serde(rename = "Xtransposey_local")]
    pub xty_local: Vec<Vec<f64>>,
    pub mean_y_local: Vec<f64>,
    pub count_local: Vec<usize>,
    pub local_stats_list: Vec<VoxelDiagnostics>,
    #[serde(rename = "X_labels")]
    pub x_labels: Vec<String>,
    pub lambda: f64,
}

/// Bulk numeric document written to the transfer directory by the decomposition phase.
#[derive(Debug, Clone, Serialize)]
pub struct DecompositionReport {
    #[serde(rename = "SSE_local")]
    pub sse_local: Vec<f64>,
    #[serde(rename = "SST_local")]
    pub sst_local: Vec<f64>,
    #[serde(rename = "varX_matrix_local")]
    pub var_x_matrix_local: Vec<Vec<f64>>,
}

/// `{output, cache}` document printed on stdout.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseEnvelope<O> {
    pub output: O,
    pub cache: BTreeMap<String, String>,
}

/// Collects every value stored under `field`, at any depth.
///
/// Traversal is depth-first; object members are visited in key order and array
/// elements in index order, so the result is stable for a given document. A matching
/// member's own value is also searched.
pub fn find_all<'a>(value: &'a Value, field: &str) -> Vec<&'a Value> {
    let mut found = Vec::new();
    collect(value, field, &mut found);
    found
}

fn collect<'a>(value: &'a Value, field: &str, found: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                let member = &map[key.as_str()];
                if key == field {
                    found.push(member);
                }
                collect(member, field, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, field, found);
            }
        }
        _ => {}
    }
}

/// Phase tags present in `message`, deduplicated keeping first occurrence.
pub fn phase_tags(message: &Value) -> Vec<String> {
    let mut seen = HashSet::new();
    find_all(message, PHASE_FIELD)
        .into_iter()
        .map(|tag| match tag {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .filter(|tag| seen.insert(tag.clone()))
        .collect()
}

pub(crate) fn matrix_rows(matrix: &ndarray::Array2<f64>) -> Vec<Vec<f64>> {
    matrix.rows().into_iter().map(|row| row.to_vec()).collect()
}
