//! Round 1: build the final design/response matrices and emit sufficient statistics.

use super::{PhaseContext, parse_input};
use crate::cache::CacheKey;
use crate::covariates::CovariateTable;
use crate::diagnostics::local_diagnostics;
use crate::error::PhaseError;
use crate::matrix::{ResponseMatrix, SITE_LABEL_PREFIX};
use crate::message::{
    InitInput, PhaseEnvelope, PhaseTagOutput, StatisticsInput, StatisticsReport, matrix_rows,
};
use crate::stats::SufficientStatistics;
use crate::volume::Volume;
use ndarray::Array2;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde_json::Value;
use std::collections::BTreeMap;

pub const INPUT_TAG: &str = "remote_0";
pub const OUTPUT_TAG: &str = "local_1";

pub fn run(
    ctx: &PhaseContext<'_>,
    message: &Value,
) -> Result<PhaseEnvelope<PhaseTagOutput>, PhaseError> {
    let input: StatisticsInput = parse_input("statistics", &message["input"])?;

    let original: Value = ctx.cache.get_json(CacheKey::ArgsFile)?;
    let original: InitInput = parse_input("cached arguments", &original["input"])?;
    let retained: Vec<String> = ctx.cache.get_json(CacheKey::RetainedSubjects)?;
    let lambda = original.lambda;
    if let Some(incoming) = input.lambda
        && incoming.to_bits() != lambda.to_bits()
    {
        log::warn!(
            "[voxreg stats] ignoring lambda={incoming} from the aggregator; keeping cached lambda={lambda}"
        );
    }
    if retained.is_empty() {
        return Err(PhaseError::DataInsufficiency(
            "no subjects survived initialization".to_string(),
        ));
    }

    let table = CovariateTable::from_subjects(&original.covariates)?.retain(&retained)?;
    let dictionary = match input.global_dict {
        Some(dict) => dict,
        None => {
            log::debug!("[voxreg stats] no global_dict received; encoding with local levels");
            table.categorical_dict()
        }
    };
    let encoded = table.encode(&dictionary)?.with_bias();

    let response = load_responses(ctx, &retained, input.mask.as_deref())?;
    log::info!(
        "[voxreg stats] {} subject(s) x {} voxel(s), {} design column(s) before site terms",
        response.nrows(),
        response.nvoxels(),
        encoded.ncols()
    );

    let local_stats_list = match local_diagnostics(&encoded, &response) {
        Ok(list) => list,
        Err(e) => {
            log::warn!("[voxreg stats] local system is singular, skipping diagnostics: {e}");
            Vec::new()
        }
    };

    let client_id = ctx.state.client_id.as_deref();
    if !input.site_covar_list.is_empty() {
        let own = client_id.map(|id| format!("{SITE_LABEL_PREFIX}{id}"));
        if !input.site_covar_list.iter().any(|l| Some(l) == own.as_ref()) {
            log::warn!(
                "[voxreg stats] none of {} site covariate(s) names this site (clientId={client_id:?})",
                input.site_covar_list.len()
            );
        }
    }
    let design = encoded.with_site_columns(&input.site_covar_list, client_id);

    let stats = SufficientStatistics::compute(&design, &response, lambda)?;
    stats.ensure_finite()?;

    ctx.cache.put_matrix(CacheKey::Covariates, design.values())?;
    ctx.cache.put_matrix(CacheKey::Dependents, response.values())?;

    let report = StatisticsReport {
        xtx_local: matrix_rows(&stats.xtx),
        xty_local: matrix_rows(&stats.xty),
        mean_y_local: stats.mean_y.to_vec(),
        count_local: stats.count_y,
        local_stats_list,
        x_labels: stats.labels,
        lambda,
    };
    let path = ctx.write_report(&report)?;
    log::info!("[voxreg stats] wrote sufficient statistics to {}", path.display());

    let cache = BTreeMap::from([
        (
            CacheKey::Covariates.as_str().to_string(),
            CacheKey::Covariates.file_name().to_string(),
        ),
        (
            CacheKey::Dependents.as_str().to_string(),
            CacheKey::Dependents.file_name().to_string(),
        ),
    ]);
    Ok(PhaseEnvelope {
        output: PhaseTagOutput {
            computation_phase: OUTPUT_TAG,
        },
        cache,
    })
}

/// Loads every retained subject (rows in `retained` order) and keeps the in-mask voxels.
fn load_responses(
    ctx: &PhaseContext<'_>,
    retained: &[String],
    mask: Option<&str>,
) -> Result<ResponseMatrix, PhaseError> {
    let volumes: Vec<Volume> = retained
        .par_iter()
        .map(|subject| {
            let volume = ctx.load_volume(subject).map_err(|e| {
                PhaseError::DataInsufficiency(format!(
                    "subject '{subject}' passed initialization but no longer loads: {e}"
                ))
            })?;
            let validity = volume.validity();
            if !validity.is_valid() {
                return Err(PhaseError::DataInsufficiency(format!(
                    "subject '{subject}' passed initialization but its image is now {}",
                    validity.describe()
                )));
            }
            Ok(volume)
        })
        .collect::<Result<_, _>>()?;

    let shape = volumes[0].shape().to_vec();
    if let Some((subject, volume)) = retained
        .iter()
        .zip(&volumes)
        .find(|(_, v)| v.shape() != shape.as_slice())
    {
        return Err(PhaseError::DataInsufficiency(format!(
            "subject '{subject}' has grid {:?}, expected {shape:?}",
            volume.shape()
        )));
    }

    let voxels: Vec<usize> = match mask {
        Some(name) => {
            let mask = ctx.load_volume(name)?;
            if mask.shape() != shape.as_slice() {
                return Err(PhaseError::DataInsufficiency(format!(
                    "mask '{name}' has grid {:?}, subject images have {shape:?}",
                    mask.shape()
                )));
            }
            mask.data()
                .iter()
                .enumerate()
                .filter(|(_, v)| **v != 0.0 && !v.is_nan())
                .map(|(i, _)| i)
                .collect()
        }
        None => (0..volumes[0].len()).collect(),
    };

    let mut values = Array2::<f64>::zeros((volumes.len(), voxels.len()));
    for (mut row, volume) in values.rows_mut().into_iter().zip(&volumes) {
        let data = volume.data();
        for (dst, &voxel) in row.iter_mut().zip(&voxels) {
            *dst = data[voxel];
        }
    }
    Ok(ResponseMatrix::new(retained.to_vec(), values))
}
