//! Round 2: residual sums of the cached local data under the global fit.

use super::{PhaseContext, parse_input};
use crate::cache::{CacheError, CacheKey};
use crate::decompose::decompose;
use crate::error::PhaseError;
use crate::message::{
    DecompositionInput, DecompositionReport, PhaseEnvelope, PhaseTagOutput, matrix_rows,
};
use ndarray::{Array1, Array2};
use serde_json::Value;
use std::collections::BTreeMap;

pub const INPUT_TAG: &str = "remote_1";
pub const OUTPUT_TAG: &str = "local_2";

pub fn run(
    ctx: &PhaseContext<'_>,
    message: &Value,
) -> Result<PhaseEnvelope<PhaseTagOutput>, PhaseError> {
    let input: DecompositionInput = parse_input("decomposition", &message["input"])?;

    for key in [CacheKey::Covariates, CacheKey::Dependents] {
        if let Some(name) = message["cache"][key.as_str()].as_str()
            && name != key.file_name()
        {
            log::debug!(
                "[voxreg decompose] message cache names '{name}' for '{}'; reading the store's own entry",
                key.as_str()
            );
        }
    }

    let x = ctx.cache.get_matrix(CacheKey::Covariates)?;
    let y = ctx.cache.get_matrix(CacheKey::Dependents)?;
    if x.nrows() != y.nrows() {
        return Err(CacheError::Corrupt {
            key: CacheKey::Dependents,
            reason: format!(
                "{} response rows for {} design rows",
                y.nrows(),
                x.nrows()
            ),
        }
        .into());
    }

    let (beta, mean_global) = global_parameters(&input, x.ncols(), y.ncols())?;
    log::info!(
        "[voxreg decompose] evaluating global fit on {} subject(s) x {} voxel(s)",
        y.nrows(),
        y.ncols()
    );

    let result = decompose(&x, &y, &beta, &mean_global);
    for (statistic, values) in [("SSE_local", &result.sse), ("SST_local", &result.sst)] {
        if let Some(col) = values.iter().position(|v| !v.is_finite()) {
            return Err(PhaseError::NonFiniteStatistic {
                statistic,
                row: 0,
                col,
            });
        }
    }

    let report = DecompositionReport {
        sse_local: result.sse.to_vec(),
        sst_local: result.sst.to_vec(),
        var_x_matrix_local: matrix_rows(&result.var_x),
    };
    let path = ctx.write_report(&report)?;
    log::info!("[voxreg decompose] wrote residual sums to {}", path.display());

    Ok(PhaseEnvelope {
        output: PhaseTagOutput {
            computation_phase: OUTPUT_TAG,
        },
        cache: BTreeMap::new(),
    })
}

/// Validates the aggregator's parameters against the cached shapes and lays the
/// coefficients out as p × v.
fn global_parameters(
    input: &DecompositionInput,
    p: usize,
    v: usize,
) -> Result<(Array2<f64>, Array1<f64>), PhaseError> {
    if input.avg_beta_vector.len() != v {
        return Err(PhaseError::Protocol(format!(
            "avg_beta_vector has {} entries for {v} voxel(s)",
            input.avg_beta_vector.len()
        )));
    }
    if input.mean_y_global.len() != v {
        return Err(PhaseError::Protocol(format!(
            "mean_y_global has {} entries for {v} voxel(s)",
            input.mean_y_global.len()
        )));
    }

    let mut beta = Array2::<f64>::zeros((p, v));
    for (voxel, coefficients) in input.avg_beta_vector.iter().enumerate() {
        if coefficients.len() != p {
            return Err(PhaseError::Protocol(format!(
                "avg_beta_vector[{voxel}] has {} coefficient(s), the cached design has {p} column(s)",
                coefficients.len()
            )));
        }
        if coefficients.iter().any(|b| !b.is_finite()) {
            return Err(PhaseError::Protocol(format!(
                "avg_beta_vector[{voxel}] contains a non-finite coefficient"
            )));
        }
        beta.column_mut(voxel)
            .assign(&Array1::from(coefficients.clone()));
    }
    if let Some(voxel) = input.mean_y_global.iter().position(|m| !m.is_finite()) {
        return Err(PhaseError::Protocol(format!(
            "mean_y_global[{voxel}] is not finite"
        )));
    }

    Ok((beta, Array1::from(input.mean_y_global.clone())))
}
