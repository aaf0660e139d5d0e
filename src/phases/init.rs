//! Round 0: validate subject images, write the group average, cache the arguments.

use super::{PhaseContext, parse_input, require_finite};
use crate::cache::CacheKey;
use crate::covariates::CovariateTable;
use crate::error::PhaseError;
use crate::message::{InitInput, InitOutput, PhaseEnvelope};
use crate::volume::VolumeAccumulator;
use serde_json::Value;
use std::collections::BTreeMap;

pub const OUTPUT_TAG: &str = "local_0";

pub fn run(ctx: &PhaseContext<'_>, message: &Value) -> Result<PhaseEnvelope<InitOutput>, PhaseError> {
    let input: InitInput = parse_input("initialization", &message["input"])?;
    let threshold = require_finite("threshold", input.threshold)?;
    let voxel_size = require_finite("voxel_size", input.voxel_size)?;
    require_finite("lambda", input.lambda)?;

    let table = CovariateTable::from_subjects(&input.covariates)?;
    log::info!(
        "[voxreg init] validating {} subject image(s) with {} covariate(s)",
        table.len(),
        table.names().len()
    );

    let mut accumulator = VolumeAccumulator::new();
    let mut retained = Vec::with_capacity(table.len());
    for subject in table.subjects() {
        let volume = match ctx.load_volume(subject) {
            Ok(volume) => volume,
            Err(e) => {
                log::warn!("[voxreg init] excluding '{subject}': {e}");
                continue;
            }
        };
        let validity = volume.validity();
        if !validity.is_valid() {
            log::warn!(
                "[voxreg init] excluding '{subject}': image is {}",
                validity.describe()
            );
            continue;
        }
        accumulator.add(&volume).map_err(|e| {
            PhaseError::DataInsufficiency(format!(
                "subject '{subject}' does not share the first retained image's grid: {e}"
            ))
        })?;
        retained.push(subject.clone());
    }

    let excluded = table.len() - retained.len();
    let Some(average) = accumulator.mean() else {
        return Err(PhaseError::DataInsufficiency(format!(
            "all {} subject image(s) were excluded; nothing left to analyse",
            table.len()
        )));
    };
    log::info!(
        "[voxreg init] retained {} subject(s), excluded {excluded}",
        retained.len()
    );

    super::ensure_dir(&ctx.state.transfer_directory)?;
    let avg_path = ctx.transfer_path(&ctx.config.avg_name);
    ctx.codec.save(&average, &avg_path)?;
    log::debug!("[voxreg init] wrote group average to {}", avg_path.display());

    let categorical_dict = table.retain(&retained)?.categorical_dict();

    ctx.cache.put_json(CacheKey::ArgsFile, message)?;
    ctx.cache.put_json(CacheKey::RetainedSubjects, &retained)?;

    Ok(PhaseEnvelope {
        output: InitOutput {
            categorical_dict,
            threshold,
            voxel_size,
            avg_nifti: ctx.config.avg_name.clone(),
            computation_phase: OUTPUT_TAG,
        },
        cache: BTreeMap::new(),
    })
}
