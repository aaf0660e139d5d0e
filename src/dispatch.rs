//! Selects and runs the one local phase a message calls for.

use crate::config::RunConfig;
use crate::error::PhaseError;
use crate::message::{PhaseMessage, phase_tags};
use crate::phases::{self, PhaseContext};
use crate::volume::VolumeCodec;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalPhase {
    Init,
    Statistics,
    Decomposition,
}

impl LocalPhase {
    pub fn name(self) -> &'static str {
        match self {
            LocalPhase::Init => "initialization",
            LocalPhase::Statistics => "statistics",
            LocalPhase::Decomposition => "decomposition",
        }
    }
}

/// Picks the phase from the tags found anywhere in `message`.
///
/// No tag means a fresh run. When both aggregator rounds are tagged the later round
/// wins. Any other tag set is a protocol error.
pub fn select_phase(message: &Value) -> Result<LocalPhase, PhaseError> {
    let tags = phase_tags(message);
    if tags.is_empty() {
        return Ok(LocalPhase::Init);
    }
    let has = |tag: &str| tags.iter().any(|t| t == tag);
    let round_0 = has(phases::statistics::INPUT_TAG);
    let round_1 = has(phases::decomposition::INPUT_TAG);
    match (round_0, round_1) {
        (true, true) => {
            log::warn!(
                "[voxreg dispatch] message carries both '{}' and '{}'; running the later round",
                phases::statistics::INPUT_TAG,
                phases::decomposition::INPUT_TAG
            );
            Ok(LocalPhase::Decomposition)
        }
        (false, true) => Ok(LocalPhase::Decomposition),
        (true, false) => Ok(LocalPhase::Statistics),
        (false, false) => Err(PhaseError::Protocol(format!(
            "unrecognized phase tag(s) {tags:?}; expected none, '{}' or '{}'",
            phases::statistics::INPUT_TAG,
            phases::decomposition::INPUT_TAG
        ))),
    }
}

/// Runs one invocation end to end and returns the stdout document.
pub fn execute(
    message: &Value,
    codec: &dyn VolumeCodec,
    config: &RunConfig,
) -> Result<Value, PhaseError> {
    let phase = select_phase(message)?;
    let envelope = PhaseMessage::deserialize(message)
        .map_err(|source| PhaseError::Schema {
            phase: "envelope",
            source,
        })?;
    log::info!("[voxreg dispatch] running {} phase", phase.name());

    let ctx = PhaseContext::new(envelope.state, codec, config)?;
    match phase {
        LocalPhase::Init => to_document(phases::init::run(&ctx, message)?),
        LocalPhase::Statistics => to_document(phases::statistics::run(&ctx, message)?),
        LocalPhase::Decomposition => to_document(phases::decomposition::run(&ctx, message)?),
    }
}

fn to_document<T: Serialize>(envelope: T) -> Result<Value, PhaseError> {
    serde_json::to_value(envelope).map_err(|source| PhaseError::Schema {
        phase: "output",
        source,
    })
}
