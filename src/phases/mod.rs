//! The three local phase handlers and the context they share.

pub mod decomposition;
pub mod init;
pub mod statistics;

use crate::cache::CacheStore;
use crate::config::RunConfig;
use crate::error::PhaseError;
use crate::message::SiteState;
use crate::volume::{Volume, VolumeCodec};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Everything one invocation needs, built once and passed to the selected handler.
pub struct PhaseContext<'a> {
    pub state: SiteState,
    pub cache: CacheStore,
    pub codec: &'a dyn VolumeCodec,
    pub config: &'a RunConfig,
}

impl<'a> PhaseContext<'a> {
    pub fn new(
        state: SiteState,
        codec: &'a dyn VolumeCodec,
        config: &'a RunConfig,
    ) -> Result<Self, PhaseError> {
        let cache = CacheStore::open(&state.cache_directory)?;
        Ok(Self {
            state,
            cache,
            codec,
            config,
        })
    }

    /// Resolves a subject or mask file name against the site's input directory.
    pub fn input_path(&self, name: &str) -> PathBuf {
        self.state.base_directory.join(name)
    }

    pub fn transfer_path(&self, name: &str) -> PathBuf {
        self.state.transfer_directory.join(name)
    }

    pub fn load_volume(&self, name: &str) -> Result<Volume, PhaseError> {
        Ok(self.codec.load(&self.input_path(name))?)
    }

    /// Writes the bulk numeric document for this phase into the transfer directory.
    pub fn write_report<T: Serialize>(&self, report: &T) -> Result<PathBuf, PhaseError> {
        let path = self.transfer_path(&self.config.output_name);
        ensure_dir(&self.state.transfer_directory)?;
        let io = |source: std::io::Error| PhaseError::Io {
            path: path.clone(),
            source,
        };
        let mut writer = BufWriter::new(fs::File::create(&path).map_err(io)?);
        serde_json::to_writer(&mut writer, report).map_err(|e| io(e.into()))?;
        writer.flush().map_err(io)?;
        Ok(path)
    }
}

pub(crate) fn ensure_dir(dir: &Path) -> Result<(), PhaseError> {
    fs::create_dir_all(dir).map_err(|source| PhaseError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

/// Decodes a handler's `input` against its schema.
pub(crate) fn parse_input<T: DeserializeOwned>(
    phase: &'static str,
    input: &Value,
) -> Result<T, PhaseError> {
    T::deserialize(input).map_err(|source| PhaseError::Schema { phase, source })
}

pub(crate) fn require_finite(name: &str, value: f64) -> Result<f64, PhaseError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(PhaseError::Protocol(format!(
            "'{name}' must be a finite number, got {value}"
        )))
    }
}
