//! Write-once, on-disk key/value store scoped to one computation run.
//!
//! Every inter-phase value lives here: the process holds nothing in memory between
//! protocol rounds. A key may be written again only with byte-identical contents,
//! which lets a restarted phase replay its writes without ever changing an entry.

use byteorder::{LittleEndian, ReadBytesExt};
use ndarray::Array2;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use thiserror::Error;

const MATRIX_MAGIC: &[u8; 4] = b"VXRM";
const MATRIX_HEADER_LEN: usize = 4 + 8 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Verbatim initialization message.
    ArgsFile,
    /// Ordered subjects that passed initialization.
    RetainedSubjects,
    /// Final design matrix.
    Covariates,
    /// Response matrix.
    Dependents,
}

impl CacheKey {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheKey::ArgsFile => "args_file",
            CacheKey::RetainedSubjects => "retained_subjects",
            CacheKey::Covariates => "covariates",
            CacheKey::Dependents => "dependents",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            CacheKey::ArgsFile => "args_file.json",
            CacheKey::RetainedSubjects => "retained_subjects.json",
            CacheKey::Covariates => "covariates.vxrm",
            CacheKey::Dependents => "dependents.vxrm",
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache entry '{}' has not been written; was an earlier phase skipped?", .0.as_str())]
    Missing(CacheKey),

    #[error("cache entry '{}' already exists with different contents", .0.as_str())]
    Conflict(CacheKey),

    #[error("cache entry '{}' is corrupt: {reason}", key.as_str())]
    Corrupt { key: CacheKey, reason: String },

    #[error("cache I/O failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Opens (creating if needed) the store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| CacheError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn path_of(&self, key: CacheKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    pub fn contains(&self, key: CacheKey) -> bool {
        self.path_of(key).is_file()
    }

    pub fn put_json<T: Serialize + ?Sized>(
        &self,
        key: CacheKey,
        value: &T,
    ) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value).map_err(|e| CacheError::Corrupt {
            key,
            reason: format!("value does not serialize: {e}"),
        })?;
        self.put_bytes(key, &bytes)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: CacheKey) -> Result<T, CacheError> {
        let bytes = self.get_bytes(key)?;
        serde_json::from_slice(&bytes).map_err(|e| CacheError::Corrupt {
            key,
            reason: e.to_string(),
        })
    }

    /// Stores a dense matrix as `VXRM`, rows and cols as little-endian u64, then the
    /// values row-major as little-endian f64. Bits are preserved exactly.
    pub fn put_matrix(&self, key: CacheKey, matrix: &Array2<f64>) -> Result<(), CacheError> {
        let (rows, cols) = matrix.dim();
        let mut bytes = Vec::with_capacity(MATRIX_HEADER_LEN + 8 * rows * cols);
        bytes.extend_from_slice(MATRIX_MAGIC);
        bytes.extend_from_slice(&(rows as u64).to_le_bytes());
        bytes.extend_from_slice(&(cols as u64).to_le_bytes());
        for &value in matrix.iter() {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        self.put_bytes(key, &bytes)
    }

    pub fn get_matrix(&self, key: CacheKey) -> Result<Array2<f64>, CacheError> {
        let bytes = self.get_bytes(key)?;
        let corrupt = |reason: String| CacheError::Corrupt { key, reason };
        if bytes.len() < MATRIX_HEADER_LEN || &bytes[..4] != MATRIX_MAGIC {
            return Err(corrupt("missing VXRM header".to_string()));
        }
        let mut cursor = Cursor::new(&bytes[4..]);
        let rows = cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| corrupt(e.to_string()))? as usize;
        let cols = cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| corrupt(e.to_string()))? as usize;
        let expected = rows
            .checked_mul(cols)
            .and_then(|n| n.checked_mul(8))
            .and_then(|n| n.checked_add(MATRIX_HEADER_LEN));
        if expected != Some(bytes.len()) {
            return Err(corrupt(format!(
                "{rows}x{cols} matrix does not match a {}-byte entry",
                bytes.len()
            )));
        }
        let mut values = vec![0.0f64; rows * cols];
        cursor
            .read_f64_into::<LittleEndian>(&mut values)
            .map_err(|e| corrupt(e.to_string()))?;
        Array2::from_shape_vec((rows, cols), values).map_err(|e| corrupt(e.to_string()))
    }

    fn put_bytes(&self, key: CacheKey, bytes: &[u8]) -> Result<(), CacheError> {
        let path = self.path_of(key);
        if path.exists() {
            let existing = self.get_bytes(key)?;
            if existing == bytes {
                log::debug!("[voxreg cache] '{}' already holds identical contents", key.as_str());
                return Ok(());
            }
            return Err(CacheError::Conflict(key));
        }
        // Write to a sibling and rename, so a crash never leaves a half-written entry.
        let staging = self.root.join(format!(".{}.partial", key.file_name()));
        let io = |source: std::io::Error| CacheError::Io {
            path: path.clone(),
            source,
        };
        fs::write(&staging, bytes).map_err(io)?;
        fs::rename(&staging, &path).map_err(io)?;
        log::debug!(
            "[voxreg cache] wrote '{}' ({} bytes)",
            key.as_str(),
            bytes.len()
        );
        Ok(())
    }

    fn get_bytes(&self, key: CacheKey) -> Result<Vec<u8>, CacheError> {
        let path = self.path_of(key);
        let mut file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::Missing(key));
            }
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|source| CacheError::Io { path, source })?;
        Ok(bytes)
    }
}
