#![deny(dead_code)]
#![deny(unused_imports)]
#![allow(non_snake_case)]

pub mod cache;
pub mod config;
pub mod covariates;
pub mod decompose;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod linalg;
pub mod matrix;
pub mod message;
pub mod nifti;
pub mod phases;
pub mod probability;
pub mod stats;
pub mod volume;

pub use cache::{CacheError, CacheKey, CacheStore};
pub use config::RunConfig;
pub use dispatch::{LocalPhase, execute, select_phase};
pub use error::{ErrorKind, PhaseError};
pub use matrix::{DesignMatrix, ResponseMatrix};
pub use nifti::NiftiCodec;
pub use volume::{Volume, VolumeCodec, VolumeError};
