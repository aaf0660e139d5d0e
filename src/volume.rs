use crate::nifti::NiftiHeader;
use ndarray::Array1;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("volume file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to access volume {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not a readable single-file NIfTI-1 image: {reason}", path.display())]
    Format { path: PathBuf, reason: String },

    #[error("unsupported NIfTI datatype code {code} in {}", path.display())]
    UnsupportedDatatype { path: PathBuf, code: i16 },

    #[error("gzip-compressed volume {} is not supported; decompress it first", .0.display())]
    Compressed(PathBuf),

    #[error("volume shape {shape:?} has more voxels than can be addressed")]
    Oversized { shape: Vec<usize> },

    #[error("volume shape {shape:?} holds {expected} values, but {found} were supplied")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        found: usize,
    },
}

impl VolumeError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            VolumeError::NotFound(path.to_path_buf())
        } else {
            VolumeError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Number of voxels on a grid, or `None` when the product overflows `usize`.
pub(crate) fn voxel_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &extent| acc.checked_mul(extent))
}

/// Outcome of the subject-level data-quality predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeValidity {
    Valid,
    Empty,
    AllNan,
    AllZero,
}

impl VolumeValidity {
    pub fn is_valid(self) -> bool {
        self == VolumeValidity::Valid
    }

    pub fn describe(self) -> &'static str {
        match self {
            VolumeValidity::Valid => "valid",
            VolumeValidity::Empty => "empty",
            VolumeValidity::AllNan => "entirely NaN",
            VolumeValidity::AllZero => "entirely zero",
        }
    }
}

/// A decoded image: its grid shape and the voxel values flattened in file order.
#[derive(Debug, Clone)]
pub struct Volume {
    shape: Vec<usize>,
    data: Array1<f64>,
    header: Option<NiftiHeader>,
}

impl Volume {
    pub fn new(shape: Vec<usize>, data: Array1<f64>) -> Result<Self, VolumeError> {
        let Some(expected) = voxel_count(&shape) else {
            return Err(VolumeError::Oversized { shape });
        };
        if expected != data.len() {
            return Err(VolumeError::ShapeMismatch {
                shape,
                expected,
                found: data.len(),
            });
        }
        Ok(Self {
            shape,
            data,
            header: None,
        })
    }

    pub(crate) fn with_header(mut self, header: NiftiHeader) -> Self {
        self.header = Some(header);
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &Array1<f64> {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn header(&self) -> Option<&NiftiHeader> {
        self.header.as_ref()
    }

    /// Classifies the volume for subject exclusion: empty, all-NaN and all-zero
    /// images carry no usable signal. A NaN counts as non-zero for the zero test.
    pub fn validity(&self) -> VolumeValidity {
        if self.data.is_empty() {
            VolumeValidity::Empty
        } else if self.data.iter().all(|v| v.is_nan()) {
            VolumeValidity::AllNan
        } else if self.data.iter().all(|&v| v == 0.0) {
            VolumeValidity::AllZero
        } else {
            VolumeValidity::Valid
        }
    }
}

/// Image collaborator: decodes subject volumes and encodes derived volumes.
pub trait VolumeCodec: Sync {
    fn load(&self, path: &Path) -> Result<Volume, VolumeError>;
    fn save(&self, volume: &Volume, path: &Path) -> Result<(), VolumeError>;
}

/// Running elementwise sum of retained subject volumes.
pub struct VolumeAccumulator {
    sum: Option<Volume>,
    count: usize,
}

impl VolumeAccumulator {
    pub fn new() -> Self {
        Self {
            sum: None,
            count: 0,
        }
    }

    /// Adds `volume`; the first volume added fixes the shape and header geometry.
    pub fn add(&mut self, volume: &Volume) -> Result<(), VolumeError> {
        match &mut self.sum {
            None => self.sum = Some(volume.clone()),
            Some(sum) => {
                if sum.shape != volume.shape {
                    return Err(VolumeError::ShapeMismatch {
                        shape: sum.shape.clone(),
                        expected: sum.len(),
                        found: volume.len(),
                    });
                }
                sum.data += &volume.data;
            }
        }
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Elementwise mean of everything added, or `None` if nothing was.
    pub fn mean(self) -> Option<Volume> {
        let count = self.count as f64;
        self.sum.map(|mut sum| {
            sum.data.mapv_inplace(|v| v / count);
            sum
        })
    }
}

impl Default for VolumeAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn validity_distinguishes_exclusion_reasons() {
        let empty = Volume::new(vec![0], Array1::zeros(0)).unwrap();
        let nan = Volume::new(vec![2], array![f64::NAN, f64::NAN]).unwrap();
        let zero = Volume::new(vec![2], array![0.0, 0.0]).unwrap();
        let mixed = Volume::new(vec![2], array![0.0, f64::NAN]).unwrap();
        let good = Volume::new(vec![2], array![0.0, 1.5]).unwrap();
        assert_eq!(empty.validity(), VolumeValidity::Empty);
        assert_eq!(nan.validity(), VolumeValidity::AllNan);
        assert_eq!(zero.validity(), VolumeValidity::AllZero);
        assert_eq!(mixed.validity(), VolumeValidity::Valid);
        assert_eq!(good.validity(), VolumeValidity::Valid);
    }

    #[test]
    fn accumulator_averages_and_rejects_shape_changes() {
        let mut acc = VolumeAccumulator::new();
        acc.add(&Volume::new(vec![3], array![1.0, 2.0, 3.0]).unwrap())
            .unwrap();
        acc.add(&Volume::new(vec![3], array![3.0, 4.0, 5.0]).unwrap())
            .unwrap();
        let wrong = Volume::new(vec![1, 3], array![1.0, 1.0, 1.0]).unwrap();
        assert!(matches!(
            acc.add(&wrong),
            Err(VolumeError::ShapeMismatch { .. })
        ));
        assert_eq!(acc.count(), 2);
        let mean = acc.mean().unwrap();
        assert_eq!(mean.data(), &array![2.0, 3.0, 4.0]);
    }

    #[test]
    fn new_rejects_mismatched_length() {
        assert!(Volume::new(vec![2, 2], array![1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn new_rejects_grids_too_large_to_address() {
        let shape = vec![usize::MAX, 2];
        assert!(voxel_count(&shape).is_none());
        assert!(matches!(
            Volume::new(shape, Array1::zeros(0)),
            Err(VolumeError::Oversized { .. })
        ));
    }
}
