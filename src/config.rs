use serde::{Deserialize, Serialize};

/// Per-invocation settings for the local node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Worker threads for the blocked kernels; `None` leaves rayon's default.
    pub threads: Option<usize>,
    /// File name of the bulk numeric document written at phases 1 and 2.
    pub output_name: String,
    /// File name of the group-average volume written at phase 0.
    pub avg_name: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            threads: None,
            output_name: "local_output".to_string(),
            avg_name: "avg_nifti.nii".to_string(),
        }
    }
}

impl RunConfig {
    /// Rejects names that would escape the transfer directory.
    pub fn validate(&self) -> Result<(), String> {
        for (field, name) in [("output_name", &self.output_name), ("avg_name", &self.avg_name)] {
            if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
                return Err(format!("{field} must be a plain file name, got '{name}'"));
            }
        }
        if self.threads == Some(0) {
            return Err("threads must be at least 1".to_string());
        }
        Ok(())
    }
}
