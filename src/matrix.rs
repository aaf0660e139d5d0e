use ndarray::{Array2, s};

/// Label of the constant bias column.
pub const BIAS_LABEL: &str = "const";

/// Prefix the aggregator uses for site-identity covariates (`site_<clientId>`).
pub const SITE_LABEL_PREFIX: &str = "site_";

/// Subjects × columns design matrix with its column labels and row subjects.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignMatrix {
    subjects: Vec<String>,
    labels: Vec<String>,
    values: Array2<f64>,
}

impl DesignMatrix {
    pub fn new(subjects: Vec<String>, labels: Vec<String>, values: Array2<f64>) -> Self {
        debug_assert_eq!(subjects.len(), values.nrows(), "one row per subject");
        debug_assert_eq!(labels.len(), values.ncols(), "one label per column");
        Self {
            subjects,
            labels,
            values,
        }
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// Prepends the constant bias column.
    pub fn with_bias(self) -> Self {
        let mut values = Array2::<f64>::ones((self.nrows(), self.ncols() + 1));
        values.slice_mut(s![.., 1..]).assign(&self.values);
        let mut labels = Vec::with_capacity(self.labels.len() + 1);
        labels.push(BIAS_LABEL.to_string());
        labels.extend(self.labels);
        Self {
            subjects: self.subjects,
            labels,
            values,
        }
    }

    /// Appends one column per site label. A column is 1.0 on every row when the label
    /// names this site (`site_<client_id>`) and 0.0 otherwise.
    pub fn with_site_columns(self, site_labels: &[String], client_id: Option<&str>) -> Self {
        if site_labels.is_empty() {
            return self;
        }
        let own_label = client_id.map(|id| format!("{SITE_LABEL_PREFIX}{id}"));
        let p = self.ncols();
        let mut values = Array2::<f64>::zeros((self.nrows(), p + site_labels.len()));
        values.slice_mut(s![.., ..p]).assign(&self.values);
        for (col, label) in site_labels.iter().enumerate() {
            if own_label.as_deref() == Some(label.as_str()) {
                values.column_mut(p + col).fill(1.0);
            }
        }
        let mut labels = self.labels;
        labels.extend(site_labels.iter().cloned());
        Self {
            subjects: self.subjects,
            labels,
            values,
        }
    }
}

/// Subjects × voxels response matrix; rows follow the design matrix's subjects.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMatrix {
    subjects: Vec<String>,
    values: Array2<f64>,
}

impl ResponseMatrix {
    pub fn new(subjects: Vec<String>, values: Array2<f64>) -> Self {
        debug_assert_eq!(subjects.len(), values.nrows(), "one row per subject");
        Self { subjects, values }
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn nvoxels(&self) -> usize {
        self.values.ncols()
    }

    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }
}
