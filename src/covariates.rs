//! Covariate table collaborator: parses the per-subject covariate object, reports the
//! categorical levels a site observed, and encodes the table into design columns.

use crate::matrix::DesignMatrix;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// One covariate cell as it appears in the input document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CovariateValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl CovariateValue {
    /// Level name used when the covariate is treated as categorical.
    pub fn level(&self) -> String {
        match self {
            CovariateValue::Bool(b) => b.to_string(),
            CovariateValue::Number(v) => v.to_string(),
            CovariateValue::Text(s) => s.clone(),
        }
    }
}

/// Subject image path → covariate name → value.
pub type SubjectCovariates = BTreeMap<String, BTreeMap<String, CovariateValue>>;

/// Covariate name → ordered levels; the first level is the dummy-coding reference.
pub type CategoricalDictionary = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CovariateKind {
    Numeric,
    Boolean,
    Categorical,
}

#[derive(Debug, Error)]
pub enum CovariateError {
    #[error("the covariate table lists no subjects")]
    NoSubjects,

    #[error("subject '{subject}' has no value for covariate '{name}'")]
    MissingValue { subject: String, name: String },

    #[error("subject '{0}' is not present in the covariate table")]
    UnknownSubject(String),

    #[error("categorical covariate '{0}' has no levels in the encoding dictionary")]
    MissingDictionary(String),

    #[error("level '{level}' of covariate '{name}' is absent from the encoding dictionary")]
    UnknownLevel { name: String, level: String },
}

#[derive(Debug, Clone)]
pub struct CovariateTable {
    subjects: Vec<String>,
    names: Vec<String>,
    kinds: Vec<CovariateKind>,
    rows: Vec<Vec<CovariateValue>>,
}

impl CovariateTable {
    /// Builds the table with subjects and covariate names in sorted order. Every subject
    /// must carry every covariate named by any subject.
    pub fn from_subjects(input: &SubjectCovariates) -> Result<Self, CovariateError> {
        if input.is_empty() {
            return Err(CovariateError::NoSubjects);
        }
        let names: Vec<String> = input
            .values()
            .flat_map(|cells| cells.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut subjects = Vec::with_capacity(input.len());
        let mut rows = Vec::with_capacity(input.len());
        for (subject, cells) in input {
            let mut row = Vec::with_capacity(names.len());
            for name in &names {
                let value = cells.get(name).ok_or_else(|| CovariateError::MissingValue {
                    subject: subject.clone(),
                    name: name.clone(),
                })?;
                row.push(value.clone());
            }
            subjects.push(subject.clone());
            rows.push(row);
        }

        let kinds = (0..names.len())
            .map(|col| infer_kind(rows.iter().map(|row| &row[col])))
            .collect();

        Ok(Self {
            subjects,
            names,
            kinds,
            rows,
        })
    }

    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn kinds(&self) -> &[CovariateKind] {
        &self.kinds
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Restricts (and reorders) the table to `subjects`. Column kinds are kept from the
    /// full table so the encoding does not depend on which subjects were excluded.
    pub fn retain(&self, subjects: &[String]) -> Result<Self, CovariateError> {
        let index: BTreeMap<&str, usize> = self
            .subjects
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i))
            .collect();
        let mut rows = Vec::with_capacity(subjects.len());
        for subject in subjects {
            let at = index
                .get(subject.as_str())
                .ok_or_else(|| CovariateError::UnknownSubject(subject.clone()))?;
            rows.push(self.rows[*at].clone());
        }
        Ok(Self {
            subjects: subjects.to_vec(),
            names: self.names.clone(),
            kinds: self.kinds.clone(),
            rows,
        })
    }

    /// Sorted distinct levels of every categorical covariate.
    pub fn categorical_dict(&self) -> CategoricalDictionary {
        let mut dict = CategoricalDictionary::new();
        for (col, name) in self.names.iter().enumerate() {
            if self.kinds[col] != CovariateKind::Categorical {
                continue;
            }
            let levels: BTreeSet<String> = self.rows.iter().map(|row| row[col].level()).collect();
            dict.insert(name.clone(), levels.into_iter().collect());
        }
        dict
    }

    /// Encodes the table without a bias column. Numeric covariates pass through,
    /// booleans become 0/1, categoricals are dummy-coded against `dictionary` with the
    /// first level dropped (`<name>_<level>` labels).
    pub fn encode(&self, dictionary: &CategoricalDictionary) -> Result<DesignMatrix, CovariateError> {
        let mut labels = Vec::new();
        // Per covariate: first output column and the levels it expands to.
        let mut layout: Vec<(usize, Option<&[String]>)> = Vec::with_capacity(self.names.len());
        for (col, name) in self.names.iter().enumerate() {
            let start = labels.len();
            match self.kinds[col] {
                CovariateKind::Numeric | CovariateKind::Boolean => {
                    labels.push(name.clone());
                    layout.push((start, None));
                }
                CovariateKind::Categorical => {
                    let levels = dictionary
                        .get(name)
                        .filter(|levels| !levels.is_empty())
                        .ok_or_else(|| CovariateError::MissingDictionary(name.clone()))?;
                    for level in levels.iter().skip(1) {
                        labels.push(format!("{name}_{level}"));
                    }
                    layout.push((start, Some(levels.as_slice())));
                }
            }
        }

        let mut values = Array2::<f64>::zeros((self.rows.len(), labels.len()));
        for (i, row) in self.rows.iter().enumerate() {
            for (col, cell) in row.iter().enumerate() {
                let (start, levels) = layout[col];
                match levels {
                    None => values[[i, start]] = numeric_value(cell),
                    Some(levels) => {
                        let level = cell.level();
                        let position = levels.iter().position(|l| *l == level).ok_or_else(|| {
                            CovariateError::UnknownLevel {
                                name: self.names[col].clone(),
                                level: level.clone(),
                            }
                        })?;
                        if position > 0 {
                            values[[i, start + position - 1]] = 1.0;
                        }
                    }
                }
            }
        }

        Ok(DesignMatrix::new(self.subjects.clone(), labels, values))
    }
}

fn infer_kind<'a>(values: impl Iterator<Item = &'a CovariateValue>) -> CovariateKind {
    let mut kind = CovariateKind::Boolean;
    for value in values {
        match value {
            CovariateValue::Text(_) => return CovariateKind::Categorical,
            CovariateValue::Number(_) => kind = CovariateKind::Numeric,
            CovariateValue::Bool(_) => {}
        }
    }
    kind
}

fn numeric_value(cell: &CovariateValue) -> f64 {
    match cell {
        CovariateValue::Bool(true) => 1.0,
        CovariateValue::Bool(false) => 0.0,
        CovariateValue::Number(v) => *v,
        // Text cells only occur in categorical columns.
        CovariateValue::Text(_) => f64::NAN,
    }
}
