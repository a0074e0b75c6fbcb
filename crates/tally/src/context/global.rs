//! Session-wide context that is never compacted.
//!
//! [`GlobalContext`] is built once when the dataset is bound and then
//! borrowed by every budget computation and every generation prompt.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata describing the bound dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub path: String,
    /// Column names in file order.
    pub columns: Vec<String>,
    /// `(rows, cols)`.
    pub shape: (usize, usize),
    /// Declared dtype per column, as pandas reports it.
    pub dtypes: BTreeMap<String, String>,
    /// Text rendering of the first rows.
    pub preview: String,
}

impl DatasetInfo {
    /// Whether there is anything to analyse.
    pub fn is_empty(&self) -> bool {
        self.shape.0 == 0 || self.columns.is_empty()
    }

    /// One line per column: `- name (dtype)`.
    pub fn column_listing(&self) -> String {
        self.columns
            .iter()
            .map(|c| {
                let dtype = self.dtypes.get(c).map(String::as_str).unwrap_or("unknown");
                format!("- {c} ({dtype})")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Dataset metadata plus a description of what the sandbox exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalContext {
    pub dataset: DatasetInfo,
    pub capability_description: String,
}

impl GlobalContext {
    pub fn new(dataset: DatasetInfo, capability_description: impl Into<String>) -> Self {
        Self {
            dataset,
            capability_description: capability_description.into(),
        }
    }

    /// The text sent to the model (and counted against the budget) for
    /// this context.
    pub fn render(&self) -> String {
        let (rows, cols) = self.dataset.shape;
        format!(
            "## Dataset\n\
             File: {path}\n\
             Shape: {rows} rows x {cols} columns\n\n\
             Columns:\n{columns}\n\n\
             Preview:\n{preview}\n\n\
             ## Sandbox\n{caps}",
            path = self.dataset.path,
            columns = self.dataset.column_listing(),
            preview = self.dataset.preview,
            caps = self.capability_description,
        )
    }
}

#[cfg(test)]
pub(crate) fn sample_dataset() -> DatasetInfo {
    DatasetInfo {
        path: "sales.csv".into(),
        columns: vec!["region".into(), "amount".into()],
        shape: (120, 2),
        dtypes: BTreeMap::from([
            ("region".to_string(), "object".to_string()),
            ("amount".to_string(), "float64".to_string()),
        ]),
        preview: "  region  amount\n0  north    12.5".into(),
    }
}
