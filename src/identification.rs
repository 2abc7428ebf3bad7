//! The identification record data model shared by the result readers, the
//! spectrum correlator and the persistence collaborator.
use std::fmt::Display;

use indexmap::IndexMap;
use thiserror::Error;

/// The separator placed between resolved protein accessions of a single peptide hit
pub const ACCESSION_SEPARATOR: &str = ";";

/// Failures to resolve a reference to something that should already be known
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("Protein reference {0} was used before it was declared")]
    UnknownProteinRef(String),
    #[error("No open result store holds spectrum {0}")]
    UnresolvedToken(String),
    #[error("No open result store belongs to result set {0}")]
    UnknownResultSet(String),
}

/// Site localization scores attached to a peptide hit by a localization tool
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Localization {
    pub score: f64,
    pub global_flr: f64,
    pub local_flr: f64,
    /// The sequence as reported by the search engine before localization
    pub search_engine_sequence: String,
}

/// A single peptide-spectrum match read from a tool's result document.
///
/// `retention_time` is always in minutes, regardless of the unit used
/// by the source document.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IdentificationRecord {
    pub workflow_id: u32,
    pub id: u64,
    pub sequence: String,
    pub retention_time: f64,
    pub mass_over_charge: f64,
    pub charge: i32,
    pub score: f64,
    pub localization: Localization,
    /// Resolved protein accessions, joined by [`ACCESSION_SEPARATOR`]
    pub accessions: String,
    pub fragment_annotation: String,
    pub target_decoy: String,
    pub spectrum_reference: String,
}

impl IdentificationRecord {
    pub fn new(workflow_id: u32, id: u64) -> Self {
        Self {
            workflow_id,
            id,
            ..Default::default()
        }
    }

    /// Iterate over the resolved accessions individually
    pub fn accessions(&self) -> impl Iterator<Item = &str> {
        self.accessions
            .split(ACCESSION_SEPARATOR)
            .filter(|s| !s.is_empty())
    }

    /// The text used to label this match when it is shown next to its spectrum
    pub fn annotation(&self) -> &str {
        if self.fragment_annotation.is_empty() {
            &self.sequence
        } else {
            &self.fragment_annotation
        }
    }

    /// Flatten the record into named columns for an [`EntityStore`](crate::store::EntityStore)
    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("workflow_id", FieldValue::Integer(self.workflow_id as i64));
        row.insert("id", FieldValue::Integer(self.id as i64));
        row.insert("sequence", FieldValue::Text(self.sequence.clone()));
        row.insert("retention_time", FieldValue::Number(self.retention_time));
        row.insert("mass_over_charge", FieldValue::Number(self.mass_over_charge));
        row.insert("charge", FieldValue::Integer(self.charge as i64));
        row.insert("score", FieldValue::Number(self.score));
        row.insert(
            "localization_score",
            FieldValue::Number(self.localization.score),
        );
        row.insert(
            "localization_global_flr",
            FieldValue::Number(self.localization.global_flr),
        );
        row.insert(
            "localization_local_flr",
            FieldValue::Number(self.localization.local_flr),
        );
        row.insert(
            "search_engine_sequence",
            FieldValue::Text(self.localization.search_engine_sequence.clone()),
        );
        row.insert("accessions", FieldValue::Text(self.accessions.clone()));
        row.insert(
            "fragment_annotation",
            FieldValue::Text(self.fragment_annotation.clone()),
        );
        row.insert("target_decoy", FieldValue::Text(self.target_decoy.clone()));
        row.insert(
            "spectrum_reference",
            FieldValue::Text(self.spectrum_reference.clone()),
        );
        row
    }
}

/// A single quantification channel value. Channels are reported in the order the
/// producing tool declared them.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QuantChannel {
    pub label: String,
    pub value: Option<f64>,
}

impl QuantChannel {
    pub fn new(label: impl Into<String>, value: Option<f64>) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }
}

/// An [`IdentificationRecord`] carrying quantification channels from a tabular export
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QuantifiedRecord {
    pub record: IdentificationRecord,
    pub channels: Vec<QuantChannel>,
}

impl QuantifiedRecord {
    pub fn channel(&self, label: &str) -> Option<f64> {
        self.channels
            .iter()
            .find(|c| c.label == label)
            .and_then(|c| c.value)
    }
}

/// Maps the document-local protein identifiers to their accessions for the
/// duration of a single parse.
#[derive(Debug, Default, Clone)]
pub struct ProteinIndex {
    accessions: IndexMap<String, String>,
}

impl ProteinIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, local_ref: impl Into<String>, accession: impl Into<String>) {
        self.accessions.insert(local_ref.into(), accession.into());
    }

    pub fn get(&self, local_ref: &str) -> Option<&str> {
        self.accessions.get(local_ref).map(|s| s.as_str())
    }

    /// Resolve a whitespace-separated list of local references into a single
    /// [`ACCESSION_SEPARATOR`]-joined string.
    pub fn resolve_refs(&self, refs: &str) -> Result<String, LookupError> {
        let mut resolved = Vec::new();
        for local_ref in refs.split_ascii_whitespace() {
            match self.get(local_ref) {
                Some(acc) => resolved.push(acc),
                None => return Err(LookupError::UnknownProteinRef(local_ref.to_string())),
            }
        }
        Ok(resolved.join(ACCESSION_SEPARATOR))
    }

    pub fn len(&self) -> usize {
        self.accessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accessions.is_empty()
    }

    pub fn clear(&mut self) {
        self.accessions.clear()
    }
}

/// A loosely typed column value handed to the persistence collaborator
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Integer(i64),
    Missing,
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Number(v) => write!(f, "{v}"),
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Missing => Ok(()),
        }
    }
}

impl From<Option<f64>> for FieldValue {
    fn from(value: Option<f64>) -> Self {
        value.map(FieldValue::Number).unwrap_or(FieldValue::Missing)
    }
}

/// An ordered set of named column values
pub type Row = IndexMap<&'static str, FieldValue>;
