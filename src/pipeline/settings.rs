use std::path::PathBuf;

use bitflags::bitflags;

use crate::config::ParameterOverride;

bitflags! {
    /// The stages that only run in some configurations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OptionalStages: u8 {
        const ALIGNMENT = 0b0001;
        const XIC_FILTER = 0b0010;
        const NORMALIZATION = 0b0100;
        const PROTEIN_INFERENCE = 0b1000;
    }
}

/// The TOPP tool each step of the pipeline is carried out by
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ToolNames {
    pub alignment: String,
    pub xic_filter: String,
    pub identification: String,
    pub indexing: String,
    pub feature_finding: String,
    pub id_mapping: String,
    pub normalization: String,
    pub protein_inference: String,
    pub quantification: String,
}

impl Default for ToolNames {
    fn default() -> Self {
        Self {
            alignment: "MapAlignerPoseClustering".into(),
            xic_filter: "FileFilter".into(),
            identification: "CometAdapter".into(),
            indexing: "PeptideIndexer".into(),
            feature_finding: "FeatureFinderCentroided".into(),
            id_mapping: "IDMapper".into(),
            normalization: "MapNormalizer".into(),
            protein_inference: "ProteinInference".into(),
            quantification: "ProteinQuantifier".into(),
        }
    }
}

#[cfg(feature = "serde")]
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to read pipeline settings: {0}")]
    IOError(
        #[from]
        #[source]
        std::io::Error,
    ),
    #[error("Malformed pipeline settings: {0}")]
    JSONError(
        #[from]
        #[source]
        serde_json::Error,
    ),
}

/**
Everything a pipeline run is configured by.

One input file runs the single-input topology. Two input files are treated as
treatment followed by control, which adds alignment and XIC filtering ahead of
identification.

```json
{
    "inputs": ["treatment.mzML", "control.mzML"],
    "database": "uniprot_target_decoy.fasta",
    "scratch_dir": "work",
    "tool_dir": "/opt/OpenMS/bin",
    "overrides": [
        {"tool": "CometAdapter", "path": "precursor_mass_tolerance", "value": "10"}
    ]
}
```
*/
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PipelineSettings {
    pub inputs: Vec<PathBuf>,
    /// The protein sequence database searched during identification
    pub database: PathBuf,
    /// Where parameter files and intermediate results are written. Concurrent
    /// runs must not share one.
    pub scratch_dir: PathBuf,
    pub tool_dir: PathBuf,
    pub share_dir: Option<PathBuf>,
    pub xic_filtering: bool,
    pub normalization: bool,
    pub protein_inference: bool,
    pub tools: ToolNames,
    pub overrides: Vec<ParameterOverride>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            database: PathBuf::new(),
            scratch_dir: std::env::temp_dir().join("mztopp"),
            tool_dir: PathBuf::new(),
            share_dir: None,
            xic_filtering: true,
            normalization: true,
            protein_inference: false,
            tools: ToolNames::default(),
            overrides: Vec::new(),
        }
    }
}

impl PipelineSettings {
    pub fn new<P: Into<PathBuf>>(inputs: impl IntoIterator<Item = P>, database: impl Into<PathBuf>) -> Self {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            database: database.into(),
            ..Default::default()
        }
    }

    #[cfg(feature = "serde")]
    pub fn from_json_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self, SettingsError> {
        let handle = std::io::BufReader::new(std::fs::File::open(path)?);
        Ok(serde_json::from_reader(handle)?)
    }

    pub fn with_scratch_dir(mut self, scratch_dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = scratch_dir.into();
        self
    }

    pub fn with_tool_dir(mut self, tool_dir: impl Into<PathBuf>) -> Self {
        self.tool_dir = tool_dir.into();
        self
    }

    pub fn with_share_dir(mut self, share_dir: impl Into<PathBuf>) -> Self {
        self.share_dir = Some(share_dir.into());
        self
    }

    pub fn with_xic_filtering(mut self, enabled: bool) -> Self {
        self.xic_filtering = enabled;
        self
    }

    pub fn with_normalization(mut self, enabled: bool) -> Self {
        self.normalization = enabled;
        self
    }

    pub fn with_protein_inference(mut self, enabled: bool) -> Self {
        self.protein_inference = enabled;
        self
    }

    pub fn with_override(mut self, parameter: ParameterOverride) -> Self {
        self.overrides.push(parameter);
        self
    }

    /// The optional stages these settings enable
    pub fn optional_stages(&self) -> OptionalStages {
        let mut stages = OptionalStages::empty();
        let paired = self.inputs.len() >= 2;
        stages.set(OptionalStages::ALIGNMENT, paired);
        stages.set(OptionalStages::XIC_FILTER, paired && self.xic_filtering);
        stages.set(OptionalStages::NORMALIZATION, self.normalization);
        stages.set(OptionalStages::PROTEIN_INFERENCE, self.protein_inference);
        stages
    }

    /// The file name stem intermediate files are named after
    pub(crate) fn run_stem(&self) -> String {
        self.inputs
            .first()
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run".to_string())
    }

    pub(crate) fn scratch_path(&self, name: &str) -> PathBuf {
        self.scratch_dir.join(name)
    }
}
