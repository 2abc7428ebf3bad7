use std::fmt::Display;

use super::stage::{Stage, StageKind};

/// The shape of a pipeline, decided by how many input files it is given
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Topology {
    /// identify → index → map to features → normalize → quantify
    SingleInput,
    /// A treatment run and a control run, aligned and background-filtered
    /// before following the single-input flow
    TreatmentControl,
}

impl Topology {
    /// The topology for `n_inputs` input files, if there is one
    pub fn for_inputs(n_inputs: usize) -> Option<Self> {
        match n_inputs {
            1 => Some(Self::SingleInput),
            2 => Some(Self::TreatmentControl),
            _ => None,
        }
    }

    pub fn stage_kinds(&self) -> &'static [StageKind] {
        const SINGLE: &[StageKind] = &[
            StageKind::Identification,
            StageKind::Indexing,
            StageKind::FeatureMapping,
            StageKind::Normalization,
            StageKind::Quantification,
        ];
        const PAIRED: &[StageKind] = &[
            StageKind::Alignment,
            StageKind::XicFilter,
            StageKind::Identification,
            StageKind::Indexing,
            StageKind::FeatureMapping,
            StageKind::Normalization,
            StageKind::Quantification,
        ];
        match self {
            Self::SingleInput => SINGLE,
            Self::TreatmentControl => PAIRED,
        }
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.stage_kinds().iter().copied().map(Stage::new).collect()
    }
}

impl Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SingleInput => f.write_str("single input"),
            Self::TreatmentControl => f.write_str("treatment/control"),
        }
    }
}
