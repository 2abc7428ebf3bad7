use std::fmt::Display;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use thiserror::Error;

use super::settings::{OptionalStages, PipelineSettings};
use crate::config::{ConfigDocument, ConfigError, OverrideValue, ParameterPath};
use crate::io::idxml::{count_protein_hits, IdXMLParserError};
use crate::tool::{CancellationToken, ProgressSink, ToolError, ToolExecutor, ToolSpec};

/// The steps a pipeline run is made of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StageKind {
    Alignment,
    XicFilter,
    Identification,
    Indexing,
    FeatureMapping,
    Normalization,
    Quantification,
}

impl StageKind {
    /// The number of tool runs the stage is expected to perform
    pub const fn invocations(&self) -> usize {
        match self {
            Self::FeatureMapping => 2,
            _ => 1,
        }
    }
}

impl Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Alignment => "alignment",
            Self::XicFilter => "XIC filtering",
            Self::Identification => "identification",
            Self::Indexing => "peptide indexing",
            Self::FeatureMapping => "feature mapping",
            Self::Normalization => "normalization",
            Self::Quantification => "quantification",
        };
        f.write_str(name)
    }
}

/// Why a single stage failed
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Config(ConfigError),
    #[error("Could not inspect intermediate results: {0}")]
    Results(#[from] IdXMLParserError),
    #[error("No {0} was produced by an earlier stage")]
    MissingArtifact(&'static str),
}

impl From<ConfigError> for StageError {
    fn from(value: ConfigError) -> Self {
        match value {
            ConfigError::Tool(e) => Self::Tool(e),
            e => Self::Config(e),
        }
    }
}

/// The files stages hand to one another. Each stage receives the artifacts of
/// the stages before it and returns them with its own outputs filled in.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Artifacts {
    /// The spectra the next spectrum-consuming stage reads, one per input
    pub spectra: Vec<PathBuf>,
    pub identifications: Option<PathBuf>,
    pub indexed_identifications: Option<PathBuf>,
    pub features: Option<PathBuf>,
    pub protein_groups: Option<PathBuf>,
    pub quantification: Option<PathBuf>,
}

impl Artifacts {
    pub fn new(spectra: Vec<PathBuf>) -> Self {
        Self {
            spectra,
            ..Default::default()
        }
    }

    fn primary_spectra(&self) -> Result<&Path, StageError> {
        self.spectra
            .first()
            .map(PathBuf::as_path)
            .ok_or(StageError::MissingArtifact("spectrum file"))
    }
}

/// Shared state available to a stage while it runs
pub struct StageContext<'a> {
    pub settings: &'a PipelineSettings,
    pub executor: &'a dyn ToolExecutor,
    pub progress: &'a dyn ProgressSink,
    pub cancel: &'a CancellationToken,
    pub stage: StageKind,
    pub(crate) completed_steps: usize,
    pub(crate) total_steps: usize,
}

impl StageContext<'_> {
    /// The fraction of the estimated tool runs completed so far, never more than one
    pub fn progress_fraction(&self) -> f64 {
        progress_fraction(self.completed_steps, self.total_steps)
    }

    fn output_path(&self, suffix: &str) -> PathBuf {
        self.settings
            .scratch_path(&format!("{}_{suffix}", self.settings.run_stem()))
    }

    /// Obtain the default configuration of `tool_name`, bind `parameters` and any
    /// configured overrides into it, then run the tool.
    pub fn invoke(&mut self, tool_name: &str, parameters: &[(&str, OverrideValue)]) -> Result<(), StageError> {
        let tool = ToolSpec::in_directory(&self.settings.tool_dir, tool_name)
            .with_share_dir(self.settings.share_dir.clone());
        let scratch = &self.settings.scratch_dir;
        let mut config = ConfigDocument::from_tool(self.executor, &tool, scratch, self.cancel)?;
        for (name, value) in parameters {
            if !bind(&mut config, name, value)? {
                warn!("{tool_name} has no parameter {name}, it will use its default");
            }
        }
        let applied = config.apply_overrides(tool_name, self.settings.overrides.iter())?;
        if applied > 0 {
            debug!("Applied {applied} parameter overrides to {tool_name}");
        }
        config.persist()?;
        let config_path = config
            .path()
            .map(Path::to_path_buf)
            .ok_or(StageError::Config(ConfigError::NoBackingFile))?;

        let output = self
            .executor
            .run_and_wait(&tool, &config_path, scratch, self.cancel)?;
        info!("{tool_name} finished in {:0.2} seconds", output.elapsed.as_secs_f64());
        self.completed_steps += 1;
        self.progress.report(
            self.progress_fraction(),
            &format!("{}: {tool_name} finished", self.stage),
        );
        Ok(())
    }
}

pub(crate) fn progress_fraction(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (completed as f64 / total as f64).min(1.0)
}

/// Set a parameter whether the tool declares it as a single value or a list
fn bind(config: &mut ConfigDocument, name: &str, value: &OverrideValue) -> Result<bool, ConfigError> {
    let path = ParameterPath::leaf(name);
    let values: Vec<&str> = match value {
        OverrideValue::Scalar(v) => vec![v.as_str()],
        OverrideValue::List(vs) => vs.iter().map(String::as_str).collect(),
    };
    if config.get_list(&path).is_some() {
        config.set_list(&path, &values, true)
    } else if config.get(&path).is_some() {
        config.set_scalar(&path, &values.join(" "))
    } else {
        Ok(false)
    }
}

fn file(path: &Path) -> OverrideValue {
    OverrideValue::Scalar(path.to_string_lossy().into_owned())
}

fn files(paths: &[PathBuf]) -> OverrideValue {
    OverrideValue::List(paths.iter().map(|p| p.to_string_lossy().into_owned()).collect())
}

pub type StageAction = fn(&mut StageContext<'_>, Artifacts) -> Result<Artifacts, StageError>;
pub type SkipPredicate = fn(&PipelineSettings) -> bool;

/// One step of a pipeline: a kind, a condition under which it is left out, and
/// what it does.
#[derive(Clone, Copy)]
pub struct Stage {
    pub kind: StageKind,
    pub skip: SkipPredicate,
    pub action: StageAction,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage").field("kind", &self.kind).finish()
    }
}

fn never(_: &PipelineSettings) -> bool {
    false
}

fn without_alignment(settings: &PipelineSettings) -> bool {
    !settings.optional_stages().contains(OptionalStages::ALIGNMENT)
}

fn without_xic_filter(settings: &PipelineSettings) -> bool {
    !settings.optional_stages().contains(OptionalStages::XIC_FILTER)
}

fn without_normalization(settings: &PipelineSettings) -> bool {
    !settings.optional_stages().contains(OptionalStages::NORMALIZATION)
}

impl Stage {
    pub fn new(kind: StageKind) -> Self {
        let (skip, action): (SkipPredicate, StageAction) = match kind {
            StageKind::Alignment => (without_alignment, align),
            StageKind::XicFilter => (without_xic_filter, filter_xic),
            StageKind::Identification => (never, identify),
            StageKind::Indexing => (never, index_peptides),
            StageKind::FeatureMapping => (never, map_features),
            StageKind::Normalization => (without_normalization, normalize),
            StageKind::Quantification => (never, quantify),
        };
        Self { kind, skip, action }
    }

    pub fn is_skipped(&self, settings: &PipelineSettings) -> bool {
        (self.skip)(settings)
    }
}

fn align(ctx: &mut StageContext<'_>, mut artifacts: Artifacts) -> Result<Artifacts, StageError> {
    let outputs: Vec<PathBuf> = artifacts
        .spectra
        .iter()
        .enumerate()
        .map(|(i, _)| ctx.output_path(&format!("aligned_{i}.mzML")))
        .collect();
    let tool = ctx.settings.tools.alignment.clone();
    ctx.invoke(&tool, &[("in", files(&artifacts.spectra)), ("out", files(&outputs))])?;
    artifacts.spectra = outputs;
    Ok(artifacts)
}

/// Subtract the control run's background from the treatment run
fn filter_xic(ctx: &mut StageContext<'_>, mut artifacts: Artifacts) -> Result<Artifacts, StageError> {
    let (treatment, control) = match artifacts.spectra.as_slice() {
        [treatment, control, ..] => (treatment.clone(), control.clone()),
        _ => return Err(StageError::MissingArtifact("control spectrum file")),
    };
    let output = ctx.output_path("filtered.mzML");
    let tool = ctx.settings.tools.xic_filter.clone();
    ctx.invoke(
        &tool,
        &[
            ("in", file(&treatment)),
            ("control", file(&control)),
            ("out", file(&output)),
        ],
    )?;
    artifacts.spectra = vec![output];
    Ok(artifacts)
}

fn identify(ctx: &mut StageContext<'_>, mut artifacts: Artifacts) -> Result<Artifacts, StageError> {
    let spectra = artifacts.primary_spectra()?.to_path_buf();
    let output = ctx.output_path("ids.idXML");
    let tool = ctx.settings.tools.identification.clone();
    let database = file(&ctx.settings.database);
    ctx.invoke(
        &tool,
        &[("in", file(&spectra)), ("database", database), ("out", file(&output))],
    )?;
    artifacts.identifications = Some(output);
    Ok(artifacts)
}

fn index_peptides(ctx: &mut StageContext<'_>, mut artifacts: Artifacts) -> Result<Artifacts, StageError> {
    let ids = artifacts
        .identifications
        .clone()
        .ok_or(StageError::MissingArtifact("identification file"))?;
    let output = ctx.output_path("indexed.idXML");
    let tool = ctx.settings.tools.indexing.clone();
    let database = file(&ctx.settings.database);
    ctx.invoke(
        &tool,
        &[("in", file(&ids)), ("fasta", database), ("out", file(&output))],
    )?;
    artifacts.indexed_identifications = Some(output);
    Ok(artifacts)
}

fn map_features(ctx: &mut StageContext<'_>, mut artifacts: Artifacts) -> Result<Artifacts, StageError> {
    let spectra = artifacts.primary_spectra()?.to_path_buf();
    let ids = artifacts
        .indexed_identifications
        .clone()
        .ok_or(StageError::MissingArtifact("indexed identification file"))?;
    let features = ctx.output_path("features.featureXML");
    let mapped = ctx.output_path("mapped.featureXML");

    let tool = ctx.settings.tools.feature_finding.clone();
    ctx.invoke(&tool, &[("in", file(&spectra)), ("out", file(&features))])?;
    let tool = ctx.settings.tools.id_mapping.clone();
    ctx.invoke(
        &tool,
        &[("id", file(&ids)), ("in", file(&features)), ("out", file(&mapped))],
    )?;
    artifacts.features = Some(mapped);
    Ok(artifacts)
}

fn normalize(ctx: &mut StageContext<'_>, mut artifacts: Artifacts) -> Result<Artifacts, StageError> {
    let features = artifacts
        .features
        .clone()
        .ok_or(StageError::MissingArtifact("feature map"))?;
    let output = ctx.output_path("normalized.featureXML");
    let tool = ctx.settings.tools.normalization.clone();
    ctx.invoke(&tool, &[("in", file(&features)), ("out", file(&output))])?;
    artifacts.features = Some(output);
    Ok(artifacts)
}

/// Quantify proteins, first grouping them by protein inference when that is
/// enabled and the identifications declare any proteins at all.
fn quantify(ctx: &mut StageContext<'_>, mut artifacts: Artifacts) -> Result<Artifacts, StageError> {
    let features = artifacts
        .features
        .clone()
        .ok_or(StageError::MissingArtifact("feature map"))?;
    let ids = artifacts
        .indexed_identifications
        .clone()
        .ok_or(StageError::MissingArtifact("indexed identification file"))?;

    if ctx
        .settings
        .optional_stages()
        .contains(OptionalStages::PROTEIN_INFERENCE)
    {
        let n_proteins = count_protein_hits(&ids)?;
        if n_proteins > 0 {
            let groups = ctx.output_path("proteins.idXML");
            let tool = ctx.settings.tools.protein_inference.clone();
            ctx.invoke(&tool, &[("in", file(&ids)), ("out", file(&groups))])?;
            artifacts.protein_groups = Some(groups);
        } else {
            debug!("Skipping protein inference, no proteins were identified");
        }
    }

    let output = ctx.output_path("quant.tsv");
    let mut parameters = vec![("in", file(&features)), ("out", file(&output))];
    if let Some(groups) = artifacts.protein_groups.as_ref() {
        parameters.push(("protein_groups", file(groups)));
    }
    let tool = ctx.settings.tools.quantification.clone();
    ctx.invoke(&tool, &parameters)?;
    artifacts.quantification = Some(output);
    Ok(artifacts)
}
