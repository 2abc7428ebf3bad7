//! Running a sequence of TOPP tools as one identification and quantification
//! workflow.
//!
//! Each [`Stage`] obtains the default configuration of its tool, binds the
//! files produced by the stages before it, runs the tool and hands the paths of
//! its outputs on as [`Artifacts`]. Stages run one after another, and the first
//! failure ends the run.
use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use log::{debug, info};
use thiserror::Error;

use crate::tool::{CancellationToken, ProgressSink, ToolError, ToolExecutor};

mod settings;
mod stage;
mod topology;

#[cfg(feature = "serde")]
pub use settings::SettingsError;
pub use settings::{OptionalStages, PipelineSettings, ToolNames};
pub use stage::{Artifacts, SkipPredicate, Stage, StageAction, StageContext, StageError, StageKind};
pub use topology::Topology;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Expected one or two input files, got {0}")]
    InvalidInputs(usize),
    #[error("Could not prepare the scratch directory {path}: {source}")]
    ScratchDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("The {stage} stage failed: {source}")]
    Stage {
        stage: StageKind,
        #[source]
        source: StageError,
    },
    #[error("The pipeline was cancelled before the {0} stage")]
    Cancelled(StageKind),
}

impl PipelineError {
    /// The tool failure behind this error, if a tool is to blame
    pub fn tool_error(&self) -> Option<&ToolError> {
        match self {
            Self::Stage {
                source: StageError::Tool(e),
                ..
            } => Some(e),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_)) || self.tool_error().is_some_and(|e| e.is_cancelled())
    }
}

/// The position of a run within its planned stages
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub stages: Vec<Stage>,
    pub current_index: usize,
    pub completed_steps: usize,
    pub total_steps: usize,
}

impl PipelineRun {
    /// Completed tool runs over the estimated total. Runtime decisions can add
    /// runs beyond the estimate, so this saturates at one.
    pub fn progress_fraction(&self) -> f64 {
        stage::progress_fraction(self.completed_steps, self.total_steps)
    }

    pub fn is_done(&self) -> bool {
        self.current_index >= self.stages.len()
    }
}

/// The outcome of a successful run
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PipelineReport {
    pub topology: Topology,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    pub stages: Vec<StageKind>,
    pub completed_steps: usize,
    pub estimated_steps: usize,
    pub artifacts: Artifacts,
}

/**
A planned workflow over one input file, or over a treatment and a control file.

```no_run
use mztopp::pipeline::{Pipeline, PipelineSettings};
use mztopp::tool::{CancellationToken, LogProgress, ProcessRunner};

let settings = PipelineSettings::new(["sample.mzML"], "db.fasta")
    .with_tool_dir("/opt/OpenMS/bin")
    .with_scratch_dir("work");
let pipeline = Pipeline::new(settings).unwrap();
let report = pipeline
    .run(&ProcessRunner::default(), &LogProgress, &CancellationToken::new())
    .unwrap();
println!("{:?}", report.artifacts.quantification);
```
*/
#[derive(Debug, Clone)]
pub struct Pipeline {
    settings: PipelineSettings,
    topology: Topology,
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings) -> Result<Self, PipelineError> {
        let topology = Topology::for_inputs(settings.inputs.len())
            .ok_or(PipelineError::InvalidInputs(settings.inputs.len()))?;
        let stages = topology.stages();
        Ok(Self {
            settings,
            topology,
            stages,
        })
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    fn planned(&self) -> impl Iterator<Item = &Stage> + '_ {
        self.stages.iter().filter(|s| {
            let skip = s.is_skipped(&self.settings);
            if skip {
                debug!("Skipping the {} stage", s.kind);
            }
            !skip
        })
    }

    /// The stages that will run, in order
    pub fn plan(&self) -> Vec<StageKind> {
        self.planned().map(|s| s.kind).collect()
    }

    /// The number of tool runs expected from the enabled stages. Protein
    /// inference is left out since it depends on the identifications found.
    pub fn estimate_total_steps(&self) -> usize {
        self.planned().map(|s| s.kind.invocations()).sum()
    }

    pub fn start(&self) -> PipelineRun {
        PipelineRun {
            stages: self.planned().copied().collect(),
            current_index: 0,
            completed_steps: 0,
            total_steps: self.estimate_total_steps(),
        }
    }

    /// Run every planned stage in order, blocking until the last one finishes
    /// or one of them fails.
    pub fn run<E: ToolExecutor, P: ProgressSink>(
        &self,
        executor: &E,
        progress: &P,
        cancel: &CancellationToken,
    ) -> Result<PipelineReport, PipelineError> {
        let started = Local::now();
        let scratch = &self.settings.scratch_dir;
        fs::create_dir_all(scratch).map_err(|source| PipelineError::ScratchDir {
            path: scratch.clone(),
            source,
        })?;

        let mut run = self.start();
        info!(
            "Starting {} pipeline with {} stages and an estimated {} tool runs",
            self.topology,
            run.stages.len(),
            run.total_steps
        );
        progress.report(0.0, &format!("Starting {} pipeline", self.topology));

        let mut artifacts = Artifacts::new(self.settings.inputs.clone());
        while !run.is_done() {
            let stage = run.stages[run.current_index];
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled(stage.kind));
            }
            info!("Running the {} stage", stage.kind);
            let mut ctx = StageContext {
                settings: &self.settings,
                executor,
                progress,
                cancel,
                stage: stage.kind,
                completed_steps: run.completed_steps,
                total_steps: run.total_steps,
            };
            artifacts = (stage.action)(&mut ctx, artifacts).map_err(|source| PipelineError::Stage {
                stage: stage.kind,
                source,
            })?;
            run.completed_steps = ctx.completed_steps;
            run.current_index += 1;
        }

        progress.report(run.progress_fraction(), "Pipeline finished");
        Ok(PipelineReport {
            topology: self.topology,
            started,
            finished: Local::now(),
            stages: run.stages.iter().map(|s| s.kind).collect(),
            completed_steps: run.completed_steps,
            estimated_steps: run.total_steps,
            artifacts,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::path::Path;
    use std::time::Duration;

    use crate::config::{ConfigDocument, ParameterOverride, ParameterPath};
    use crate::tool::{ToolOutput, ToolSpec};

    /// Stands in for an OpenMS installation. Every tool declares the same
    /// parameters, and running one creates the files named by its `out` parameter.
    #[derive(Default)]
    struct FakeTools {
        proteins: usize,
        fail_on: Option<&'static str>,
        attempts: RefCell<Vec<String>>,
        runs: RefCell<Vec<(String, ConfigDocument)>>,
    }

    impl FakeTools {
        fn tools_run(&self) -> Vec<String> {
            self.runs.borrow().iter().map(|(name, _)| name.clone()).collect()
        }

        fn config_of(&self, tool: &str) -> ConfigDocument {
            self.runs
                .borrow()
                .iter()
                .find(|(name, _)| name == tool)
                .map(|(_, doc)| doc.clone())
                .unwrap()
        }
    }

    fn leaf(name: &str) -> ParameterPath {
        ParameterPath::leaf(name)
    }

    impl ToolExecutor for FakeTools {
        fn write_default_config(
            &self,
            tool: &ToolSpec,
            path: &Path,
            _cancel: &CancellationToken,
        ) -> Result<(), ToolError> {
            let io_params = if tool.name == "MapAlignerPoseClustering" {
                "<ITEMLIST name=\"in\" type=\"input-file\" />\n      <ITEMLIST name=\"out\" type=\"output-file\" />"
            } else {
                "<ITEM name=\"in\" value=\"\" type=\"input-file\" />\n      <ITEM name=\"out\" value=\"\" type=\"output-file\" />"
            };
            let text = format!(
                r#"<?xml version="1.0" encoding="ISO-8859-1"?>
<PARAMETERS version="1.7.0">
  <NODE name="{name}" description="">
    <ITEM name="version" value="3.1.0" type="string" />
    <NODE name="1" description="Instance '1' section for '{name}'">
      {io_params}
      <ITEM name="database" value="" type="input-file" />
      <ITEM name="fasta" value="" type="input-file" />
      <ITEM name="id" value="" type="input-file" />
      <ITEM name="control" value="" type="input-file" />
      <ITEM name="protein_groups" value="" type="input-file" />
      <ITEM name="precursor_mass_tolerance" value="10.0" type="double" />
    </NODE>
  </NODE>
</PARAMETERS>
"#,
                name = tool.name
            );
            std::fs::write(path, text).unwrap();
            Ok(())
        }

        fn run_and_wait(
            &self,
            tool: &ToolSpec,
            config_path: &Path,
            _working_dir: &Path,
            _cancel: &CancellationToken,
        ) -> Result<ToolOutput, ToolError> {
            self.attempts.borrow_mut().push(tool.name.clone());
            if self.fail_on == Some(tool.name.as_str()) {
                return Err(ToolError::Execution {
                    tool: tool.name.clone(),
                    code: 3,
                    stderr: "Error: Unable to read file".into(),
                });
            }
            let doc = ConfigDocument::open(config_path).unwrap();
            let mut outputs: Vec<String> = doc.get(&leaf("out")).map(|s| s.to_string()).into_iter().collect();
            if let Some(list) = doc.get_list(&leaf("out")) {
                outputs.extend(list.iter().cloned());
            }
            for out in outputs.iter().filter(|s| !s.is_empty()) {
                let content = if tool.name == "PeptideIndexer" {
                    let hits: String = (0..self.proteins)
                        .map(|i| format!("<ProteinHit id=\"PH_{i}\" accession=\"P{i}\"/>"))
                        .collect();
                    format!("<IdXML><IdentificationRun><ProteinIdentification>{hits}</ProteinIdentification></IdentificationRun></IdXML>")
                } else {
                    String::new()
                };
                std::fs::write(out, content).unwrap();
            }
            self.runs.borrow_mut().push((tool.name.clone(), doc));
            Ok(ToolOutput::new(0, String::new(), Duration::from_millis(5)))
        }
    }

    fn settings(dir: &Path, inputs: &[&str]) -> PipelineSettings {
        PipelineSettings::new(inputs.iter().map(|i| dir.join(i)), dir.join("db.fasta"))
            .with_scratch_dir(dir.join("scratch"))
            .with_tool_dir(dir.join("bin"))
    }

    #[test]
    fn plans_by_topology() {
        let dir = Path::new("/tmp");
        let single = Pipeline::new(settings(dir, &["a.mzML"])).unwrap();
        assert_eq!(single.topology(), Topology::SingleInput);
        assert_eq!(
            single.plan(),
            vec![
                StageKind::Identification,
                StageKind::Indexing,
                StageKind::FeatureMapping,
                StageKind::Normalization,
                StageKind::Quantification
            ]
        );
        assert_eq!(single.estimate_total_steps(), 6);

        let paired = Pipeline::new(settings(dir, &["t.mzML", "c.mzML"])).unwrap();
        let plan = paired.plan();
        assert_eq!(plan.iter().filter(|k| **k == StageKind::Alignment).count(), 1);
        assert_eq!(plan.iter().filter(|k| **k == StageKind::XicFilter).count(), 1);
        let ident = plan.iter().position(|k| *k == StageKind::Identification).unwrap();
        assert!(plan[..ident].contains(&StageKind::Alignment));
        assert!(plan[..ident].contains(&StageKind::XicFilter));
        assert_eq!(paired.estimate_total_steps(), 8);

        let unfiltered = Pipeline::new(
            settings(dir, &["t.mzML", "c.mzML"])
                .with_xic_filtering(false)
                .with_normalization(false),
        )
        .unwrap();
        assert_eq!(unfiltered.plan()[0], StageKind::Alignment);
        assert!(!unfiltered.plan().contains(&StageKind::XicFilter));
        assert_eq!(unfiltered.estimate_total_steps(), 6);

        assert!(matches!(
            Pipeline::new(settings(dir, &[])),
            Err(PipelineError::InvalidInputs(0))
        ));
    }

    #[test_log::test]
    fn run_single_input() {
        let dir = tempfile::tempdir().unwrap();
        let tools = FakeTools::default();
        let pipeline = Pipeline::new(settings(dir.path(), &["sample.mzML"]).with_override(
            ParameterOverride::scalar("CometAdapter", leaf("precursor_mass_tolerance"), "5"),
        ))
        .unwrap();

        let seen = RefCell::new(Vec::new());
        let report = {
            let sink = |fraction: f64, _text: &str| seen.borrow_mut().push(fraction);
            pipeline.run(&tools, &sink, &CancellationToken::new()).unwrap()
        };

        assert_eq!(
            tools.tools_run(),
            vec![
                "CometAdapter",
                "PeptideIndexer",
                "FeatureFinderCentroided",
                "IDMapper",
                "MapNormalizer",
                "ProteinQuantifier"
            ]
        );
        assert_eq!(report.completed_steps, 6);
        assert_eq!(report.estimated_steps, 6);
        assert!(report.finished >= report.started);

        let seen = seen.into_inner();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last().copied(), Some(1.0));

        let scratch = dir.path().join("scratch");
        let comet = tools.config_of("CometAdapter");
        assert_eq!(
            comet.get(&leaf("in")),
            Some(dir.path().join("sample.mzML").to_str().unwrap())
        );
        assert_eq!(comet.get(&leaf("precursor_mass_tolerance")), Some("5"));
        assert_eq!(
            comet.get(&leaf("database")),
            Some(dir.path().join("db.fasta").to_str().unwrap())
        );

        let mapper = tools.config_of("IDMapper");
        assert_eq!(mapper.get(&leaf("precursor_mass_tolerance")), Some("10.0"));
        assert_eq!(
            mapper.get(&leaf("id")),
            Some(scratch.join("sample_indexed.idXML").to_str().unwrap())
        );

        assert_eq!(
            report.artifacts.quantification,
            Some(scratch.join("sample_quant.tsv"))
        );
        assert_eq!(report.artifacts.protein_groups, None);
        assert!(scratch.join("CometAdapter.ini").exists());
    }

    #[test]
    fn run_treatment_control() {
        let dir = tempfile::tempdir().unwrap();
        let tools = FakeTools::default();
        let pipeline = Pipeline::new(settings(dir.path(), &["treated.mzML", "control.mzML"])).unwrap();
        let report = pipeline
            .run(&tools, &crate::tool::NoProgress, &CancellationToken::new())
            .unwrap();
        assert_eq!(report.topology, Topology::TreatmentControl);
        assert_eq!(&tools.tools_run()[..3], &["MapAlignerPoseClustering", "FileFilter", "CometAdapter"]);

        let scratch = dir.path().join("scratch");
        let aligner = tools.config_of("MapAlignerPoseClustering");
        assert_eq!(aligner.get_list(&leaf("in")).unwrap().len(), 2);
        let aligned = aligner.get_list(&leaf("out")).unwrap().to_vec();

        let filter = tools.config_of("FileFilter");
        assert_eq!(filter.get(&leaf("in")), Some(aligned[0].as_str()));
        assert_eq!(filter.get(&leaf("control")), Some(aligned[1].as_str()));

        let comet = tools.config_of("CometAdapter");
        assert_eq!(
            comet.get(&leaf("in")),
            Some(scratch.join("treated_filtered.mzML").to_str().unwrap())
        );
        assert_eq!(report.completed_steps, 8);
    }

    #[test]
    fn protein_inference_is_decided_at_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &["sample.mzML"]).with_protein_inference(true);

        let without_proteins = FakeTools::default();
        Pipeline::new(settings.clone())
            .unwrap()
            .run(&without_proteins, &crate::tool::NoProgress, &CancellationToken::new())
            .unwrap();
        assert!(!without_proteins.tools_run().contains(&"ProteinInference".to_string()));

        let with_proteins = FakeTools {
            proteins: 2,
            ..Default::default()
        };
        let pipeline = Pipeline::new(settings).unwrap();
        let seen = RefCell::new(Vec::new());
        let report = {
            let sink = |fraction: f64, _text: &str| seen.borrow_mut().push(fraction);
            pipeline.run(&with_proteins, &sink, &CancellationToken::new()).unwrap()
        };
        assert_eq!(report.estimated_steps, 6);
        assert_eq!(report.completed_steps, 7);
        assert!(seen.into_inner().iter().all(|f| (0.0..=1.0).contains(f)));

        let quantifier = with_proteins.config_of("ProteinQuantifier");
        let groups = report.artifacts.protein_groups.unwrap();
        assert_eq!(
            quantifier.get(&leaf("protein_groups")),
            Some(groups.to_str().unwrap())
        );
    }

    #[test]
    fn failure_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let tools = FakeTools {
            fail_on: Some("PeptideIndexer"),
            ..Default::default()
        };
        let pipeline = Pipeline::new(settings(dir.path(), &["sample.mzML"])).unwrap();
        let err = pipeline
            .run(&tools, &crate::tool::NoProgress, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Stage {
                stage: StageKind::Indexing,
                ..
            }
        ));
        assert!(matches!(
            err.tool_error(),
            Some(ToolError::Execution { code: 3, .. })
        ));
        let message = format!("{err}: {}", err.tool_error().unwrap());
        assert!(message.contains("PeptideIndexer failed with exit code 3"), "{message}");
        assert_eq!(*tools.attempts.borrow(), vec!["CometAdapter", "PeptideIndexer"]);
    }

    #[test]
    fn cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let tools = FakeTools::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Pipeline::new(settings(dir.path(), &["sample.mzML"]))
            .unwrap()
            .run(&tools, &crate::tool::NoProgress, &cancel)
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(tools.attempts.borrow().is_empty());
    }
}
