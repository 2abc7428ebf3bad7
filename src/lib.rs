//! `mztopp` drives OpenMS TOPP command line tools as a staged identification
//! and quantification pipeline, and reads their results back.
//!
//! - [`config`] patches the `.ini` parameter files tools read, preserving
//!   everything it does not touch.
//! - [`tool`] launches a tool, streams its progress and kills it on cancellation.
//! - [`pipeline`] sequences tools into single-input or treatment/control workflows.
//! - [`io`] reads idXML identifications and tabular quantification exports.
//! - [`correlate`] joins identifications to spectra and routes correlation tokens
//!   back to the result set they belong to.
//! - [`store`] hands the results to a persistence layer.
pub mod config;
pub mod correlate;
pub mod identification;
pub mod io;
pub mod pipeline;
pub mod prelude;
pub mod store;
pub mod tool;

pub use crate::config::{ConfigDocument, ConfigError, ParameterOverride, ParameterPath};
pub use crate::correlate::{
    CorrelationKey, CorrelationToken, ResultSetGuid, ResultStoreRouter, SpectrumCorrelator,
};
pub use crate::identification::{IdentificationRecord, LookupError, QuantifiedRecord};
pub use crate::io::{IdXMLReader, IdXMLParserError};
pub use crate::pipeline::{Pipeline, PipelineError, PipelineSettings};
pub use crate::tool::{CancellationToken, ProcessRunner, ToolError, ToolSpec};
