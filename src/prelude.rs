//! Traits needed to work with pipelines, tools and result stores
pub use crate::correlate::ResultStore;
pub use crate::store::{EntityStore, SpectrumStore};
pub use crate::tool::{ProgressSink, ToolExecutor};
pub use std::io::prelude::*;
