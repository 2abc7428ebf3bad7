//! Readers and writers for the result formats the TOPP tools produce.
pub mod idxml;
pub mod tsv;

pub(crate) mod compression;

pub use crate::io::compression::open_maybe_gzipped;
pub use crate::io::idxml::{count_protein_hits, IdXMLParserError, IdXMLParserState, IdXMLReader};
pub use crate::io::tsv::{parse_tabular, read_tabular, write_tabular, TabularError};
