//! Reading peptide identifications from OpenMS idXML documents.
//!
//! The reader is a pull parser: each call produces the next
//! [`IdentificationRecord`](crate::identification::IdentificationRecord) once
//! its enclosing `PeptideIdentification` closes, without materializing the document.
mod reader;

pub use reader::{
    apply_user_param, count_protein_hits, IdXMLParser, IdXMLParserError, IdXMLParserState,
    IdXMLReader, ParserResult,
};
