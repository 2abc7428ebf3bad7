//! Tab-separated quantification exports.
//!
//! ```text
//! # exported by ProteinQuantifier
//! #rt	mz	charge	score	sequence	accessions	114	115	116	117
//! 600.0	582.319	2	0.98	LVNELTEFAK	sp|P02769|ALBU_BOVIN	1520.3	1411.0	NA	1633.8
//! ```
//!
//! Lines starting with `#` are comments, except that the last one naming the
//! fixed columns declares the quantification channel labels. Retention times
//! are stored in seconds and read into minutes.
use std::fmt::Display;
use std::io::{self, prelude::*};
use std::path::Path;

use log::warn;
use thiserror::Error;

use crate::identification::{IdentificationRecord, QuantChannel, QuantifiedRecord};
use crate::io::compression::open_maybe_gzipped;

/// The columns every row starts with, in order
pub const FIXED_COLUMNS: [&str; 6] = ["rt", "mz", "charge", "score", "sequence", "accessions"];

const MISSING_VALUE: &str = "NA";

#[derive(Debug, Error)]
pub enum TabularError {
    #[error("Line {line} has {found} columns, at least {} are required", FIXED_COLUMNS.len())]
    NotEnoughColumns { line: usize, found: usize },
    #[error("Encountered an IO error: {0}")]
    IOError(
        #[from]
        #[source]
        io::Error,
    ),
}

impl From<TabularError> for io::Error {
    fn from(value: TabularError) -> Self {
        match value {
            TabularError::IOError(e) => e,
            e => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}

fn number_or_zero<T: std::str::FromStr + Default>(column: &str, line: usize, value: &str) -> T {
    match value.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            warn!("Could not parse {column} value {value:?} on line {line}, using zero");
            T::default()
        }
    }
}

fn channel_value(label: &str, line: usize, value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case(MISSING_VALUE) || value.eq_ignore_ascii_case("nan") {
        return None;
    }
    Some(number_or_zero(label, line, value))
}

fn header_labels(line: &str) -> Option<Vec<String>> {
    let fields: Vec<&str> = line.trim_start_matches('#').split('\t').map(str::trim).collect();
    if fields.len() < FIXED_COLUMNS.len()
        || !fields.iter().zip(FIXED_COLUMNS.iter()).all(|(a, b)| a == b)
    {
        return None;
    }
    Some(
        fields[FIXED_COLUMNS.len()..]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    )
}

/// Parse a complete tabular export. Records are numbered from 1 in row order.
pub fn parse_tabular(text: &str, workflow_id: u32) -> Result<Vec<QuantifiedRecord>, TabularError> {
    let mut labels: Vec<String> = Vec::new();
    let mut records = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with('#') {
            if let Some(found) = header_labels(line) {
                labels = found;
            }
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < FIXED_COLUMNS.len() {
            return Err(TabularError::NotEnoughColumns {
                line: line_no,
                found: fields.len(),
            });
        }
        let mut record = IdentificationRecord::new(workflow_id, records.len() as u64 + 1);
        record.retention_time = number_or_zero::<f64>("rt", line_no, fields[0]) / 60.0;
        record.mass_over_charge = number_or_zero("mz", line_no, fields[1]);
        record.charge = number_or_zero("charge", line_no, fields[2]);
        record.score = number_or_zero("score", line_no, fields[3]);
        record.sequence = fields[4].trim().to_string();
        record.accessions = fields[5].trim().to_string();

        let cells = &fields[FIXED_COLUMNS.len()..];
        let n_channels = labels.len().max(cells.len());
        let channels = (0..n_channels)
            .map(|j| {
                let label = labels
                    .get(j)
                    .cloned()
                    .unwrap_or_else(|| format!("channel_{}", j + 1));
                let value = cells
                    .get(j)
                    .and_then(|cell| channel_value(&label, line_no, cell));
                QuantChannel::new(label, value)
            })
            .collect();
        records.push(QuantifiedRecord { record, channels });
    }
    Ok(records)
}

/// Read a tabular export from disk, which may be gzip-compressed
pub fn read_tabular<P: AsRef<Path>>(
    path: P,
    workflow_id: u32,
) -> Result<Vec<QuantifiedRecord>, TabularError> {
    let mut text = String::new();
    open_maybe_gzipped(path)?.read_to_string(&mut text)?;
    parse_tabular(&text, workflow_id)
}

fn write_cell<W: Write, V: Display>(writer: &mut W, value: V) -> io::Result<()> {
    write!(writer, "\t{value}")
}

/// Write records in the same layout [`parse_tabular`] reads. The channel labels
/// of the first record name the channel columns.
pub fn write_tabular<W: Write>(writer: &mut W, records: &[QuantifiedRecord]) -> io::Result<()> {
    write!(writer, "#{}", FIXED_COLUMNS.join("\t"))?;
    if let Some(first) = records.first() {
        for channel in first.channels.iter() {
            write_cell(writer, &channel.label)?;
        }
    }
    writeln!(writer)?;
    for quant in records {
        let rec = &quant.record;
        write!(writer, "{}", rec.retention_time * 60.0)?;
        write_cell(writer, rec.mass_over_charge)?;
        write_cell(writer, rec.charge)?;
        write_cell(writer, rec.score)?;
        write_cell(writer, &rec.sequence)?;
        write_cell(writer, &rec.accessions)?;
        for channel in quant.channels.iter() {
            match channel.value {
                Some(v) => write_cell(writer, v)?,
                None => write_cell(writer, MISSING_VALUE)?,
            }
        }
        writeln!(writer)?;
    }
    Ok(())
}
