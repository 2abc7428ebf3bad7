use std::collections::VecDeque;
use std::io::{self, BufRead};
use std::path::Path;

use log::{trace, warn};
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Error as XMLError, Reader};
use thiserror::Error;

use crate::identification::{IdentificationRecord, LookupError, ProteinIndex};
use crate::io::compression::open_maybe_gzipped;

/// Seconds per minute, the unit conversion applied to every retention time read
const SECONDS_PER_MINUTE: f64 = 60.0;

/**
The different states the [`IdXMLParser`] can enter while walking an
identification document.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IdXMLParserState {
    None,
    ProteinHit,
    PeptideIdentification,
    PeptideHit,
    PeptideHitUserParam,
    PeptideIdentificationUserParam,
    Done,
    ParserError,
}

/**
All the ways idXML parsing can go wrong. Unparseable numeric values are not
among them, those are read as zero.
*/
#[derive(Debug, Error)]
pub enum IdXMLParserError {
    #[error("An XML error {1} was encountered in {0:?}")]
    XMLError(IdXMLParserState, #[source] XMLError),
    #[error("An incomplete or misplaced element {0} was encountered in {1:?}")]
    IncompleteElementError(String, IdXMLParserState),
    #[error("Failed to resolve a reference in {0:?}: {1}")]
    LookupError(IdXMLParserState, #[source] LookupError),
    #[error("An IO error {1} was encountered in {0:?}")]
    IOError(IdXMLParserState, #[source] io::Error),
}

impl From<IdXMLParserError> for io::Error {
    fn from(value: IdXMLParserError) -> Self {
        match value {
            IdXMLParserError::IOError(_, ref e) => io::Error::new(e.kind(), value),
            _ => io::Error::new(io::ErrorKind::InvalidData, value),
        }
    }
}

pub type ParserResult = Result<(), IdXMLParserError>;

fn parse_or_zero<T: std::str::FromStr + Default>(field: &str, value: &str) -> T {
    match value.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            warn!("Could not parse {field} value {value:?}, using zero");
            T::default()
        }
    }
}

/// Copy the value of a named extension parameter into the field of `record`
/// it describes. Returns `false` for names without a corresponding field.
pub fn apply_user_param(record: &mut IdentificationRecord, name: &str, value: &str) -> bool {
    match name {
        "target_decoy" => record.target_decoy = value.to_string(),
        "Luciphor_pep_score" => record.localization.score = parse_or_zero(name, value),
        "Luciphor_global_flr" => record.localization.global_flr = parse_or_zero(name, value),
        "Luciphor_local_flr" => record.localization.local_flr = parse_or_zero(name, value),
        "search_engine_sequence" => {
            record.localization.search_engine_sequence = value.to_string()
        }
        "fragment_annotation" => record.fragment_annotation = value.to_string(),
        "spectrum_reference" => record.spectrum_reference = value.to_string(),
        _ => return false,
    }
    true
}

/**
The state machine behind [`IdXMLReader`]. It owns everything a single pass over
a document needs, so independent documents can be parsed concurrently by
independent parsers.

Records are built from `PeptideHit` elements and stamped with the precursor
m/z and retention time of their enclosing `PeptideIdentification`. Protein
references must be declared by a `ProteinHit` before they are used.

The hits of a `PeptideIdentification` become available through
[`IdXMLParser::next_record`] once that element closes, because its own
`UserParam`s may follow the hits and still apply to all of them.
*/
#[derive(Debug, Clone)]
pub struct IdXMLParser {
    pub state: IdXMLParserState,
    pub protein_index: ProteinIndex,
    workflow_id: u32,
    /// Values shared by every hit of the current `PeptideIdentification`
    block: IdentificationRecord,
    current: IdentificationRecord,
    /// Completed hits of the open `PeptideIdentification`
    pending: Vec<IdentificationRecord>,
    ready: VecDeque<IdentificationRecord>,
    next_id: u64,
    depth: usize,
}

impl IdXMLParser {
    pub fn new(workflow_id: u32) -> Self {
        Self {
            state: IdXMLParserState::None,
            protein_index: ProteinIndex::new(),
            workflow_id,
            block: IdentificationRecord::default(),
            current: IdentificationRecord::default(),
            pending: Vec::new(),
            ready: VecDeque::new(),
            next_id: 1,
            depth: 0,
        }
    }

    fn attributes<'a>(
        &self,
        event: &'a BytesStart,
    ) -> impl Iterator<Item = Result<(&'a [u8], String), IdXMLParserError>> + 'a {
        let state = self.state;
        event.attributes().map(move |attr| {
            let attr = attr.map_err(|e| IdXMLParserError::XMLError(state, e.into()))?;
            let value = attr
                .unescape_value()
                .map_err(|e| IdXMLParserError::XMLError(state, e))?
                .into_owned();
            Ok((attr.key.into_inner(), value))
        })
    }

    fn misplaced(&mut self, event: &BytesStart) -> IdXMLParserError {
        let err = IdXMLParserError::IncompleteElementError(
            String::from_utf8_lossy(event.name().as_ref()).into_owned(),
            self.state,
        );
        self.state = IdXMLParserState::ParserError;
        err
    }

    fn start_protein_hit(&mut self, event: &BytesStart) -> Result<(), IdXMLParserError> {
        let mut local_id = None;
        let mut accession = None;
        for attr in self.attributes(event) {
            let (key, value) = attr?;
            match key {
                b"id" => local_id = Some(value),
                b"accession" => accession = Some(value),
                _ => {}
            }
        }
        match (local_id, accession) {
            (Some(local_id), Some(accession)) => {
                trace!("Indexed protein {local_id} as {accession}");
                self.protein_index.insert(local_id, accession);
            }
            (local_id, _) => {
                warn!("ProteinHit {local_id:?} is missing an id or accession and cannot be referenced")
            }
        }
        self.state = IdXMLParserState::ProteinHit;
        Ok(())
    }

    fn start_peptide_identification(&mut self, event: &BytesStart) -> Result<(), IdXMLParserError> {
        let mut block = IdentificationRecord::new(self.workflow_id, 0);
        for attr in self.attributes(event) {
            let (key, value) = attr?;
            match key {
                b"MZ" => block.mass_over_charge = parse_or_zero("MZ", &value),
                b"RT" => {
                    block.retention_time = parse_or_zero::<f64>("RT", &value) / SECONDS_PER_MINUTE
                }
                b"spectrum_reference" => block.spectrum_reference = value,
                _ => {}
            }
        }
        self.block = block;
        self.state = IdXMLParserState::PeptideIdentification;
        Ok(())
    }

    fn start_peptide_hit(&mut self, event: &BytesStart) -> Result<(), IdXMLParserError> {
        let mut record = self.block.clone();
        record.id = self.next_id;
        self.next_id += 1;
        for attr in self.attributes(event) {
            let (key, value) = attr?;
            match key {
                b"score" => record.score = parse_or_zero("score", &value),
                b"sequence" => record.sequence = value,
                b"charge" => record.charge = parse_or_zero("charge", &value),
                b"protein_refs" => {
                    record.accessions = self
                        .protein_index
                        .resolve_refs(&value)
                        .map_err(|e| IdXMLParserError::LookupError(self.state, e))?;
                }
                _ => {}
            }
        }
        self.current = record;
        self.state = IdXMLParserState::PeptideHit;
        Ok(())
    }

    fn start_user_param(&mut self, event: &BytesStart) -> Result<(), IdXMLParserError> {
        let next_state = match self.state {
            IdXMLParserState::PeptideHit => IdXMLParserState::PeptideHitUserParam,
            IdXMLParserState::PeptideIdentification => {
                IdXMLParserState::PeptideIdentificationUserParam
            }
            _ => return Ok(()),
        };
        let mut name = None;
        let mut value = None;
        for attr in self.attributes(event) {
            let (key, val) = attr?;
            match key {
                b"name" => name = Some(val),
                b"value" => value = Some(val),
                _ => {}
            }
        }
        self.state = next_state;
        if let (Some(name), Some(value)) = (name, value) {
            let applied = match next_state {
                IdXMLParserState::PeptideHitUserParam => {
                    apply_user_param(&mut self.current, &name, &value)
                }
                _ => {
                    for record in self.pending.iter_mut() {
                        apply_user_param(record, &name, &value);
                    }
                    apply_user_param(&mut self.block, &name, &value)
                }
            };
            if !applied {
                trace!("Ignoring UserParam {name}");
            }
        }
        Ok(())
    }

    fn finish_user_param(&mut self) {
        self.state = match self.state {
            IdXMLParserState::PeptideHitUserParam => IdXMLParserState::PeptideHit,
            IdXMLParserState::PeptideIdentificationUserParam => {
                IdXMLParserState::PeptideIdentification
            }
            state => state,
        };
    }

    fn finish_peptide_hit(&mut self) {
        self.state = IdXMLParserState::PeptideIdentification;
        self.pending.push(std::mem::take(&mut self.current));
    }

    fn finish_peptide_identification(&mut self) {
        self.state = IdXMLParserState::None;
        self.ready.extend(self.pending.drain(..));
    }

    /// Take the next completed record, in document order
    pub fn next_record(&mut self) -> Option<IdentificationRecord> {
        self.ready.pop_front()
    }

    /// Stop parsing, discarding every record not yet taken
    pub fn fail(&mut self) {
        self.state = IdXMLParserState::ParserError;
        self.pending.clear();
        self.ready.clear();
    }

    /// Handle an opening tag, or a self-closing one if `is_empty` is set
    pub fn start_element(&mut self, event: &BytesStart, is_empty: bool) -> ParserResult {
        if !is_empty {
            self.depth += 1;
        }
        match event.name().as_ref() {
            b"ProteinHit" => {
                if !matches!(self.state, IdXMLParserState::None) {
                    return Err(self.misplaced(event));
                }
                self.start_protein_hit(event)?;
                if is_empty {
                    self.state = IdXMLParserState::None;
                }
            }
            b"PeptideIdentification" => {
                if !matches!(self.state, IdXMLParserState::None | IdXMLParserState::ProteinHit) {
                    return Err(self.misplaced(event));
                }
                self.start_peptide_identification(event)?;
                if is_empty {
                    self.finish_peptide_identification();
                }
            }
            b"PeptideHit" => {
                if self.state != IdXMLParserState::PeptideIdentification {
                    return Err(self.misplaced(event));
                }
                self.start_peptide_hit(event)?;
                if is_empty {
                    self.finish_peptide_hit();
                }
            }
            b"UserParam" => {
                self.start_user_param(event)?;
                if is_empty {
                    self.finish_user_param();
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Handle a closing tag
    pub fn end_element(&mut self, event: &BytesEnd) -> ParserResult {
        self.depth = self.depth.saturating_sub(1);
        match event.name().as_ref() {
            b"ProteinHit" => self.state = IdXMLParserState::None,
            b"PeptideIdentification" => self.finish_peptide_identification(),
            b"PeptideHit" => {
                if self.state == IdXMLParserState::PeptideHit {
                    self.finish_peptide_hit();
                }
            }
            b"UserParam" => self.finish_user_param(),
            _ => {}
        }
        Ok(())
    }

    /// Called when the input is exhausted
    pub fn finish(&mut self) -> Result<(), IdXMLParserError> {
        if self.depth != 0 {
            let state = self.state;
            self.state = IdXMLParserState::ParserError;
            return Err(IdXMLParserError::IncompleteElementError(
                format!("{} unclosed element(s)", self.depth),
                state,
            ));
        }
        self.state = IdXMLParserState::Done;
        Ok(())
    }
}

/**
Reads [`IdentificationRecord`]s from an idXML document one `PeptideHit` at a
time, in document order.

```text
<IdentificationRun>
  <ProteinIdentification>
    <ProteinHit id="PH_0" accession="sp|P02769|ALBU_BOVIN" />
  </ProteinIdentification>
  <PeptideIdentification MZ="722.3" RT="600.0">
    <PeptideHit score="0.98" sequence="LVNELTEFAK" charge="2" protein_refs="PH_0">
      <UserParam type="string" name="target_decoy" value="target"/>
    </PeptideHit>
  </PeptideIdentification>
</IdentificationRun>
```

Retention times are converted from seconds to minutes. Iteration stops after the
first error.
*/
pub struct IdXMLReader<R: BufRead> {
    handle: Reader<R>,
    buffer: Vec<u8>,
    parser: IdXMLParser,
}

impl<R: BufRead> IdXMLReader<R> {
    pub fn new(handle: R) -> Self {
        Self::with_workflow_id(handle, 0)
    }

    /// Create a reader whose records are attributed to `workflow_id`
    pub fn with_workflow_id(handle: R, workflow_id: u32) -> Self {
        let mut handle = Reader::from_reader(handle);
        handle.trim_text(true);
        handle.check_end_names(true);
        Self {
            handle,
            buffer: Vec::new(),
            parser: IdXMLParser::new(workflow_id),
        }
    }

    pub fn state(&self) -> IdXMLParserState {
        self.parser.state
    }

    /// The protein accessions declared so far
    pub fn protein_index(&self) -> &ProteinIndex {
        &self.parser.protein_index
    }

    /// Read the next record, or `None` at the end of the document
    pub fn read_next(&mut self) -> Result<Option<IdentificationRecord>, IdXMLParserError> {
        loop {
            if let Some(record) = self.parser.next_record() {
                return Ok(Some(record));
            }
            if matches!(
                self.parser.state,
                IdXMLParserState::Done | IdXMLParserState::ParserError
            ) {
                return Ok(None);
            }
            let state = self.parser.state;
            let result = match self.handle.read_event_into(&mut self.buffer) {
                Ok(Event::Start(ref e)) => self.parser.start_element(e, false),
                Ok(Event::Empty(ref e)) => self.parser.start_element(e, true),
                Ok(Event::End(ref e)) => self.parser.end_element(e),
                Ok(Event::Eof) => self.parser.finish(),
                Ok(_) => Ok(()),
                Err(XMLError::Io(e)) => Err(IdXMLParserError::IOError(
                    state,
                    io::Error::new(e.kind(), e.to_string()),
                )),
                Err(e) => Err(IdXMLParserError::XMLError(state, e)),
            };
            self.buffer.clear();
            if let Err(e) = result {
                self.parser.fail();
                return Err(e);
            }
        }
    }

    /// Read every remaining record
    pub fn read_all(&mut self) -> Result<Vec<IdentificationRecord>, IdXMLParserError> {
        let mut records = Vec::new();
        while let Some(record) = self.read_next()? {
            records.push(record);
        }
        Ok(records)
    }
}

impl IdXMLReader<Box<dyn BufRead + Send>> {
    /// Open an idXML file, which may be gzip-compressed
    pub fn open_path<P: AsRef<Path>>(path: P, workflow_id: u32) -> io::Result<Self> {
        let handle = open_maybe_gzipped(path)?;
        Ok(Self::with_workflow_id(handle, workflow_id))
    }
}

impl<R: BufRead> Iterator for IdXMLReader<R> {
    type Item = Result<IdentificationRecord, IdXMLParserError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

/// Count the `ProteinHit` declarations in an idXML file without building records
pub fn count_protein_hits<P: AsRef<Path>>(path: P) -> Result<usize, IdXMLParserError> {
    let handle = open_maybe_gzipped(path)
        .map_err(|e| IdXMLParserError::IOError(IdXMLParserState::None, e))?;
    let mut reader = Reader::from_reader(handle);
    reader.trim_text(true);
    let mut buffer = Vec::new();
    let mut count = 0;
    loop {
        match reader.read_event_into(&mut buffer) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) if e.name().as_ref() == b"ProteinHit" => {
                count += 1
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(IdXMLParserError::XMLError(IdXMLParserState::None, e)),
        }
        buffer.clear();
    }
    Ok(count)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::identification::ACCESSION_SEPARATOR;

    fn parse(text: &str) -> Result<Vec<IdentificationRecord>, IdXMLParserError> {
        IdXMLReader::with_workflow_id(text.as_bytes(), 7).read_all()
    }

    #[test_log::test]
    fn reader_from_file() {
        let reader = IdXMLReader::open_path("./test/data/small.idXML", 3).unwrap();
        let records: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 4);

        let first = &records[0];
        assert_eq!(first.workflow_id, 3);
        assert_eq!(first.id, 1);
        assert_eq!(first.sequence, "LVNELTEFAK");
        assert_eq!(first.charge, 2);
        assert!((first.retention_time - 10.0).abs() < 1e-9);
        assert!((first.mass_over_charge - 582.319).abs() < 1e-9);
        assert_eq!(first.accessions, "sp|P02769|ALBU_BOVIN");
        assert_eq!(first.target_decoy, "target");
        assert_eq!(first.spectrum_reference, "controllerType=0 controllerNumber=1 scan=1200");
        assert_eq!(first.fragment_annotation, "b2+,y3+,y4+");

        // second candidate of the same spectrum keeps the block's coordinates
        let second = &records[1];
        assert_eq!(second.id, 2);
        assert_eq!(second.retention_time, first.retention_time);
        assert_eq!(second.mass_over_charge, first.mass_over_charge);
        assert_eq!(
            second.accessions,
            ["sp|P02769|ALBU_BOVIN", "DECOY_sp|P02769|ALBU_BOVIN"].join(ACCESSION_SEPARATOR)
        );
        assert_eq!(second.target_decoy, "target+decoy");

        let phospho = &records[3];
        assert_eq!(phospho.sequence, "YLYEIAR(Phospho)");
        assert!((phospho.localization.score - 0.87).abs() < 1e-9);
        assert_eq!(phospho.localization.global_flr, 0.0);
        assert!((phospho.localization.local_flr - 0.01).abs() < 1e-9);
        assert_eq!(phospho.localization.search_engine_sequence, "Y(Phospho)LYEIAR");
    }

    #[test]
    fn reparse_is_identical() {
        let text = std::fs::read_to_string("./test/data/small.idXML").unwrap();
        assert_eq!(parse(&text).unwrap(), parse(&text).unwrap());
    }

    #[test]
    fn retention_time_in_minutes() {
        let records = parse(
            r#"<IdentificationRun><PeptideIdentification MZ="500.1" RT="600"><PeptideHit score="1" sequence="PEPTIDE" charge="2"/></PeptideIdentification></IdentificationRun>"#,
        )
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].retention_time, 10.0);
        assert_eq!(records[0].accessions, "");
    }

    #[test]
    fn protein_refs_resolution() {
        let records = parse(
            r#"<IdentificationRun>
                <ProteinHit id="PH_1" accession="ACC1"/>
                <ProteinHit id="PH_2" accession="P2"/>
                <PeptideIdentification MZ="500" RT="60">
                    <PeptideHit score="1" sequence="A" charge="1" protein_refs="PH_1"/>
                    <PeptideHit score="1" sequence="B" charge="1" protein_refs="PH_1 PH_2"></PeptideHit>
                </PeptideIdentification>
            </IdentificationRun>"#,
        )
        .unwrap();
        assert_eq!(records[0].accessions, "ACC1");
        assert_eq!(records[1].accessions, "ACC1;P2");
    }

    #[test]
    fn forward_reference_is_a_lookup_error() {
        let err = parse(
            r#"<IdentificationRun>
                <PeptideIdentification MZ="500" RT="60">
                    <PeptideHit score="1" sequence="A" charge="1" protein_refs="PH_9"/>
                </PeptideIdentification>
                <ProteinHit id="PH_9" accession="LATE"/>
            </IdentificationRun>"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            IdXMLParserError::LookupError(_, LookupError::UnknownProteinRef(ref r)) if r == "PH_9"
        ));
    }

    #[test]
    fn bad_numbers_degrade_to_zero() {
        let records = parse(
            r#"<IdentificationRun><PeptideIdentification MZ="abc" RT="x">
                <PeptideHit score="high" sequence="PEPTIDE" charge="two">
                    <UserParam type="float" name="Luciphor_pep_score" value="n/a"/>
                    <UserParam type="string" name="unrelated" value="1"/>
                </PeptideHit>
            </PeptideIdentification></IdentificationRun>"#,
        )
        .unwrap();
        let rec = &records[0];
        assert_eq!(rec.mass_over_charge, 0.0);
        assert_eq!(rec.retention_time, 0.0);
        assert_eq!(rec.score, 0.0);
        assert_eq!(rec.charge, 0);
        assert_eq!(rec.localization.score, 0.0);
        assert_eq!(rec.sequence, "PEPTIDE");
    }

    #[test]
    fn structural_errors_abort() {
        let err = parse(
            r#"<IdentificationRun><PeptideIdentification MZ="1" RT="1"><PeptideHit score="1"></PeptideIdentification></IdentificationRun>"#,
        )
        .unwrap_err();
        assert!(matches!(err, IdXMLParserError::XMLError(..)), "{err}");

        let err = parse(r#"<IdentificationRun><PeptideHit score="1"/></IdentificationRun>"#).unwrap_err();
        assert!(matches!(err, IdXMLParserError::IncompleteElementError(..)), "{err}");

        let err = parse(r#"<IdentificationRun><PeptideIdentification MZ="1" RT="1">"#).unwrap_err();
        assert!(matches!(err, IdXMLParserError::IncompleteElementError(..)), "{err}");

        let mut reader = IdXMLReader::new(r#"<IdentificationRun><PeptideHit/>"#.as_bytes());
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());
        assert_eq!(reader.state(), IdXMLParserState::ParserError);
    }

    #[test]
    fn trailing_block_params_apply_to_every_hit() {
        let records = parse(
            r#"<IdentificationRun>
                <PeptideIdentification MZ="500" RT="120">
                    <PeptideHit score="1" sequence="A" charge="1">
                        <UserParam type="string" name="target_decoy" value="target"/>
                    </PeptideHit>
                    <PeptideHit score="2" sequence="B" charge="1"/>
                    <UserParam type="string" name="spectrum_reference" value="scan=77"/>
                </PeptideIdentification>
                <PeptideIdentification MZ="600" RT="180">
                    <PeptideHit score="3" sequence="C" charge="2"/>
                </PeptideIdentification>
            </IdentificationRun>"#,
        )
        .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].spectrum_reference, "scan=77");
        assert_eq!(records[0].target_decoy, "target");
        assert_eq!(records[1].spectrum_reference, "scan=77");
        assert_eq!(records[2].spectrum_reference, "");
        assert_eq!(
            records.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn count_proteins() {
        assert_eq!(count_protein_hits("./test/data/small.idXML").unwrap(), 3);
    }
}
