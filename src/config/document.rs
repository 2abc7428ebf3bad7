use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace, warn};
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Error as XMLError, Reader, Writer};
use thiserror::Error;

use super::path::ParameterPath;
use crate::tool::{CancellationToken, ToolError, ToolExecutor, ToolSpec};

const SECTION_TAG: &[u8] = b"NODE";
const ITEM_TAG: &[u8] = b"ITEM";
const ITEM_LIST_TAG: &[u8] = b"ITEMLIST";
const LIST_ITEM_TAG: &[u8] = b"LISTITEM";

const INDENT: &str = "  ";

/**
All the ways that loading or saving a [`ConfigDocument`] can go wrong
*/
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Malformed configuration document at byte {0}: {1}")]
    MalformedDocument(usize, String),
    #[error("An XML error {1} was encountered at byte {0}")]
    XMLError(usize, #[source] XMLError),
    #[error("An IO error occurred while accessing the configuration document: {0}")]
    IOError(
        #[from]
        #[source]
        io::Error,
    ),
    #[error("The configuration document has no backing file to persist to")]
    NoBackingFile,
    #[error(transparent)]
    Tool(#[from] ToolError),
}

impl ConfigError {
    /// Whether this error stems from the content of the document rather than
    /// from the file system or the tool that produced it.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, Self::MalformedDocument(..) | Self::XMLError(..))
    }
}

/// A named group of parameters, a `NODE` element in the backing file
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Section {
    pub name: String,
    pub children: Vec<ConfigNode>,
}

/// A scalar parameter, an `ITEM` element
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub name: String,
    pub value: String,
    event: usize,
}

/// A list-valued parameter, an `ITEMLIST` element with `LISTITEM` children
#[derive(Debug, Clone, PartialEq)]
pub struct ItemList {
    pub name: String,
    pub values: Vec<String>,
    start: usize,
    end: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigNode {
    Section(Section),
    Item(Item),
    ItemList(ItemList),
}

impl Section {
    fn new(name: String) -> Self {
        Self {
            name,
            children: Vec::new(),
        }
    }

    /// Visit every leaf below this section in document order along with the
    /// chain of section names enclosing it.
    fn walk<'a>(&'a self, chain: &mut Vec<&'a str>, visitor: &mut impl FnMut(&[&'a str], &'a ConfigNode)) {
        for child in self.children.iter() {
            match child {
                ConfigNode::Section(section) => {
                    chain.push(section.name.as_str());
                    section.walk(chain, visitor);
                    chain.pop();
                }
                leaf => visitor(chain, leaf),
            }
        }
    }

    /// Find a direct child section by name
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.children.iter().find_map(|c| match c {
            ConfigNode::Section(s) if s.name == name => Some(s),
            _ => None,
        })
    }
}

fn attribute_of(event: &BytesStart, key: &[u8]) -> Result<Option<String>, XMLError> {
    for attr in event.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Copy `event` with the attribute `key` set to `value`, leaving every other
/// attribute's raw text untouched.
fn with_attribute(event: &BytesStart, key: &str, value: &str) -> Result<BytesStart<'static>, XMLError> {
    let name = String::from_utf8_lossy(event.name().as_ref()).into_owned();
    let mut updated = BytesStart::new(name);
    let mut seen = false;
    for attr in event.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == key.as_bytes() {
            updated.push_attribute((key, value));
            seen = true;
        } else {
            updated.push_attribute(attr);
        }
    }
    if !seen {
        updated.push_attribute((key, value));
    }
    Ok(updated)
}

fn whitespace_of(event: &Event) -> Option<String> {
    match event {
        Event::Text(text) if text.iter().all(u8::is_ascii_whitespace) => {
            Some(String::from_utf8_lossy(text).into_owned())
        }
        _ => None,
    }
}

/// The line break and indentation that precede the element at `index`
fn indentation_before(events: &[Event], index: usize) -> String {
    index
        .checked_sub(1)
        .and_then(|i| whitespace_of(&events[i]))
        .and_then(|ws| ws.rfind('\n').map(|i| ws[i..].to_string()))
        .unwrap_or_else(|| "\n".to_string())
}

fn is_tag(event: &Event, tag: &[u8]) -> bool {
    match event {
        Event::Start(e) | Event::Empty(e) => e.name().as_ref() == tag,
        _ => false,
    }
}

/// Build the typed tree over a verbatim event sequence
fn build_tree(events: &[Event<'static>]) -> Result<Section, ConfigError> {
    let mut stack = vec![Section::default()];
    let mut open_list: Option<ItemList> = None;

    let name_of = |e: &BytesStart, i: usize| -> Result<String, ConfigError> {
        attribute_of(e, b"name")
            .map_err(|err| ConfigError::XMLError(i, err))?
            .ok_or_else(|| {
                ConfigError::MalformedDocument(
                    i,
                    format!(
                        "{} element without a name",
                        String::from_utf8_lossy(e.name().as_ref())
                    ),
                )
            })
    };

    for (i, event) in events.iter().enumerate() {
        match event {
            Event::Start(e) | Event::Empty(e) => {
                let is_empty = matches!(event, Event::Empty(_));
                match e.name().as_ref() {
                    SECTION_TAG => {
                        let section = Section::new(name_of(e, i)?);
                        if is_empty {
                            if let Some(parent) = stack.last_mut() {
                                parent.children.push(ConfigNode::Section(section));
                            }
                        } else {
                            stack.push(section);
                        }
                    }
                    ITEM_TAG => {
                        let value = attribute_of(e, b"value")
                            .map_err(|err| ConfigError::XMLError(i, err))?
                            .unwrap_or_default();
                        let item = Item {
                            name: name_of(e, i)?,
                            value,
                            event: i,
                        };
                        if let Some(parent) = stack.last_mut() {
                            parent.children.push(ConfigNode::Item(item));
                        }
                    }
                    ITEM_LIST_TAG => {
                        let list = ItemList {
                            name: name_of(e, i)?,
                            values: Vec::new(),
                            start: i,
                            end: i,
                        };
                        if is_empty {
                            if let Some(parent) = stack.last_mut() {
                                parent.children.push(ConfigNode::ItemList(list));
                            }
                        } else {
                            open_list = Some(list);
                        }
                    }
                    LIST_ITEM_TAG => {
                        let value = attribute_of(e, b"value")
                            .map_err(|err| ConfigError::XMLError(i, err))?
                            .unwrap_or_default();
                        match open_list.as_mut() {
                            Some(list) => list.values.push(value),
                            None => {
                                return Err(ConfigError::MalformedDocument(
                                    i,
                                    "LISTITEM outside of an ITEMLIST".into(),
                                ))
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::End(e) => match e.name().as_ref() {
                SECTION_TAG => {
                    let section = stack.pop().filter(|_| !stack.is_empty()).ok_or_else(|| {
                        ConfigError::MalformedDocument(i, "Unbalanced NODE element".into())
                    })?;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(ConfigNode::Section(section));
                    }
                }
                ITEM_LIST_TAG => {
                    let mut list = open_list.take().ok_or_else(|| {
                        ConfigError::MalformedDocument(i, "Unbalanced ITEMLIST element".into())
                    })?;
                    list.end = i;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(ConfigNode::ItemList(list));
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }
    if stack.len() != 1 || open_list.is_some() {
        return Err(ConfigError::MalformedDocument(
            events.len(),
            "Document ended inside an open section".into(),
        ));
    }
    stack
        .pop()
        .ok_or_else(|| ConfigError::MalformedDocument(events.len(), "Empty document".into()))
}

/**
A TOPP tool's parameter file, held as the exact sequence of XML events read from
disk with a typed [`Section`]/[`Item`]/[`ItemList`] tree built over it.

Mutations rewrite only the events of the addressed node, so writing the document
back out reproduces every untouched element, attribute, comment and whitespace
run byte-for-byte. No type checking is applied to values: an invalid value is only
detected when the tool reads the file.
*/
#[derive(Debug, Clone)]
pub struct ConfigDocument {
    path: Option<PathBuf>,
    events: Vec<Event<'static>>,
    root: Section,
}

impl ConfigDocument {
    /// Ask `tool` to write out its default parameters into `scratch_dir` and
    /// load the resulting file.
    pub fn from_tool<E: ToolExecutor + ?Sized>(
        executor: &E,
        tool: &ToolSpec,
        scratch_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Self, ConfigError> {
        let path = scratch_dir.join(format!("{}.ini", tool.name));
        if path.exists() {
            fs::remove_file(&path)?;
        }
        debug!("Requesting default configuration of {} into {}", tool.name, path.display());
        executor.write_default_config(tool, &path, cancel)?;
        if !path.exists() {
            return Err(ToolError::Invocation {
                tool: tool.name.clone(),
                reason: format!("no default configuration was written to {}", path.display()),
                source: None,
            }
            .into());
        }
        Self::open(path)
    }

    /// Read a configuration document from a file, remembering the path for [`ConfigDocument::persist`]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let handle = BufReader::new(fs::File::open(path)?);
        let mut this = Self::from_reader(handle)?;
        this.path = Some(path.to_path_buf());
        Ok(this)
    }

    pub fn from_reader<R: BufRead>(handle: R) -> Result<Self, ConfigError> {
        let mut reader = Reader::from_reader(handle);
        reader.trim_text(false);
        reader.check_end_names(true);
        let mut buffer = Vec::new();
        let mut events = Vec::new();
        let mut depth = 0usize;
        loop {
            let event = match reader.read_event_into(&mut buffer) {
                Ok(Event::Eof) => break,
                Ok(event) => event.into_owned(),
                Err(err) => return Err(ConfigError::XMLError(reader.buffer_position(), err)),
            };
            match &event {
                Event::Start(_) => depth += 1,
                Event::End(_) => depth = depth.saturating_sub(1),
                _ => {}
            }
            events.push(event);
            buffer.clear();
        }
        if depth != 0 {
            return Err(ConfigError::MalformedDocument(
                reader.buffer_position(),
                format!("{depth} element(s) were never closed"),
            ));
        }
        if !events.iter().any(|e| matches!(e, Event::Start(_) | Event::Empty(_))) {
            return Err(ConfigError::MalformedDocument(
                reader.buffer_position(),
                "No root element".into(),
            ));
        }
        let root = build_tree(&events)?;
        trace!("Loaded configuration document with {} events", events.len());
        Ok(Self {
            path: None,
            events,
            root,
        })
    }

    /// The backing file, if this document was read from or persisted to one
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The implicit top-level section enclosing all `NODE` elements
    pub fn root(&self) -> &Section {
        &self.root
    }

    fn find<'a>(&'a self, path: &ParameterPath, want_list: bool) -> Option<&'a ConfigNode> {
        let mut found = None;
        let mut count = 0usize;
        let mut chain = Vec::new();
        self.root.walk(&mut chain, &mut |chain, node| {
            let name = match (node, want_list) {
                (ConfigNode::Item(item), false) => &item.name,
                (ConfigNode::ItemList(list), true) => &list.name,
                _ => return,
            };
            if path.matches(chain, name) {
                count += 1;
                found = Some(node);
            }
        });
        if count > 1 {
            debug!("{path} matched {count} parameters, the last one is used");
        }
        found
    }

    fn find_item(&self, path: &ParameterPath) -> Option<&Item> {
        match self.find(path, false) {
            Some(ConfigNode::Item(item)) => Some(item),
            _ => None,
        }
    }

    fn find_list(&self, path: &ParameterPath) -> Option<&ItemList> {
        match self.find(path, true) {
            Some(ConfigNode::ItemList(list)) => Some(list),
            _ => None,
        }
    }

    /// The value of the scalar parameter `path` addresses
    pub fn get(&self, path: &ParameterPath) -> Option<&str> {
        self.find_item(path).map(|item| item.value.as_str())
    }

    /// The entries of the list parameter `path` addresses
    pub fn get_list(&self, path: &ParameterPath) -> Option<&[String]> {
        self.find_list(path).map(|list| list.values.as_slice())
    }

    /// Overwrite the value of the scalar parameter `path` addresses.
    ///
    /// Returns `false` and leaves the document unchanged if nothing matches.
    pub fn set_scalar(&mut self, path: &ParameterPath, value: &str) -> Result<bool, ConfigError> {
        let index = match self.find_item(path) {
            Some(item) => item.event,
            None => {
                warn!("No parameter {path} to set");
                return Ok(false);
            }
        };
        let updated = match &self.events[index] {
            Event::Empty(e) => Event::Empty(
                with_attribute(e, "value", value).map_err(|err| ConfigError::XMLError(index, err))?,
            ),
            Event::Start(e) => Event::Start(
                with_attribute(e, "value", value).map_err(|err| ConfigError::XMLError(index, err))?,
            ),
            _ => {
                return Err(ConfigError::MalformedDocument(
                    index,
                    "Parameter index does not point at an element".into(),
                ))
            }
        };
        self.events[index] = updated;
        self.root = build_tree(&self.events)?;
        Ok(true)
    }

    /// Append `values` to the list parameter `path` addresses, dropping its
    /// existing entries first if `clear_first` is set.
    ///
    /// Returns `false` and leaves the document unchanged if nothing matches.
    pub fn set_list<S: AsRef<str>>(
        &mut self,
        path: &ParameterPath,
        values: &[S],
        clear_first: bool,
    ) -> Result<bool, ConfigError> {
        let (start, mut end) = match self.find_list(path) {
            Some(list) => (list.start, list.end),
            None => {
                warn!("No list parameter {path} to set");
                return Ok(false);
            }
        };

        if start == end {
            // A self-closing ITEMLIST must be opened up before it can hold entries
            if let Event::Empty(e) = &self.events[start] {
                let opened = e.clone();
                let closing = Event::End(opened.to_end().into_owned());
                self.events[start] = Event::Start(opened);
                self.events.insert(start + 1, closing);
                end = start + 1;
            }
        }
        if !matches!(self.events[end], Event::End(_)) {
            return Err(ConfigError::MalformedDocument(
                end,
                format!("List parameter {path} is not closed"),
            ));
        }

        let outer_indent = indentation_before(&self.events, start);
        let closing_indent = whitespace_of(&self.events[end - 1])
            .filter(|_| end - 1 > start)
            .unwrap_or_else(|| outer_indent.clone());
        let child_indent = (start + 2 < end)
            .then(|| whitespace_of(&self.events[start + 1]))
            .flatten()
            .filter(|_| is_tag(&self.events[start + 2], LIST_ITEM_TAG))
            .unwrap_or_else(|| format!("{closing_indent}{INDENT}"));

        let mut body: Vec<Event<'static>> = if clear_first {
            Vec::new()
        } else {
            let mut kept = self.events[start + 1..end].to_vec();
            if kept.last().and_then(whitespace_of).is_some() {
                kept.pop();
            }
            kept
        };
        for value in values {
            let mut entry = BytesStart::new("LISTITEM");
            entry.push_attribute(("value", value.as_ref()));
            body.push(Event::Text(BytesText::from_escaped(child_indent.clone())));
            body.push(Event::Empty(entry));
        }
        if !body.is_empty() {
            body.push(Event::Text(BytesText::from_escaped(closing_indent)));
        }
        self.events.splice(start + 1..end, body);
        self.root = build_tree(&self.events)?;
        Ok(true)
    }

    /// Write the document to `handle`
    pub fn write_to<W: Write>(&self, handle: W) -> Result<(), ConfigError> {
        let mut writer = Writer::new(handle);
        for (i, event) in self.events.iter().enumerate() {
            writer
                .write_event(event)
                .map_err(|err| ConfigError::XMLError(i, err))?;
        }
        writer.into_inner().flush()?;
        Ok(())
    }

    /// Write the document back to the file it was read from
    pub fn persist(&self) -> Result<(), ConfigError> {
        let path = self.path.as_ref().ok_or(ConfigError::NoBackingFile)?;
        let handle = BufWriter::new(fs::File::create(path)?);
        self.write_to(handle)
    }

    /// Write the document to a new file, which becomes its backing file
    pub fn persist_to<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        self.path = Some(path.as_ref().to_path_buf());
        self.persist()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        let mut buffer = Vec::new();
        self.write_to(&mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tool::ToolOutput;
    use std::time::Duration;

    const SMALL_INI: &str = include_str!("../../test/data/small.ini");

    fn load() -> ConfigDocument {
        ConfigDocument::from_reader(SMALL_INI.as_bytes()).unwrap()
    }

    fn path(s: &str) -> ParameterPath {
        s.parse().unwrap()
    }

    #[test]
    fn round_trip_is_verbatim() {
        let doc = load();
        let bytes = doc.to_bytes().unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), SMALL_INI);
    }

    #[test]
    fn read_tree() {
        let doc = load();
        let tool = doc.root().section("FeatureFinderCentroided").unwrap();
        assert_eq!(tool.children.len(), 2);
        assert_eq!(doc.get(&path("1:in")), Some("input.mzML"));
        assert_eq!(doc.get(&path("mass_trace:mz_tolerance")), Some("0.03"));
        assert_eq!(
            doc.get_list(&path("fixed_modifications")).unwrap(),
            &["Carbamidomethyl (C)".to_string()]
        );
        assert_eq!(doc.get_list(&path("variable_modifications")).unwrap().len(), 0);
        assert_eq!(doc.get(&path("no_such_thing")), None);
    }

    #[test]
    fn set_scalar_round_trip() {
        let mut doc = load();
        assert!(doc
            .set_scalar(&path("mass_trace:mz_tolerance"), "0.01")
            .unwrap());
        let text = String::from_utf8(doc.to_bytes().unwrap()).unwrap();
        let reloaded = ConfigDocument::from_reader(text.as_bytes()).unwrap();
        assert_eq!(reloaded.get(&path("mass_trace:mz_tolerance")), Some("0.01"));

        // Only the touched line differs
        let changed: Vec<_> = SMALL_INI
            .lines()
            .zip(text.lines())
            .filter(|(a, b)| a != b)
            .collect();
        assert_eq!(changed.len(), 1);
        assert!(changed[0].1.contains(r#"value="0.01""#));
        assert!(changed[0].1.contains(r#"description="m/z tolerance""#));
    }

    #[test]
    fn set_scalar_unmatched_is_noop() {
        let mut doc = load();
        assert!(!doc.set_scalar(&path("missing:thing"), "1").unwrap());
        assert_eq!(doc.to_bytes().unwrap(), SMALL_INI.as_bytes());
    }

    #[test]
    fn last_match_wins() {
        let mut doc = load();
        // `debug` appears both at the tool level and inside `algorithm`
        assert_eq!(doc.get(&path("debug")), Some("2"));
        doc.set_scalar(&path("debug"), "5").unwrap();
        let reloaded = ConfigDocument::from_reader(doc.to_bytes().unwrap().as_slice()).unwrap();
        assert_eq!(reloaded.get(&path("1:debug")), Some("0"));
        assert_eq!(reloaded.get(&path("algorithm:debug")), Some("5"));
    }

    #[test]
    fn set_list_clear_first_is_idempotent() {
        let mut doc = load();
        let values = ["Oxidation (M)", "Acetyl (N-term)"];
        let p = path("fixed_modifications");
        doc.set_list(&p, &values, true).unwrap();
        let first = doc.to_bytes().unwrap();
        doc.set_list(&p, &values, true).unwrap();
        let second = doc.to_bytes().unwrap();
        assert_eq!(first, second);

        let reloaded = ConfigDocument::from_reader(second.as_slice()).unwrap();
        assert_eq!(reloaded.get_list(&p).unwrap(), &values.map(String::from));
        let text = String::from_utf8(second).unwrap();
        assert!(text.contains(
            "\n        <LISTITEM value=\"Oxidation (M)\"/>\n        <LISTITEM value=\"Acetyl (N-term)\"/>\n      </ITEMLIST>"
        ));
    }

    #[test]
    fn set_list_appends_and_opens_empty_lists() {
        let mut doc = load();
        let p = path("fixed_modifications");
        doc.set_list(&p, &["Oxidation (M)"], false).unwrap();
        assert_eq!(
            doc.get_list(&p).unwrap(),
            &["Carbamidomethyl (C)".to_string(), "Oxidation (M)".to_string()]
        );

        let p = path("variable_modifications");
        doc.set_list(&p, &["Phospho (S)"], true).unwrap();
        let reloaded = ConfigDocument::from_reader(doc.to_bytes().unwrap().as_slice()).unwrap();
        assert_eq!(reloaded.get_list(&p).unwrap(), &["Phospho (S)".to_string()]);
    }

    #[test]
    fn malformed_documents() {
        let err = ConfigDocument::from_reader(b"<PARAMETERS><NODE name=\"a\"></PARAMETERS>".as_slice())
            .unwrap_err();
        assert!(err.is_parse_error(), "{err}");

        let err = ConfigDocument::from_reader(b"<PARAMETERS><NODE name=\"a\">".as_slice()).unwrap_err();
        assert!(err.is_parse_error(), "{err}");

        let err = ConfigDocument::from_reader(b"<PARAMETERS><ITEM value=\"1\"/></PARAMETERS>".as_slice())
            .unwrap_err();
        assert!(err.is_parse_error(), "{err}");
    }

    #[test]
    fn persist_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("copy.ini");
        let mut doc = load();
        assert!(matches!(doc.persist(), Err(ConfigError::NoBackingFile)));
        doc.persist_to(&target).unwrap();
        let mut reopened = ConfigDocument::open(&target).unwrap();
        reopened.set_scalar(&path("1:out"), "features.featureXML").unwrap();
        reopened.persist().unwrap();
        let again = ConfigDocument::open(&target).unwrap();
        assert_eq!(again.get(&path("1:out")), Some("features.featureXML"));
    }

    struct WritesIni(bool);

    impl ToolExecutor for WritesIni {
        fn write_default_config(
            &self,
            _tool: &ToolSpec,
            path: &Path,
            _cancel: &CancellationToken,
        ) -> Result<(), ToolError> {
            if self.0 {
                fs::write(path, SMALL_INI).unwrap();
            }
            Ok(())
        }

        fn run_and_wait(
            &self,
            _tool: &ToolSpec,
            _config_path: &Path,
            _working_dir: &Path,
            _cancel: &CancellationToken,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::new(0, String::new(), Duration::ZERO))
        }
    }

    #[test]
    fn initialize_from_tool() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ToolSpec::new("FeatureFinderCentroided", "FeatureFinderCentroided");
        let cancel = CancellationToken::new();
        let doc = ConfigDocument::from_tool(&WritesIni(true), &tool, dir.path(), &cancel).unwrap();
        assert_eq!(
            doc.path().unwrap(),
            dir.path().join("FeatureFinderCentroided.ini")
        );

        let dir = tempfile::tempdir().unwrap();
        let err = ConfigDocument::from_tool(&WritesIni(false), &tool, dir.path(), &cancel).unwrap_err();
        assert!(matches!(err, ConfigError::Tool(ToolError::Invocation { .. })));
    }
}
