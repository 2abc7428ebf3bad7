use std::fmt::Display;
use std::str::FromStr;

use thiserror::Error;

/// The separator TOPP tools use between the components of a parameter name
pub const PATH_SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterPathError {
    #[error("A parameter path must name a leaf")]
    Empty,
    #[error("Parameter path {0:?} contains an empty component")]
    EmptyComponent(String),
}

/**
Addresses an `ITEM` or `ITEMLIST` inside a [`ConfigDocument`](super::ConfigDocument)
by the names of its enclosing sections and its own name.

A path is relative: it matches any node whose leaf name is equal and whose
enclosing section chain *ends with* [`ParameterPath::sections`]. This lets
`algorithm:mass_trace:mz_tolerance` address
`FeatureFinderCentroided:1:algorithm:mass_trace:mz_tolerance` without knowing
the tool name or instance number. When several nodes match, the one that
occurs last in the document is used.
*/
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct ParameterPath {
    pub sections: Vec<String>,
    pub leaf: String,
}

impl ParameterPath {
    pub fn new<S: Into<String>>(sections: impl IntoIterator<Item = S>, leaf: impl Into<String>) -> Self {
        Self {
            sections: sections.into_iter().map(Into::into).collect(),
            leaf: leaf.into(),
        }
    }

    /// A path consisting of just a leaf name, matching it in any section
    pub fn leaf(leaf: impl Into<String>) -> Self {
        Self {
            sections: Vec::new(),
            leaf: leaf.into(),
        }
    }

    /// Whether a node named `leaf` nested in `chain` is addressed by this path
    pub fn matches<S: AsRef<str>>(&self, chain: &[S], leaf: &str) -> bool {
        if self.leaf != leaf || chain.len() < self.sections.len() {
            return false;
        }
        let tail = &chain[chain.len() - self.sections.len()..];
        tail.iter()
            .zip(self.sections.iter())
            .all(|(a, b)| a.as_ref() == b)
    }
}

impl Display for ParameterPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for section in self.sections.iter() {
            write!(f, "{section}{PATH_SEPARATOR}")?;
        }
        f.write_str(&self.leaf)
    }
}

impl FromStr for ParameterPath {
    type Err = ParameterPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParameterPathError::Empty);
        }
        let mut parts: Vec<String> = s.split(PATH_SEPARATOR).map(|p| p.to_string()).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(ParameterPathError::EmptyComponent(s.to_string()));
        }
        // `parts` always has at least one element after a non-empty split
        let leaf = parts.pop().unwrap_or_default();
        Ok(Self {
            sections: parts,
            leaf,
        })
    }
}

impl TryFrom<String> for ParameterPath {
    type Error = ParameterPathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ParameterPath> for String {
    fn from(value: ParameterPath) -> Self {
        value.to_string()
    }
}
