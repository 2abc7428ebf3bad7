//! Reading, patching and writing TOPP tool parameter files (`.ini`).
//!
//! ```text
//! <NODE name="FeatureFinderCentroided">
//!   <NODE name="1">
//!     <ITEM name="in" value="input.mzML" ... />
//!     <ITEMLIST name="fixed_modifications" ...>
//!       <LISTITEM value="Carbamidomethyl (C)"/>
//!     </ITEMLIST>
//!   </NODE>
//! </NODE>
//! ```
mod document;
mod path;

pub use document::{ConfigDocument, ConfigError, ConfigNode, Item, ItemList, Section};
pub use path::{ParameterPath, ParameterPathError, PATH_SEPARATOR};

/// A value to place in a parameter file, either a single `ITEM` value or the
/// entries of an `ITEMLIST`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum OverrideValue {
    Scalar(String),
    List(Vec<String>),
}

/// A parameter to overwrite in the configuration of a named tool before it runs
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParameterOverride {
    pub tool: String,
    pub path: ParameterPath,
    pub value: OverrideValue,
}

impl ParameterOverride {
    pub fn scalar(tool: impl Into<String>, path: ParameterPath, value: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            path,
            value: OverrideValue::Scalar(value.into()),
        }
    }

    pub fn list<S: Into<String>>(
        tool: impl Into<String>,
        path: ParameterPath,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            tool: tool.into(),
            path,
            value: OverrideValue::List(values.into_iter().map(Into::into).collect()),
        }
    }
}

impl ConfigDocument {
    /// Apply every override addressed to `tool`, in order. List overrides replace
    /// the existing entries. Returns the number of overrides that matched a parameter.
    pub fn apply_overrides<'a>(
        &mut self,
        tool: &str,
        overrides: impl IntoIterator<Item = &'a ParameterOverride>,
    ) -> Result<usize, ConfigError> {
        let mut applied = 0;
        for ov in overrides.into_iter().filter(|ov| ov.tool == tool) {
            let hit = match &ov.value {
                OverrideValue::Scalar(value) => self.set_scalar(&ov.path, value)?,
                OverrideValue::List(values) => self.set_list(&ov.path, values.as_slice(), true)?,
            };
            if hit {
                applied += 1;
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn apply_tool_overrides() {
        let text = include_str!("../test/data/small.ini");
        let mut doc = ConfigDocument::from_reader(text.as_bytes()).unwrap();
        let overrides = vec![
            ParameterOverride::scalar(
                "FeatureFinderCentroided",
                "mass_trace:min_spectra".parse().unwrap(),
                "5",
            ),
            ParameterOverride::list(
                "FeatureFinderCentroided",
                "variable_modifications".parse().unwrap(),
                ["Oxidation (M)"],
            ),
            ParameterOverride::scalar("IDMapper", ParameterPath::leaf("debug"), "9"),
            ParameterOverride::scalar(
                "FeatureFinderCentroided",
                ParameterPath::leaf("not_a_parameter"),
                "1",
            ),
        ];
        let n = doc
            .apply_overrides("FeatureFinderCentroided", &overrides)
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(
            doc.get(&"mass_trace:min_spectra".parse().unwrap()),
            Some("5")
        );
        assert_eq!(doc.get(&ParameterPath::leaf("debug")), Some("2"));
        assert_eq!(
            doc.get_list(&ParameterPath::leaf("variable_modifications"))
                .unwrap(),
            &["Oxidation (M)".to_string()]
        );
    }
}
