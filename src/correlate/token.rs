use std::fmt::Display;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

/// Separates the fields of a [`CorrelationToken`]
pub const TOKEN_SEPARATOR: char = ';';

/// Introduces the result-set GUID field of a [`CorrelationToken`]
pub const GUID_FIELD: &str = "REPORT_GUID=";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenParseError {
    #[error("Correlation token {1:?} is missing its {0} field")]
    MissingField(&'static str, String),
    #[error("Correlation token spectrum id {0:?} is not an integer")]
    InvalidSpectrumId(String),
    #[error("Correlation token result set {0:?} is not a valid GUID")]
    InvalidGuid(String),
}

/// Distinguishes result sets that are open at the same time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResultSetGuid(pub Uuid);

impl ResultSetGuid {
    /// A fresh random GUID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResultSetGuid {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ResultSetGuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ResultSetGuid {
    type Err = TokenParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| TokenParseError::InvalidGuid(s.to_string()))
    }
}

impl From<Uuid> for ResultSetGuid {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/**
The opaque string handed to the interactive layer for each correlated spectrum,
and later given back to find the result set it came from.

```text
{scope};{spectrum_id};{annotation}[;REPORT_GUID={guid}]
```

Tokens written before result sets carried a GUID lack the last field. The
annotation is the last positional field, so it may itself contain the separator.
*/
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationToken {
    pub scope: String,
    pub spectrum_id: u64,
    pub annotation: String,
    pub result_set: Option<ResultSetGuid>,
}

impl CorrelationToken {
    pub fn new(
        scope: impl Into<String>,
        spectrum_id: u64,
        annotation: impl Into<String>,
        result_set: Option<ResultSetGuid>,
    ) -> Self {
        Self {
            scope: scope.into(),
            spectrum_id,
            annotation: annotation.into(),
            result_set,
        }
    }

    /// Whether this token predates result-set GUIDs
    pub fn is_legacy(&self) -> bool {
        self.result_set.is_none()
    }
}

impl Display for CorrelationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{TOKEN_SEPARATOR}{}{TOKEN_SEPARATOR}{}",
            self.scope, self.spectrum_id, self.annotation
        )?;
        if let Some(guid) = self.result_set {
            write!(f, "{TOKEN_SEPARATOR}{GUID_FIELD}{guid}")?;
        }
        Ok(())
    }
}

impl FromStr for CorrelationToken {
    type Err = TokenParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let marker = format!("{TOKEN_SEPARATOR}{GUID_FIELD}");
        let (body, result_set) = match s.rsplit_once(marker.as_str()) {
            Some((body, guid)) => (body, Some(guid.parse()?)),
            None => (s, None),
        };
        let mut fields = body.splitn(3, TOKEN_SEPARATOR);
        let scope = fields
            .next()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| TokenParseError::MissingField("scope", s.to_string()))?;
        let spectrum_id = fields
            .next()
            .ok_or_else(|| TokenParseError::MissingField("spectrum id", s.to_string()))?;
        let spectrum_id = spectrum_id
            .parse()
            .map_err(|_| TokenParseError::InvalidSpectrumId(spectrum_id.to_string()))?;
        let annotation = fields
            .next()
            .ok_or_else(|| TokenParseError::MissingField("annotation", s.to_string()))?;
        Ok(Self {
            scope: scope.to_string(),
            spectrum_id,
            annotation: annotation.to_string(),
            result_set,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_tokens() {
        let guid: ResultSetGuid = "67e55044-10b1-426f-9247-bb680e5fe0c8".parse().unwrap();
        let token = CorrelationToken::new("Spectra_3", 1204, "b2+;y3+", Some(guid));
        let text = token.to_string();
        assert_eq!(
            text,
            "Spectra_3;1204;b2+;y3+;REPORT_GUID=67e55044-10b1-426f-9247-bb680e5fe0c8"
        );
        assert_eq!(text.parse::<CorrelationToken>().unwrap(), token);

        let legacy: CorrelationToken = "Spectra_3;1204;PEPTIDE".parse().unwrap();
        assert!(legacy.is_legacy());
        assert_eq!(legacy.spectrum_id, 1204);
        assert_eq!(legacy.annotation, "PEPTIDE");

        let empty_annotation: CorrelationToken = "S;5;".parse().unwrap();
        assert_eq!(empty_annotation.annotation, "");
    }

    #[test]
    fn malformed_tokens() {
        assert!(matches!(
            "Spectra_3;x;PEPTIDE".parse::<CorrelationToken>(),
            Err(TokenParseError::InvalidSpectrumId(_))
        ));
        assert!(matches!(
            "Spectra_3;12".parse::<CorrelationToken>(),
            Err(TokenParseError::MissingField("annotation", _))
        ));
        assert!(matches!(
            "S;1;A;REPORT_GUID=nope".parse::<CorrelationToken>(),
            Err(TokenParseError::InvalidGuid(_))
        ));
        assert!(matches!(
            "".parse::<CorrelationToken>(),
            Err(TokenParseError::MissingField("scope", _))
        ));
    }
}
