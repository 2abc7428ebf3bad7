use std::fmt::Display;

use crate::identification::IdentificationRecord;
use crate::store::SpectrumDescriptor;

/**
An approximate join key between identifications and spectra.

Both coordinates are rounded by formatting them to a fixed number of decimals,
one for the retention time in minutes and four for the m/z, so values that differ
below that precision produce the same key:

```
use mztopp::correlate::CorrelationKey;
assert_eq!(CorrelationKey::new(12.34, 500.1234), CorrelationKey::new(12.341, 500.12341));
```
*/
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey {
    retention_time: String,
    mass_over_charge: String,
}

impl CorrelationKey {
    pub fn new(retention_time: f64, mass_over_charge: f64) -> Self {
        Self {
            retention_time: format!("{retention_time:.1}"),
            mass_over_charge: format!("{mass_over_charge:.4}"),
        }
    }

    pub fn retention_time(&self) -> &str {
        &self.retention_time
    }

    pub fn mass_over_charge(&self) -> &str {
        &self.mass_over_charge
    }
}

impl Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.mass_over_charge, self.retention_time)
    }
}

impl From<&IdentificationRecord> for CorrelationKey {
    fn from(value: &IdentificationRecord) -> Self {
        Self::new(value.retention_time, value.mass_over_charge)
    }
}

impl From<&SpectrumDescriptor> for CorrelationKey {
    fn from(value: &SpectrumDescriptor) -> Self {
        Self::new(value.retention_time, value.mass_over_charge)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rounding() {
        let key = CorrelationKey::new(12.34, 500.1234);
        assert_eq!(key, CorrelationKey::new(12.341, 500.12341));
        assert_eq!(key.retention_time(), "12.3");
        assert_eq!(key.mass_over_charge(), "500.1234");
        assert_ne!(key, CorrelationKey::new(12.4, 500.1234));
        assert_ne!(key, CorrelationKey::new(12.34, 500.1236));
        assert_eq!(key.to_string(), "500.1234@12.3");
    }
}
