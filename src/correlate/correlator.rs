use indexmap::IndexMap;
use log::{debug, trace};

use super::key::CorrelationKey;
use super::token::{CorrelationToken, ResultSetGuid};
use crate::identification::IdentificationRecord;
use crate::store::{SpectrumDescriptor, SpectrumStore};

/// An identification joined to the spectrum it was made from
#[derive(Debug, Clone, PartialEq)]
pub struct Correlation {
    pub record: IdentificationRecord,
    pub spectrum: SpectrumDescriptor,
    pub token: CorrelationToken,
}

/**
Joins [`IdentificationRecord`]s to [`SpectrumDescriptor`]s by [`CorrelationKey`].

The join is deliberately fuzzy: when several records share a key the last one
indexed is the one every matching spectrum is associated with.
*/
#[derive(Debug, Default, Clone)]
pub struct SpectrumCorrelator {
    /// Names the store the correlated spectra live in, the first field of every token
    pub scope: String,
    pub result_set: Option<ResultSetGuid>,
    index: IndexMap<CorrelationKey, IdentificationRecord>,
}

impl SpectrumCorrelator {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Default::default()
        }
    }

    /// Stamp every token produced with `result_set`
    pub fn with_result_set(mut self, result_set: ResultSetGuid) -> Self {
        self.result_set = Some(result_set);
        self
    }

    /// Replace the index with `records`, returning the number of distinct keys
    pub fn build_index<I: IntoIterator<Item = IdentificationRecord>>(&mut self, records: I) -> usize {
        self.index.clear();
        for record in records {
            let key = CorrelationKey::from(&record);
            if let Some(prev) = self.index.insert(key, record) {
                trace!("Record {} was displaced by a later record with the same key", prev.id);
            }
        }
        debug!("Indexed {} correlation keys", self.index.len());
        self.index.len()
    }

    pub fn get(&self, key: &CorrelationKey) -> Option<&IdentificationRecord> {
        self.index.get(key)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn correlate_one(&self, spectrum: &SpectrumDescriptor) -> Option<Correlation> {
        let record = self.index.get(&CorrelationKey::from(spectrum))?;
        let token = CorrelationToken::new(
            self.scope.clone(),
            spectrum.spectrum_id,
            record.annotation(),
            self.result_set,
        );
        Some(Correlation {
            record: record.clone(),
            spectrum: spectrum.clone(),
            token,
        })
    }

    /// Associate each spectrum with the indexed record sharing its key.
    /// Spectra without a match are left out.
    pub fn correlate<'a, I: IntoIterator<Item = &'a SpectrumDescriptor>>(
        &self,
        spectra: I,
    ) -> Vec<Correlation> {
        let correlations: Vec<_> = spectra
            .into_iter()
            .filter_map(|spectrum| self.correlate_one(spectrum))
            .collect();
        debug!("Correlated {} spectra in {}", correlations.len(), self.scope);
        correlations
    }

    /// Correlate every spectrum `store` holds for `workflow_id`
    pub fn correlate_store<S: SpectrumStore + ?Sized>(
        &self,
        store: &S,
        workflow_id: u32,
    ) -> Vec<Correlation> {
        self.correlate(store.spectra(workflow_id).iter())
    }
}
