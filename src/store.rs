//! The persistence collaborators results are handed to once parsed and
//! correlated, and an in-memory implementation of them.
use indexmap::IndexMap;
use log::debug;
use thiserror::Error;

use crate::correlate::{Correlation, ResultSetGuid, ResultStore};
use crate::identification::{FieldValue, IdentificationRecord, Row};

/// The entity identification records are stored under
pub const IDENTIFICATION_ENTITY: &str = "identification";
/// The entity spectra are stored under
pub const SPECTRUM_ENTITY: &str = "spectrum";
/// The column the correlation token of a record is written to
pub const TOKEN_COLUMN: &str = "correlation_token";

/// Where a spectrum was acquired, as known to the spectrum store
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpectrumDescriptor {
    pub workflow_id: u32,
    pub spectrum_id: u64,
    /// In minutes
    pub retention_time: f64,
    pub mass_over_charge: f64,
    pub charge: i32,
}

/// Read access to spectra by workflow
pub trait SpectrumStore {
    fn spectrum(&self, workflow_id: u32, spectrum_id: u64) -> Option<SpectrumDescriptor>;

    fn spectra(&self, workflow_id: u32) -> Vec<SpectrumDescriptor>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Entity {0} has not been registered")]
    UnknownEntity(String),
    #[error("Entity {0} has no column {1}")]
    UnknownColumn(String, String),
    #[error("The store has been closed")]
    Closed,
}

/// Write access to a table-like entity store
pub trait EntityStore {
    /// Declare an entity and its columns. Registering an existing entity again
    /// adds any new columns to it.
    fn register_entity(&mut self, entity: &str, columns: &[&'static str]) -> Result<(), StoreError>;

    fn insert_items(&mut self, entity: &str, rows: Vec<Row>) -> Result<usize, StoreError>;

    /// Link items of `from_entity` to items of `to_entity` by their `id` columns
    fn connect_items(
        &mut self,
        from_entity: &str,
        to_entity: &str,
        links: &[(u64, u64)],
    ) -> Result<usize, StoreError>;

    /// Merge each row into the stored rows whose `key_column` holds the same value
    fn update_items_by_key(
        &mut self,
        entity: &str,
        key_column: &'static str,
        rows: Vec<Row>,
    ) -> Result<usize, StoreError>;
}

#[derive(Debug, Default, Clone)]
struct Entity {
    columns: Vec<&'static str>,
    rows: Vec<Row>,
}

impl Entity {
    fn check_columns(&self, entity: &str, row: &Row) -> Result<(), StoreError> {
        match row.keys().find(|k| !self.columns.contains(*k)) {
            Some(k) => Err(StoreError::UnknownColumn(entity.to_string(), k.to_string())),
            None => Ok(()),
        }
    }
}

/// Keeps everything in memory. Doubles as a [`ResultStore`] that stays live
/// until [`MemoryStore::close`] is called.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    result_set: ResultSetGuid,
    open: bool,
    spectra: IndexMap<(u32, u64), SpectrumDescriptor>,
    entities: IndexMap<String, Entity>,
    links: IndexMap<(String, String), Vec<(u64, u64)>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(ResultSetGuid::new())
    }
}

impl MemoryStore {
    pub fn new(result_set: ResultSetGuid) -> Self {
        Self {
            result_set,
            open: true,
            spectra: IndexMap::new(),
            entities: IndexMap::new(),
            links: IndexMap::new(),
        }
    }

    pub fn add_spectrum(&mut self, spectrum: SpectrumDescriptor) {
        self.spectra
            .insert((spectrum.workflow_id, spectrum.spectrum_id), spectrum);
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    pub fn rows(&self, entity: &str) -> Option<&[Row]> {
        self.entities.get(entity).map(|e| e.rows.as_slice())
    }

    pub fn links(&self, from_entity: &str, to_entity: &str) -> &[(u64, u64)] {
        self.links
            .get(&(from_entity.to_string(), to_entity.to_string()))
            .map(|l| l.as_slice())
            .unwrap_or_default()
    }

    fn entity_mut(&mut self, entity: &str) -> Result<&mut Entity, StoreError> {
        if !self.open {
            return Err(StoreError::Closed);
        }
        self.entities
            .get_mut(entity)
            .ok_or_else(|| StoreError::UnknownEntity(entity.to_string()))
    }
}

impl SpectrumStore for MemoryStore {
    fn spectrum(&self, workflow_id: u32, spectrum_id: u64) -> Option<SpectrumDescriptor> {
        self.spectra.get(&(workflow_id, spectrum_id)).cloned()
    }

    fn spectra(&self, workflow_id: u32) -> Vec<SpectrumDescriptor> {
        self.spectra
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect()
    }
}

impl EntityStore for MemoryStore {
    fn register_entity(&mut self, entity: &str, columns: &[&'static str]) -> Result<(), StoreError> {
        if !self.open {
            return Err(StoreError::Closed);
        }
        let slot = self.entities.entry(entity.to_string()).or_default();
        for column in columns {
            if !slot.columns.contains(column) {
                slot.columns.push(*column);
            }
        }
        Ok(())
    }

    fn insert_items(&mut self, entity: &str, rows: Vec<Row>) -> Result<usize, StoreError> {
        let slot = self.entity_mut(entity)?;
        for row in rows.iter() {
            slot.check_columns(entity, row)?;
        }
        let n = rows.len();
        slot.rows.extend(rows);
        Ok(n)
    }

    fn connect_items(
        &mut self,
        from_entity: &str,
        to_entity: &str,
        links: &[(u64, u64)],
    ) -> Result<usize, StoreError> {
        if !self.open {
            return Err(StoreError::Closed);
        }
        for name in [from_entity, to_entity] {
            if !self.entities.contains_key(name) {
                return Err(StoreError::UnknownEntity(name.to_string()));
            }
        }
        self.links
            .entry((from_entity.to_string(), to_entity.to_string()))
            .or_default()
            .extend_from_slice(links);
        Ok(links.len())
    }

    fn update_items_by_key(
        &mut self,
        entity: &str,
        key_column: &'static str,
        rows: Vec<Row>,
    ) -> Result<usize, StoreError> {
        let slot = self.entity_mut(entity)?;
        let mut updated = 0;
        for row in rows {
            slot.check_columns(entity, &row)?;
            let Some(key) = row.get(key_column) else {
                continue;
            };
            for stored in slot.rows.iter_mut().filter(|r| r.get(key_column) == Some(key)) {
                for (column, value) in row.iter() {
                    stored.insert(*column, value.clone());
                }
                updated += 1;
            }
        }
        Ok(updated)
    }
}

impl ResultStore for MemoryStore {
    fn is_live(&self) -> bool {
        self.open
    }

    fn result_set(&self) -> ResultSetGuid {
        self.result_set
    }

    fn contains_spectrum(&self, spectrum_id: u64) -> bool {
        self.spectra.keys().any(|(_, id)| *id == spectrum_id)
    }
}

/// What [`ingest`] wrote
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub inserted: usize,
    pub connected: usize,
    pub annotated: usize,
}

/// Persist `records`, link the correlated ones to their spectra and record the
/// correlation token on each of them.
pub fn ingest<S: EntityStore + ?Sized>(
    store: &mut S,
    records: &[IdentificationRecord],
    correlations: &[Correlation],
) -> Result<IngestSummary, StoreError> {
    let mut columns: Vec<&'static str> = IdentificationRecord::default().to_row().keys().copied().collect();
    columns.push(TOKEN_COLUMN);
    store.register_entity(IDENTIFICATION_ENTITY, &columns)?;
    store.register_entity(SPECTRUM_ENTITY, &[])?;

    let inserted = store.insert_items(
        IDENTIFICATION_ENTITY,
        records.iter().map(|r| r.to_row()).collect(),
    )?;

    let links: Vec<(u64, u64)> = correlations
        .iter()
        .map(|c| (c.record.id, c.spectrum.spectrum_id))
        .collect();
    let connected = store.connect_items(IDENTIFICATION_ENTITY, SPECTRUM_ENTITY, &links)?;

    let updates = correlations
        .iter()
        .map(|c| {
            let mut row = Row::new();
            row.insert("id", FieldValue::Integer(c.record.id as i64));
            row.insert(TOKEN_COLUMN, FieldValue::Text(c.token.to_string()));
            row
        })
        .collect();
    let annotated = store.update_items_by_key(IDENTIFICATION_ENTITY, "id", updates)?;

    debug!("Ingested {inserted} records, {connected} linked to spectra");
    Ok(IngestSummary {
        inserted,
        connected,
        annotated,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::correlate::SpectrumCorrelator;

    #[test_log::test]
    fn ingest_correlated_records() {
        let mut store = MemoryStore::default();
        store.add_spectrum(SpectrumDescriptor {
            workflow_id: 1,
            spectrum_id: 40,
            retention_time: 10.0,
            mass_over_charge: 582.319,
            charge: 2,
        });

        let mut a = IdentificationRecord::new(1, 1);
        a.retention_time = 10.0;
        a.mass_over_charge = 582.319;
        a.sequence = "LVNELTEFAK".into();
        let mut b = IdentificationRecord::new(1, 2);
        b.retention_time = 30.0;
        b.mass_over_charge = 417.7;
        let records = vec![a, b];

        let mut correlator = SpectrumCorrelator::new("Spectra_1").with_result_set(store.result_set());
        correlator.build_index(records.iter().cloned());
        let correlations = correlator.correlate_store(&store, 1);
        assert_eq!(correlations.len(), 1);

        let summary = ingest(&mut store, &records, &correlations).unwrap();
        assert_eq!(
            summary,
            IngestSummary {
                inserted: 2,
                connected: 1,
                annotated: 1
            }
        );
        assert_eq!(store.links(IDENTIFICATION_ENTITY, SPECTRUM_ENTITY), &[(1, 40)]);
        let rows = store.rows(IDENTIFICATION_ENTITY).unwrap();
        assert_eq!(
            rows[0][TOKEN_COLUMN],
            FieldValue::Text(correlations[0].token.to_string())
        );
        assert!(!rows[1].contains_key(TOKEN_COLUMN));
    }

    #[test]
    fn closed_store_rejects_writes() {
        let mut store = MemoryStore::default();
        store.register_entity("x", &["id"]).unwrap();
        let mut row = Row::new();
        row.insert("nope", FieldValue::Missing);
        assert_eq!(
            store.insert_items("x", vec![row]),
            Err(StoreError::UnknownColumn("x".into(), "nope".into()))
        );
        assert_eq!(
            store.insert_items("y", vec![]),
            Err(StoreError::UnknownEntity("y".into()))
        );
        store.close();
        assert!(!store.is_live());
        assert_eq!(store.insert_items("x", vec![]), Err(StoreError::Closed));
    }
}
