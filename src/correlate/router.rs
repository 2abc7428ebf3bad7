use log::{debug, warn};
use thiserror::Error;

use super::token::{CorrelationToken, ResultSetGuid};
use crate::identification::LookupError;

/// A handle on one open result set, as seen by a [`ResultStoreRouter`]
pub trait ResultStore {
    /// Whether the backing store is still open. Handles that are not live are
    /// evicted before they can be resolved to.
    fn is_live(&self) -> bool;

    fn result_set(&self) -> ResultSetGuid;

    /// Whether the store holds a spectrum with this store-local id
    fn contains_spectrum(&self, spectrum_id: u64) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("Spectrum {spectrum_id} is present in {matches} open result sets")]
    Ambiguity { spectrum_id: u64, matches: usize },
}

impl RouterError {
    /// The short diagnostic shown in place of a result that could not be opened
    pub fn user_message(&self) -> String {
        match self {
            Self::Lookup(LookupError::UnknownResultSet(_)) => {
                "Could not show result: its result set is no longer open".to_string()
            }
            Self::Lookup(e) => format!("Could not show result: {e}"),
            Self::Ambiguity { matches, .. } => format!(
                "Could not show result: it matches {matches} open result sets, reopen only the one you want"
            ),
        }
    }
}

/**
Routes [`CorrelationToken`]s back to the open result store they were issued by.

Stores that report they are no longer live are dropped before every
resolution. Tokens carrying a result-set GUID resolve by that GUID alone.
Legacy tokens are matched against every live store by spectrum id, and must
match exactly one.
*/
#[derive(Debug)]
pub struct ResultStoreRouter<S: ResultStore> {
    stores: Vec<S>,
}

impl<S: ResultStore> Default for ResultStoreRouter<S> {
    fn default() -> Self {
        Self { stores: Vec::new() }
    }
}

impl<S: ResultStore> ResultStoreRouter<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a store, replacing any store already registered for the same result set
    pub fn register(&mut self, store: S) {
        let guid = store.result_set();
        if let Some(slot) = self.stores.iter_mut().find(|s| s.result_set() == guid) {
            debug!("Replacing the store registered for result set {guid}");
            *slot = store;
        } else {
            self.stores.push(store);
        }
    }

    /// Drop every store that is no longer live, returning how many were removed
    pub fn evict_stale(&mut self) -> usize {
        let before = self.stores.len();
        self.stores.retain(|store| {
            let live = store.is_live();
            if !live {
                warn!("Evicting closed result set {}", store.result_set());
            }
            live
        });
        before - self.stores.len()
    }

    pub fn resolve(&mut self, token: &CorrelationToken) -> Result<&S, RouterError> {
        self.evict_stale();
        match token.result_set {
            Some(guid) => self
                .stores
                .iter()
                .find(|s| s.result_set() == guid)
                .ok_or_else(|| LookupError::UnknownResultSet(guid.to_string()).into()),
            None => {
                let mut hits = self
                    .stores
                    .iter()
                    .filter(|s| s.contains_spectrum(token.spectrum_id));
                match (hits.next(), hits.count()) {
                    (Some(store), 0) => Ok(store),
                    (Some(_), rest) => Err(RouterError::Ambiguity {
                        spectrum_id: token.spectrum_id,
                        matches: rest + 1,
                    }),
                    (None, _) => Err(LookupError::UnresolvedToken(token.to_string()).into()),
                }
            }
        }
    }

    pub fn get(&self, guid: ResultSetGuid) -> Option<&S> {
        self.stores.iter().find(|s| s.result_set() == guid)
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}
