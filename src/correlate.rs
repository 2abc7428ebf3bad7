//! Joining identifications back to their spectra, and finding the open result
//! set a correlated spectrum belongs to.
mod correlator;
mod key;
mod router;
mod token;

pub use correlator::{Correlation, SpectrumCorrelator};
pub use key::CorrelationKey;
pub use router::{ResultStore, ResultStoreRouter, RouterError};
pub use token::{CorrelationToken, ResultSetGuid, TokenParseError, GUID_FIELD, TOKEN_SEPARATOR};
