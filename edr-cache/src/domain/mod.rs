//! Domain types for the EDR cache.

pub mod edr;
pub mod entry;
pub mod state;
pub mod token;

pub use edr::{DataAddress, EndpointDataReference};
pub use entry::{EdrEntry, EdrFilter};
pub use state::EdrState;
pub use token::{TokenClaims, TokenParseError, parse_claims};
