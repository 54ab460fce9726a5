//! GAP (Generic Access Profile) layer
//!
//! Addressing, client identities and the connection intent registry that
//! decides which remote devices the controller should be connecting to.

pub mod constants;
pub mod intents;
pub mod types;

#[cfg(test)]
mod tests;

pub use constants::*;
pub use intents::IntentKey;
pub use types::*;
