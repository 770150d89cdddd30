//! Conduit core: the exchange model shared by every mediation primitive.

pub mod error;
pub mod exchange;
pub mod hash;
pub mod types;

pub use error::ExchangeError;
pub use exchange::{properties, Exchange, ExchangePattern, Message};
pub use types::Value;
