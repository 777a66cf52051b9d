//! # Zapflow Core
//! Shared types, the gateway adapter trait, errors and configuration.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::ZapflowConfig;
pub use error::{Result, ZapflowError};
pub use traits::Gateway;
pub use types::{Channel, ChannelEndpoint, ChannelFamily, ConnectionState, DeliveryOutcome};
