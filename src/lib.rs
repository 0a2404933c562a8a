// Toolkit credentials - connection lifecycle and token management

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod notifier;
pub mod registry;
pub mod storage;

pub use connection::{Connection, ConnectionId, ConnectionKind, FeatureId};
pub use error::{AuthError, Result};
pub use manager::{AuthContext, AuthSettings, ConnectionSettings, FeatureCredentialManager};
