//! Firestore REST backend.

pub mod client;
pub mod metrics;
pub mod repos;
pub mod retry;
pub mod token_cache;
pub mod types;

pub use client::{FirestoreClient, FirestoreConfig};
pub use repos::FirestoreStore;
pub use retry::RetryConfig;
pub use token_cache::TokenSource;
