pub mod account;
pub mod chain;
pub mod config;
pub mod credentials;
pub mod error;
pub mod intent;
pub mod signer;
