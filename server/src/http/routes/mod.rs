pub mod config;
pub mod transactions;
