pub mod nonce;
pub mod propagator;
pub mod shutdown;
pub mod store;
pub mod worker;
