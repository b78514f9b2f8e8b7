pub mod chains;
pub mod config;
pub mod http;
pub mod wallets;

pub use chains::RpcChainService;
pub use config::{
    ChainConfig, LogFormat, QueueConfig, RedisConfig, RelayerServerConfig, ServerConfig,
    WalletConfig,
};
pub use http::server::{RelayerServer, RelayerServerState};
pub use wallets::ConfigWalletRegistry;
