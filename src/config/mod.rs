pub mod settings;

pub use settings::{
    load_bidder_config, load_server_config, ConfigError, FanoutBackend, LedgerBackend,
    ServerConfig,
};
