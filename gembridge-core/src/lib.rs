pub mod bridge;
pub mod checkpoint;
pub mod config;
pub mod framer;
pub mod logfile;
pub mod rpc;
pub mod server;
pub mod supervisor;
pub mod tag_parser;

pub use config::{get_config_path, load_config, BridgeConfig};
pub use server::start_bridge_server;

/// Returns the bridge version from Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
