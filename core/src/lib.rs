//! labrig core: daemon runtime, query protocol, orchestrator ("mum"),
//! worker agents ("kid"), experiment conditions and remote nodes.

pub mod controller;
pub mod daemon;
pub mod errors;
pub mod experiment;
pub mod kid;
pub mod mum;
pub mod node;
pub mod rpc;
pub mod settings;

/// Version string `labrig --version` prints after the binary name.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
