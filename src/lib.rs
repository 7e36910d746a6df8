pub mod cli;
pub mod engine;
pub mod filter;
pub mod logging;
pub mod message;
pub mod proxy;
pub mod settings;
pub mod util;

pub use proxy::Proxy;

/// Product token used for `Via`, `Server`, and synthesized responses.
pub const AGENT: &str = concat!("weir/", env!("CARGO_PKG_VERSION"));
