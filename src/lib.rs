pub mod config;
pub mod detection;
pub mod metrics;
pub mod proxy;

pub use config::*;
pub use detection::*;
pub use metrics::*;
pub use proxy::*;
