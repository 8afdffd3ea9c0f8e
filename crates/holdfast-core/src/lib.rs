pub mod classifier;
pub mod config;
pub mod context;
pub mod enforcer;
pub mod error;
pub mod event_bus;
pub mod loopback;
pub mod ports;
pub mod reconciler;
pub mod store;

pub use classifier::*;
pub use config::*;
pub use context::*;
pub use enforcer::*;
pub use error::*;
pub use event_bus::*;
pub use loopback::*;
pub use ports::*;
pub use reconciler::*;
pub use store::*;
