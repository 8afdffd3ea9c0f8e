pub mod attributes;
pub mod command;
pub mod device;

pub use attributes::*;
pub use command::*;
pub use device::*;
