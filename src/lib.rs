pub mod actions;
pub mod handler;
pub mod macros;
pub mod negotiate;
pub mod session;
pub mod status;
pub mod wire;

mod error;

pub use error::MilterError;
