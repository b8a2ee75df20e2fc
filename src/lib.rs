pub mod attach;
pub mod bus;
pub mod config;
pub mod error;
pub mod frame;
pub mod issuer;
pub mod loader;
pub mod packer;
pub mod router;
pub mod strip;
pub mod transport;

pub use error::{LuattError, Result};
pub use frame::Frame;
pub use router::{Router, Token};
