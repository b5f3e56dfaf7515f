// Core modules
pub mod config;
pub mod container;
pub mod criu;
pub mod error;
pub mod images;
pub mod logging;
pub mod restore;
pub mod signals;
pub mod terminal;

pub use error::{Error, ErrorKind, Result};
