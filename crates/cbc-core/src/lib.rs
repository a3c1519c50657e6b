pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod http;
pub mod io;
pub mod locator;
pub mod paths;
pub mod sigv4;
pub mod store;
pub mod tasks;
pub mod workflow;

pub use error::{CbcError, ErrorKind, Result};
