pub mod audit;
pub mod bundle;
pub mod config;
pub mod error;
pub mod io;
pub mod machine;
pub mod paths;
pub mod publish;
pub mod remote;
pub mod secrets;
pub mod store;
pub mod types;

pub use error::{KeelError, Result};
