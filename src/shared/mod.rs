// Shared infrastructure - configuration and the error taxonomy

pub mod config;
pub mod error;

pub use error::{MessengerError, Result};
