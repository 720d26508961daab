pub mod config;
pub mod error;
pub mod media_info;

#[cfg(test)]
mod config_test;

pub use config::*;
pub use error::*;
pub use media_info::*;
