pub mod check;
pub mod clock;
pub mod compress;
pub mod config;
pub mod content;
pub mod index;
pub mod logging;
pub mod platform;
pub mod repo;
pub mod upgrade;

#[cfg(test)]
pub mod testutil;

#[cfg(test)]
mod tests;

pub use cairn_types::error::{CairnError, Result};
