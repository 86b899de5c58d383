//! Configuration document types shared by the experiment crates.

mod experiment;
mod types;

pub use experiment::*;
pub use types::*;
