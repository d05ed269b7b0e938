//! Command implementations.

pub mod modes;
pub mod run;
