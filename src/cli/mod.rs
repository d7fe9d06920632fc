//! CLI command implementations.

pub mod call;
pub mod echo;
pub mod serve;
