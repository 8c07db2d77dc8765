//! Command-line entry points.

pub mod delete;
pub mod edit;
pub mod export;
pub mod import;
pub mod list;
pub mod refine;
pub mod serve;
pub mod text;
