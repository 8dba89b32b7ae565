//! CLI command implementations

pub mod context;
pub mod event;
pub mod run;
pub mod status;
pub mod style;
