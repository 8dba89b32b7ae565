//! mergebot - batching, staging and CI-gated merge bot for GitHub
//!
//! Approved pull requests are grouped into batches, applied on top of their
//! target branch in a local mirror, and pushed to a `staging.<branch>` branch
//! for CI. When every required status on the staging heads succeeds, the
//! target branches are fast-forwarded to them, all repositories or none.
//! Failed stagings of several batches are bisected to find the culprit.
//!
//! The engine reaches GitHub through [`remote::RemoteClient`] and persists
//! state through [`store::Store`], both injected into [`engine::Engine`].

pub mod auth;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod feedback;
pub mod git;
pub mod message;
pub mod remote;
pub mod selector;
pub mod staging;
pub mod store;
pub mod types;
pub mod validator;

pub use engine::{Engine, TickReport};
pub use error::{Error, Result};
