//! Terminal styling helpers
//!
//! Colors are dropped automatically by `anstream` when stdout is not a
//! terminal.

use mergebot::types::{PrState, StagingState};
use owo_colors::{OwoColorize, Style};
use std::fmt::Display;

/// Check mark for successful steps
pub const CHECK: &str = "✓";
/// Cross for failed steps
pub const CROSS: &str = "✗";

/// Semantic styles for CLI output
pub trait Stylize: Display {
    /// Secondary information
    fn muted(&self) -> String {
        Style::new().dimmed().style(self).to_string()
    }

    /// Names the user should notice
    fn emphasis(&self) -> String {
        Style::new().bold().cyan().style(self).to_string()
    }

    /// Section headings
    fn heading(&self) -> String {
        Style::new().bold().style(self).to_string()
    }
}

impl<T: Display + ?Sized> Stylize for T {}

/// Green check mark
pub fn check() -> String {
    CHECK.green().to_string()
}

/// Red cross
pub fn cross() -> String {
    CROSS.red().to_string()
}

/// PR state, colored by how close it is to merging
pub fn pr_state(state: PrState) -> String {
    let text = state.to_string();
    match state {
        PrState::Ready => text.green().to_string(),
        PrState::Merged => text.magenta().to_string(),
        PrState::Error => text.red().to_string(),
        PrState::Closed => text.dimmed().to_string(),
        PrState::Approved | PrState::Validated => text.yellow().to_string(),
        PrState::Opened => text,
    }
}

/// Staging state, colored by outcome
pub fn staging_state(state: StagingState) -> String {
    let text = state.to_string();
    match state {
        StagingState::Success => text.green().to_string(),
        StagingState::Pending => text.yellow().to_string(),
        _ => text.red().to_string(),
    }
}
