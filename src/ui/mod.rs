//! Terminal output for the CLI
//!
//! Status lines and spinners go to stderr so that stdout can carry a
//! compiled bundle. Fancy output falls back to plain prefixed lines when
//! stderr is not a terminal or a CI environment is detected.

mod context;
mod output;
mod progress;

pub use context::UiContext;
pub use output::{key_value, step_ok, step_ok_detail, step_warn, step_warn_hint};
pub use progress::BuildSpinner;
