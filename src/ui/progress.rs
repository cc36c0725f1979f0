//! Spinner shown while a build request is pending

use super::context::UiContext;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner for a bundle build with CI fallback
pub struct BuildSpinner {
    bar: Option<ProgressBar>,
}

impl BuildSpinner {
    /// Start spinning for `label` (plain line in CI)
    pub fn start(ctx: &UiContext, label: &str) -> Self {
        let bar = if ctx.use_fancy_output() {
            let bar = ProgressBar::new_spinner();
            let spinner_style = ProgressStyle::default_spinner()
                .template("  {spinner:.cyan} Building {prefix}  {msg:.dim}  {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ");
            bar.set_style(spinner_style);
            bar.set_prefix(label.to_string());
            bar.enable_steady_tick(Duration::from_millis(120));
            Some(bar)
        } else {
            eprintln!("{} Building {}", style("...").dim(), label);
            None
        };
        Self { bar }
    }

    /// Note a redirect while the build keeps running
    pub fn redirected(&self, attempt: u32) {
        let message = format!("still building, retry {}", attempt);
        match &self.bar {
            Some(bar) => bar.set_message(message),
            None => eprintln!("  {}", message),
        }
    }

    /// Finish and clear the spinner
    pub fn finish(self) {
        if let Some(bar) = self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}
