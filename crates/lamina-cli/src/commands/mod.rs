pub mod build;
pub mod check;
pub mod completions;
pub mod gc;
pub mod inspect;
pub mod unpriv_setup;

use indicatif::{ProgressBar, ProgressStyle};
use lamina_core::{CoreError, NodeState};
use std::io::IsTerminal;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_ENVIRONMENT: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, CoreError> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// A spinner on stderr, or `None` when output is JSON or not a terminal.
pub fn spinner(msg: &str, json: bool) -> Option<ProgressBar> {
    if json || !std::io::stderr().is_terminal() {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    Some(pb)
}

fn finish(pb: Option<&ProgressBar>, msg: String) {
    if let Some(pb) = pb {
        if let Ok(style) = ProgressStyle::with_template("{msg}") {
            pb.set_style(style);
        }
        pb.finish_with_message(msg);
    }
}

pub fn spin_ok(pb: Option<&ProgressBar>, msg: &str) {
    finish(pb, format!("✓ {msg}"));
}

pub fn spin_fail(pb: Option<&ProgressBar>, msg: &str) {
    finish(pb, format!("✗ {msg}"));
}

pub fn colorize_state(state: NodeState) -> String {
    use console::Style;
    let text = state.to_string();
    match state {
        NodeState::Complete => Style::new().green().apply_to(text).to_string(),
        NodeState::Building | NodeState::Ready => Style::new().cyan().bold().apply_to(text).to_string(),
        NodeState::Failed => Style::new().red().bold().apply_to(text).to_string(),
        NodeState::Cancelled => Style::new().yellow().apply_to(text).to_string(),
        NodeState::Pending => Style::new().dim().apply_to(text).to_string(),
    }
}
