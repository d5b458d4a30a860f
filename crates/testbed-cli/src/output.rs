//! Formatted output helpers for CLI commands.

use std::time::Duration;

/// Bold text.
pub const BOLD: &str = "\x1b[1m";
/// Dimmed text.
pub const DIM: &str = "\x1b[2m";
/// Success.
pub const GREEN: &str = "\x1b[32m";
/// Links and arrows.
pub const CYAN: &str = "\x1b[36m";
/// Warnings.
pub const YELLOW: &str = "\x1b[33m";
/// Back to the terminal default.
pub const RESET: &str = "\x1b[0m";

/// Formats a duration as seconds with one decimal (e.g., "12.3s").
#[must_use]
pub fn format_secs(elapsed: Duration) -> String {
    format!("{:.1}s", elapsed.as_secs_f64())
}

/// "1 container", "3 containers".
#[must_use]
pub fn count_noun(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{count} {noun}")
    } else {
        format!("{count} {noun}s")
    }
}
