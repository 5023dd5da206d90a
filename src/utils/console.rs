// src/utils/console.rs

//! Operator-facing console output with server-style formatting.
//!
//! Diagnostics go through the `log` facade; this module only prints the
//! headers and summaries a person reads at the end of a CLI command.

use chrono::Local;

/// Prefix a line with a local timestamp.
fn format_line(message: &str) -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    format!("[{}] {}", timestamp, message)
}

/// Print a header
pub fn header(title: &str) {
    let border = "═".repeat(60);
    println!("{}", format_line(&border));
    println!("{}", format_line(&format!("  {}", title)));
    println!("{}", format_line(&border));
}

/// Print a step in a process
pub fn step(step_num: usize, total: usize, message: &str) {
    println!("{}", format_line(&format!("[STEP {}/{}] {}", step_num, total, message)));
}

/// Print a sub-item (indented)
pub fn sub_item(message: &str) {
    println!("{}", format_line(&format!("    {}", message)));
}

/// Print a summary section
pub fn summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("{}", format_line(&format!("[SUMMARY] {}", title)));
    for line in summary_lines(items) {
        println!("{}", format_line(&line));
    }
}

fn summary_lines(items: &[(&str, String)]) -> Vec<String> {
    items
        .iter()
        .map(|(key, value)| format!("    {}: {}", key, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_lines_are_indented() {
        let lines = summary_lines(&[("dispatched", "3".to_string()), ("errors", "0".to_string())]);
        assert_eq!(lines, vec!["    dispatched: 3", "    errors: 0"]);
    }

    #[test]
    fn test_format_line_has_timestamp() {
        let line = format_line("hello");
        assert!(line.starts_with('['));
        assert!(line.ends_with("] hello"));
    }
}
