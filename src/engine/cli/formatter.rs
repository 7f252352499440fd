//! CLI Output Formatting Module
//! Colorized terminal output for release listings and command results

use colored::Colorize;

use crate::engine::audit::AuditEntry;
use crate::engine::release::Release;

/// Column titles and widths of the release table
const RELEASE_COLUMNS: &[(&str, usize)] = &[
    ("VERSION", 12),
    ("STATE", 9),
    ("ROLLOUT", 8),
    ("BINARY", 12),
    ("SIZE", 11),
    ("CHK/DL/OK/FAIL", 0),
];

pub struct CliFormatter;

impl CliFormatter {
    pub fn success(message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }

    /// Errors go to stderr so `--format json` output stays parseable
    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    pub fn warning(message: &str) {
        eprintln!("{} {}", "!".yellow().bold(), message);
    }

    pub fn info(message: &str) {
        println!("{} {}", "·".blue().bold(), message);
    }

    pub fn header(title: &str) {
        println!("\n{}", title.bright_cyan().bold());
        println!("{}", "─".repeat(title.chars().count()).bright_black());
    }

    /// Key-value line with keys aligned to a fixed width
    pub fn kv(key: &str, value: &str) {
        println!("  {:<12} {}", format!("{}:", key).bold(), value);
    }

    pub fn item(text: &str) {
        println!("  {} {}", "-".bright_black(), text);
    }

    fn padded(cells: &[(String, usize)]) -> String {
        cells
            .iter()
            .map(|(text, width)| format!("{:<width$}", text, width = *width))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn release_table_header() {
        let cells: Vec<(String, usize)> = RELEASE_COLUMNS
            .iter()
            .map(|(title, width)| (title.to_string(), *width))
            .collect();
        println!("  {}", Self::padded(&cells).bold());
    }

    /// One release, aligned under [`CliFormatter::release_table_header`]
    pub fn release_row(release: &Release) {
        let cells = [
            release.version.clone(),
            if release.disabled { "disabled" } else { "active" }.to_string(),
            format!("{}%", release.rollout_percent),
            release.target_binary_range.clone(),
            format_size(release.size_bytes),
            format!(
                "{}/{}/{}/{}",
                release.stats.checks,
                release.stats.downloads,
                release.stats.installs,
                release.stats.failures
            ),
        ];
        let row: Vec<(String, usize)> = cells
            .into_iter()
            .zip(RELEASE_COLUMNS.iter().map(|(_, width)| *width))
            .collect();
        let line = Self::padded(&row);
        if release.disabled {
            println!("  {}", line.bright_black());
        } else {
            println!("  {}", line);
        }
    }

    pub fn audit_row(entry: &AuditEntry) {
        println!(
            "  {} {:<8} {:<10} {} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().bright_black(),
            entry.action.to_string().bold(),
            entry.release_version,
            entry.scope,
            entry.actor.as_deref().unwrap_or("-").bright_black()
        );
    }

    pub fn blank() {
        println!();
    }
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS[unit_idx])
    }
}
