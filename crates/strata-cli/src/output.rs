//! Human and JSON rendering of operation results.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use console::{style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use strata_engine::{Controller, OperationState, Report};

pub struct Output {
    json: bool,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    /// Spinner advanced once per unit of work. Hidden for JSON output or
    /// when stderr is not a terminal.
    pub fn track(&self, controller: &Controller, verb: &'static str) -> ProgressBar {
        let pb = if self.json || !Term::stderr().is_term() {
            ProgressBar::hidden()
        } else {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
                    .template("{spinner:.cyan} {prefix} {pos} {wide_msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(Duration::from_millis(80));
            pb
        };
        pb.set_prefix(verb);

        let observed = pb.clone();
        controller.set_unit_observer(move |path: &Path| {
            observed.inc(1);
            observed.set_message(path.display().to_string());
        });
        pb
    }

    pub fn json<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    /// Print warnings and errors, then fail if the run had errors.
    pub fn finish(&self, operation: &str, report: &Report) -> Result<()> {
        if !self.json {
            for warning in &report.warnings {
                eprintln!("  {} {}", style("warning:").yellow().bold(), warning);
            }
            for error in &report.errors {
                eprintln!("  {} {}", style("error:").red().bold(), error);
            }
            let state = match report.state {
                OperationState::Completed => style(report.state.to_string()).green(),
                OperationState::Stopped => style(report.state.to_string()).yellow(),
                _ => style(report.state.to_string()).red(),
            };
            println!("  {operation} {state} in {:.1}s", report.duration.as_secs_f64());
        }
        if !report.errors.is_empty() {
            bail!("{operation} finished with {} error(s)", report.errors.len());
        }
        Ok(())
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.50 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GiB");
    }
}
