//! `adw doctor`: preflight checks before the first run.

use adw::config::AdwConfig;
use adw::doctor::{CheckStatus, Doctor};
use adw::errors::{EXIT_COMPLETED, EXIT_FATAL};
use anyhow::Result;
use console::style;

use super::print_json;

pub fn cmd_doctor(config: &AdwConfig, checks: &[String], strict: bool, json: bool) -> Result<i32> {
    let report = Doctor::new(config).run(checks, strict)?;
    let code = if report.ok { EXIT_COMPLETED } else { EXIT_FATAL };

    if json {
        print_json(&report)?;
        return Ok(code);
    }

    println!();
    for check in &report.checks {
        let status = match check.status {
            CheckStatus::Pass => style("pass").green(),
            CheckStatus::Warn => style("warn").yellow(),
            CheckStatus::Fail => style("FAIL").red().bold(),
        };
        println!("  {}  {:<14} {}", status, check.name, check.details);
    }
    println!();
    if report.ok {
        println!("{}", style("Ready to run.").green().bold());
    } else {
        println!("{}", style("Fix the failing checks before running.").red().bold());
    }
    println!();
    Ok(code)
}
