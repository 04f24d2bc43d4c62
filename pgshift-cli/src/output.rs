//! Terminal output formatting for all pgshift commands.
//! Uses comfy-table for tabular output and colored for
//! state-aware terminal styling.

use colored::Colorize;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, ContentArrangement, Table};

use pgshift_core::{
    DiffReport, GenerateReport, MigrateReport, MigrationState, RollbackReport, StatusReport,
    UnlockReport, ValidateReport,
};

/// Format migration status as a colored table.
pub fn print_status_table(report: &StatusReport) {
    if report.entries.is_empty() {
        println!("{}", "No migrations found.".yellow());
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Version"),
            Cell::new("Name"),
            Cell::new("State"),
            Cell::new("Applied At"),
            Cell::new("Down"),
            Cell::new("Error"),
        ]);

    for entry in &report.entries {
        let applied_at = entry
            .applied_at
            .map(|dt| {
                dt.with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .unwrap_or_default();
        let down = if entry.has_down { "yes" } else { "no" };

        table.add_row(vec![
            Cell::new(&entry.version),
            Cell::new(&entry.name),
            Cell::new(format_state(entry.state)),
            Cell::new(&applied_at),
            Cell::new(down),
            Cell::new(entry.error.as_deref().unwrap_or("")),
        ]);
    }

    println!("{table}");
    println!(
        "{} applied, {} pending, {} failed, {} missing",
        report.count(MigrationState::Applied),
        report.count(MigrationState::Pending),
        report.count(MigrationState::Failed),
        report.count(MigrationState::Missing)
    );
}

/// Return a colored string representation of a migration state.
fn format_state(state: MigrationState) -> String {
    match state {
        MigrationState::Pending => "Pending".yellow().to_string(),
        MigrationState::Applied => "Applied".green().to_string(),
        MigrationState::Failed => "Failed".red().bold().to_string(),
        MigrationState::Missing => "Missing".red().to_string(),
    }
}

pub fn print_migrate_summary(report: &MigrateReport) {
    if report.migrations_applied == 0 {
        println!(
            "{}",
            "Schema is up to date. No migration necessary.".green()
        );
        return;
    }

    let verb = if report.dry_run {
        "Would apply"
    } else {
        "Successfully applied"
    };
    println!(
        "{}",
        format!(
            "{} {} migration(s) (execution time {}ms)",
            verb, report.migrations_applied, report.total_time_ms
        )
        .green()
        .bold()
    );

    for detail in &report.details {
        println!(
            "  {} {} {} ({} statement(s), {}ms)",
            "→".green(),
            detail.version,
            detail.name,
            detail.statements,
            detail.execution_time_ms
        );
    }
}

pub fn print_rollback_summary(report: &RollbackReport) {
    if report.migrations_rolled_back == 0 {
        println!(
            "{}",
            format!("Nothing to roll back above version {}.", report.target).green()
        );
        return;
    }

    let verb = if report.dry_run {
        "Would roll back"
    } else {
        "Successfully rolled back"
    };
    println!(
        "{}",
        format!(
            "{} {} migration(s) (execution time {}ms)",
            verb, report.migrations_rolled_back, report.total_time_ms
        )
        .green()
        .bold()
    );

    for detail in &report.details {
        println!(
            "  {} {} {} ({} statement(s), {}ms)",
            "←".magenta(),
            detail.version,
            detail.name,
            detail.statements,
            detail.execution_time_ms
        );
    }
}

/// Print a validate report. Failures are reported through the error path.
pub fn print_validate_result(report: &ValidateReport) {
    if report.valid {
        println!(
            "{}",
            "Successfully validated all applied migrations."
                .green()
                .bold()
        );
    }
}

/// Print the detected differences followed by the planned SQL.
pub fn print_diff_report(report: &DiffReport) {
    if !report.has_changes {
        println!("{}", "No schema differences detected.".green().bold());
        return;
    }

    println!(
        "{}",
        format!("Schema differences ({} source):", report.source)
            .yellow()
            .bold()
    );
    println!();

    for line in report.diff.to_string().lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('+') {
            println!("  {}", line.green());
        } else if trimmed.starts_with('-') {
            println!("  {}", line.red());
        } else {
            println!("  {}", line.yellow());
        }
    }

    if report.manual_review > 0 {
        println!();
        println!(
            "{} {} statement(s) need manual review before applying.",
            "WARNING:".yellow().bold(),
            report.manual_review
        );
    }

    println!();
    println!("{}", "Up:".bold());
    println!("{}", report.up_sql.dimmed());
    println!("{}", "Down:".bold());
    println!("{}", report.down_sql.dimmed());
}

pub fn print_generate_result(report: &GenerateReport) {
    if !report.has_changes {
        println!(
            "{}",
            "No schema differences detected. Nothing written.".green()
        );
        return;
    }

    println!(
        "{}",
        format!(
            "Generated migration {} ({} up, {} down statement(s))",
            report.version.as_deref().unwrap_or(""),
            report.up_statements,
            report.down_statements
        )
        .green()
        .bold()
    );
    for path in report.up_path.iter().chain(report.down_path.iter()) {
        println!("  {} {}", "+".green(), path.display());
    }
    if report.manual_review {
        println!(
            "{} The up migration contains a conversion that needs manual review.",
            "WARNING:".yellow().bold()
        );
    }
}

pub fn print_unlock_result(report: &UnlockReport) {
    if report.holders.is_empty() {
        println!(
            "{}",
            format!("Advisory lock {} is not held.", report.lock_key).green()
        );
        return;
    }

    let pids = |list: &[i32]| {
        list.iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    if !report.terminated.is_empty() {
        println!(
            "Terminated backend(s) {} holding advisory lock {}.",
            pids(&report.terminated),
            report.lock_key
        );
    }
    if report.still_held {
        println!(
            "{} Advisory lock {} is held by backend(s) {}. A lock can only be released by its own session; \
             rerun with --terminate or call pg_terminate_backend(pid).",
            "WARNING:".yellow().bold(),
            report.lock_key,
            pids(&report.holders)
        );
    } else {
        println!(
            "{}",
            format!("Advisory lock {} is now free.", report.lock_key).green()
        );
    }
}
