//! Progress output for provisioning runs.
//!
//! Provides consistent formatting for console output while a server is
//! being built.

use std::io::Write;

use colored::Colorize;

/// Receives progress from a provisioning run.
///
/// Methods return nothing, so a sink can observe a run but never steer it.
pub trait ProgressSink: Send + Sync {
    /// A stage is starting.
    fn status(&self, message: &str);

    /// Informational line.
    fn info(&self, message: &str);

    /// One progress marker while waiting.
    fn tick(&self);

    /// A labelled value, such as an address.
    fn field(&self, label: &str, value: &str);

    /// Completion of a wait.
    fn done(&self);

    /// Something went wrong but the run may continue or has left state behind.
    fn warn(&self, message: &str);

    /// Something failed.
    fn error(&self, message: &str);
}

/// Colored console sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalSink;

impl ProgressSink for TerminalSink {
    fn status(&self, message: &str) {
        println!("\n{}", message.magenta());
    }

    fn info(&self, message: &str) {
        println!("{message}");
    }

    fn tick(&self) {
        print!(".");
        let _ = std::io::stdout().flush();
    }

    fn field(&self, label: &str, value: &str) {
        println!("{}: {value}", label.cyan());
    }

    fn done(&self) {
        println!("{}", "done".green());
    }

    fn warn(&self, message: &str) {
        eprintln!("{} {}", "WARNING:".yellow().bold(), message.yellow());
    }

    fn error(&self, message: &str) {
        eprintln!("{} {}", "ERROR:".red().bold(), message.red());
    }
}
