//! Best-effort run notifications
//!
//! A [`Notifier`] may fail; the runner logs the failure and carries on. A
//! notification is never the reason an experiment stops.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{bail, Context};

use crate::config::NotifySettings;

/// Sink for `(subject, body)` notifications.
pub trait Notifier {
    /// Deliver one notification.
    ///
    /// # Errors
    ///
    /// Any delivery failure. Callers treat it as a warning.
    fn notify(&self, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _subject: &str, _body: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        tracing::info!(target: "prunelab::notify", body, "{subject}");
        Ok(())
    }
}

/// Pipes notifications to an external program, e.g. `["mail", "-s"]`.
///
/// The subject is appended as the last argument and the body written to stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandNotifier {
    command: Vec<String>,
}

impl CommandNotifier {
    /// Create a notifier running `command`.
    #[must_use]
    pub const fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .context("empty notification command")?;
        let mut child = Command::new(program)
            .args(args)
            .arg(subject)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn `{program}`"))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(body.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            bail!(
                "`{program}` exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Build the notifier described by `settings`: a command when one is configured,
/// otherwise a no-op.
#[must_use]
pub fn from_settings(settings: &NotifySettings) -> Box<dyn Notifier> {
    if settings.command.is_empty() {
        Box::new(NoopNotifier)
    } else {
        Box::new(CommandNotifier::new(settings.command.clone()))
    }
}
