use crate::Result;
use tracing::info;

/// Fire-and-forget, user-visible messages.
///
/// The engine logs and discards errors returned by a sink.
pub trait Notifier: Send + Sync {
    fn toast(&self, title: &str, message: &str) -> Result<()>;
}

/// Sink that only writes toasts to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn toast(&self, title: &str, message: &str) -> Result<()> {
        info!(target: "toast", "{}: {}", title, message);
        Ok(())
    }
}

impl<F> Notifier for F
where
    F: Fn(&str, &str) -> Result<()> + Send + Sync,
{
    fn toast(&self, title: &str, message: &str) -> Result<()> {
        self(title, message)
    }
}
