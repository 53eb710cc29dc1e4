/// Sink for user-facing problems: invalid input, timeouts, OAuth failures.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, content: &str);
}

impl<F> Notifier for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn notify(&self, title: &str, content: &str) {
        self(title, content)
    }
}

/// Writes notifications to stderr. Used by the command line.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, title: &str, content: &str) {
        tracing::debug!("notify: {}", title);
        eprintln!("{}\n{}", title, content);
    }
}
