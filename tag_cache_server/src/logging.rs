use std::io::{self, Write};
use tokio::sync::mpsc::UnboundedSender;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Forwards formatted log lines to a channel, e.g. for an operator console or a test.
struct ChannelWriter {
    tx: UnboundedSender<String>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = String::from_utf8_lossy(buf).to_string();
        // Receiver gone means nobody is watching anymore.
        let _ = self.tx.send(line);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Filter from `RUST_LOG` if set, otherwise from the configured directive.
fn filter(directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
}

/// Initialize logging. If a channel is provided, log output is forwarded
/// to the channel instead of standard output.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(
    directive: &str,
    forward: Option<UnboundedSender<String>>,
) -> Result<(), TryInitError> {
    let registry = tracing_subscriber::registry().with(filter(directive));
    if let Some(tx) = forward {
        let layer = fmt::layer()
            .with_ansi(false)
            .with_writer(move || ChannelWriter { tx: tx.clone() });
        registry.with(layer).try_init()
    } else {
        registry.with(fmt::layer().with_thread_names(true)).try_init()
    }
}
