use crate::config::{LOG_LEVEL_ERROR, LOG_LEVEL_SILENT};
use crate::error::{Error, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const VERBOSE_ENV: &str = "CELLGUARD_VERBOSE";

/// Maps the config `logLevel` onto a filter directive. `None` is used before a
/// config has been loaded. The verbose toggle never filters below `info`, which
/// is where its dumps are logged.
pub fn directive_for(level: Option<u8>, verbose: bool) -> &'static str {
    let directive = match level {
        None => "info",
        Some(LOG_LEVEL_SILENT) => "off",
        Some(LOG_LEVEL_ERROR) => "error",
        Some(_) => "debug",
    };
    match directive {
        "off" | "error" if verbose => "info",
        other => other,
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `level` when set.
pub fn init(level: Option<u8>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive_for(level, verbose())))
        .map_err(|err| Error::config(format!("invalid log filter: {}", err)))?;

    // a second init in the same process keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
    Ok(())
}

pub fn verbose() -> bool {
    is_enabled(std::env::var(VERBOSE_ENV).ok().as_deref())
}

fn is_enabled(value: Option<&str>) -> bool {
    value.is_some_and(|value| !value.trim().is_empty())
}


/// Scoped subscriber writing plain text into a buffer, for asserting on log output.
#[cfg(test)]
pub(crate) mod capture {
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing::subscriber::DefaultGuard;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    #[derive(Clone, Default)]
    pub(crate) struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        pub(crate) fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Logs on this thread go to the returned buffer until the guard drops.
    pub(crate) fn logs(directive: &str) -> (DefaultGuard, Captured) {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::registry().with(EnvFilter::new(directive)).with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(move || writer.clone()),
        );
        (tracing::subscriber::set_default(subscriber), captured)
    }
}
