//! Subscriber bootstrap (SPEC_FULL.md "Logging"): reads `QSHIM_LOG_LEVEL`/`QSHIM_LOG_FILE`,
//! builds an `EnvFilter`, and installs a `tracing-subscriber` `fmt` layer writing to the
//! configured path or stderr if it can't be opened. Deliberately thin — log file I/O and
//! rotation are named out of scope; this just gets *something* wired up so the crate is usable
//! standalone, the way `qail-daemon`'s own subscriber setup does for its binary.

use std::fs::OpenOptions;
use std::sync::Once;

static INIT: Once = Once::new();

pub fn install(config: &shimcore::config::Config) {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error"));

        let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

        match OpenOptions::new().create(true).append(true).open(&config.log_file) {
            Ok(file) => {
                let _ = builder.with_writer(std::sync::Mutex::new(file)).try_init();
            }
            Err(_) => {
                let _ = builder.with_writer(std::io::stderr).try_init();
            }
        }
    });
}
