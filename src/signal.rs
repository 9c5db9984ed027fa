//! Signal-driven shutdown.
//!
//! SIGTSTP, SIGINT and SIGTERM request shutdown of one event loop. A
//! background thread receives the signals and triggers the loop's
//! shutdown handle; the loop then exits and closes its sockets on its own
//! thread.

use crate::runtime::ShutdownHandle;
use signal_hook::consts::{SIGINT, SIGTERM, SIGTSTP};
use signal_hook::iterator::Signals;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::info;

/// Signals that stop the loop.
pub const SHUTDOWN_SIGNALS: [i32; 3] = [SIGTSTP, SIGINT, SIGTERM];

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Route shutdown signals to `handle`.
///
/// Only one handle per process; a second call fails with `AlreadyExists`.
pub fn install(handle: ShutdownHandle) -> io::Result<()> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "signal handlers already installed",
        ));
    }

    let mut signals = match Signals::new(SHUTDOWN_SIGNALS) {
        Ok(signals) => signals,
        Err(e) => {
            INSTALLED.store(false, Ordering::SeqCst);
            return Err(e);
        }
    };

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for signum in signals.forever() {
                info!(signal = signum, "Received shutdown signal");
                handle.trigger();
            }
        })?;

    Ok(())
}
