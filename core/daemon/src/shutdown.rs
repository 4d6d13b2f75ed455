//! Shared shutdown signal for the accept loop, scanner and dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::info;

const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(200);

static SIGNALLED: AtomicBool = AtomicBool::new(false);

#[derive(Default)]
struct Inner {
    triggered: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        if !self.inner.triggered.swap(true, Ordering::SeqCst) {
            let _guard = self
                .inner
                .lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.inner.condvar.notify_all();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Sleeps up to `timeout`. Returns `true` if shutdown was triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self
            .inner
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_triggered() {
            return true;
        }
        let _ = self
            .inner
            .condvar
            .wait_timeout_while(guard, timeout, |_| !self.is_triggered())
            .unwrap_or_else(PoisonError::into_inner);
        self.is_triggered()
    }
}

extern "C" fn on_signal(_signal: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Routes SIGINT and SIGTERM into `shutdown`. `on_triggered` runs once,
/// on the watcher thread, after the signal is observed.
pub fn install_signal_handlers<F>(shutdown: Shutdown, on_triggered: F)
where
    F: FnOnce() + Send + 'static,
{
    #[cfg(unix)]
    {
        let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // SAFETY: the handler only stores to a static atomic, which is
        // async-signal-safe. Installing a handler has no other side effects.
        #[allow(unsafe_code)]
        unsafe {
            libc::signal(libc::SIGINT, handler);
            libc::signal(libc::SIGTERM, handler);
        }
    }

    thread::spawn(move || {
        while !shutdown.is_triggered() {
            if SIGNALLED.load(Ordering::SeqCst) {
                info!("Shutdown signal received");
                shutdown.trigger();
                break;
            }
            shutdown.wait_timeout(SIGNAL_POLL_INTERVAL);
        }
        on_triggered();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn wait_returns_early_once_triggered() {
        let shutdown = Shutdown::new();
        let remote = shutdown.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.trigger();
        });

        let started = Instant::now();
        assert!(shutdown.wait_timeout(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().expect("join");
    }

    #[test]
    fn wait_times_out_without_trigger() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.wait_timeout(Duration::from_millis(20)));
        assert!(!shutdown.is_triggered());
    }
}
