use super::Engine;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// The ticker thread that runs the poll cycle and due reconnects.
///
/// It holds only a weak reference so that dropping the last engine handle
/// ends the thread.
#[derive(Debug)]
pub(crate) struct Driver {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Driver {
    pub(crate) fn spawn(engine: Weak<Engine>, name: &str, interval: Duration) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread_name = if name.is_empty() {
            "netbind".to_string()
        } else {
            format!("netbind-{name}")
        };

        let handle = thread::Builder::new().name(thread_name).spawn(move || {
            debug!("Driver started");
            while !thread_stop.load(Ordering::Acquire) {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.tick();
                drop(engine);
                thread::sleep(interval);
            }
            debug!("Driver stopped");
        })?;

        Ok(Self { stop, handle })
    }

    /// Stops the thread and waits for it, unless called from the thread itself.
    pub(crate) fn stop(self) {
        self.stop.store(true, Ordering::Release);
        if self.handle.thread().id() == thread::current().id() {
            return;
        }
        if self.handle.join().is_err() {
            error!("Driver thread panicked");
        }
    }
}
