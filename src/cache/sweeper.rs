use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::Sweep;

struct Registration {
    cache: Weak<dyn Sweep>,
    interval: Duration,
    next_due: Instant,
}

/// Background thread that purges expired entries from registered caches.
///
/// Caches are held weakly; dropping a cache unregisters it. Stops on
/// `shutdown()` or when the sweeper is dropped.
pub struct CacheSweeper {
    registrations: Arc<Mutex<Vec<Registration>>>,
    shutdown_signal: Mutex<Option<Sender<()>>>,
    sweep_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CacheSweeper {
    /// Start the sweep thread, waking at least every `tick`
    pub fn start(tick: Duration) -> Self {
        let registrations: Arc<Mutex<Vec<Registration>>> = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = bounded(1);

        let thread_registrations = Arc::clone(&registrations);
        let spawned = thread::Builder::new()
            .name("cache-sweeper".to_string())
            .spawn(move || Self::sweep_loop(thread_registrations, shutdown_rx, tick));

        let sweep_thread = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                // Reads still enforce expiry; only memory reclamation is lost
                log::error!("Failed to start cache sweeper thread: {}", e);
                None
            }
        };

        Self {
            registrations,
            shutdown_signal: Mutex::new(Some(shutdown_tx)),
            sweep_thread: Mutex::new(sweep_thread),
        }
    }

    /// Sweep `cache` every `cache.sweep_interval()`
    pub fn register<C: Sweep + 'static>(&self, cache: &Arc<C>) {
        let interval = cache.sweep_interval().max(Duration::from_millis(1));
        log::debug!(
            "Registered cache {} for sweeping every {:?}",
            cache.cache_name(),
            interval
        );
        self.registrations.lock().push(Registration {
            cache: Arc::downgrade(cache) as Weak<dyn Sweep>,
            interval,
            next_due: Instant::now() + interval,
        });
    }

    /// Caches still alive and registered
    pub fn registered(&self) -> usize {
        self.registrations
            .lock()
            .iter()
            .filter(|registration| registration.cache.strong_count() > 0)
            .count()
    }

    pub fn is_running(&self) -> bool {
        self.sweep_thread.lock().is_some()
    }

    /// Stop the sweep thread and wait for it to exit
    pub fn shutdown(&self) {
        // Dropping the sender disconnects the channel and wakes the thread
        self.shutdown_signal.lock().take();
        if let Some(handle) = self.sweep_thread.lock().take() {
            if handle.join().is_err() {
                log::error!("Cache sweeper thread panicked");
            }
            log::debug!("Cache sweeper stopped");
        }
    }

    fn sweep_loop(
        registrations: Arc<Mutex<Vec<Registration>>>,
        shutdown: Receiver<()>,
        tick: Duration,
    ) {
        loop {
            let wait = Self::next_wait(&registrations, tick);
            match shutdown.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            let due: Vec<Arc<dyn Sweep>> = {
                let mut registrations = registrations.lock();
                registrations.retain(|registration| registration.cache.strong_count() > 0);
                registrations
                    .iter_mut()
                    .filter(|registration| registration.next_due <= now)
                    .filter_map(|registration| {
                        registration.next_due = now + registration.interval;
                        registration.cache.upgrade()
                    })
                    .collect()
            };

            for cache in due {
                let removed = cache.sweep();
                if removed > 0 {
                    log::debug!("Swept {} expired entries from {}", removed, cache.cache_name());
                }
            }
        }
    }

    fn next_wait(registrations: &Mutex<Vec<Registration>>, tick: Duration) -> Duration {
        let now = Instant::now();
        registrations
            .lock()
            .iter()
            .map(|registration| registration.next_due.saturating_duration_since(now))
            .min()
            .map_or(tick, |until_due| until_due.min(tick))
    }
}

impl Drop for CacheSweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
