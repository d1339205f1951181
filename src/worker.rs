//! # Worker Module
//!
//! Handle on a named background thread that runs until asked to stop. The thread body receives
//! the stop flag and is expected to check it at least once per iteration.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// A running background loop and the flag used to stop it.
///
/// `R` is whatever the loop hands back when it exits.
#[derive(Debug)]
pub struct Worker<R> {
    name: &'static str,

    stop: Arc<AtomicBool>,

    handle: JoinHandle<R>
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl<R: Send + 'static> Worker<R> {
    /// Spawn `body` on a new thread called `name`.
    pub fn spawn<F>(name: &'static str, body: F) -> Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) -> R + Send + 'static
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || body(thread_stop))
            .map_err(|e| Error::ThreadSpawnError(name, e))?;

        Ok(Self { name, stop, handle })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the loop to exit at its next check, without waiting.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Returns true once the thread body has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Request a stop and wait for the thread to exit.
    pub fn join(self) -> Result<R> {
        self.request_stop();
        let name = self.name;

        self.handle.join().map_err(|_| Error::ThreadJoinError(name))
    }
}

// -----------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Sleep for `duration`, waking early if `stop` is set.
///
/// Returns false if the sleep was cut short.
pub fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) -> bool {
    const CHUNK: Duration = Duration::from_millis(5);
    let deadline = Instant::now() + duration;

    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }

        let now = Instant::now();
        if now >= deadline {
            return true;
        }

        thread::sleep((deadline - now).min(CHUNK));
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn join_stops_the_loop_and_returns_its_output() {
        let worker = Worker::spawn("counter", |stop| {
            let mut n = 0u32;
            while !stop.load(Ordering::SeqCst) {
                n += 1;
                thread::sleep(Duration::from_millis(1));
            }
            n
        }).unwrap();

        thread::sleep(Duration::from_millis(20));
        assert!(!worker.is_finished());
        assert!(worker.join().unwrap() > 0);
    }

    #[test]
    fn panicking_body_is_reported() {
        let worker = Worker::spawn("panics", |_| -> () { panic!("boom") }).unwrap();

        assert!(matches!(worker.join(), Err(Error::ThreadJoinError("panics"))));
    }

    #[test]
    fn interruptible_sleep() {
        let stop = AtomicBool::new(false);
        assert!(sleep_unless_stopped(Duration::from_millis(10), &stop));

        stop.store(true, Ordering::SeqCst);
        let start = Instant::now();
        assert!(!sleep_unless_stopped(Duration::from_secs(5), &stop));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
