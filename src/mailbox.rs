//! # Mailbox Module
//!
//! A single-slot, overwrite-on-publish store shared between one producer thread and any number of
//! readers. Publishing replaces the held value and wakes all waiting readers, readers always
//! receive a clone of the most recent value. Every publish bumps a version counter so readers
//! can wait for a value newer than the one they already have.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Longest a waiting reader sleeps before re-checking its cancel flag.
const CANCEL_POLL: Duration = Duration::from_millis(20);

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    version: u64
}

/// Latest-value slot.
#[derive(Debug)]
pub struct Mailbox<T> {
    slot: Mutex<Slot<T>>,
    published: Condvar
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl<T: Clone> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                version: 0
            }),
            published: Condvar::new()
        }
    }

    /// Replace the held value and wake every waiting reader.
    ///
    /// Returns the version of the new value.
    pub fn publish(&self, value: T) -> u64 {
        let version = {
            let mut slot = self.slot.lock();
            slot.value = Some(value);
            slot.version += 1;
            slot.version
        };

        self.published.notify_all();

        version
    }

    /// Clone of the most recent value, if anything was ever published.
    pub fn latest(&self) -> Option<T> {
        self.slot.lock().value.clone()
    }

    /// Version of the held value, `0` before the first publish.
    pub fn version(&self) -> u64 {
        self.slot.lock().version
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().value.is_none()
    }

    /// The most recent value, waiting up to `timeout` for a first one to be published.
    pub fn latest_or_wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();

        while slot.value.is_none() {
            if self.published.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }

        slot.value.clone()
    }

    /// Wait for a value with a version greater than `since`.
    ///
    /// Returns `None` on timeout or once `cancel` is set. Callers that set `cancel` should call
    /// [`Mailbox::wake_all`] so waiting readers notice without waiting out a poll interval.
    pub fn wait_newer(
        &self,
        since: u64,
        timeout: Duration,
        cancel: &AtomicBool
    ) -> Option<(u64, T)> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();

        loop {
            if slot.version > since {
                if let Some(ref value) = slot.value {
                    return Some((slot.version, value.clone()));
                }
            }

            if cancel.load(Ordering::SeqCst) {
                return None;
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let wake_at = deadline.min(now + CANCEL_POLL);
            self.published.wait_until(&mut slot, wake_at);
        }
    }

    /// Wake every waiting reader without publishing.
    pub fn wake_all(&self) {
        // Taking the lock orders this wake after any reader's flag check
        let _slot = self.slot.lock();
        self.published.notify_all();
    }
}

impl<T: Clone> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
