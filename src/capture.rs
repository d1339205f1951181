//! # Capture Loop Module
//!
//! The capture loop runs on its own thread for as long as capture is started. It owns the frame
//! source and the transport sinks, stamps every frame it reads, and publishes it into the raw
//! frame mailbox, overwriting whatever frame was there.
//!
//! Read failures are treated as transient: the loop backs off, doubling its delay up to a limit,
//! and tries again. After `device_loss_retries` failed reads in a row, or as many failed attempts
//! to reopen a source that closed itself, the device is reported lost through the shared
//! `device_ok` flag and the source is closed. The loop carries on reopening it so that a
//! replugged device is picked up again, `device_ok` is set once a frame is read.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::frame::{RawFrame, Timestamp};
use crate::logger::Logger;
use crate::mailbox::Mailbox;
use crate::source::FrameSource;
use crate::transport::FrameSink;
use crate::worker::sleep_unless_stopped;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// State moved onto the capture thread.
pub(crate) struct CaptureContext {
    pub source: Box<dyn FrameSource>,
    pub sinks: Vec<Box<dyn FrameSink>>,

    pub raw: Arc<Mailbox<RawFrame>>,

    /// Cleared when the device is declared lost, set again when it comes back
    pub device_ok: Arc<AtomicBool>,

    pub backoff: Backoff,
    pub device_loss_retries: u32,

    pub logger: Logger
}

/// What the capture thread hands back when it exits, so the camera can reuse the source.
pub(crate) struct CaptureOutput {
    pub source: Box<dyn FrameSource>,
    pub sinks: Vec<Box<dyn FrameSink>>
}

/// Doubling delay between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration
}

/// Issues strictly increasing capture timestamps from the wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureClock {
    last: Option<Timestamp>
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);

        Self {
            initial,
            max,
            current: initial
        }
    }

    /// The delay to wait now, the following call returns twice as much up to the maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);

        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl CaptureClock {
    pub fn stamp(&mut self) -> Timestamp {
        let now = Timestamp::now();

        let ts = match self.last {
            Some(last) if now <= last => Timestamp::from_micros(last.as_micros() + 1),
            _ => now
        };
        self.last = Some(ts);

        ts
    }
}

impl CaptureContext {
    /// Run the capture loop until `stop` is set.
    pub fn run(mut self, stop: Arc<AtomicBool>) -> CaptureOutput {
        self.logger.info(format!("capture started on {}", self.source.describe()));

        let mut clock = CaptureClock::default();
        let mut read_failures: u64 = 0;
        let mut reopen_failures: u32 = 0;

        while !stop.load(Ordering::SeqCst) {
            if !self.source.is_opened() {
                match self.source.open() {
                    Ok(()) => {
                        self.logger.info(format!("reopened {}", self.source.describe()));
                        reopen_failures = 0;
                        self.backoff.reset();
                    },
                    Err(e) => {
                        reopen_failures = reopen_failures.saturating_add(1);

                        if reopen_failures >= self.device_loss_retries {
                            self.report_lost(format!(
                                "{} attempts to reopen failed: {}",
                                reopen_failures, e
                            ));
                        } else {
                            self.logger.warn(format!("cannot reopen device: {}", e));
                        }

                        sleep_unless_stopped(self.backoff.next_delay(), &stop);
                        continue;
                    }
                }
            }

            match self.source.read() {
                Ok(image) => {
                    if read_failures > 0 {
                        self.logger.info(format!(
                            "capture recovered after {} failed reads",
                            read_failures
                        ));
                        read_failures = 0;
                    }
                    if !self.device_ok.swap(true, Ordering::SeqCst) {
                        self.logger.info(format!("{} is back", self.source.describe()));
                    }
                    self.backoff.reset();

                    let frame = RawFrame {
                        image,
                        timestamp: clock.stamp()
                    };

                    self.publish(frame);
                },
                Err(e) => {
                    read_failures += 1;

                    if read_failures == 1 {
                        self.logger.warn(format!("failed to read frame: {}", e));
                    } else {
                        self.logger.debug(format!(
                            "failed to read frame ({} in a row): {}",
                            read_failures, e
                        ));
                    }

                    if read_failures >= self.device_loss_retries as u64 {
                        self.report_lost(format!("{} reads in a row failed: {}", read_failures, e));
                        self.source.close();
                        read_failures = 0;
                    }

                    sleep_unless_stopped(self.backoff.next_delay(), &stop);
                }
            }
        }

        self.logger.info("capture stopped");

        CaptureOutput {
            source: self.source,
            sinks: self.sinks
        }
    }

    /// Clear `device_ok`, logging the loss only the first time.
    fn report_lost(&self, reason: String) {
        if self.device_ok.swap(false, Ordering::SeqCst) {
            self.logger.error(format!("{} lost, {}", self.source.describe(), reason));
        }
    }

    fn publish(&mut self, frame: RawFrame) {
        if self.sinks.is_empty() {
            self.raw.publish(frame);
            return;
        }

        self.raw.publish(frame.clone());

        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.forward(&frame) {
                self.logger.warn(format!("{} sink failed: {}", sink.name(), e));
            }
        }
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use crate::error::{Error, Result};
    use crate::frame::FrameSize;
    use crate::source::SyntheticSource;
    use crate::worker::Worker;
    use parking_lot::Mutex;
    use std::thread;

    struct CountingSink {
        count: Arc<Mutex<usize>>,
        fail: bool
    }

    impl FrameSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        fn forward(&mut self, _: &RawFrame) -> Result<()> {
            *self.count.lock() += 1;

            if self.fail {
                Err(Error::HardwareUnavailable)
            } else {
                Ok(())
            }
        }
    }

    /// Stays open but fails every read, as a V4L2 node does once unplugged.
    struct UnpluggedSource {
        closes: Arc<Mutex<usize>>
    }

    impl FrameSource for UnpluggedSource {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn is_opened(&self) -> bool {
            true
        }

        fn read(&mut self) -> Result<image::RgbImage> {
            Err(Error::CameraCaptureError(std::io::Error::from_raw_os_error(19)))
        }

        fn close(&mut self) {
            *self.closes.lock() += 1;
        }

        fn frame_size(&self) -> FrameSize {
            FrameSize::new(64, 16)
        }

        fn frame_rate(&self) -> f32 {
            30.0
        }

        fn configure(&mut self, _: FrameSize, _: f32) -> Result<()> {
            Ok(())
        }

        fn describe(&self) -> String {
            "unplugged source".into()
        }
    }

    fn context<S: FrameSource + 'static>(
        source: S,
        sinks: Vec<Box<dyn FrameSink>>
    ) -> CaptureContext {
        CaptureContext {
            source: Box::new(source),
            sinks,
            raw: Arc::new(Mailbox::new()),
            device_ok: Arc::new(AtomicBool::new(true)),
            backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(4)),
            device_loss_retries: 3,
            logger: Logger::default()
        }
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let mut b = Backoff::new(Duration::from_millis(5), Duration::from_millis(15));

        assert_eq!(b.next_delay(), Duration::from_millis(5));
        assert_eq!(b.next_delay(), Duration::from_millis(10));
        assert_eq!(b.next_delay(), Duration::from_millis(15));
        assert_eq!(b.next_delay(), Duration::from_millis(15));

        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(5));
    }

    #[test]
    fn clock_is_strictly_increasing() {
        let mut clock = CaptureClock::default();
        let mut last = clock.stamp();

        for _ in 0..1000 {
            let ts = clock.stamp();
            assert!(ts > last);
            last = ts;
        }
    }

    #[test]
    fn survives_dropouts_and_feeds_sinks() {
        let count = Arc::new(Mutex::new(0));
        let failing = Arc::new(Mutex::new(0));
        let sinks: Vec<Box<dyn FrameSink>> = vec![
            Box::new(CountingSink { count: count.clone(), fail: false }),
            Box::new(CountingSink { count: failing.clone(), fail: true })
        ];

        let mut src = SyntheticSource::textured(FrameSize::new(64, 16), 200.0, 2)
            .with_dropouts(2);
        src.open().unwrap();

        let ctx = context(src, sinks);
        let raw = ctx.raw.clone();
        let worker = Worker::spawn("capture", move |stop| ctx.run(stop)).unwrap();

        thread::sleep(Duration::from_millis(150));
        let output = worker.join().unwrap();

        assert!(raw.version() >= 3);
        assert_eq!(*count.lock() as u64, raw.version());
        assert_eq!(*failing.lock(), *count.lock());
        assert!(output.source.is_opened());
        assert_eq!(output.sinks.len(), 2);
    }

    #[test]
    fn lost_device_clears_flag() {
        let mut src = SyntheticSource::textured(FrameSize::new(64, 16), 500.0, 2)
            .disconnect_after(3);
        src.open().unwrap();

        let ctx = context(src, Vec::new());
        let raw = ctx.raw.clone();
        let device_ok = ctx.device_ok.clone();
        let worker = Worker::spawn("capture", move |stop| ctx.run(stop)).unwrap();

        thread::sleep(Duration::from_millis(150));
        assert!(!device_ok.load(Ordering::SeqCst));
        worker.join().unwrap();

        // The last good frame is kept
        assert_eq!(raw.version(), 2);
        assert!(raw.latest().is_some());
    }

    #[test]
    fn failing_reads_on_an_open_source_report_loss() {
        let closes = Arc::new(Mutex::new(0));
        let ctx = context(UnpluggedSource { closes: closes.clone() }, Vec::new());
        let raw = ctx.raw.clone();
        let device_ok = ctx.device_ok.clone();
        let worker = Worker::spawn("capture", move |stop| ctx.run(stop)).unwrap();

        thread::sleep(Duration::from_millis(150));
        assert!(!device_ok.load(Ordering::SeqCst));
        assert!(!worker.is_finished());
        worker.join().unwrap();

        assert!(*closes.lock() >= 1);
        assert!(raw.latest().is_none());
    }
}
