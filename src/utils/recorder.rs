//! recorder.rs
//! Status log writer behind `--record`.
//!
//! - `record()` pushes onto a bounded lock-free queue and returns immediately;
//!   a full queue drops the status and counts it
//! - a background consumer drains the queue in batches and writes one JSON
//!   object per line, flushing every few batches
//! - `finish()` stops the consumer after a final drain

use crossbeam_queue::ArrayQueue;
use log::{debug, error, info};
use parking_lot::Mutex;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::core::{error::Result, protocol::Status};

const RECORD_CAPACITY: usize = 8192;
const CONSUMER_POLL_MS: u64 = 5;
const BATCH: usize = 256;
const FLUSH_BATCHES: usize = 8;

pub struct StatusRecorder {
    queue: Arc<ArrayQueue<Status>>,
    dropped: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    consumer: Mutex<Option<JoinHandle<u64>>>,
    path: PathBuf,
}

impl StatusRecorder {
    /// Creates the log file and starts the consumer thread.
    pub fn start(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        let queue = Arc::new(ArrayQueue::new(RECORD_CAPACITY));
        let running = Arc::new(AtomicBool::new(true));

        let consumer = {
            let queue = queue.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("status-recorder".into())
                .spawn(move || consume(queue, running, BufWriter::new(file)))?
        };

        info!("[Recorder] writing status log to {}", path.display());
        Ok(Self {
            queue,
            dropped: Arc::new(AtomicU64::new(0)),
            running,
            consumer: Mutex::new(Some(consumer)),
            path,
        })
    }

    #[inline]
    pub fn record(&self, status: Status) {
        if self.queue.push(status).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops the consumer after it drained the queue. Returns lines written.
    pub fn finish(&self) -> u64 {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.consumer.lock().take();
        match handle.map(|h| h.join()) {
            Some(Ok(written)) => {
                info!(
                    "[Recorder] {} status line(s) written to {}, {} dropped",
                    written,
                    self.path.display(),
                    self.dropped()
                );
                written
            }
            Some(Err(_)) => {
                error!("[Recorder] consumer thread panicked");
                0
            }
            None => 0,
        }
    }
}

impl Drop for StatusRecorder {
    fn drop(&mut self) {
        self.finish();
    }
}

fn consume(queue: Arc<ArrayQueue<Status>>, running: Arc<AtomicBool>, mut out: BufWriter<File>) -> u64 {
    let mut written = 0u64;
    let mut flush_counter = 0usize;

    while running.load(Ordering::SeqCst) {
        let mut any = false;
        for _ in 0..BATCH {
            match queue.pop() {
                Some(status) => {
                    any = true;
                    written += write_line(&mut out, &status);
                }
                None => break,
            }
        }
        if any {
            flush_counter += 1;
            if flush_counter >= FLUSH_BATCHES {
                out.flush().ok();
                flush_counter = 0;
            }
        } else {
            thread::sleep(Duration::from_millis(CONSUMER_POLL_MS));
        }
    }

    while let Some(status) = queue.pop() {
        written += write_line(&mut out, &status);
    }
    if let Err(e) = out.flush() {
        error!("[Recorder] final flush failed: {}", e);
    }
    debug!("[Recorder] consumer exiting after {} line(s)", written);
    written
}

fn write_line(out: &mut BufWriter<File>, status: &Status) -> u64 {
    let result = serde_json::to_writer(&mut *out, status.as_ref())
        .map_err(std::io::Error::from)
        .and_then(|_| out.write_all(b"\n"));
    match result {
        Ok(()) => 1,
        Err(e) => {
            error!("[Recorder] write failed: {}", e);
            0
        }
    }
}
