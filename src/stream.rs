//! Bounded point-to-point streams between pipeline stages
//!
//! A stream is a named bounded `crossbeam` channel split into a
//! [`StreamWriter`] and a [`StreamReader`]. Neither half is `Clone`, so once
//! a stage owns an endpoint no other stage can push to or pop from that
//! channel. Pushes block while the stream is full and pops block while it is
//! empty; that backpressure is the only synchronization between stages.
//!
//! Every stream of one graph shares a [`Watchdog`]. A blocked push or pop
//! fails with [`GemmError::Stalled`] only once no stream of the graph has
//! moved a value for the stall timeout, so a long wait behind a busy stage
//! is not mistaken for a deadlock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::error::{GemmError, GemmResult, StreamOp};

const MIN_POLL: Duration = Duration::from_millis(1);
const MAX_POLL: Duration = Duration::from_millis(100);

/// Graph-wide progress counter shared by every stream of one run
#[derive(Debug, Clone)]
pub struct Watchdog {
    moves: Arc<AtomicU64>,
    stall_timeout: Duration,
}

impl Watchdog {
    pub fn new(stall_timeout: Duration) -> Self {
        Self {
            moves: Arc::new(AtomicU64::new(0)),
            stall_timeout,
        }
    }

    pub fn stall_timeout(&self) -> Duration {
        self.stall_timeout
    }

    /// Values moved through any stream of the graph so far
    pub fn moves(&self) -> u64 {
        self.moves.load(Ordering::Relaxed)
    }

    fn record(&self) {
        self.moves.fetch_add(1, Ordering::Relaxed);
    }

    fn poll_interval(&self) -> Duration {
        (self.stall_timeout / 4).clamp(MIN_POLL, MAX_POLL)
    }

    fn clock(&self) -> StallClock {
        StallClock {
            seen: self.moves(),
            since: Instant::now(),
        }
    }
}

/// Time since the graph last made progress, as observed by one waiter
struct StallClock {
    seen: u64,
    since: Instant,
}

impl StallClock {
    fn stalled(&mut self, watchdog: &Watchdog) -> bool {
        let moves = watchdog.moves();
        if moves != self.seen {
            self.seen = moves;
            self.since = Instant::now();
            return false;
        }
        self.since.elapsed() >= watchdog.stall_timeout
    }
}

/// Create a bounded stream holding at most `capacity` values.
pub fn stream<T: Send>(
    name: impl Into<String>,
    capacity: usize,
    watchdog: &Watchdog,
) -> (StreamWriter<T>, StreamReader<T>) {
    debug_assert!(capacity > 0, "a zero-capacity stream is a rendezvous");
    let name: Arc<str> = name.into().into();
    let (tx, rx) = channel::bounded(capacity);
    (
        StreamWriter {
            name: name.clone(),
            tx,
            watchdog: watchdog.clone(),
        },
        StreamReader {
            name,
            rx,
            watchdog: watchdog.clone(),
        },
    )
}

/// Producing end of a stream
#[derive(Debug)]
pub struct StreamWriter<T> {
    name: Arc<str>,
    tx: Sender<T>,
    watchdog: Watchdog,
}

impl<T> StreamWriter<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Push a value, blocking while the stream is full.
    pub fn push(&self, value: T) -> GemmResult<()> {
        let mut pending = value;
        let mut clock = self.watchdog.clock();
        loop {
            match self.tx.send_timeout(pending, self.watchdog.poll_interval()) {
                Ok(()) => {
                    self.watchdog.record();
                    return Ok(());
                }
                Err(SendTimeoutError::Timeout(value)) => pending = value,
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(GemmError::Disconnected {
                        channel: self.name.to_string(),
                    });
                }
            }

            if clock.stalled(&self.watchdog) {
                log::warn!("stream {} stalled on push", self.name);
                return Err(GemmError::Stalled {
                    channel: self.name.to_string(),
                    operation: StreamOp::Push,
                });
            }
        }
    }
}

/// Consuming end of a stream
#[derive(Debug)]
pub struct StreamReader<T> {
    name: Arc<str>,
    rx: Receiver<T>,
    watchdog: Watchdog,
}

impl<T> StreamReader<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pop the oldest value, blocking while the stream is empty.
    pub fn pop(&self) -> GemmResult<T> {
        let mut clock = self.watchdog.clock();
        loop {
            match self.rx.recv_timeout(self.watchdog.poll_interval()) {
                Ok(value) => {
                    self.watchdog.record();
                    return Ok(value);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(GemmError::Disconnected {
                        channel: self.name.to_string(),
                    });
                }
            }

            if clock.stalled(&self.watchdog) {
                log::warn!("stream {} stalled on pop", self.name);
                return Err(GemmError::Stalled {
                    channel: self.name.to_string(),
                    operation: StreamOp::Pop,
                });
            }
        }
    }
}
