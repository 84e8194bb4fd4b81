//! Playback scheduler: gapless, receipt-ordered playback of agent audio with a
//! hard stop for barge-in.
//!
//! The scheduler owns the queue model and the monotonic start-time cursor; a
//! [`PlaybackSink`] turns scheduled entries into sound. [`RodioSink`] plays on
//! the default output device, [`NullSink`] discards audio (text-only sessions).

use crate::codec::InboundFrame;
use crate::error::{LiveError, LiveResult};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Monotonic time source, expressed as an offset from the clock's origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Wall clock anchored at construction.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven clock for deterministic scheduling tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, at: Duration) {
        self.nanos.store(at.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// One decoded buffer and the time it is scheduled to start.
#[derive(Debug, Clone)]
pub struct PlaybackQueueEntry {
    pub id: u64,
    pub frame: InboundFrame,
    pub start: Duration,
}

impl PlaybackQueueEntry {
    pub fn duration(&self) -> Duration {
        self.frame.duration()
    }

    pub fn end(&self) -> Duration {
        self.start + self.duration()
    }
}

/// Output side of the scheduler ("consume buffer for playback at time T").
pub trait PlaybackSink: Send {
    /// Queue the entry; it must start no earlier than `entry.start`.
    fn play(&mut self, entry: &PlaybackQueueEntry) -> LiveResult<()>;

    /// Silence the entry immediately, whether playing or still pending.
    fn cancel(&mut self, id: u64);

    /// Silence everything the device still holds, including entries the
    /// scheduler already considers finished.
    fn stop_all(&mut self);
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl PlaybackSink for NullSink {
    fn play(&mut self, _entry: &PlaybackQueueEntry) -> LiveResult<()> {
        Ok(())
    }

    fn cancel(&mut self, _id: u64) {}

    fn stop_all(&mut self) {}
}

/// Owns the playback queue and the "next start time" cursor.
pub struct PlaybackScheduler {
    sink: Box<dyn PlaybackSink>,
    clock: Arc<dyn Clock>,
    queue: VecDeque<PlaybackQueueEntry>,
    cursor: Duration,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn PlaybackSink>, clock: Arc<dyn Clock>) -> Self {
        let cursor = clock.now();
        Self {
            sink,
            clock,
            queue: VecDeque::new(),
            cursor,
            next_id: 0,
        }
    }

    /// Schedule a frame at the cursor (or now, if the cursor fell behind) and
    /// advance the cursor by its duration.
    pub fn enqueue(&mut self, frame: InboundFrame) -> LiveResult<PlaybackQueueEntry> {
        let now = self.clock.now();
        self.prune(now);

        let start = self.cursor.max(now);
        let entry = PlaybackQueueEntry {
            id: self.next_id,
            frame,
            start,
        };
        self.next_id += 1;

        self.sink.play(&entry)?;
        self.cursor = entry.end();
        debug!(
            id = entry.id,
            start_ms = start.as_millis() as u64,
            duration_ms = entry.duration().as_millis() as u64,
            "scheduled playback entry"
        );
        self.queue.push_back(entry.clone());
        Ok(entry)
    }

    /// Stop every scheduled or playing entry, empty the queue and reset the
    /// cursor to now. Returns how many entries were stopped.
    pub fn interrupt(&mut self) -> usize {
        let now = self.clock.now();
        let stopped = self.queue.len();
        for entry in self.queue.drain(..) {
            self.sink.cancel(entry.id);
        }
        // The device can run behind the clock; pruned entries may still sound.
        self.sink.stop_all();
        self.cursor = now;
        if stopped > 0 {
            info!("⏹️ Playback interrupted ({} entries stopped)", stopped);
        }
        stopped
    }

    /// Drop entries that have not started yet; the entry currently playing
    /// finishes. Returns how many were dropped.
    pub fn drop_pending(&mut self) -> usize {
        let now = self.clock.now();
        self.prune(now);

        let mut dropped = 0;
        while let Some(last) = self.queue.back() {
            if last.start <= now {
                break;
            }
            let id = last.id;
            self.queue.pop_back();
            self.sink.cancel(id);
            dropped += 1;
        }
        self.cursor = self.queue.back().map(|e| e.end()).unwrap_or(now).max(now);
        if dropped > 0 {
            debug!(dropped, "dropped pending playback entries");
        }
        dropped
    }

    /// Entries still playing or waiting to play.
    pub fn queue_len(&mut self) -> usize {
        let now = self.clock.now();
        self.prune(now);
        self.queue.len()
    }

    pub fn is_playing(&mut self) -> bool {
        self.queue_len() > 0
    }

    pub fn cursor(&self) -> Duration {
        self.cursor
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    fn prune(&mut self, now: Duration) {
        while self.queue.front().is_some_and(|e| e.end() <= now) {
            self.queue.pop_front();
        }
    }
}

/// Source wrapper that ends as soon as its flag is raised.
struct Cancellable<S> {
    inner: S,
    cancelled: Arc<AtomicBool>,
}

impl<S> Iterator for Cancellable<S>
where
    S: Iterator<Item = f32>,
{
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.cancelled.load(Ordering::Relaxed) {
            return None;
        }
        self.inner.next()
    }
}

impl<S> Source for Cancellable<S>
where
    S: Source<Item = f32>,
{
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        self.inner.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Plays entries on the default output device through a `rodio::Sink`.
///
/// The sink appends sources back to back, which matches the scheduler's
/// cursor arithmetic. `rodio::OutputStream` is not `Send`, so it lives on a
/// dedicated thread for the lifetime of this value.
pub struct RodioSink {
    sink: Sink,
    flags: HashMap<u64, Arc<AtomicBool>>,
    _stream_guard: std_mpsc::Sender<()>,
}

impl RodioSink {
    /// Open the default output device.
    pub fn open() -> LiveResult<Self> {
        info!("🔊 Initializing audio playback");

        let (handle_tx, handle_rx) = std_mpsc::channel::<LiveResult<OutputStreamHandle>>();
        let (guard_tx, guard_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("pagi-live-playback".to_string())
            .spawn(move || {
                let (_stream, handle): (OutputStream, OutputStreamHandle) =
                    match OutputStream::try_default() {
                        Ok(pair) => pair,
                        Err(e) => {
                            let _ = handle_tx.send(Err(LiveError::AudioDevice(e.to_string())));
                            return;
                        }
                    };
                if handle_tx.send(Ok(handle)).is_err() {
                    return;
                }
                // Blocks until the RodioSink (and its sender) is dropped.
                let _ = guard_rx.recv();
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| LiveError::AudioDevice("playback thread exited".to_string()))??;
        let sink = Sink::try_new(&handle).map_err(|e| LiveError::Playback(e.to_string()))?;

        info!("✅ Audio playback initialized");

        Ok(Self {
            sink,
            flags: HashMap::new(),
            _stream_guard: guard_tx,
        })
    }
}

impl PlaybackSink for RodioSink {
    fn play(&mut self, entry: &PlaybackQueueEntry) -> LiveResult<()> {
        // Sources that finished were dropped by the mixer; forget their flags.
        self.flags.retain(|_, flag| Arc::strong_count(flag) > 1);

        let format = entry.frame.format();
        let cancelled = Arc::new(AtomicBool::new(false));
        let source = Cancellable {
            inner: rodio::buffer::SamplesBuffer::new(
                format.channels,
                format.sample_rate,
                entry.frame.to_f32(),
            ),
            cancelled: Arc::clone(&cancelled),
        };
        self.flags.insert(entry.id, cancelled);
        self.sink.append(source);
        Ok(())
    }

    fn cancel(&mut self, id: u64) {
        if let Some(flag) = self.flags.remove(&id) {
            flag.store(true, Ordering::Relaxed);
        }
    }

    fn stop_all(&mut self) {
        for (_, flag) in self.flags.drain() {
            flag.store(true, Ordering::Relaxed);
        }
    }
}

impl Drop for RodioSink {
    fn drop(&mut self) {
        self.sink.stop();
    }
}
