// Frame ledger: arrival timestamps and counters for the current chunk
//
// `on_frame` runs in the device's delivery context (a GStreamer streaming
// thread or the simulated trigger thread). It never blocks on I/O and never
// waits for another frame: if a previous call still holds the busy guard the
// new frame is dropped and counted.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::pipeline::FrameCallback;

/// Seconds since the Unix epoch, microsecond resolution
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// What happened to a frame notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Recorded under this global frame index
    Recorded(u64),
    /// Another notification held the busy guard
    Dropped,
}

/// Held while a frame is being recorded.
///
/// Releases the busy flag on drop.
pub struct BusyGuard<'a> {
    busy: &'a AtomicBool,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Timestamps collected for one chunk, taken out of the ledger at close
#[derive(Debug, Default)]
pub struct ChunkRecords {
    /// Chunk counter at the moment the timestamps were taken
    pub frames: u64,
    pub timestamps: BTreeMap<u64, f64>,
}

impl ChunkRecords {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

pub struct FrameLedger {
    busy: AtomicBool,
    timestamps: Mutex<HashMap<u64, f64>>,
    /// Frames seen since session start (resynced at rotation)
    global_counter: AtomicU64,
    /// Frames seen in the current chunk
    chunk_counter: AtomicU64,
    /// f64 bits of the last arrival time
    time_of_last_frame: AtomicU64,
    dropped_frames: AtomicU64,
}

impl FrameLedger {
    pub fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            timestamps: Mutex::new(HashMap::new()),
            global_counter: AtomicU64::new(0),
            chunk_counter: AtomicU64::new(0),
            time_of_last_frame: AtomicU64::new(now_secs().to_bits()),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Frame-arrival handler, stamped with the current time
    pub fn on_frame(&self) -> FrameOutcome {
        self.on_frame_at(now_secs())
    }

    /// Frame-arrival handler with an explicit arrival time
    pub fn on_frame_at(&self, t: f64) -> FrameOutcome {
        let Some(_guard) = self.try_enter() else {
            let dropped = self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
            log::error!(
                "[!] Frame dropped (busy), {} dropped so far",
                dropped
            );
            return FrameOutcome::Dropped;
        };

        let index = self.global_counter.load(Ordering::Acquire);
        self.timestamps.lock().insert(index, t);
        self.time_of_last_frame.store(t.to_bits(), Ordering::Release);
        self.global_counter.store(index + 1, Ordering::Release);
        self.chunk_counter.fetch_add(1, Ordering::AcqRel);
        log::trace!("Recorded frame {}", index);

        FrameOutcome::Recorded(index)
    }

    /// Acquire the busy guard, or None if a frame is being recorded
    pub fn try_enter(&self) -> Option<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| BusyGuard { busy: &self.busy })
    }

    /// Callback suitable for `PipelineAdapter::set_frame_callback`
    pub fn frame_callback(self: &Arc<Self>) -> FrameCallback {
        let ledger = Arc::clone(self);
        Arc::new(move || {
            ledger.on_frame();
        })
    }

    pub fn global_counter(&self) -> u64 {
        self.global_counter.load(Ordering::Acquire)
    }

    pub fn chunk_counter(&self) -> u64 {
        self.chunk_counter.load(Ordering::Acquire)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn time_of_last_frame(&self) -> f64 {
        f64::from_bits(self.time_of_last_frame.load(Ordering::Acquire))
    }

    pub fn set_time_of_last_frame(&self, t: f64) {
        self.time_of_last_frame.store(t.to_bits(), Ordering::Release);
    }

    /// Move the current chunk's timestamps out of the ledger.
    ///
    /// The counter and the map are read under the busy guard, so a frame
    /// still in flight after the pipeline stopped is either in both or in
    /// neither.
    pub fn take_chunk(&self) -> ChunkRecords {
        let _guard = self.wait_enter();
        let frames = self.chunk_counter.load(Ordering::Acquire);
        let map = std::mem::take(&mut *self.timestamps.lock());
        ChunkRecords {
            frames,
            timestamps: map.into_iter().collect(),
        }
    }

    /// Start counting a new chunk from `global`.
    ///
    /// Any timestamps still held are discarded.
    pub fn reset(&self, global: u64) {
        let _guard = self.wait_enter();
        self.timestamps.lock().clear();
        self.global_counter.store(global, Ordering::Release);
        self.chunk_counter.store(0, Ordering::Release);
    }

    /// Zero the per-chunk counter, keeping the global counter running.
    ///
    /// Frames recorded since the last `take_chunk` are discarded.
    pub fn reset_chunk_counter(&self) {
        let _guard = self.wait_enter();
        self.timestamps.lock().clear();
        self.chunk_counter.store(0, Ordering::Release);
    }

    // Controller side only: spin until the delivery context lets go
    fn wait_enter(&self) -> BusyGuard<'_> {
        loop {
            if let Some(guard) = self.try_enter() {
                return guard;
            }
            std::hint::spin_loop();
        }
    }
}

impl Default for FrameLedger {
    fn default() -> Self {
        Self::new()
    }
}
