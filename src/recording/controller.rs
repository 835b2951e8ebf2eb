// Chunk controller: opens, names and rotates chunks around the delay monitor
//
// Idle -> Running -> Closing -> Idle, repeated until cancelled (Stopped).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::ledger::FrameLedger;
use super::monitor::{DelayMonitor, MonitorOutcome};
use super::pipeline::{PipelineAdapter, PipelineError};
use super::{Chunk, ChunkState};
use crate::session::{write_ledger, LedgerError, LedgerFile, Session};

/// Closed chunks kept for inspection; older ones are forgotten
pub const CHUNK_HISTORY: usize = 32;

/// Error type for the chunk loop
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("failed to start chunk {chunk}: {source}")]
    PipelineStart {
        chunk: String,
        #[source]
        source: PipelineError,
    },

    #[error("failed to stop chunk {chunk}: {source}")]
    PipelineStop {
        chunk: String,
        #[source]
        source: PipelineError,
    },

    #[error("timestamps of chunk {chunk} were not saved: {source}")]
    Ledger {
        chunk: String,
        #[source]
        source: LedgerError,
    },
}

/// Requests a running controller to finish its current chunk and return
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Totals over a finished `run`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub chunks: usize,
    pub ledgers_written: usize,
    pub frames_recorded: u64,
    pub dropped_frames: u64,
    /// Times the global counter was forced back onto the chunk schedule
    pub resyncs: u64,
}

pub struct ChunkController<P: PipelineAdapter> {
    session: Session,
    pipeline: P,
    ledger: Arc<FrameLedger>,
    monitor: DelayMonitor,
    cancel: Arc<AtomicBool>,
    /// Most recent chunks, the current one last
    history: VecDeque<Chunk>,
    chunks_started: u64,
    state: ChunkState,
    summary: RunSummary,
}

impl<P: PipelineAdapter> ChunkController<P> {
    pub fn new(session: Session, mut pipeline: P) -> Self {
        let ledger = Arc::new(FrameLedger::new());
        let cancel = Arc::new(AtomicBool::new(false));
        let monitor = DelayMonitor::new(
            ledger.clone(),
            session.timeout_delay,
            session.poll_interval,
            cancel.clone(),
        );
        pipeline.set_frame_callback(ledger.frame_callback());

        Self {
            session,
            pipeline,
            ledger,
            monitor,
            cancel,
            history: VecDeque::with_capacity(CHUNK_HISTORY),
            chunks_started: 0,
            state: ChunkState::Idle,
            summary: RunSummary::default(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            flag: self.cancel.clone(),
        }
    }

    pub fn ledger(&self) -> Arc<FrameLedger> {
        self.ledger.clone()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The last `CHUNK_HISTORY` chunks, oldest first
    pub fn chunks(&self) -> impl DoubleEndedIterator<Item = &Chunk> + '_ {
        self.history.iter()
    }

    pub fn current_chunk(&self) -> Option<&Chunk> {
        self.history.back()
    }

    pub fn chunks_started(&self) -> u64 {
        self.chunks_started
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    /// Record chunks until cancelled.
    ///
    /// Returns the run totals on cancellation. A pipeline start failure, stop
    /// failure or ledger write failure ends the run with an error; the chunk
    /// being closed is still flushed first.
    pub fn run(&mut self) -> Result<RunSummary, ChunkError> {
        let result = self.run_chunks();
        self.state = ChunkState::Stopped;
        self.summary.dropped_frames = self.ledger.dropped_frames();
        log::info!(
            "Recording stopped: {} chunk(s), {} ledger(s), {} frame(s), {} dropped",
            self.summary.chunks,
            self.summary.ledgers_written,
            self.summary.frames_recorded,
            self.summary.dropped_frames
        );
        result.map(|_| self.summary.clone())
    }

    fn run_chunks(&mut self) -> Result<(), ChunkError> {
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Ok(());
            }

            let (name, video_path) = self.open_chunk();
            log::info!("New video: {}", video_path.display());

            if let Err(source) = self
                .pipeline
                .start(&video_path, &self.session.device_properties)
            {
                return Err(ChunkError::PipelineStart { chunk: name, source });
            }
            self.state = ChunkState::Running;
            log::debug!("Started pipeline for chunk {}", name);

            self.monitor.arm();
            let outcome = self.monitor.wait();

            self.state = ChunkState::Closing;
            log::info!("Closing pipeline");
            let stopped = self.pipeline.stop();
            let flushed = self.close_chunk();
            self.rotate();

            if let Err(source) = stopped {
                return Err(ChunkError::PipelineStop { chunk: name, source });
            }
            flushed?;

            self.state = ChunkState::Idle;
            if outcome == MonitorOutcome::Cancelled {
                return Ok(());
            }
        }
    }

    /// Next chunk's expected first frame
    fn relative_zero(&self) -> u64 {
        if self.session.is_count_bounded() {
            self.session.expected_frames * self.chunks_started
        } else {
            self.ledger.global_counter()
        }
    }

    fn loss(&self, frames: u64) -> i64 {
        if self.session.is_count_bounded() {
            self.session.expected_frames as i64 - frames as i64
        } else {
            0
        }
    }

    fn open_chunk(&mut self) -> (String, PathBuf) {
        let relative_zero = self.relative_zero();
        if self.session.is_count_bounded() && self.ledger.global_counter() != relative_zero {
            // Frames that arrived between chunks
            self.warn_frame_mismatch(relative_zero);
            self.ledger.reset(relative_zero);
        }

        let name = Session::chunk_name(self.ledger.global_counter());
        let chunk = Chunk {
            index: self.chunks_started,
            relative_zero,
            video_path: self.session.video_path(&name),
            ledger_path: self.session.ledger_path(&name),
            name,
            closed: false,
            frames: 0,
            loss: 0,
        };
        log::debug!("relative zero: {}", relative_zero);
        let opened = (chunk.name.clone(), chunk.video_path.clone());

        if self.history.len() == CHUNK_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(chunk);
        self.chunks_started += 1;
        opened
    }

    /// Finalize the current chunk once: loss, frame rate estimate and ledger flush
    fn close_chunk(&mut self) -> Result<(), ChunkError> {
        let records = match self.history.back() {
            Some(chunk) if !chunk.closed => self.ledger.take_chunk(),
            _ => return Ok(()),
        };
        let frames = records.frames;
        let loss = self.loss(frames);

        let Some(chunk) = self.history.back_mut() else {
            return Ok(());
        };
        chunk.closed = true;
        chunk.frames = frames;
        chunk.loss = loss;
        self.summary.chunks += 1;
        self.summary.frames_recorded += frames;

        if frames == 0 {
            log::info!("Chunk {} received no frames, no timestamps saved", chunk.name);
            return Ok(());
        }

        let ledger = LedgerFile::new(records.timestamps, loss);
        if let Some(fps) = ledger.estimated_framerate() {
            log::info!("Estimated framerate for the last video: {:.2}Hz", fps);
        }

        write_ledger(&chunk.ledger_path, &ledger).map_err(|source| {
            log::error!("Failed to save timestamps for {}: {}", chunk.name, source);
            ChunkError::Ledger {
                chunk: chunk.name.clone(),
                source,
            }
        })?;
        self.summary.ledgers_written += 1;
        log::info!("Timestamps saved ({})", chunk.ledger_path.display());
        Ok(())
    }

    /// Realign counters for the next chunk
    fn rotate(&mut self) {
        if !self.session.is_count_bounded() {
            self.ledger.reset_chunk_counter();
            return;
        }

        let next_zero = self.relative_zero();
        if self.ledger.global_counter() != next_zero {
            self.warn_frame_mismatch(next_zero);
        }
        self.ledger.reset(next_zero);
    }

    fn warn_frame_mismatch(&mut self, relative_zero: u64) {
        self.summary.resyncs += 1;
        let name = self
            .history
            .back()
            .map(|c| c.name.as_str())
            .unwrap_or("-");
        let frames = self.ledger.chunk_counter();
        log::warn!(
            "Frame count mismatch: video={} counter={} expected_counter={} frames_in_chunk={} expected_in_chunk={} loss={}",
            name,
            self.ledger.global_counter(),
            relative_zero,
            frames,
            self.session.expected_frames,
            self.loss(frames)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::pipeline::FrameCallback;
    use crate::session::{read_ledger, DeviceProperty, PropertyValue};
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    /// Scripted pipeline: on each start, delivers a burst of frames
    /// synchronously, optionally cancelling afterwards.
    #[derive(Default)]
    struct ScriptedPipeline {
        callback: Option<FrameCallback>,
        bursts: VecDeque<u64>,
        cancel_after: Option<(usize, CancelHandle)>,
        fail_start_at: Option<usize>,
        fail_stop: bool,
        starts: Vec<PathBuf>,
        stops: usize,
        properties_seen: Vec<Vec<DeviceProperty>>,
    }

    impl PipelineAdapter for ScriptedPipeline {
        fn set_frame_callback(&mut self, callback: FrameCallback) {
            self.callback = Some(callback);
        }

        fn start(&mut self, target: &Path, properties: &[DeviceProperty]) -> Result<(), PipelineError> {
            if self.fail_start_at == Some(self.starts.len()) {
                return Err(PipelineError::Start("device unplugged".into()));
            }
            self.starts.push(target.to_path_buf());
            self.properties_seen.push(properties.to_vec());

            let burst = self.bursts.pop_front().unwrap_or(0);
            if let Some(callback) = &self.callback {
                for _ in 0..burst {
                    callback();
                }
            }
            if let Some((at, handle)) = &self.cancel_after {
                if *at == self.starts.len() {
                    handle.cancel();
                }
            }
            Ok(())
        }

        fn stop(&mut self) -> Result<(), PipelineError> {
            self.stops += 1;
            if self.fail_stop {
                return Err(PipelineError::Stop("state change failed".into()));
            }
            Ok(())
        }
    }

    /// Delivers frames from its own thread until `stop` clears the flag.
    /// A callback already past the flag check still lands after `stop`.
    struct StreamingPipeline {
        callback: Option<FrameCallback>,
        delivering: Arc<AtomicBool>,
        cancel: Option<(u64, CancelHandle)>,
        worker: Option<std::thread::JoinHandle<()>>,
    }

    impl PipelineAdapter for StreamingPipeline {
        fn set_frame_callback(&mut self, callback: FrameCallback) {
            self.callback = Some(callback);
        }

        fn start(&mut self, _target: &Path, _properties: &[DeviceProperty]) -> Result<(), PipelineError> {
            let callback = self.callback.clone();
            let delivering = self.delivering.clone();
            let cancel = self.cancel.clone();
            delivering.store(true, Ordering::SeqCst);

            self.worker = Some(std::thread::spawn(move || {
                let mut sent = 0u64;
                while delivering.load(Ordering::SeqCst) {
                    if let Some(callback) = &callback {
                        callback();
                    }
                    sent += 1;
                    if let Some((after, handle)) = &cancel {
                        if sent == *after {
                            handle.cancel();
                        }
                    }
                }
            }));
            Ok(())
        }

        fn stop(&mut self) -> Result<(), PipelineError> {
            self.delivering.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Drop for StreamingPipeline {
        fn drop(&mut self) {
            self.delivering.store(false, Ordering::SeqCst);
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
    }

    fn session(dir: &Path, expected: u64) -> Session {
        Session::new(dir, expected, 0.03)
            .unwrap()
            .with_poll_interval(Duration::from_millis(1))
            .unwrap()
    }

    fn controller(
        session: Session,
        bursts: &[u64],
        cancel_after_start: usize,
    ) -> ChunkController<ScriptedPipeline> {
        let pipeline = ScriptedPipeline {
            bursts: bursts.iter().copied().collect(),
            ..Default::default()
        };
        let mut controller = ChunkController::new(session, pipeline);
        let handle = controller.cancel_handle();
        controller.pipeline.cancel_after = Some((cancel_after_start, handle));
        controller
    }

    #[test]
    fn loss_follows_expected_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let mut controller = controller(session(tmp.path(), 50), &[47, 52, 50], 3);

        let summary = controller.run().unwrap();

        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.ledgers_written, 3);
        assert_eq!(summary.frames_recorded, 149);
        let losses: Vec<i64> = controller.chunks().map(|c| c.loss).collect();
        assert_eq!(losses, vec![3, -2, 0]);

        let ledger = read_ledger(&tmp.path().join("000000.cbor")).unwrap();
        assert_eq!(ledger.loss, 3);
        assert_eq!(ledger.frames.len(), 47);
        let ledger = read_ledger(&tmp.path().join("000050.cbor")).unwrap();
        assert_eq!(ledger.loss, -2);
        assert_eq!(ledger.first_frame().map(|f| f.0), Some(50));
        assert_eq!(ledger.last_frame().map(|f| f.0), Some(101));
    }

    #[test]
    fn names_follow_schedule_after_resync() {
        let tmp = tempfile::tempdir().unwrap();
        let mut controller = controller(session(tmp.path(), 50), &[47, 52, 10], 3);
        controller.run().unwrap();

        let names: Vec<&str> = controller.chunks().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["000000", "000050", "000100"]);
        let zeros: Vec<u64> = controller.chunks().map(|c| c.relative_zero).collect();
        assert_eq!(zeros, [0, 50, 100]);
        assert_eq!(
            controller.pipeline().starts,
            vec![
                tmp.path().join("000000.avi"),
                tmp.path().join("000050.avi"),
                tmp.path().join("000100.avi"),
            ]
        );
        // Final rotation realigned to the fourth chunk's relative zero
        assert_eq!(controller.ledger().global_counter(), 150);
        assert_eq!(controller.ledger().chunk_counter(), 0);
    }

    #[test]
    fn unbounded_session_keeps_counting() {
        let tmp = tempfile::tempdir().unwrap();
        let mut controller = controller(session(tmp.path(), 0), &[7, 5], 2);
        controller.run().unwrap();

        let names: Vec<&str> = controller.chunks().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["000000", "000007"]);
        assert!(controller.chunks().all(|c| c.loss == 0));
        assert_eq!(controller.ledger().global_counter(), 12);
        assert_eq!(read_ledger(&tmp.path().join("000007.cbor")).unwrap().frames.len(), 5);
    }

    #[test]
    fn empty_chunk_writes_no_ledger() {
        let tmp = tempfile::tempdir().unwrap();
        let mut controller = controller(session(tmp.path(), 50), &[0], 1);

        let summary = controller.run().unwrap();

        assert_eq!(summary.chunks, 1);
        assert_eq!(summary.ledgers_written, 0);
        assert!(!tmp.path().join("000000.cbor").exists());
        assert_eq!(controller.current_chunk().unwrap().loss, 50);
    }

    #[test]
    fn cancel_mid_chunk_flushes_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut controller = controller(session(tmp.path(), 50), &[20], 1);

        let summary = controller.run().unwrap();

        assert_eq!(controller.state(), ChunkState::Stopped);
        assert_eq!(summary.ledgers_written, 1);
        assert_eq!(controller.pipeline().starts.len(), 1);
        assert_eq!(controller.pipeline().stops, 1);
        assert!(controller.current_chunk().unwrap().closed);
        assert_eq!(read_ledger(&tmp.path().join("000000.cbor")).unwrap().frames.len(), 20);

        // A second close of the same chunk is a no-op
        controller.close_chunk().unwrap();
        assert_eq!(controller.summary.ledgers_written, 1);
        assert_eq!(controller.summary.chunks, 1);
    }

    #[test]
    fn cancel_before_run_opens_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut controller = controller(session(tmp.path(), 50), &[10], 1);
        controller.cancel_handle().cancel();

        let summary = controller.run().unwrap();

        assert_eq!(summary, RunSummary::default());
        assert_eq!(controller.chunks_started(), 0);
        assert!(controller.pipeline().starts.is_empty());
    }

    #[test]
    fn start_failure_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let mut controller = controller(session(tmp.path(), 50), &[50, 50], 5);
        controller.pipeline.fail_start_at = Some(1);

        match controller.run() {
            Err(ChunkError::PipelineStart { chunk, .. }) => assert_eq!(chunk, "000050"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(controller.state(), ChunkState::Stopped);
        assert!(tmp.path().join("000000.cbor").exists());
    }

    #[test]
    fn ledger_failure_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("does-not-exist");
        let mut controller = controller(session(&missing, 50), &[12], 1);

        match controller.run() {
            Err(ChunkError::Ledger { chunk, .. }) => assert_eq!(chunk, "000000"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(controller.pipeline().stops, 1);
    }

    #[test]
    fn properties_are_applied_every_chunk() {
        let tmp = tempfile::tempdir().unwrap();
        let properties = vec![
            DeviceProperty::new("Trigger Mode", PropertyValue::Bool(true)),
            DeviceProperty::new("Exposure Time (us)", PropertyValue::Integer(4000)),
        ];
        let session = session(tmp.path(), 5).with_properties(properties.clone());
        let mut controller = controller(session, &[5, 5], 2);
        controller.run().unwrap();

        assert_eq!(controller.pipeline().properties_seen, vec![properties.clone(), properties]);
    }

    #[test]
    fn ledger_agrees_with_counts_when_frames_race_the_close() {
        for run in 0..100 {
            let tmp = tempfile::tempdir().unwrap();
            let expected = 1_000_000;
            let pipeline = StreamingPipeline {
                callback: None,
                delivering: Arc::new(AtomicBool::new(false)),
                cancel: None,
                worker: None,
            };
            let mut controller = ChunkController::new(session(tmp.path(), expected), pipeline);
            controller.pipeline.cancel = Some((200, controller.cancel_handle()));

            controller.run().unwrap();

            let chunk = controller.current_chunk().unwrap();
            let ledger = read_ledger(&chunk.ledger_path).unwrap();
            assert_eq!(ledger.frames.len() as u64, chunk.frames, "run {}", run);
            assert_eq!(ledger.loss, expected as i64 - chunk.frames as i64, "run {}", run);
        }
    }

    #[test]
    fn stop_failure_still_flushes_the_chunk() {
        let tmp = tempfile::tempdir().unwrap();
        let mut controller = controller(session(tmp.path(), 50), &[30, 50], 5);
        controller.pipeline.fail_stop = true;

        match controller.run() {
            Err(ChunkError::PipelineStop { chunk, .. }) => assert_eq!(chunk, "000000"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(controller.state(), ChunkState::Stopped);
        assert_eq!(controller.pipeline().starts.len(), 1);

        let ledger = read_ledger(&tmp.path().join("000000.cbor")).unwrap();
        assert_eq!(ledger.frames.len(), 30);
        assert_eq!(ledger.loss, 20);
    }

    #[test]
    fn frame_count_mismatch_forces_resync() {
        let tmp = tempfile::tempdir().unwrap();
        // Short, long and exact chunks: only the first two are off schedule
        let mut controller = controller(session(tmp.path(), 50), &[47, 52, 50], 3);

        let summary = controller.run().unwrap();

        assert_eq!(summary.resyncs, 2);
        let names: Vec<&str> = controller.chunks().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["000000", "000050", "000100"]);
        assert_eq!(controller.ledger().global_counter(), 150);
    }

    #[test]
    fn chunk_history_is_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let bursts = vec![1; CHUNK_HISTORY + 8];
        let mut controller = controller(session(tmp.path(), 1), &bursts, CHUNK_HISTORY + 8);

        let summary = controller.run().unwrap();

        assert_eq!(summary.chunks, CHUNK_HISTORY + 8);
        assert_eq!(controller.chunks_started(), (CHUNK_HISTORY + 8) as u64);
        assert_eq!(controller.chunks().count(), CHUNK_HISTORY);
        assert_eq!(controller.chunks().next().map(|c| c.index), Some(8));
        assert_eq!(controller.current_chunk().map(|c| c.name.as_str()), Some("000039"));
    }
}
