//! Butler thread for asynchronous disk I/O.
//!
//! Refills playback rings ahead of their read cursors and flushes capture
//! rings behind their write cursors. May block on the filesystem freely; it
//! only touches the far end of each ring.

use crate::capture::{create_wav_writer, finish_capture, flush_all_captures, CaptureState};
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::metrics::IOMetrics;
use crate::reader::SourceReader;
use crate::refill::{refill_all, refill_all_parallel, SourceSlot};
use crate::request::{ButlerCommand, ButlerState, CaptureId, SourceId};
use crate::ring::{capture_ring, playback_ring, CaptureProducer, Frame, PlaybackConsumer, SourceMonitor, SourceStatus};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thread_priority::ThreadPriority;

const IDLE_WAIT: Duration = Duration::from_millis(2);
const PAUSED_WAIT: Duration = Duration::from_millis(10);

/// Handle to the disk I/O thread.
pub struct Butler {
    command_tx: Sender<ButlerCommand>,
    monitors: Arc<DashMap<SourceId, SourceMonitor>>,
    metrics: Arc<IOMetrics>,
    thread_handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    config: StreamConfig,
    sample_rate: u32,
}

impl Butler {
    /// Spawn the butler for a session running at `sample_rate`.
    pub fn spawn(config: StreamConfig, sample_rate: u32, channel_capacity: usize) -> Result<Self> {
        config.validate()?;
        let (tx, rx) = bounded(channel_capacity.max(1));
        let metrics = Arc::new(IOMetrics::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let state = Arc::new(AtomicU8::new(ButlerState::Running as u8));

        let handle = {
            let metrics = Arc::clone(&metrics);
            let shutdown = Arc::clone(&shutdown);
            let state = Arc::clone(&state);
            thread::Builder::new()
                .name("stagehand-butler".into())
                .spawn(move || {
                    let _ = thread_priority::set_current_thread_priority(ThreadPriority::Max);
                    butler_loop(rx, &metrics, &shutdown, &state, config);
                })?
        };
        tracing::info!(
            "butler started: {:.2} s rings at {} Hz",
            config.read_buffer_seconds,
            sample_rate
        );

        Ok(Self {
            command_tx: tx,
            monitors: Arc::new(DashMap::new()),
            metrics,
            thread_handle: Some(handle),
            shutdown,
            state,
            config,
            sample_rate,
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn state(&self) -> ButlerState {
        ButlerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn send(&self, cmd: ButlerCommand) -> Result<()> {
        self.command_tx
            .send(cmd)
            .map_err(|_| Error::Butler("butler thread has exited".into()))
    }

    /// Open a WAV file for streaming. The returned consumer stays silent until
    /// its first `seek`.
    pub fn open_source(&self, path: impl AsRef<Path>) -> Result<PlaybackConsumer> {
        let reader = SourceReader::open(path)?;
        if reader.sample_rate() != self.sample_rate {
            tracing::warn!(
                "{} is {} Hz, session runs at {} Hz; playing without conversion",
                reader.path().display(),
                reader.sample_rate(),
                self.sample_rate
            );
        }
        let id = SourceId::generate();
        let (producer, consumer) = playback_ring(id, self.config.ring_frames(self.sample_rate));
        self.monitors.insert(id, consumer.monitor());
        tracing::debug!("opening source {} from {}", id.0, reader.path().display());
        self.send(ButlerCommand::OpenSource {
            id,
            reader: Box::new(reader),
            producer,
        })?;
        Ok(consumer)
    }

    pub fn close_source(&self, id: SourceId) -> Result<()> {
        self.monitors.remove(&id);
        self.send(ButlerCommand::CloseSource(id))
    }

    pub fn source_status(&self, id: SourceId) -> Option<SourceStatus> {
        self.monitors.get(&id).map(|m| m.status())
    }

    /// Create a capture ring whose contents the butler writes to `path` as
    /// 32-bit float WAV. `channels` is 1 or 2.
    pub fn open_capture(&self, path: impl AsRef<Path>, channels: u16) -> Result<CaptureProducer> {
        if !(1..=2).contains(&channels) {
            return Err(Error::UnsupportedFormat(format!("{channels} capture channels")));
        }
        let id = CaptureId::generate();
        let (producer, consumer) =
            capture_ring(id, channels, self.config.ring_frames(self.sample_rate));
        self.send(ButlerCommand::RegisterCapture {
            id,
            consumer,
            path: path.as_ref().to_path_buf(),
            sample_rate: self.sample_rate,
            channels,
        })?;
        Ok(producer)
    }

    /// Flush and finalise a capture. Blocks until the file is complete and
    /// returns the number of frames written.
    pub fn finish_capture(&self, id: CaptureId) -> Result<u64> {
        let (reply, done) = bounded(1);
        self.send(ButlerCommand::FinishCapture { id, reply })?;
        done.recv()
            .map_err(|_| Error::Butler("butler exited before finishing capture".into()))?
    }

    /// Block until every capture's pending data is on disk.
    pub fn wait_for_completion(&self) -> Result<()> {
        let (reply, done) = bounded(1);
        self.send(ButlerCommand::WaitForCompletion(reply))?;
        done.recv()
            .map_err(|_| Error::Butler("butler exited before completing".into()))
    }

    pub fn pause(&self) -> Result<()> {
        self.send(ButlerCommand::Pause)
    }

    pub fn run(&self) -> Result<()> {
        self.send(ButlerCommand::Run)
    }

    pub fn metrics(&self) -> Arc<IOMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Flush captures and join the thread. Idempotent.
    pub fn stop(&mut self) {
        let Some(handle) = self.thread_handle.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.command_tx.send(ButlerCommand::Shutdown);
        let _ = handle.join();
        self.monitors.clear();
        tracing::info!("butler stopped");
    }
}

impl Drop for Butler {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Work {
    sources: Vec<SourceSlot>,
    captures: HashMap<CaptureId, CaptureState>,
    paused: bool,
    scratch: Vec<Frame>,
}

fn butler_loop(
    rx: Receiver<ButlerCommand>,
    metrics: &IOMetrics,
    shutdown: &AtomicBool,
    state: &AtomicU8,
    config: StreamConfig,
) {
    let mut work = Work {
        sources: Vec::new(),
        captures: HashMap::new(),
        paused: false,
        scratch: Vec::with_capacity(config.chunk_frames * 4),
    };
    let mut worked = true;

    loop {
        // Wait briefly for a command when the last pass found nothing to do.
        let first = if worked {
            match rx.try_recv() {
                Ok(cmd) => Some(cmd),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => break,
            }
        } else {
            let wait = if work.paused { PAUSED_WAIT } else { IDLE_WAIT };
            match rx.recv_timeout(wait) {
                Ok(cmd) => Some(cmd),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        };

        let mut exit = false;
        if let Some(cmd) = first {
            exit = handle_command(cmd, &mut work, metrics, state, &config);
            while !exit {
                match rx.try_recv() {
                    Ok(cmd) => exit = handle_command(cmd, &mut work, metrics, state, &config),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        exit = true;
                        break;
                    }
                }
            }
        }
        if exit || shutdown.load(Ordering::SeqCst) {
            break;
        }

        if work.paused {
            worked = false;
            continue;
        }

        worked = if config.parallel_io && work.sources.len() >= 3 {
            refill_all_parallel(&mut work.sources, &config, metrics)
        } else {
            refill_all(&mut work.sources, &config, metrics, &mut work.scratch)
        };

        flush_all_captures(
            &mut work.captures,
            metrics,
            config.flush_threshold,
            false,
            &mut work.scratch,
        );
    }

    for (_, capture) in work.captures.drain() {
        if let Err(e) = finish_capture(capture, metrics, &mut work.scratch) {
            tracing::error!("finalising capture on shutdown failed: {}", e);
        }
    }
    state.store(ButlerState::Stopped as u8, Ordering::SeqCst);
}

/// Returns true when the loop should exit.
fn handle_command(
    cmd: ButlerCommand,
    work: &mut Work,
    metrics: &IOMetrics,
    state: &AtomicU8,
    config: &StreamConfig,
) -> bool {
    match cmd {
        ButlerCommand::Run => {
            work.paused = false;
            state.store(ButlerState::Running as u8, Ordering::SeqCst);
        }
        ButlerCommand::Pause => {
            work.paused = true;
            state.store(ButlerState::Paused as u8, Ordering::SeqCst);
        }
        ButlerCommand::WaitForCompletion(reply) => {
            flush_all_captures(
                &mut work.captures,
                metrics,
                config.flush_threshold,
                true,
                &mut work.scratch,
            );
            let _ = reply.send(());
        }
        ButlerCommand::OpenSource {
            id,
            reader,
            producer,
        } => {
            work.sources.push(SourceSlot::new(id, reader, producer));
        }
        ButlerCommand::CloseSource(id) => {
            work.sources.retain(|slot| slot.id != id);
        }
        ButlerCommand::RegisterCapture {
            id,
            consumer,
            path,
            sample_rate,
            channels,
        } => match create_wav_writer(&path, sample_rate, channels) {
            Ok(writer) => {
                tracing::info!("capturing to {}", path.display());
                work.captures.insert(
                    id,
                    CaptureState {
                        consumer,
                        writer,
                        path,
                        channels,
                    },
                );
            }
            Err(e) => tracing::error!("cannot create capture file {}: {}", path.display(), e),
        },
        ButlerCommand::FinishCapture { id, reply } => {
            let result = match work.captures.remove(&id) {
                Some(capture) => finish_capture(capture, metrics, &mut work.scratch),
                None => Err(Error::Butler(format!("unknown capture {}", id.0))),
            };
            let _ = reply.send(result);
        }
        ButlerCommand::Shutdown => return true,
    }
    false
}
