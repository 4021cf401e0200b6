//! CPAL-backed hardware backends: ALSA, JACK and the platform default host.

use super::claims::DeviceClaim;
use super::{Backend, DeviceSession, PeriodCallback, PeriodIo};
use crate::config::{BackendKind, DeviceConfig, DuplexMode};
use crate::error::DriverError;
use crate::lockfree::AtomicFlag;
use crate::pool::{BufferPool, PoolStats};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::Sample;
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Wrapper to hold `cpal::Stream` in a `Send` context.
///
/// # Safety
/// `cpal::Stream` is `!Send` due to platform internals. The driver is only
/// touched from the thread holding the device manager's lock.
struct StreamHandle(#[allow(dead_code)] cpal::Stream);

unsafe impl Send for StreamHandle {}

/// Same reasoning as [`StreamHandle`].
struct DeviceHandle(cpal::Device);

unsafe impl Send for DeviceHandle {}

pub struct CpalDriver {
    kind: BackendKind,
    stats: Arc<PoolStats>,
    claim: Option<DeviceClaim>,
    session: Option<DeviceSession>,
    device: Option<DeviceHandle>,
    output_format: Option<cpal::SampleFormat>,
    input_format: Option<cpal::SampleFormat>,
    pools: Option<(BufferPool, BufferPool)>,
    streams: Vec<StreamHandle>,
    lost: Arc<AtomicFlag>,
    xruns: Arc<AtomicU32>,
}

impl CpalDriver {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            stats: PoolStats::new(),
            claim: None,
            session: None,
            device: None,
            output_format: None,
            input_format: None,
            pools: None,
            streams: Vec::new(),
            lost: Arc::new(AtomicFlag::new(false)),
            xruns: Arc::new(AtomicU32::new(0)),
        }
    }

    fn allocate_pools(&self, session: &DeviceSession) -> (BufferPool, BufferPool) {
        (
            BufferPool::new(
                session.input_channels,
                session.period_size,
                session.period_count,
                Arc::clone(&self.stats),
            ),
            BufferPool::new(
                session.output_channels,
                session.period_size,
                session.period_count,
                Arc::clone(&self.stats),
            ),
        )
    }

    /// Build and start the streams for `session`. Everything built is
    /// dropped on error.
    fn build_streams(
        &self,
        session: &DeviceSession,
        (input, output): (BufferPool, BufferPool),
        callback: Box<dyn PeriodCallback>,
    ) -> Result<Vec<cpal::Stream>, DriverError> {
        let device = &self.device.as_ref().ok_or(DriverError::Unknown)?.0;

        let stream_config = |channels: usize| cpal::StreamConfig {
            channels: channels as u16,
            sample_rate: cpal::SampleRate(session.sample_rate.as_u32()),
            buffer_size: cpal::BufferSize::Fixed(session.period_size as u32),
        };

        let mut engine = PeriodEngine {
            callback,
            scratch: vec![0.0; session.period_size * session.input_channels.max(1)],
            input,
            output,
            period_size: session.period_size,
            capture: None,
            xruns: Arc::clone(&self.xruns),
        };

        let mut streams = Vec::new();
        match session.duplex {
            DuplexMode::Full => {
                let ring = HeapRb::<f32>::new(
                    session.period_size * session.input_channels * session.period_count * 2,
                );
                let (prod, cons) = ring.split();
                engine.capture = Some(cons);
                streams.push(build_capture_feed(
                    device,
                    &stream_config(session.input_channels),
                    self.input_format,
                    prod,
                    &self.lost,
                    &self.xruns,
                )?);
                streams.push(build_output(
                    device,
                    &stream_config(session.output_channels),
                    self.output_format,
                    engine,
                    &self.lost,
                    &self.xruns,
                )?);
            }
            DuplexMode::Playback => {
                streams.push(build_output(
                    device,
                    &stream_config(session.output_channels),
                    self.output_format,
                    engine,
                    &self.lost,
                    &self.xruns,
                )?);
            }
            DuplexMode::Capture => {
                streams.push(build_capture_driven(
                    device,
                    &stream_config(session.input_channels),
                    self.input_format,
                    engine,
                    &self.lost,
                    &self.xruns,
                )?);
            }
        }

        for stream in &streams {
            stream.play().map_err(|e| classify(&e.to_string()))?;
        }
        Ok(streams)
    }
}

impl Backend for CpalDriver {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn open(&mut self, config: &DeviceConfig) -> Result<DeviceSession, DriverError> {
        self.close();

        let host = host_for(self.kind)?;
        let device = find_device(&host, &config.device_id, config.duplex)?;
        let claim = DeviceClaim::acquire(&config.device_id)?;
        let rate = config.sample_rate.as_u32();

        let output_format = if config.duplex.has_playback() {
            let ranges = device
                .supported_output_configs()
                .map_err(|e| classify(&e.to_string()))?;
            Some(pick_format(ranges, config.output_channels, rate).ok_or(DriverError::UnsupportedConfig)?)
        } else {
            None
        };
        let input_format = if config.duplex.has_capture() {
            let ranges = device
                .supported_input_configs()
                .map_err(|e| classify(&e.to_string()))?;
            Some(pick_format(ranges, config.input_channels, rate).ok_or(DriverError::UnsupportedConfig)?)
        } else {
            None
        };

        let name = device.name().unwrap_or_else(|_| config.device_id.clone());
        let session = DeviceSession::from_config(self.kind, &name, config);
        tracing::info!(
            "{} opened '{}' at {} Hz, {} frames x {}",
            self.kind.name(),
            name,
            rate,
            session.period_size,
            session.period_count
        );

        self.pools = Some(self.allocate_pools(&session));
        self.lost.set(false);
        self.device = Some(DeviceHandle(device));
        self.output_format = output_format;
        self.input_format = input_format;
        self.claim = Some(claim);
        self.session = Some(session.clone());
        Ok(session)
    }

    fn start(&mut self, callback: Box<dyn PeriodCallback>) -> Result<(), DriverError> {
        if !self.streams.is_empty() {
            return Ok(());
        }
        let session = self.session.clone().ok_or(DriverError::Unknown)?;
        if self.device.is_none() {
            return Err(DriverError::Unknown);
        }
        let pools = self.pools.take().ok_or(DriverError::Unknown)?;

        match self.build_streams(&session, pools, callback) {
            Ok(streams) => {
                self.streams = streams.into_iter().map(StreamHandle).collect();
                Ok(())
            }
            Err(e) => {
                // The pools were dropped with the half-built streams.
                self.pools = Some(self.allocate_pools(&session));
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        if self.streams.is_empty() {
            return;
        }
        // Dropping the streams joins CPAL's callback threads.
        self.streams.clear();
        if let Some(session) = self.session.clone() {
            self.pools = Some(self.allocate_pools(&session));
        }
        tracing::debug!("{} stopped", self.kind.name());
    }

    fn close(&mut self) {
        self.stop();
        self.pools = None;
        self.device = None;
        self.session = None;
        self.claim = None;
    }

    fn session(&self) -> Option<&DeviceSession> {
        self.session.as_ref()
    }

    fn device_lost(&self) -> bool {
        self.lost.get()
    }

    fn pool_stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }
}

impl Drop for CpalDriver {
    fn drop(&mut self) {
        self.close();
    }
}

/// Per-period state moved into the CPAL callback.
struct PeriodEngine {
    callback: Box<dyn PeriodCallback>,
    input: BufferPool,
    output: BufferPool,
    period_size: usize,
    /// Captured samples from the input stream in full-duplex mode.
    capture: Option<HeapCons<f32>>,
    scratch: Vec<f32>,
    xruns: Arc<AtomicU32>,
}

impl PeriodEngine {
    fn take_xrun(&self) -> bool {
        self.xruns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Output-driven periods: render into the device buffer in period-sized chunks.
    fn render<T>(&mut self, data: &mut [T], channels: usize)
    where
        T: cpal::SizedSample + cpal::FromSample<f32>,
    {
        for chunk in data.chunks_mut(self.period_size * channels) {
            let frames = chunk.len() / channels;
            let mut hardware_xrun = self.take_xrun();

            let mut input = self.input.lease(frames);
            if let Some(cons) = self.capture.as_mut() {
                let in_channels = input.channels();
                let wanted = frames * in_channels;
                let got = cons.pop_slice(&mut self.scratch[..wanted]);
                if got < wanted {
                    self.scratch[got..wanted].fill(0.0);
                    hardware_xrun = true;
                }
                input.deinterleave_from(&self.scratch[..wanted], in_channels);
            }

            let mut io = PeriodIo {
                input,
                output: self.output.lease(frames),
                frames,
                hardware_xrun,
            };
            self.callback.process(&mut io);
            io.output
                .interleave_into(chunk, channels, |s| T::from_sample(s));
        }
    }

    /// Capture-only periods: the input stream drives the callback.
    fn capture<T>(&mut self, data: &[T], channels: usize)
    where
        T: cpal::SizedSample,
        f32: cpal::FromSample<T>,
    {
        for chunk in data.chunks(self.period_size * channels) {
            let frames = chunk.len() / channels;
            let hardware_xrun = self.take_xrun();

            for (dst, s) in self.scratch.iter_mut().zip(chunk) {
                *dst = s.to_sample::<f32>();
            }
            let mut input = self.input.lease(frames);
            input.deinterleave_from(&self.scratch[..chunk.len()], channels);

            let mut io = PeriodIo {
                input,
                output: self.output.lease(frames),
                frames,
                hardware_xrun,
            };
            self.callback.process(&mut io);
        }
    }
}

fn error_handler(
    lost: &Arc<AtomicFlag>,
    xruns: &Arc<AtomicU32>,
) -> impl FnMut(cpal::StreamError) + Send + 'static {
    let lost = Arc::clone(lost);
    let xruns = Arc::clone(xruns);
    move |err| {
        if let cpal::StreamError::DeviceNotAvailable = err {
            lost.set(true);
        } else {
            xruns.fetch_add(1, Ordering::AcqRel);
        }
    }
}

fn build_output(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: Option<cpal::SampleFormat>,
    engine: PeriodEngine,
    lost: &Arc<AtomicFlag>,
    xruns: &Arc<AtomicU32>,
) -> Result<cpal::Stream, DriverError> {
    match format {
        Some(cpal::SampleFormat::I16) => build_output_typed::<i16>(device, config, engine, lost, xruns),
        _ => build_output_typed::<f32>(device, config, engine, lost, xruns),
    }
}

fn build_output_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut engine: PeriodEngine,
    lost: &Arc<AtomicFlag>,
    xruns: &Arc<AtomicU32>,
) -> Result<cpal::Stream, DriverError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels as usize;
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    engine.render(data, channels);
                }));
                if result.is_err() {
                    data.fill(T::EQUILIBRIUM);
                }
            },
            error_handler(lost, xruns),
            None,
        )
        .map_err(map_build_error)
}

fn build_capture_driven(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: Option<cpal::SampleFormat>,
    engine: PeriodEngine,
    lost: &Arc<AtomicFlag>,
    xruns: &Arc<AtomicU32>,
) -> Result<cpal::Stream, DriverError> {
    match format {
        Some(cpal::SampleFormat::I16) => {
            build_capture_driven_typed::<i16>(device, config, engine, lost, xruns)
        }
        _ => build_capture_driven_typed::<f32>(device, config, engine, lost, xruns),
    }
}

fn build_capture_driven_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut engine: PeriodEngine,
    lost: &Arc<AtomicFlag>,
    xruns: &Arc<AtomicU32>,
) -> Result<cpal::Stream, DriverError>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let channels = config.channels as usize;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    engine.capture(data, channels);
                }));
            },
            error_handler(lost, xruns),
            None,
        )
        .map_err(map_build_error)
}

fn build_capture_feed(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: Option<cpal::SampleFormat>,
    prod: HeapProd<f32>,
    lost: &Arc<AtomicFlag>,
    xruns: &Arc<AtomicU32>,
) -> Result<cpal::Stream, DriverError> {
    match format {
        Some(cpal::SampleFormat::I16) => build_capture_feed_typed::<i16>(device, config, prod, lost, xruns),
        _ => build_capture_feed_typed::<f32>(device, config, prod, lost, xruns),
    }
}

/// Full duplex: the input stream only forwards samples to the output callback.
fn build_capture_feed_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut prod: HeapProd<f32>,
    lost: &Arc<AtomicFlag>,
    xruns: &Arc<AtomicU32>,
) -> Result<cpal::Stream, DriverError>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let overflow = Arc::clone(xruns);
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                for s in data {
                    if prod.try_push(s.to_sample::<f32>()).is_err() {
                        overflow.fetch_add(1, Ordering::AcqRel);
                        break;
                    }
                }
            },
            error_handler(lost, xruns),
            None,
        )
        .map_err(map_build_error)
}

fn host_for(kind: BackendKind) -> Result<cpal::Host, DriverError> {
    match kind {
        #[cfg(target_os = "linux")]
        BackendKind::Alsa => {
            cpal::host_from_id(cpal::HostId::Alsa).map_err(|_| DriverError::DeviceNotFound)
        }
        #[cfg(all(feature = "jack", target_os = "linux"))]
        BackendKind::Jack => {
            cpal::host_from_id(cpal::HostId::Jack).map_err(|_| DriverError::DeviceNotFound)
        }
        BackendKind::PortAudio => Ok(cpal::default_host()),
        _ => Err(DriverError::DeviceNotFound),
    }
}

fn find_device(
    host: &cpal::Host,
    device_id: &str,
    duplex: DuplexMode,
) -> Result<cpal::Device, DriverError> {
    if device_id.is_empty() || device_id == "default" {
        let device = if duplex.has_playback() {
            host.default_output_device()
        } else {
            host.default_input_device()
        };
        return device.ok_or(DriverError::DeviceNotFound);
    }

    host.devices()
        .map_err(|e| classify(&e.to_string()))?
        .find(|d| d.name().map(|n| n == device_id).unwrap_or(false))
        .ok_or(DriverError::DeviceNotFound)
}

/// Pick a sample format for an exact channel count and rate, preferring f32.
fn pick_format(
    ranges: impl Iterator<Item = cpal::SupportedStreamConfigRange>,
    channels: usize,
    rate: u32,
) -> Option<cpal::SampleFormat> {
    let mut fallback = None;
    for range in ranges {
        if range.channels() as usize != channels
            || range.min_sample_rate().0 > rate
            || range.max_sample_rate().0 < rate
        {
            continue;
        }
        match range.sample_format() {
            cpal::SampleFormat::F32 => return Some(cpal::SampleFormat::F32),
            cpal::SampleFormat::I16 => fallback = Some(cpal::SampleFormat::I16),
            _ => {}
        }
    }
    fallback
}

pub(super) fn list_devices(kind: BackendKind) -> Result<Vec<String>, DriverError> {
    let host = host_for(kind)?;
    let devices = host.devices().map_err(|e| classify(&e.to_string()))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

fn map_build_error(err: cpal::BuildStreamError) -> DriverError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => DriverError::DeviceNotFound,
        cpal::BuildStreamError::StreamConfigNotSupported
        | cpal::BuildStreamError::InvalidArgument => DriverError::UnsupportedConfig,
        other => classify(&other.to_string()),
    }
}

/// Map a backend's error text to a driver error.
fn classify(message: &str) -> DriverError {
    let msg = message.to_ascii_lowercase();
    if msg.contains("busy") {
        DriverError::DeviceBusy
    } else if msg.contains("permission") || msg.contains("denied") {
        DriverError::PermissionDenied
    } else if msg.contains("no such") || msg.contains("not found") || msg.contains("not available")
    {
        DriverError::DeviceNotFound
    } else {
        DriverError::Unknown
    }
}
