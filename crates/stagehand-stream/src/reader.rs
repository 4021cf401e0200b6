//! Streaming WAV source reader.

use crate::error::{Error, Result};
use crate::ring::Frame;
use hound::{SampleFormat, WavReader};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Sequential reader over a WAV file with seek support.
///
/// Integer PCM of 8, 16, 24 or 32 bits and 32-bit float are converted to
/// `f32`. Mono is duplicated to both sides; reads past the end of the file
/// yield silence.
pub struct SourceReader {
    reader: WavReader<BufReader<File>>,
    path: PathBuf,
    channels: u16,
    sample_rate: u32,
    format: SampleFormat,
    bits: u16,
    len_frames: u64,
    position: u64,
}

impl std::fmt::Debug for SourceReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceReader")
            .field("path", &self.path)
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .field("len_frames", &self.len_frames)
            .field("position", &self.position)
            .finish()
    }
}

impl SourceReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = WavReader::open(&path)?;
        let spec = reader.spec();

        if spec.channels == 0 || spec.channels > 2 {
            return Err(Error::UnsupportedFormat(format!(
                "{} channels in {}",
                spec.channels,
                path.display()
            )));
        }
        match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Int, 8 | 16 | 24 | 32) | (SampleFormat::Float, 32) => {}
            (format, bits) => {
                return Err(Error::UnsupportedFormat(format!(
                    "{bits}-bit {format:?} in {}",
                    path.display()
                )))
            }
        }

        let len_frames = reader.duration() as u64;
        Ok(Self {
            reader,
            path,
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            format: spec.sample_format,
            bits: spec.bits_per_sample,
            len_frames,
            position: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len_frames(&self) -> u64 {
        self.len_frames
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes of file data per frame.
    pub fn bytes_per_frame(&self) -> u64 {
        self.channels as u64 * (self.bits as u64).div_ceil(8)
    }

    /// Move the read cursor. Positions past the end clamp to the end.
    pub fn seek(&mut self, frame: u64) -> Result<()> {
        let target = frame.min(self.len_frames);
        self.reader.seek(target as u32)?;
        self.position = target;
        Ok(())
    }

    /// Append `frames` frames to `out`. Returns how many came from the file;
    /// the rest are silence.
    pub fn read(&mut self, out: &mut Vec<Frame>, frames: usize) -> Result<usize> {
        let from_file = (self.len_frames.saturating_sub(self.position) as usize).min(frames);
        let start = out.len();

        if from_file > 0 {
            let samples = from_file * self.channels as usize;
            match self.format {
                SampleFormat::Float => {
                    let mut it = self.reader.samples::<f32>().take(samples);
                    collect_frames(&mut it, self.channels, out, |s: f32| s)?;
                }
                SampleFormat::Int => {
                    let scale = 1.0 / (1u64 << (self.bits - 1)) as f32;
                    let mut it = self.reader.samples::<i32>().take(samples);
                    collect_frames(&mut it, self.channels, out, |s: i32| s as f32 * scale)?;
                }
            }
        }

        let read = out.len() - start;
        self.position += read as u64;
        out.resize(start + frames, (0.0, 0.0));
        Ok(read)
    }
}

fn collect_frames<S, I, F>(samples: &mut I, channels: u16, out: &mut Vec<Frame>, convert: F) -> Result<()>
where
    I: Iterator<Item = std::result::Result<S, hound::Error>>,
    F: Fn(S) -> f32,
{
    if channels == 1 {
        for s in samples {
            let v = convert(s?);
            out.push((v, v));
        }
    } else {
        while let Some(left) = samples.next() {
            let left = convert(left?);
            let right = match samples.next() {
                Some(right) => convert(right?),
                None => left,
            };
            out.push((left, right));
        }
    }
    Ok(())
}
