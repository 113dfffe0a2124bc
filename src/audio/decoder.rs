//! # Audio Decoding
//!
//! Turns the bytes of an uploaded file into normalized PCM: 32-bit floats in
//! `[-1.0, 1.0]`, mono, at the target sample rate (16 kHz for Whisper).
//!
//! ## Supported Inputs:
//! - Anything symphonia can probe: WAV, MP3, FLAC, OGG/Vorbis, AAC/M4A, ...
//!   The file extension is passed along as a probe hint.
//! - **Raw PCM**: headerless 16-bit little-endian mono at the target rate
//!   (files named `*.pcm` / `*.raw`)
//!
//! ## Processing Steps:
//! 1. Probe the container and pick the first audio track
//! 2. Decode every packet of that track to interleaved float samples
//! 3. Down-mix all channels to mono by averaging
//! 4. Resample to the target rate

use crate::audio::resampler::resample_mono;
use crate::error::DecodeError;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

/// Decode capability consumed by the session controller.
pub trait AudioDecoder: Send + Sync + 'static {
    /// Decode a whole file. `file_name` is only used as a format hint.
    fn decode(&self, file_name: &str, bytes: &[u8]) -> Result<Vec<f32>, DecodeError>;
}

/// Symphonia-backed decoder with a raw-PCM fallback.
#[derive(Debug, Clone)]
pub struct MediaDecoder {
    target_rate: u32,
}

impl Default for MediaDecoder {
    fn default() -> Self {
        Self::new(16000)
    }
}

impl MediaDecoder {
    pub fn new(target_rate: u32) -> Self {
        Self { target_rate }
    }

    fn decode_container(&self, file_name: &str, bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
        let source = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = extension(file_name) {
            hint.with_extension(&extension);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, source, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| classify(e, file_name))?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| DecodeError::Unsupported("no audio track".to_string()))?;
        let track_id = track.id;
        let declared_rate = track.codec_params.sample_rate;

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| classify(e, file_name))?;

        let mut mono = Vec::new();
        let mut decoded_rate = None;
        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(classify(e, file_name)),
            };
            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                // A damaged frame is skipped, the rest of the stream is still usable
                Err(SymphoniaError::DecodeError(e)) => {
                    debug!(file = file_name, "Skipping undecodable packet: {}", e);
                    continue;
                }
                Err(e) => return Err(classify(e, file_name)),
            };

            let spec = *decoded.spec();
            decoded_rate.get_or_insert(spec.rate);
            let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            buffer.copy_interleaved_ref(decoded);
            mono.extend(downmix(buffer.samples(), spec.channels.count()));
        }

        let source_rate = declared_rate
            .or(decoded_rate)
            .ok_or_else(|| DecodeError::Corrupt("unknown sample rate".to_string()))?;

        debug!(
            file = file_name,
            source_rate,
            samples = mono.len(),
            "Decoded audio"
        );

        resample_mono(&mono, source_rate, self.target_rate)
    }

    fn decode_raw(&self, bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
        if bytes.len() % 2 != 0 {
            return Err(DecodeError::Corrupt("raw PCM length must be even for 16-bit samples".to_string()));
        }

        let mut cursor = Cursor::new(bytes);
        let mut samples = Vec::with_capacity(bytes.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }
        Ok(pcm16_to_float(&samples))
    }
}

impl AudioDecoder for MediaDecoder {
    fn decode(&self, file_name: &str, bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }

        let samples = match extension(file_name).as_deref() {
            Some("pcm" | "raw") => self.decode_raw(bytes)?,
            _ => self.decode_container(file_name, bytes)?,
        };

        if samples.is_empty() {
            return Err(DecodeError::NoSamples);
        }
        Ok(samples)
    }
}

fn extension(file_name: &str) -> Option<String> {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty())
}

/// Map a symphonia failure onto the user-facing decode error.
fn classify(err: SymphoniaError, file_name: &str) -> DecodeError {
    match err {
        SymphoniaError::Unsupported(what) => {
            let kind = extension(file_name).map_or_else(|| "unknown file type".to_string(), |ext| format!(".{} file", ext));
            DecodeError::Unsupported(format!("{}: {}", kind, what))
        }
        SymphoniaError::IoError(e) => DecodeError::Corrupt(e.to_string()),
        SymphoniaError::DecodeError(what) => DecodeError::Corrupt(what.to_string()),
        other => DecodeError::Corrupt(other.to_string()),
    }
}

/// Scale 16-bit integers to `[-1.0, 1.0)`.
pub fn pcm16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

/// Average interleaved frames into a single channel. A trailing partial frame is dropped.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
