//! # Audio Module
//!
//! Decoding of uploaded files into the 16 kHz mono float samples the
//! transcription engine expects. Decoding runs on the controller side, so a
//! file that cannot be read never reaches the inference worker.

pub mod decoder;
pub mod resampler;
