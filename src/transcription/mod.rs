//! # Transcription Module
//!
//! Everything between decoded samples and rendered text, using Whisper models
//! on the Candle-rs framework.
//!
//! ## Key Components:
//! - **fingerprint**: Which engine is loaded, and when it must be replaced
//! - **engine**: Loader and engine traits, progress and partial-output sinks
//! - **whisper**: Candle implementation of those traits
//! - **chunking**: Overlapping windows for audio longer than one model input
//! - **result**: The shapes an engine may return
//! - **normalizer**: Renders any result shape as display text
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39MB, fastest; quantized GGUF weights are published for tiny variants
//! - **base**: ~74MB, good balance for development
//! - **small**: ~244MB, better accuracy
//! - **medium**: ~769MB, good technical vocabulary
//! - **large-v2**: ~1550MB, best accuracy but slowest

pub mod chunking;
pub mod engine;
pub mod fingerprint;
pub mod normalizer;
pub mod result;
pub mod whisper;
