//! # Chunking Policy
//!
//! Long recordings are transcribed in fixed windows so that each inference call
//! sees a bounded amount of audio. Neighbouring windows overlap by a stride on
//! each side; text is only kept from the central "owned" part of every window,
//! which makes the owned regions tile the recording without gaps or duplicates.
//!
//! ```text
//! |<------ chunk (30s) ------>|
//! |stride|   owned    |stride|
//!               |stride|   owned    |stride|
//! ```
//! The first window owns its leading stride and the last window owns its
//! trailing stride.

/// Window length and overlap in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkPolicy {
    pub chunk_length_s: f64,
    pub stride_length_s: f64,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            chunk_length_s: 30.0,
            stride_length_s: 5.0,
        }
    }
}

impl ChunkPolicy {
    pub fn new(chunk_length_s: f64, stride_length_s: f64) -> Self {
        Self {
            chunk_length_s,
            stride_length_s,
        }
    }

    /// Split `total_samples` into windows.
    ///
    /// Always returns at least one window (an empty recording yields one empty window).
    pub fn plan(&self, total_samples: usize, sample_rate: u32) -> Vec<Window> {
        let chunk = (self.chunk_length_s * sample_rate as f64).round() as usize;
        let stride = (self.stride_length_s * sample_rate as f64).round() as usize;

        if chunk == 0 || total_samples <= chunk {
            return vec![Window {
                start: 0,
                end: total_samples,
                keep_start: 0,
                keep_end: total_samples,
            }];
        }

        // A stride eating the whole window would stop it from advancing.
        let stride = if 2 * stride >= chunk { 0 } else { stride };
        let step = chunk - 2 * stride;
        let mut windows = Vec::new();
        let mut start = 0usize;

        loop {
            let end = (start + chunk).min(total_samples);
            let is_first = start == 0;
            let is_last = end == total_samples;

            windows.push(Window {
                start,
                end,
                keep_start: if is_first { start } else { start + stride },
                keep_end: if is_last { end } else { end - stride },
            });

            if is_last {
                break;
            }
            start += step;
        }

        windows
    }
}

/// One inference window, in samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: usize,
    pub end: usize,
    /// First sample whose text belongs to this window
    pub keep_start: usize,
    /// One past the last sample whose text belongs to this window
    pub keep_end: usize,
}

impl Window {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Offset of the window start in seconds.
    pub fn offset_seconds(&self, sample_rate: u32) -> f64 {
        self.start as f64 / sample_rate as f64
    }

    /// Whether a segment spanning `[start_s, end_s]` (absolute seconds) belongs here.
    ///
    /// Ownership is decided by the segment midpoint.
    pub fn owns(&self, start_s: f64, end_s: f64, sample_rate: u32) -> bool {
        let mid = (start_s + end_s) / 2.0 * sample_rate as f64;
        mid >= self.keep_start as f64 && mid < self.keep_end as f64
    }
}
