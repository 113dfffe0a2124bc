//! # Configuration Fingerprint & Engine Cache
//!
//! A loaded engine is fully described by three values: which model, on which
//! kind of device, at which precision. Together they form the [`Fingerprint`].
//! The inference worker keeps exactly one engine alive and replaces it only when
//! a `load` request arrives with a different fingerprint.
//!
//! ## Reload Decision:
//! ```text
//! needs_reload(current, requested) = current is empty || current != requested
//! ```
//! The decision is a pure function of the cache contents, so it can be tested
//! without ever constructing a real engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the engine executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDevice {
    /// CPU-only execution, available everywhere
    Portable,
    /// Hardware-accelerated execution (CUDA or Metal)
    Accelerated,
}

impl std::str::FromStr for ComputeDevice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "portable" | "cpu" | "wasm" => Ok(ComputeDevice::Portable),
            "accelerated" | "gpu" | "cuda" | "metal" | "webgpu" => Ok(ComputeDevice::Accelerated),
            _ => Err(format!("Unknown device: {}", s)),
        }
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeDevice::Portable => write!(f, "portable"),
            ComputeDevice::Accelerated => write!(f, "accelerated"),
        }
    }
}

/// Numeric precision of the model weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 8-bit quantized weights (GGUF)
    Quantized,
    /// Full 32-bit float weights (safetensors)
    Full,
}

impl std::str::FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "quantized" | "q8" | "q8_0" | "int8" => Ok(Precision::Quantized),
            "full" | "fp32" | "f32" => Ok(Precision::Full),
            _ => Err(format!("Unknown precision: {}", s)),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Quantized => write!(f, "quantized"),
            Precision::Full => write!(f, "full"),
        }
    }
}

/// The tuple of configuration values that decides whether a loaded engine is reusable.
///
/// Two fingerprints are equal iff all three fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// HuggingFace repository id, e.g. "openai/whisper-tiny"
    pub model_id: String,
    pub device: ComputeDevice,
    pub precision: Precision,
}

impl Fingerprint {
    pub fn new(model_id: impl Into<String>, device: ComputeDevice, precision: Precision) -> Self {
        Self {
            model_id: model_id.into(),
            device,
            precision,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}, {}]", self.model_id, self.device, self.precision)
    }
}

/// Pure, total reload predicate.
pub fn needs_reload(current: Option<&Fingerprint>, requested: &Fingerprint) -> bool {
    match current {
        Some(loaded) => loaded != requested,
        None => true,
    }
}

/// Holds the single live engine together with the fingerprint it was loaded for.
///
/// ## Ownership:
/// The cache is owned by the inference worker. While a `run` executes on a
/// blocking thread the engine and its fingerprint are taken out with
/// [`EngineCache::take`] and put back with [`EngineCache::install`]. A run that
/// never returns its engine leaves the cache empty.
#[derive(Debug)]
pub struct EngineCache<E> {
    fingerprint: Option<Fingerprint>,
    engine: Option<E>,
}

impl<E> Default for EngineCache<E> {
    fn default() -> Self {
        Self {
            fingerprint: None,
            engine: None,
        }
    }
}

impl<E> EngineCache<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprint of the live engine, if any.
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.engine.as_ref().and(self.fingerprint.as_ref())
    }

    /// Whether `requested` requires a fresh load.
    pub fn needs_reload(&self, requested: &Fingerprint) -> bool {
        needs_reload(self.fingerprint(), requested)
    }

    /// Replace the live engine. The previous engine (if any) is dropped.
    pub fn install(&mut self, fingerprint: Fingerprint, engine: E) {
        self.fingerprint = Some(fingerprint);
        self.engine = Some(engine);
    }

    /// Temporarily move the engine out (for a blocking run).
    pub fn take(&mut self) -> Option<(Fingerprint, E)> {
        let engine = self.engine.take()?;
        let fingerprint = self.fingerprint.take()?;
        Some((fingerprint, engine))
    }

    pub fn clear(&mut self) {
        self.fingerprint = None;
        self.engine = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> Fingerprint {
        Fingerprint::new("openai/whisper-tiny", ComputeDevice::Portable, Precision::Full)
    }

    #[test]
    fn test_needs_reload_when_empty() {
        assert!(needs_reload(None, &tiny()));
    }

    #[test]
    fn test_needs_reload_each_field() {
        let loaded = tiny();
        assert!(!needs_reload(Some(&loaded), &tiny()));

        let mut other_model = tiny();
        other_model.model_id = "openai/whisper-base".to_string();
        assert!(needs_reload(Some(&loaded), &other_model));

        let mut other_device = tiny();
        other_device.device = ComputeDevice::Accelerated;
        assert!(needs_reload(Some(&loaded), &other_device));

        let mut other_precision = tiny();
        other_precision.precision = Precision::Quantized;
        assert!(needs_reload(Some(&loaded), &other_precision));
    }

    #[test]
    fn test_cache_install_take() {
        let mut cache: EngineCache<u32> = EngineCache::new();
        assert!(cache.needs_reload(&tiny()));

        cache.install(tiny(), 7);
        assert!(!cache.needs_reload(&tiny()));
        assert_eq!(cache.fingerprint(), Some(&tiny()));

        let (fingerprint, engine) = cache.take().unwrap();
        assert_eq!(engine, 7);
        assert_eq!(cache.fingerprint(), None);
        assert!(cache.needs_reload(&tiny()));

        cache.install(fingerprint, engine);
        assert_eq!(cache.fingerprint(), Some(&tiny()));
        cache.clear();
        assert_eq!(cache.fingerprint(), None);
    }

    #[test]
    fn test_parse_device_and_precision() {
        assert_eq!("GPU".parse::<ComputeDevice>().unwrap(), ComputeDevice::Accelerated);
        assert_eq!("wasm".parse::<ComputeDevice>().unwrap(), ComputeDevice::Portable);
        assert_eq!("q8".parse::<Precision>().unwrap(), Precision::Quantized);
        assert!("tpu".parse::<ComputeDevice>().is_err());
        assert!("half".parse::<Precision>().is_err());
    }

    #[test]
    fn test_fingerprint_wire_shape() {
        let json = serde_json::to_value(tiny()).unwrap();
        assert_eq!(json["model_id"], "openai/whisper-tiny");
        assert_eq!(json["device"], "portable");
        assert_eq!(json["precision"], "full");
    }
}
