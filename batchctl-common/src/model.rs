//! Static registry of models the control plane knows how to serve.
//!
//! Mirrors the teacher's static team/flag lookup tables: a small, in-memory map seeded at
//! startup rather than a database table, since the set of deployable models changes with
//! deploys, not with user requests. Used only to reject unknown model names at batch-creation
//! time and to pick a chunk size appropriate to the GPU the model runs on; otherwise the model
//! identifier is opaque to the rest of the control plane.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// GPU memory tier a model is qualified to run on, used to size inference chunks so a single
/// chunk's KV cache comfortably fits in VRAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VramTier {
    /// 12 GiB class (e.g. a single mid-range consumer card).
    Gb12,
    /// 16 GiB class.
    Gb16,
    /// 24 GiB class, conservative chunk size for larger context windows.
    Gb24,
    /// 24 GiB class, models qualified for the larger chunk size on the same hardware.
    Gb24Wide,
}

impl VramTier {
    /// Default chunk size (number of requests per inference batch) for this tier.
    pub fn chunk_size(&self) -> usize {
        match self {
            VramTier::Gb12 => 50,
            VramTier::Gb16 => 100,
            VramTier::Gb24 => 150,
            VramTier::Gb24Wide => 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub context_window: u32,
    pub vram_tier: VramTier,
    pub enabled: bool,
}

impl ModelInfo {
    pub fn chunk_size(&self) -> usize {
        self.vram_tier.chunk_size()
    }
}

/// Process-wide table of known models. Seeded once at startup; swapping it for a
/// database-backed registry later would only mean changing this module.
static REGISTRY: Lazy<HashMap<&'static str, ModelInfo>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert(
        "llama-3-8b-instruct",
        ModelInfo {
            context_window: 8192,
            vram_tier: VramTier::Gb12,
            enabled: true,
        },
    );
    map.insert(
        "llama-3-70b-instruct",
        ModelInfo {
            context_window: 8192,
            vram_tier: VramTier::Gb24Wide,
            enabled: true,
        },
    );
    map.insert(
        "mixtral-8x7b-instruct",
        ModelInfo {
            context_window: 32768,
            vram_tier: VramTier::Gb24,
            enabled: true,
        },
    );
    map.insert(
        "mistral-7b-instruct",
        ModelInfo {
            context_window: 32768,
            vram_tier: VramTier::Gb16,
            enabled: true,
        },
    );
    map
});

/// Looks up a model by name. Returns `None` for models the control plane either never knew
/// about or has since disabled — callers should treat both the same way (reject at enqueue).
pub fn lookup(model: &str) -> Option<&'static ModelInfo> {
    REGISTRY.get(model).filter(|info| info.enabled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_resolves() {
        let info = lookup("llama-3-8b-instruct").expect("model should be registered");
        assert_eq!(info.vram_tier.chunk_size(), 50);
    }

    #[test]
    fn unknown_model_is_none() {
        assert!(lookup("does-not-exist").is_none());
    }

    #[test]
    fn chunk_sizes_match_tier_table() {
        assert_eq!(VramTier::Gb12.chunk_size(), 50);
        assert_eq!(VramTier::Gb16.chunk_size(), 100);
        assert_eq!(VramTier::Gb24.chunk_size(), 150);
        assert_eq!(VramTier::Gb24Wide.chunk_size(), 200);
    }
}
