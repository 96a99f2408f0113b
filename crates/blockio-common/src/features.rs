//! Image feature bitmask
//!
//! Features are recorded in the image header at creation time and gate which
//! auxiliary artifacts (object map, journal, mirror record) an image carries.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Feature bits an image can be created with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FeatureSet: u64 {
        /// Image supports cloning (copy-on-write children).
        const LAYERING       = 1 << 0;
        /// Non-default striping layout is recorded in the header.
        const STRIPINGV2     = 1 << 1;
        /// Writers must hold the exclusive lock.
        const EXCLUSIVE_LOCK = 1 << 2;
        /// Per-object presence bitmap is maintained.
        const OBJECT_MAP     = 1 << 3;
        /// Snapshot diffs are computed from the object map.
        const FAST_DIFF      = 1 << 4;
        /// Flatten also dissociates snapshots from the parent.
        const DEEP_FLATTEN   = 1 << 5;
        /// All writes are journaled for replication.
        const JOURNALING     = 1 << 6;
        /// Bulk data lives in a separate pool named in the header.
        const DATA_POOL      = 1 << 7;
    }
}

impl FeatureSet {
    /// Every feature bit this implementation understands.
    pub const SUPPORTED: FeatureSet = FeatureSet::all();

    /// Check whether any bit outside the supported universe is set.
    #[must_use]
    pub fn has_unknown_bits(bits: u64) -> bool {
        bits & !Self::SUPPORTED.bits() != 0
    }

    /// Check the inter-feature dependency rules.
    ///
    /// Returns the human-readable rule that is violated, or `None` when the
    /// set is closed under its dependencies.
    #[must_use]
    pub fn dependency_violation(&self) -> Option<&'static str> {
        if self.contains(Self::FAST_DIFF) && !self.contains(Self::OBJECT_MAP) {
            return Some("fast-diff requires object-map");
        }
        if self.contains(Self::OBJECT_MAP) && !self.contains(Self::EXCLUSIVE_LOCK) {
            return Some("object-map requires exclusive-lock");
        }
        if self.contains(Self::JOURNALING) && !self.contains(Self::EXCLUSIVE_LOCK) {
            return Some("journaling requires exclusive-lock");
        }
        None
    }
}

// Persisted as the raw bit value. Unknown bits survive the round trip so the
// feature validator can reject them instead of silently dropping them.
impl Serialize for FeatureSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.bits())
    }
}

impl<'de> Deserialize<'de> for FeatureSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        u64::deserialize(deserializer).map(FeatureSet::from_bits_retain)
    }
}

impl Default for FeatureSet {
    /// Default feature set for newly created images.
    fn default() -> Self {
        Self::LAYERING
            | Self::EXCLUSIVE_LOCK
            | Self::OBJECT_MAP
            | Self::FAST_DIFF
            | Self::DEEP_FLATTEN
    }
}
