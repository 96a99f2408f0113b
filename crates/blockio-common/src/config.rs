//! Configuration types for blockio
//!
//! Process-wide defaults applied to image creation when the caller leaves an
//! option unset.

use serde::{Deserialize, Serialize};

use crate::features::FeatureSet;

/// Defaults merged into every creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDefaults {
    /// Feature bits for images created without an explicit feature set
    pub features: FeatureSet,
    /// Object size exponent; object size = 2^order bytes
    pub order: u8,
    /// Default stripe unit in bytes; 0 means the object size
    pub stripe_unit: u64,
    /// Default stripe count; 0 means one object per stripe set
    pub stripe_count: u64,
    /// Journal object size exponent
    pub journal_order: u8,
    /// Number of journal objects written round-robin
    pub journal_splay_width: u8,
    /// Pool holding the journal objects; empty means the image's pool
    pub journal_pool: String,
    /// Pool holding the data objects; empty means the image's pool
    pub data_pool: String,
    /// Probe the pool directory before creating (switches fresh pools into
    /// self-managed snapshot mode)
    pub validate_pool: bool,
}

impl Default for CreateDefaults {
    fn default() -> Self {
        Self {
            features: FeatureSet::default(),
            order: 22,
            stripe_unit: 0,
            stripe_count: 0,
            journal_order: 24,
            journal_splay_width: 4,
            journal_pool: String::new(),
            data_pool: String::new(),
            validate_pool: true,
        }
    }
}
