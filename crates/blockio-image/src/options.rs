//! Creation options and their resolution
//!
//! Callers hand over a sparse [`ImageOptions`]; [`CreateParams::resolve`]
//! merges it with the process-wide defaults into the fully determined
//! parameter set the pipeline runs on. Resolution is pure: it touches no
//! store state and reports no errors. Validation happens afterwards, on the
//! resolved values.

use blockio_common::{CreateDefaults, FeatureSet, ImageId, ImageLayout, ImageName};

/// Sparse, caller-supplied creation options.
///
/// Unset fields (and fields set to zero or the empty string) fall back to
/// the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct ImageOptions {
    /// Full feature set, replacing the default set
    pub features: Option<FeatureSet>,
    /// Bits to switch on after the base set is chosen
    pub features_set: FeatureSet,
    /// Bits to switch off after the base set is chosen
    pub features_clear: FeatureSet,
    /// Object size exponent
    pub order: Option<u8>,
    /// Stripe unit in bytes
    pub stripe_unit: Option<u64>,
    /// Objects per stripe set
    pub stripe_count: Option<u64>,
    /// Journal object size exponent
    pub journal_order: Option<u8>,
    /// Number of journal objects written round-robin
    pub journal_splay_width: Option<u8>,
    /// Pool holding the journal objects
    pub journal_pool: Option<String>,
    /// Pool holding the data objects
    pub data_pool: Option<String>,
}

impl ImageOptions {
    /// Create an empty option set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the default feature set
    #[must_use]
    pub fn with_features(mut self, features: FeatureSet) -> Self {
        self.features = Some(features);
        self
    }

    /// Switch feature bits on
    #[must_use]
    pub fn with_features_set(mut self, set: FeatureSet) -> Self {
        self.features_set = set;
        self
    }

    /// Switch feature bits off
    #[must_use]
    pub fn with_features_clear(mut self, clear: FeatureSet) -> Self {
        self.features_clear = clear;
        self
    }

    /// Set the object size exponent
    #[must_use]
    pub fn with_order(mut self, order: u8) -> Self {
        self.order = Some(order);
        self
    }

    /// Set the stripe unit and count
    #[must_use]
    pub fn with_striping(mut self, stripe_unit: u64, stripe_count: u64) -> Self {
        self.stripe_unit = Some(stripe_unit);
        self.stripe_count = Some(stripe_count);
        self
    }

    /// Set the journal layout
    #[must_use]
    pub fn with_journal(mut self, order: u8, splay_width: u8) -> Self {
        self.journal_order = Some(order);
        self.journal_splay_width = Some(splay_width);
        self
    }

    /// Set the journal pool
    #[must_use]
    pub fn with_journal_pool(mut self, pool: impl Into<String>) -> Self {
        self.journal_pool = Some(pool.into());
        self
    }

    /// Direct the bulk data to a separate pool
    #[must_use]
    pub fn with_data_pool(mut self, pool: impl Into<String>) -> Self {
        self.data_pool = Some(pool.into());
        self
    }
}

/// Fully resolved creation parameters
#[derive(Debug, Clone)]
pub struct CreateParams {
    /// Image name, unique within the pool directory
    pub name: ImageName,
    /// Caller-allocated image id
    pub id: ImageId,
    /// Logical size in bytes
    pub size: u64,
    /// Resolved feature bits, closed under the derivation rules
    pub features: FeatureSet,
    /// Object size exponent
    pub order: u8,
    /// Raw stripe unit; 0 means default striping
    pub stripe_unit: u64,
    /// Raw stripe count; 0 means default striping
    pub stripe_count: u64,
    /// Effective data layout with defaults substituted
    pub layout: ImageLayout,
    /// Journal object size exponent
    pub journal_order: u8,
    /// Number of journal objects written round-robin
    pub journal_splay_width: u8,
    /// Pool holding the journal objects; empty means the image's pool
    pub journal_pool: String,
    /// Pool holding the data objects; empty means the image's pool
    pub data_pool: String,
    /// Global id of the remote primary this image replicates, if any
    pub non_primary_global_image_id: String,
    /// Tag owner for the journal when replicating a remote primary
    pub primary_mirror_uuid: String,
    /// Whether this creation is a replica of a remote primary image
    pub force_non_primary: bool,
}

impl CreateParams {
    /// Merge caller options with the defaults into a determined parameter
    /// set for an image in the pool named `pool_name`.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn resolve(
        name: ImageName,
        id: ImageId,
        size: u64,
        non_primary_global_image_id: impl Into<String>,
        primary_mirror_uuid: impl Into<String>,
        options: &ImageOptions,
        defaults: &CreateDefaults,
        pool_name: &str,
    ) -> Self {
        let mut features = options.features.unwrap_or(defaults.features);

        // A bit named in both masks cancels out of each.
        let conflict = options.features_set & options.features_clear;
        let set = options.features_set & !conflict;
        let clear = options.features_clear & !conflict;
        features = (features | set) & !clear;

        let order = match options.order {
            Some(order) if order != 0 => order,
            _ => defaults.order,
        };
        let stripe_unit = match options.stripe_unit {
            Some(unit) if unit != 0 => unit,
            _ => defaults.stripe_unit,
        };
        let stripe_count = match options.stripe_count {
            Some(count) if count != 0 => count,
            _ => defaults.stripe_count,
        };
        let journal_order = match options.journal_order {
            Some(order) if order != 0 => order,
            _ => defaults.journal_order,
        };
        let journal_splay_width = match options.journal_splay_width {
            Some(width) if width != 0 => width,
            _ => defaults.journal_splay_width,
        };
        let journal_pool = match options.journal_pool.as_deref() {
            Some(pool) if !pool.is_empty() => pool.to_string(),
            _ => defaults.journal_pool.clone(),
        };
        let mut data_pool = match options.data_pool.as_deref() {
            Some(pool) if !pool.is_empty() => pool.to_string(),
            _ => defaults.data_pool.clone(),
        };

        let object_size = 1u64 << order;
        let layout = if stripe_unit == 0 || stripe_count == 0 {
            ImageLayout {
                object_size,
                stripe_unit: object_size,
                stripe_count: 1,
            }
        } else {
            ImageLayout {
                object_size,
                stripe_unit,
                stripe_count,
            }
        };

        // A data pool equal to the image's own pool is no data pool at all.
        if !data_pool.is_empty() && data_pool != pool_name {
            features |= FeatureSet::DATA_POOL;
        } else {
            data_pool.clear();
            features -= FeatureSet::DATA_POOL;
        }

        if (stripe_unit != 0 && stripe_unit != object_size)
            || (stripe_count != 0 && stripe_count != 1)
        {
            features |= FeatureSet::STRIPINGV2;
        } else {
            features -= FeatureSet::STRIPINGV2;
        }

        let non_primary_global_image_id = non_primary_global_image_id.into();
        let force_non_primary = !non_primary_global_image_id.is_empty();

        Self {
            name,
            id,
            size,
            features,
            order,
            stripe_unit,
            stripe_count,
            layout,
            journal_order,
            journal_splay_width,
            journal_pool,
            data_pool,
            non_primary_global_image_id,
            primary_mirror_uuid: primary_mirror_uuid.into(),
            force_non_primary,
        }
    }

    /// Whether the stripe parameters are the object-size default, in either
    /// spelling (unset, or unit = object size with a single-object set)
    #[must_use]
    pub fn default_striping(&self) -> bool {
        (self.stripe_unit == 0 && self.stripe_count == 0)
            || (self.stripe_count == 1 && self.stripe_unit == self.layout.object_size)
    }
}
