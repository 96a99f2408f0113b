//! Core type definitions for blockio
//!
//! Identifiers, well-known object names, the image header record, the
//! striped data layout, and the pool mirroring data model.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;
use crate::features::FeatureSet;

/// Per-pool object mapping image names to ids.
pub const IMAGE_DIRECTORY: &str = "rbd_directory";

/// Per-pool object carrying the mirror mode and per-image mirror records.
pub const MIRRORING: &str = "rbd_mirroring";

/// Name prefix of the per-image id object.
pub const ID_PREFIX: &str = "rbd_id.";

/// Name prefix of the per-image header object.
pub const HEADER_PREFIX: &str = "rbd_header.";

/// Name prefix of the per-image object-map object.
pub const OBJECT_MAP_PREFIX: &str = "rbd_object_map.";

/// Name prefix shared by all data objects backing an image.
pub const DATA_PREFIX: &str = "rbd_data.";

/// Most entries an object map may hold; images whose layout would exceed
/// this cannot be created.
pub const MAX_OBJECT_MAP_ENTRIES: u64 = 256_000_000;

/// Errors that can occur when constructing an image name or id
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name cannot be empty")]
    Empty,
}

impl From<NameError> for Error {
    fn from(err: NameError) -> Self {
        Error::InvalidArgument(err.to_string())
    }
}

/// Human-readable image handle, unique within a pool's directory
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display("{_0}")]
pub struct ImageName(String);

impl ImageName {
    /// Create a new image name
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(NameError::Empty);
        }
        Ok(Self(name))
    }

    /// Get the name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageName({:?})", self.0)
    }
}

/// Opaque image identifier, allocated by the caller and globally unique
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display("{_0}")]
pub struct ImageId(String);

impl ImageId {
    /// Create a new image id
    pub fn new(id: impl Into<String>) -> Result<Self, NameError> {
        let id = id.into();
        if id.is_empty() {
            return Err(NameError::Empty);
        }
        Ok(Self(id))
    }

    /// Get the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageId({:?})", self.0)
    }
}

/// Numeric pool identifier assigned by the store
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
#[display("{_0}")]
pub struct PoolId(i64);

impl PoolId {
    /// Sentinel for "no separate data pool".
    pub const NONE: PoolId = PoolId(-1);

    /// Create a pool id from its raw value
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Check whether this is the no-pool sentinel
    #[must_use]
    pub const fn is_none(&self) -> bool {
        self.0 == Self::NONE.0
    }
}

/// Name of the id object for `name`
#[must_use]
pub fn id_object_name(name: &ImageName) -> String {
    format!("{ID_PREFIX}{name}")
}

/// Name of the header object for `id`
#[must_use]
pub fn header_object_name(id: &ImageId) -> String {
    format!("{HEADER_PREFIX}{id}")
}

/// Name of the object-map object for `id`
#[must_use]
pub fn object_map_name(id: &ImageId) -> String {
    format!("{OBJECT_MAP_PREFIX}{id}")
}

/// Prefix shared by the data objects backing image `id`.
///
/// When the bulk data is directed to a separate pool, the primary pool's id
/// is embedded so data objects remain attributable from the data pool alone.
#[must_use]
pub fn data_object_prefix(primary_pool: PoolId, data_pool_id: PoolId, id: &ImageId) -> String {
    if data_pool_id.is_none() {
        format!("{DATA_PREFIX}{id}")
    } else {
        format!("{DATA_PREFIX}{primary_pool}.{id}")
    }
}

/// Striped data layout of an image.
///
/// `stripe_unit` bytes are written to each of `stripe_count` consecutive
/// objects in turn; with the default layout (unit = object size, count = 1)
/// data fills one object after another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    /// Size of each backing object in bytes (a power of two)
    pub object_size: u64,
    /// Bytes written to one object before advancing to the next
    pub stripe_unit: u64,
    /// Number of objects in one stripe set
    pub stripe_count: u64,
}

impl ImageLayout {
    /// Layout for `order` with default striping
    #[must_use]
    pub fn with_default_striping(order: u8) -> Self {
        let object_size = 1u64 << order;
        Self {
            object_size,
            stripe_unit: object_size,
            stripe_count: 1,
        }
    }

    /// Bytes covered by one full stripe set
    #[must_use]
    pub fn period(&self) -> u64 {
        self.stripe_count * self.object_size
    }

    /// Number of backing objects needed for `size` bytes.
    ///
    /// The tail period may leave trailing objects untouched when the
    /// remaining bytes do not reach every object of the stripe set.
    #[must_use]
    pub fn object_count(&self, size: u64) -> u64 {
        if size == 0 {
            return 0;
        }
        let period = self.period();
        let periods = size.div_ceil(period);
        let remainder = size % period;
        let mut unused_tail = 0;
        if remainder > 0 && remainder < self.stripe_count * self.stripe_unit {
            unused_tail = self.stripe_count - remainder.div_ceil(self.stripe_unit);
        }
        periods * self.stripe_count - unused_tail
    }
}

/// Image header record persisted at creation time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHeader {
    /// Logical size in bytes
    pub size: u64,
    /// Object size exponent; object size = 2^order bytes
    pub order: u8,
    /// Feature bits the image was created with
    pub features: FeatureSet,
    /// Name prefix of the backing data objects
    pub object_prefix: String,
    /// Pool holding the data objects, or the sentinel for the primary pool
    pub data_pool_id: PoolId,
}

/// State of the initial object-map entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectMapState {
    /// Backing object has never been written
    Nonexistent,
    /// Backing object exists
    Exists,
    /// Backing object state is being updated
    Pending,
}

/// Pool-level mirroring mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorMode {
    /// No image in the pool is mirrored
    Disabled,
    /// Mirroring is enabled per image
    Image,
    /// Every journaled image in the pool is mirrored
    Pool,
}

impl From<MirrorMode> for u32 {
    fn from(mode: MirrorMode) -> u32 {
        match mode {
            MirrorMode::Disabled => 0,
            MirrorMode::Image => 1,
            MirrorMode::Pool => 2,
        }
    }
}

impl TryFrom<u32> for MirrorMode {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Error> {
        match value {
            0 => Ok(MirrorMode::Disabled),
            1 => Ok(MirrorMode::Image),
            2 => Ok(MirrorMode::Pool),
            _ => Err(Error::invalid_argument(format!(
                "unknown mirror mode ({value})"
            ))),
        }
    }
}

/// Per-image mirroring state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MirrorImageState {
    /// Image is not mirrored
    #[default]
    Disabled,
    /// Image participates in mirroring
    Enabled,
    /// Mirroring is being torn down
    Disabling,
}

/// Mirror record for a single image, keyed by image id in the mirroring index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MirrorImage {
    /// Identifier shared by all replicas of this image across clusters
    pub global_image_id: String,
    /// Mirroring state of this image
    pub state: MirrorImageState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_names_rejected() {
        assert_eq!(ImageName::new(""), Err(NameError::Empty));
        assert_eq!(ImageId::new(""), Err(NameError::Empty));
        assert!(ImageName::new("img1").is_ok());
    }

    #[test]
    fn test_object_names() {
        let name = ImageName::new("img1").unwrap();
        let id = ImageId::new("10af6b8b4567").unwrap();
        assert_eq!(id_object_name(&name), "rbd_id.img1");
        assert_eq!(header_object_name(&id), "rbd_header.10af6b8b4567");
        assert_eq!(object_map_name(&id), "rbd_object_map.10af6b8b4567");
    }

    #[test]
    fn test_data_prefix() {
        let id = ImageId::new("10af6b8b4567").unwrap();
        assert_eq!(
            data_object_prefix(PoolId::new(2), PoolId::NONE, &id),
            "rbd_data.10af6b8b4567"
        );
        assert_eq!(
            data_object_prefix(PoolId::new(2), PoolId::new(3), &id),
            "rbd_data.2.10af6b8b4567"
        );
    }

    #[test]
    fn test_default_layout_object_count() {
        let layout = ImageLayout::with_default_striping(22);
        assert_eq!(layout.object_size, 4 * 1024 * 1024);
        assert_eq!(layout.object_count(0), 0);
        assert_eq!(layout.object_count(1), 1);
        assert_eq!(layout.object_count(4 * 1024 * 1024), 1);
        assert_eq!(layout.object_count(4 * 1024 * 1024 + 1), 2);
        assert_eq!(layout.object_count(1 << 30), 256);
    }

    #[test]
    fn test_striped_layout_object_count() {
        // 4 MiB objects, 64 KiB stripe unit, 4-way striping
        let layout = ImageLayout {
            object_size: 4 * 1024 * 1024,
            stripe_unit: 64 * 1024,
            stripe_count: 4,
        };
        assert_eq!(layout.period(), 16 * 1024 * 1024);
        // Full periods touch every object of each stripe set.
        assert_eq!(layout.object_count(1 << 30), 256);
        // A single stripe unit touches only the first object of the set.
        assert_eq!(layout.object_count(64 * 1024), 1);
        // Two units touch two objects.
        assert_eq!(layout.object_count(2 * 64 * 1024), 2);
        // One full stripe round touches all four.
        assert_eq!(layout.object_count(4 * 64 * 1024), 4);
        // A second round reuses the same objects until the period is full.
        assert_eq!(layout.object_count(5 * 64 * 1024), 4);
    }

    #[test]
    fn test_mirror_mode_round_trip() {
        for mode in [MirrorMode::Disabled, MirrorMode::Image, MirrorMode::Pool] {
            assert_eq!(MirrorMode::try_from(u32::from(mode)).unwrap(), mode);
        }
        assert!(MirrorMode::try_from(7).is_err());
    }
}
