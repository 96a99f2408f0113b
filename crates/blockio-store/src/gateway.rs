//! Store gateway trait
//!
//! A thin semantic facade over the object store client: named-object
//! create/read/remove plus the typed class-method calls the image layer
//! issues. The gateway is scoped to one primary pool; every call is a single
//! store round-trip delivering exactly one completion.

use async_trait::async_trait;

use blockio_common::{
    ImageHeader, ImageId, ImageName, MirrorImage, MirrorMode, ObjectMapState, PoolId, Result,
};

/// Asynchronous facade over one pool of the object store.
///
/// Mutations of shared objects (the directory, the mirroring index) rely on
/// the store's atomic class-method semantics; callers never lock around them.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    /// Id of the pool this gateway operates on
    fn pool_id(&self) -> PoolId;

    /// Name of the pool this gateway operates on
    fn pool_name(&self) -> &str;

    /// Resolve a pool name to its id
    async fn lookup_pool_id(&self, pool_name: &str) -> Result<PoolId>;

    /// Existence probe for a named object
    async fn stat(&self, oid: &str) -> Result<()>;

    /// Create a named object; with `exclusive`, fail if it already exists
    async fn create(&self, oid: &str, exclusive: bool) -> Result<()>;

    /// Remove a named object
    async fn remove(&self, oid: &str) -> Result<()>;

    /// Record the image id in an id object
    async fn set_id(&self, oid: &str, id: &ImageId) -> Result<()>;

    /// Add a name-to-id mapping to a directory object, creating the
    /// directory on first use
    async fn dir_add(&self, dir_oid: &str, name: &ImageName, id: &ImageId) -> Result<()>;

    /// Remove a name-to-id mapping from a directory object; the mapping must
    /// match both name and id
    async fn dir_remove(&self, dir_oid: &str, name: &ImageName, id: &ImageId) -> Result<()>;

    /// Look up the id mapped to `name` in a directory object
    async fn dir_get(&self, dir_oid: &str, name: &ImageName) -> Result<ImageId>;

    /// Write the image header record to a header object
    async fn write_header(&self, oid: &str, header: &ImageHeader) -> Result<()>;

    /// Read the image header record back from a header object
    async fn read_header(&self, oid: &str) -> Result<ImageHeader>;

    /// Persist a non-default stripe unit/count on a header object
    async fn set_stripe_unit_count(&self, oid: &str, unit: u64, count: u64) -> Result<()>;

    /// Create or resize an object-map object to `entry_count` entries, all
    /// set to `fill`
    async fn object_map_resize(
        &self,
        oid: &str,
        entry_count: u64,
        fill: ObjectMapState,
    ) -> Result<()>;

    /// Number of entries in an object-map object
    async fn object_map_len(&self, oid: &str) -> Result<u64>;

    /// Read the pool mirror mode from a mirroring object
    async fn mirror_mode_get(&self, oid: &str) -> Result<MirrorMode>;

    /// Read the mirror record for `id` from a mirroring object
    async fn mirror_image_get(&self, oid: &str, id: &ImageId) -> Result<MirrorImage>;

    /// Write the mirror record for `id` to a mirroring object, creating the
    /// object on first use
    async fn mirror_image_set(&self, oid: &str, id: &ImageId, record: &MirrorImage) -> Result<()>;

    /// Allocate a self-managed snapshot id, switching the pool into
    /// self-managed snapshot mode on first use
    async fn create_self_managed_snapshot(&self) -> Result<u64>;

    /// Release a self-managed snapshot id
    async fn remove_self_managed_snapshot(&self, snap_id: u64) -> Result<()>;
}
