//! In-process store implementation
//!
//! Backs one pool with locked maps. Class-method payloads are kept as typed
//! facets on a per-object record, which is exactly the shape the remote
//! store's class methods impose on object omaps. Supports one-shot fault
//! injection per operation so callers can exercise every failure path of a
//! multi-step pipeline.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use blockio_common::{
    Error, ImageHeader, ImageId, ImageName, MirrorImage, MirrorMode, ObjectMapState, PoolId,
    Result,
};

use crate::gateway::StoreGateway;

/// Gateway operations, used to key injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    LookupPool,
    Stat,
    Create,
    Remove,
    SetId,
    DirAdd,
    DirRemove,
    DirGet,
    WriteHeader,
    ReadHeader,
    SetStripeUnitCount,
    ObjectMapResize,
    ObjectMapLen,
    MirrorModeGet,
    MirrorImageGet,
    MirrorImageSet,
    SnapCreate,
    SnapRemove,
}

/// Typed payload facets of one named object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ObjectRecord {
    id: Option<ImageId>,
    header: Option<ImageHeader>,
    stripe: Option<(u64, u64)>,
    object_map: Option<(u64, ObjectMapState)>,
    directory: Option<BTreeMap<String, ImageId>>,
    mirroring: Option<MirroringRecord>,
}

/// Mirroring-index payload: pool mode plus per-image records.
///
/// The mode is held raw so a malformed on-disk value can be simulated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MirroringRecord {
    mode: u32,
    images: BTreeMap<String, MirrorImage>,
}

impl Default for MirroringRecord {
    fn default() -> Self {
        Self {
            mode: u32::from(MirrorMode::Disabled),
            images: BTreeMap::new(),
        }
    }
}

/// Point-in-time copy of every object in the pool, for equality checks
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSnapshot(BTreeMap<String, ObjectRecord>);

#[derive(Debug, Default)]
struct SnapshotState {
    self_managed: bool,
    next_id: u64,
    live: BTreeSet<u64>,
}

/// A pending injected failure: fires once `skip` further calls have passed
#[derive(Debug)]
struct Fault {
    skip: usize,
    err: Error,
}

/// In-memory implementation of [`StoreGateway`] for one pool
pub struct MemoryStore {
    pool_id: PoolId,
    pool_name: String,
    peer_pools: RwLock<BTreeMap<String, PoolId>>,
    objects: RwLock<BTreeMap<String, ObjectRecord>>,
    snapshots: Mutex<SnapshotState>,
    faults: Mutex<HashMap<StoreOp, Fault>>,
}

impl MemoryStore {
    /// Create an empty (fresh) pool
    pub fn new(pool_name: impl Into<String>, pool_id: PoolId) -> Self {
        Self {
            pool_id,
            pool_name: pool_name.into(),
            peer_pools: RwLock::new(BTreeMap::new()),
            objects: RwLock::new(BTreeMap::new()),
            snapshots: Mutex::new(SnapshotState::default()),
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Register another pool resolvable through [`StoreGateway::lookup_pool_id`]
    pub fn add_peer_pool(&self, name: impl Into<String>, id: PoolId) {
        self.peer_pools.write().insert(name.into(), id);
    }

    /// Create the pool's directory object, as an already-used pool would have
    pub fn seed_directory(&self, dir_oid: &str) {
        let mut objects = self.objects.write();
        objects
            .entry(dir_oid.to_string())
            .or_default()
            .directory
            .get_or_insert_with(BTreeMap::new);
    }

    /// Set the pool mirror mode, creating the mirroring object if needed
    pub fn set_mirror_mode(&self, oid: &str, mode: MirrorMode) {
        self.set_raw_mirror_mode(oid, u32::from(mode));
    }

    /// Set a raw (possibly invalid) mirror mode value
    pub fn set_raw_mirror_mode(&self, oid: &str, raw: u32) {
        let mut objects = self.objects.write();
        objects
            .entry(oid.to_string())
            .or_default()
            .mirroring
            .get_or_insert_with(MirroringRecord::default)
            .mode = raw;
    }

    /// Seed a pre-existing mirror record for an image
    pub fn seed_mirror_image(&self, oid: &str, id: &ImageId, record: MirrorImage) {
        let mut objects = self.objects.write();
        objects
            .entry(oid.to_string())
            .or_default()
            .mirroring
            .get_or_insert_with(MirroringRecord::default)
            .images
            .insert(id.to_string(), record);
    }

    /// Make the next call of `op` fail with `err`
    pub fn inject_error(&self, op: StoreOp, err: Error) {
        self.inject_error_after(op, 0, err);
    }

    /// Make the call of `op` after `skip` successful ones fail with `err`
    pub fn inject_error_after(&self, op: StoreOp, skip: usize, err: Error) {
        self.faults.lock().insert(op, Fault { skip, err });
    }

    /// Point-in-time copy of the pool contents
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot(self.objects.read().clone())
    }

    /// Check whether a named object exists
    pub fn object_exists(&self, oid: &str) -> bool {
        self.objects.read().contains_key(oid)
    }

    /// Names of every object in the pool
    pub fn object_names(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    /// Stripe unit/count persisted on a header object, if any
    pub fn stripe_unit_count(&self, oid: &str) -> Option<(u64, u64)> {
        self.objects.read().get(oid).and_then(|record| record.stripe)
    }

    /// Whether the pool has been switched into self-managed snapshot mode
    pub fn self_managed_snapshots(&self) -> bool {
        self.snapshots.lock().self_managed
    }

    /// Number of allocated, unreleased self-managed snapshot ids
    pub fn live_snapshot_count(&self) -> usize {
        self.snapshots.lock().live.len()
    }

    fn fail_point(&self, op: StoreOp) -> Result<()> {
        let mut faults = self.faults.lock();
        if let Entry::Occupied(mut occupied) = faults.entry(op) {
            if occupied.get().skip == 0 {
                let fault = occupied.remove();
                debug!(?op, err = %fault.err, "injected fault");
                return Err(fault.err);
            }
            occupied.get_mut().skip -= 1;
        }
        Ok(())
    }
}

#[async_trait]
impl StoreGateway for MemoryStore {
    fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    fn pool_name(&self) -> &str {
        &self.pool_name
    }

    async fn lookup_pool_id(&self, pool_name: &str) -> Result<PoolId> {
        self.fail_point(StoreOp::LookupPool)?;
        if pool_name == self.pool_name {
            return Ok(self.pool_id);
        }
        self.peer_pools
            .read()
            .get(pool_name)
            .copied()
            .ok_or_else(|| Error::not_found(format!("pool {pool_name}")))
    }

    async fn stat(&self, oid: &str) -> Result<()> {
        self.fail_point(StoreOp::Stat)?;
        if self.objects.read().contains_key(oid) {
            Ok(())
        } else {
            Err(Error::not_found(oid))
        }
    }

    async fn create(&self, oid: &str, exclusive: bool) -> Result<()> {
        self.fail_point(StoreOp::Create)?;
        let mut objects = self.objects.write();
        if exclusive && objects.contains_key(oid) {
            return Err(Error::conflict(oid));
        }
        objects.entry(oid.to_string()).or_default();
        Ok(())
    }

    async fn remove(&self, oid: &str) -> Result<()> {
        self.fail_point(StoreOp::Remove)?;
        self.objects
            .write()
            .remove(oid)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(oid))
    }

    async fn set_id(&self, oid: &str, id: &ImageId) -> Result<()> {
        self.fail_point(StoreOp::SetId)?;
        let mut objects = self.objects.write();
        let record = objects.get_mut(oid).ok_or_else(|| Error::not_found(oid))?;
        record.id = Some(id.clone());
        Ok(())
    }

    async fn dir_add(&self, dir_oid: &str, name: &ImageName, id: &ImageId) -> Result<()> {
        self.fail_point(StoreOp::DirAdd)?;
        let mut objects = self.objects.write();
        let dir = objects
            .entry(dir_oid.to_string())
            .or_default()
            .directory
            .get_or_insert_with(BTreeMap::new);
        if dir.contains_key(name.as_str()) {
            return Err(Error::conflict(format!("directory entry {name}")));
        }
        dir.insert(name.to_string(), id.clone());
        Ok(())
    }

    async fn dir_remove(&self, dir_oid: &str, name: &ImageName, id: &ImageId) -> Result<()> {
        self.fail_point(StoreOp::DirRemove)?;
        let mut objects = self.objects.write();
        let dir = objects
            .get_mut(dir_oid)
            .and_then(|record| record.directory.as_mut())
            .ok_or_else(|| Error::not_found(dir_oid))?;
        match dir.get(name.as_str()) {
            Some(mapped) if mapped == id => {
                dir.remove(name.as_str());
                Ok(())
            }
            _ => Err(Error::not_found(format!("directory entry {name}"))),
        }
    }

    async fn dir_get(&self, dir_oid: &str, name: &ImageName) -> Result<ImageId> {
        self.fail_point(StoreOp::DirGet)?;
        self.objects
            .read()
            .get(dir_oid)
            .and_then(|record| record.directory.as_ref())
            .and_then(|dir| dir.get(name.as_str()).cloned())
            .ok_or_else(|| Error::not_found(format!("directory entry {name}")))
    }

    async fn write_header(&self, oid: &str, header: &ImageHeader) -> Result<()> {
        self.fail_point(StoreOp::WriteHeader)?;
        let mut objects = self.objects.write();
        let record = objects.get_mut(oid).ok_or_else(|| Error::not_found(oid))?;
        record.header = Some(header.clone());
        Ok(())
    }

    async fn read_header(&self, oid: &str) -> Result<ImageHeader> {
        self.fail_point(StoreOp::ReadHeader)?;
        self.objects
            .read()
            .get(oid)
            .and_then(|record| record.header.clone())
            .ok_or_else(|| Error::not_found(oid))
    }

    async fn set_stripe_unit_count(&self, oid: &str, unit: u64, count: u64) -> Result<()> {
        self.fail_point(StoreOp::SetStripeUnitCount)?;
        let mut objects = self.objects.write();
        let record = objects.get_mut(oid).ok_or_else(|| Error::not_found(oid))?;
        record.stripe = Some((unit, count));
        Ok(())
    }

    async fn object_map_resize(
        &self,
        oid: &str,
        entry_count: u64,
        fill: ObjectMapState,
    ) -> Result<()> {
        self.fail_point(StoreOp::ObjectMapResize)?;
        let mut objects = self.objects.write();
        let record = objects.entry(oid.to_string()).or_default();
        record.object_map = Some((entry_count, fill));
        Ok(())
    }

    async fn object_map_len(&self, oid: &str) -> Result<u64> {
        self.fail_point(StoreOp::ObjectMapLen)?;
        self.objects
            .read()
            .get(oid)
            .and_then(|record| record.object_map)
            .map(|(count, _)| count)
            .ok_or_else(|| Error::not_found(oid))
    }

    async fn mirror_mode_get(&self, oid: &str) -> Result<MirrorMode> {
        self.fail_point(StoreOp::MirrorModeGet)?;
        let raw = self
            .objects
            .read()
            .get(oid)
            .and_then(|record| record.mirroring.as_ref())
            .map(|mirroring| mirroring.mode)
            .ok_or_else(|| Error::not_found(oid))?;
        MirrorMode::try_from(raw)
    }

    async fn mirror_image_get(&self, oid: &str, id: &ImageId) -> Result<MirrorImage> {
        self.fail_point(StoreOp::MirrorImageGet)?;
        self.objects
            .read()
            .get(oid)
            .and_then(|record| record.mirroring.as_ref())
            .and_then(|mirroring| mirroring.images.get(id.as_str()).cloned())
            .ok_or_else(|| Error::not_found(format!("mirror image {id}")))
    }

    async fn mirror_image_set(&self, oid: &str, id: &ImageId, record: &MirrorImage) -> Result<()> {
        self.fail_point(StoreOp::MirrorImageSet)?;
        let mut objects = self.objects.write();
        objects
            .entry(oid.to_string())
            .or_default()
            .mirroring
            .get_or_insert_with(MirroringRecord::default)
            .images
            .insert(id.to_string(), record.clone());
        Ok(())
    }

    async fn create_self_managed_snapshot(&self) -> Result<u64> {
        self.fail_point(StoreOp::SnapCreate)?;
        let mut snapshots = self.snapshots.lock();
        snapshots.self_managed = true;
        snapshots.next_id += 1;
        let snap_id = snapshots.next_id;
        snapshots.live.insert(snap_id);
        debug!(snap_id, "allocated self-managed snapshot");
        Ok(snap_id)
    }

    async fn remove_self_managed_snapshot(&self, snap_id: u64) -> Result<()> {
        self.fail_point(StoreOp::SnapRemove)?;
        let mut snapshots = self.snapshots.lock();
        if snapshots.live.remove(&snap_id) {
            Ok(())
        } else {
            Err(Error::not_found(format!("snapshot {snap_id}")))
        }
    }
}
