//! Image creation pipeline
//!
//! Creating an image persists up to six artifacts, one store round-trip at a
//! time: the id object, the directory entry, the header, the stripe layout,
//! the object map, and (for journaled images) the journal plus a mirror
//! record. The pipeline validates everything up front, then walks the steps
//! in order; the first failure triggers removal of every artifact already
//! written, in reverse order, and is returned to the caller. Cleanup
//! failures are logged and do not stop the unwind.
//!
//! Only one operation is ever in flight per request; concurrent creations
//! under the same image id are the caller's responsibility to serialize.

use std::sync::Arc;

use tracing::{debug, error, warn};
use uuid::Uuid;

use blockio_common::{
    data_object_prefix, header_object_name, id_object_name, object_map_name, CreateDefaults,
    Error, FeatureSet, ImageHeader, ImageId, ImageLayout, ImageName, MirrorImage,
    MirrorImageState, MirrorMode, ObjectMapState, PoolId, Result, IMAGE_DIRECTORY,
    MAX_OBJECT_MAP_ENTRIES, MIRRORING,
};
use blockio_store::StoreGateway;

use crate::journal::{JournalCreateParams, JournalSubsystem};
use crate::mirror::{ImageUpdateNotice, MirrorNotifier};
use crate::options::{CreateParams, ImageOptions};
use crate::{IMAGE_CLIENT_ID, LOCAL_MIRROR_UUID, TAG_CLASS_NEW};

/// Pipeline steps that leave artifacts behind, in forward order.
///
/// The ordering doubles as the rollback key: a failure at step `k` removes
/// the artifacts of every step up to and including `k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Step {
    CreateIdObject,
    AddToDirectory,
    CreateHeader,
    SetStripeUnitCount,
    ObjectMapResize,
    FetchMirrorMode,
    JournalCreate,
    FetchMirrorImage,
    MirrorImageEnable,
}

fn validate_features(features: FeatureSet, force_non_primary: bool) -> Result<()> {
    if FeatureSet::has_unknown_bits(features.bits()) {
        error!(features = features.bits(), "requested features are not supported");
        return Err(Error::unsupported(format!(
            "unknown feature bits {:#x}",
            features.bits() & !FeatureSet::SUPPORTED.bits()
        )));
    }
    if let Some(rule) = features.dependency_violation() {
        error!(rule, "feature dependency violated");
        return Err(Error::invalid_argument(rule));
    }
    if force_non_primary && !features.contains(FeatureSet::JOURNALING) {
        // A replica of a remote primary is journal-fed by definition; a
        // caller reaching this point bypassed its own request construction.
        return Err(Error::internal(
            "non-primary image requested without journaling",
        ));
    }
    Ok(())
}

fn validate_order(order: u8) -> Result<()> {
    if !(12..=25).contains(&order) {
        error!(order, "order must be in the range [12, 25]");
        return Err(Error::OutOfRange {
            what: "order",
            value: u64::from(order),
            min: 12,
            max: 25,
        });
    }
    Ok(())
}

fn validate_striping(object_size: u64, stripe_unit: u64, stripe_count: u64) -> Result<()> {
    if (stripe_unit == 0) != (stripe_count == 0) {
        error!("must specify both (or neither) of stripe-unit and stripe-count");
        return Err(Error::invalid_argument(
            "must specify both (or neither) of stripe-unit and stripe-count",
        ));
    }
    if stripe_unit != 0 && (object_size % stripe_unit != 0 || stripe_unit > object_size) {
        error!(stripe_unit, object_size, "stripe unit is not a factor of the object size");
        return Err(Error::invalid_argument(
            "stripe unit is not a factor of the object size",
        ));
    }
    Ok(())
}

fn validate_layout(layout: ImageLayout, size: u64) -> Result<()> {
    if layout.object_count(size) > MAX_OBJECT_MAP_ENTRIES {
        error!(size, "image size not compatible with object map");
        return Err(Error::invalid_argument(
            "image size not compatible with object map",
        ));
    }
    Ok(())
}

/// One image-creation request.
///
/// Built from resolved [`CreateParams`], consumed by [`send`](Self::send),
/// which resolves exactly once with the overall outcome.
pub struct CreateRequest {
    store: Arc<dyn StoreGateway>,
    journal: Arc<dyn JournalSubsystem>,
    notifier: Arc<dyn MirrorNotifier>,
    params: CreateParams,
    pool_validation: bool,

    id_obj: String,
    header_obj: String,
    objmap_obj: String,

    data_pool_id: PoolId,
    mirror_mode: MirrorMode,
    mirror_image: MirrorImage,
    id_object_created: bool,
    header_created: bool,
}

impl CreateRequest {
    /// Build a request from resolved parameters
    pub fn new(
        store: Arc<dyn StoreGateway>,
        journal: Arc<dyn JournalSubsystem>,
        notifier: Arc<dyn MirrorNotifier>,
        params: CreateParams,
    ) -> Self {
        let id_obj = id_object_name(&params.name);
        let header_obj = header_object_name(&params.id);
        let objmap_obj = object_map_name(&params.id);
        Self {
            store,
            journal,
            notifier,
            params,
            pool_validation: true,
            id_obj,
            header_obj,
            objmap_obj,
            data_pool_id: PoolId::NONE,
            mirror_mode: MirrorMode::Disabled,
            mirror_image: MirrorImage::default(),
            id_object_created: false,
            header_created: false,
        }
    }

    /// Enable or disable the initial pool-directory probe
    #[must_use]
    pub fn pool_validation(mut self, enabled: bool) -> Self {
        self.pool_validation = enabled;
        self
    }

    /// Run the pipeline to completion.
    ///
    /// On success every artifact of the resolved feature set exists; on
    /// failure the pool is restored and the first failure is returned.
    pub async fn send(mut self) -> Result<()> {
        validate_features(self.params.features, self.params.force_non_primary)?;
        validate_order(self.params.order)?;
        validate_striping(
            self.params.layout.object_size,
            self.params.stripe_unit,
            self.params.stripe_count,
        )?;
        self.data_pool_id = self.resolve_data_pool().await?;
        validate_layout(self.params.layout, self.params.size)?;

        debug!(
            name = %self.params.name,
            id = %self.params.id,
            size = self.params.size,
            features = ?self.params.features,
            order = self.params.order,
            stripe_unit = self.params.stripe_unit,
            stripe_count = self.params.stripe_count,
            journal_order = self.params.journal_order,
            journal_splay_width = self.params.journal_splay_width,
            journal_pool = %self.params.journal_pool,
            data_pool = %self.params.data_pool,
            "creating image",
        );

        if self.pool_validation {
            self.validate_pool().await?;
        }

        match self.execute().await {
            Ok(()) => {
                debug!(name = %self.params.name, id = %self.params.id, "image created");
                Ok(())
            }
            Err((step, error)) => {
                warn!(?step, %error, "image creation failed, rolling back");
                self.rollback(step).await;
                Err(error)
            }
        }
    }

    async fn execute(&mut self) -> std::result::Result<(), (Step, Error)> {
        self.create_id_object()
            .await
            .map_err(|e| (Step::CreateIdObject, e))?;
        self.add_to_directory()
            .await
            .map_err(|e| (Step::AddToDirectory, e))?;
        self.create_header()
            .await
            .map_err(|e| (Step::CreateHeader, e))?;
        self.set_stripe_unit_count()
            .await
            .map_err(|e| (Step::SetStripeUnitCount, e))?;
        self.object_map_resize()
            .await
            .map_err(|e| (Step::ObjectMapResize, e))?;

        if !self.params.features.contains(FeatureSet::JOURNALING) {
            return Ok(());
        }
        self.fetch_mirror_mode()
            .await
            .map_err(|e| (Step::FetchMirrorMode, e))?;
        self.journal_create()
            .await
            .map_err(|e| (Step::JournalCreate, e))?;

        if self.mirror_mode != MirrorMode::Pool && !self.params.force_non_primary {
            return Ok(());
        }
        let already_enabled = self
            .fetch_mirror_image()
            .await
            .map_err(|e| (Step::FetchMirrorImage, e))?;
        if already_enabled {
            return Ok(());
        }
        self.mirror_image_enable()
            .await
            .map_err(|e| (Step::MirrorImageEnable, e))?;
        self.notify_watchers().await;
        Ok(())
    }

    async fn resolve_data_pool(&self) -> Result<PoolId> {
        if !self.params.features.contains(FeatureSet::DATA_POOL) {
            return Ok(PoolId::NONE);
        }
        match self.store.lookup_pool_id(&self.params.data_pool).await {
            Ok(pool_id) => Ok(pool_id),
            Err(err) => {
                error!(data_pool = %self.params.data_pool, %err, "data pool does not exist");
                Err(err)
            }
        }
    }

    /// Probe the pool directory; a fresh pool is switched into self-managed
    /// snapshot mode by allocating and releasing one snapshot id.
    async fn validate_pool(&self) -> Result<()> {
        match self.store.stat(IMAGE_DIRECTORY).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                error!(%err, "failed to stat image directory");
                return Err(err);
            }
        }

        let snap_id = match self.store.create_self_managed_snapshot().await {
            Ok(snap_id) => snap_id,
            Err(err) => {
                error!(%err, "failed to allocate self-managed snapshot");
                return Err(err);
            }
        };
        if let Err(err) = self.store.remove_self_managed_snapshot(snap_id).await {
            // The pool has already switched modes; the leaked id is harmless.
            warn!(snap_id, %err, "failed to release self-managed snapshot");
        }
        Ok(())
    }

    async fn create_id_object(&mut self) -> Result<()> {
        debug!(oid = %self.id_obj, "creating id object");
        self.store.create(&self.id_obj, true).await?;
        self.id_object_created = true;
        self.store.set_id(&self.id_obj, &self.params.id).await
    }

    async fn add_to_directory(&self) -> Result<()> {
        debug!(name = %self.params.name, "adding image to directory");
        self.store
            .dir_add(IMAGE_DIRECTORY, &self.params.name, &self.params.id)
            .await
    }

    async fn create_header(&mut self) -> Result<()> {
        debug!(oid = %self.header_obj, "writing image header");
        let header = ImageHeader {
            size: self.params.size,
            order: self.params.order,
            features: self.params.features,
            object_prefix: data_object_prefix(
                self.store.pool_id(),
                self.data_pool_id,
                &self.params.id,
            ),
            data_pool_id: self.data_pool_id,
        };
        self.store.create(&self.header_obj, true).await?;
        self.header_created = true;
        self.store.write_header(&self.header_obj, &header).await
    }

    async fn set_stripe_unit_count(&self) -> Result<()> {
        if self.params.default_striping() {
            return Ok(());
        }
        debug!(
            stripe_unit = self.params.stripe_unit,
            stripe_count = self.params.stripe_count,
            "persisting stripe layout",
        );
        self.store
            .set_stripe_unit_count(
                &self.header_obj,
                self.params.stripe_unit,
                self.params.stripe_count,
            )
            .await
    }

    async fn object_map_resize(&self) -> Result<()> {
        if !self.params.features.contains(FeatureSet::OBJECT_MAP) {
            return Ok(());
        }
        let entry_count = self.params.layout.object_count(self.params.size);
        debug!(entry_count, "initializing object map");
        self.store
            .object_map_resize(&self.objmap_obj, entry_count, ObjectMapState::Nonexistent)
            .await
    }

    async fn fetch_mirror_mode(&mut self) -> Result<()> {
        self.mirror_mode = match self.store.mirror_mode_get(MIRRORING).await {
            Ok(mode) => mode,
            // No mirroring object yet means mirroring was never enabled.
            Err(err) if err.is_not_found() => MirrorMode::Disabled,
            Err(err) => {
                error!(%err, "failed to retrieve mirror mode");
                return Err(err);
            }
        };
        debug!(mirror_mode = ?self.mirror_mode, "fetched pool mirror mode");
        Ok(())
    }

    async fn journal_create(&self) -> Result<()> {
        debug!(id = %self.params.id, "creating journal");
        let mirror_uuid = if self.params.force_non_primary {
            self.params.primary_mirror_uuid.clone()
        } else {
            LOCAL_MIRROR_UUID.to_string()
        };
        self.journal
            .create_journal(JournalCreateParams {
                image_id: self.params.id.clone(),
                order: self.params.journal_order,
                splay_width: self.params.journal_splay_width,
                pool: self.params.journal_pool.clone(),
                tag_class: TAG_CLASS_NEW,
                mirror_uuid,
                client_id: IMAGE_CLIENT_ID.to_string(),
            })
            .await
    }

    /// Returns true when a record already marked Enabled makes the
    /// remaining steps unnecessary.
    async fn fetch_mirror_image(&mut self) -> Result<bool> {
        match self.store.mirror_image_get(MIRRORING, &self.params.id).await {
            Ok(record) => {
                let enabled = record.state == MirrorImageState::Enabled;
                self.mirror_image = record;
                if enabled {
                    debug!(id = %self.params.id, "image mirroring already enabled");
                }
                Ok(enabled)
            }
            // Absent record: enable from scratch.
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => {
                error!(%err, "cannot enable mirroring");
                Err(err)
            }
        }
    }

    async fn mirror_image_enable(&mut self) -> Result<()> {
        self.mirror_image.state = MirrorImageState::Enabled;
        self.mirror_image.global_image_id = if self.params.non_primary_global_image_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            self.params.non_primary_global_image_id.clone()
        };
        debug!(
            global_image_id = %self.mirror_image.global_image_id,
            "enabling image mirroring",
        );
        self.store
            .mirror_image_set(MIRRORING, &self.params.id, &self.mirror_image)
            .await
    }

    async fn notify_watchers(&self) {
        let notice = ImageUpdateNotice {
            state: MirrorImageState::Enabled,
            image_id: self.params.id.clone(),
            global_image_id: self.mirror_image.global_image_id.clone(),
        };
        if let Err(err) = self.notifier.notify_image_updated(notice).await {
            // Watchers reconcile from the mirroring index on their next pass.
            warn!(%err, "failed to send update notification");
        } else {
            debug!(
                global_image_id = %self.mirror_image.global_image_id,
                "image mirroring is enabled",
            );
        }
    }

    /// Remove every artifact written before `failed`, newest first.
    async fn rollback(&mut self, failed: Step) {
        if failed >= Step::FetchMirrorImage {
            self.journal_remove().await;
        }
        if failed >= Step::ObjectMapResize {
            self.remove_object_map().await;
        }
        if failed >= Step::CreateHeader {
            self.remove_header_object().await;
        }
        if failed >= Step::AddToDirectory {
            self.remove_from_directory().await;
        }
        self.remove_id_object().await;
    }

    async fn journal_remove(&self) {
        if !self.params.features.contains(FeatureSet::JOURNALING) {
            return;
        }
        if let Err(err) = self
            .journal
            .remove_journal(&self.params.id, IMAGE_CLIENT_ID)
            .await
        {
            warn!(%err, "error cleaning up journal after creation failed");
        }
    }

    async fn remove_object_map(&self) {
        if !self.params.features.contains(FeatureSet::OBJECT_MAP) {
            return;
        }
        if let Err(err) = self.store.remove(&self.objmap_obj).await {
            warn!(%err, "error cleaning up object map after creation failed");
        }
    }

    async fn remove_header_object(&self) {
        if !self.header_created {
            return;
        }
        if let Err(err) = self.store.remove(&self.header_obj).await {
            warn!(%err, "error cleaning up image header after creation failed");
        }
    }

    async fn remove_from_directory(&self) {
        if let Err(err) = self
            .store
            .dir_remove(IMAGE_DIRECTORY, &self.params.name, &self.params.id)
            .await
        {
            warn!(%err, "error cleaning up directory entry after creation failed");
        }
    }

    async fn remove_id_object(&self) {
        if !self.id_object_created {
            return;
        }
        if let Err(err) = self.store.remove(&self.id_obj).await {
            warn!(%err, "error cleaning up id object after creation failed");
        }
    }
}

/// Resolve options against the defaults and create a local primary image.
///
/// Replicas of a remote primary build their [`CreateParams`] directly and
/// drive a [`CreateRequest`] themselves.
#[allow(clippy::too_many_arguments)]
pub async fn create_image(
    store: Arc<dyn StoreGateway>,
    journal: Arc<dyn JournalSubsystem>,
    notifier: Arc<dyn MirrorNotifier>,
    name: ImageName,
    id: ImageId,
    size: u64,
    options: &ImageOptions,
    defaults: &CreateDefaults,
) -> Result<()> {
    let params = CreateParams::resolve(
        name,
        id,
        size,
        "",
        "",
        options,
        defaults,
        store.pool_name(),
    );
    CreateRequest::new(store, journal, notifier, params)
        .pool_validation(defaults.validate_pool)
        .send()
        .await
}
