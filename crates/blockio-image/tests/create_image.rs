//! End-to-end creation pipeline tests against the in-memory store.

use std::sync::Arc;

use tokio::sync::broadcast::error::TryRecvError;

use blockio_common::{
    header_object_name, id_object_name, object_map_name, CreateDefaults, Error, FeatureSet,
    ImageId, ImageName, MirrorImage, MirrorImageState, MirrorMode, PoolId, IMAGE_DIRECTORY,
    MIRRORING,
};
use blockio_image::{
    create_image, BroadcastNotifier, CreateParams, CreateRequest, ImageOptions, MemoryJournal,
    LOCAL_MIRROR_UUID, TAG_CLASS_NEW,
};
use blockio_store::{MemoryStore, StoreGateway, StoreOp};

const GIB: u64 = 1 << 30;

fn image_name() -> ImageName {
    ImageName::new("img1").unwrap()
}

fn image_id() -> ImageId {
    ImageId::new("10af6b8b4567").unwrap()
}

fn full_features() -> FeatureSet {
    FeatureSet::LAYERING
        | FeatureSet::EXCLUSIVE_LOCK
        | FeatureSet::OBJECT_MAP
        | FeatureSet::FAST_DIFF
        | FeatureSet::JOURNALING
}

struct Harness {
    store: Arc<MemoryStore>,
    journal: Arc<MemoryJournal>,
    notifier: Arc<BroadcastNotifier>,
    defaults: CreateDefaults,
}

impl Harness {
    /// Pool "rbd" (id 2) with an existing image directory
    fn new() -> Self {
        let harness = Self::fresh_pool();
        harness.store.seed_directory(IMAGE_DIRECTORY);
        harness
    }

    /// Pool that has never held an image
    fn fresh_pool() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        Self {
            store: Arc::new(MemoryStore::new("rbd", PoolId::new(2))),
            journal: Arc::new(MemoryJournal::new()),
            notifier: Arc::new(BroadcastNotifier::default()),
            defaults: CreateDefaults::default(),
        }
    }

    fn params(&self, size: u64, options: &ImageOptions) -> CreateParams {
        CreateParams::resolve(
            image_name(),
            image_id(),
            size,
            "",
            "",
            options,
            &self.defaults,
            self.store.pool_name(),
        )
    }

    fn replica_params(
        &self,
        options: &ImageOptions,
        global_image_id: &str,
        primary_mirror_uuid: &str,
    ) -> CreateParams {
        CreateParams::resolve(
            image_name(),
            image_id(),
            GIB,
            global_image_id,
            primary_mirror_uuid,
            options,
            &self.defaults,
            self.store.pool_name(),
        )
    }

    async fn run(&self, params: CreateParams) -> Result<(), Error> {
        CreateRequest::new(
            self.store.clone(),
            self.journal.clone(),
            self.notifier.clone(),
            params,
        )
        .send()
        .await
    }
}

#[tokio::test]
async fn minimal_defaults_creates_core_artifacts() {
    let h = Harness::new();
    let options = ImageOptions::new().with_features(FeatureSet::LAYERING);
    let params = h.params(4 * 1024 * 1024, &options);

    h.run(params).await.unwrap();

    assert!(h.store.object_exists(&id_object_name(&image_name())));
    assert_eq!(
        h.store
            .dir_get(IMAGE_DIRECTORY, &image_name())
            .await
            .unwrap(),
        image_id()
    );

    let header = h
        .store
        .read_header(&header_object_name(&image_id()))
        .await
        .unwrap();
    assert_eq!(header.size, 4 * 1024 * 1024);
    assert_eq!(header.order, 22);
    assert_eq!(header.features, FeatureSet::LAYERING);
    assert_eq!(header.object_prefix, "rbd_data.10af6b8b4567");
    assert_eq!(header.data_pool_id, PoolId::NONE);

    // No object map, journal, or mirror record for this feature set.
    assert!(!h.store.object_exists(&object_map_name(&image_id())));
    assert!(h.journal.is_empty());
    assert!(h
        .store
        .mirror_image_get(MIRRORING, &image_id())
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn full_featured_creates_object_map_and_journal() {
    let h = Harness::new();
    let options = ImageOptions::new().with_features(full_features());

    h.run(h.params(GIB, &options)).await.unwrap();

    // 1 GiB of 4 MiB objects.
    let map_len = h
        .store
        .object_map_len(&object_map_name(&image_id()))
        .await
        .unwrap();
    assert_eq!(map_len, 256);

    let journal = h.journal.created(&image_id()).unwrap();
    assert_eq!(journal.order, 24);
    assert_eq!(journal.splay_width, 4);
    assert_eq!(journal.tag_class, TAG_CLASS_NEW);
    assert_eq!(journal.mirror_uuid, LOCAL_MIRROR_UUID);

    // Pool mirroring was never enabled, so no record was written.
    assert!(h
        .store
        .mirror_image_get(MIRRORING, &image_id())
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn pool_mirror_mode_enables_mirroring() {
    let h = Harness::new();
    h.store.set_mirror_mode(MIRRORING, MirrorMode::Pool);
    let mut notices = h.notifier.subscribe();
    let options = ImageOptions::new().with_features(full_features());

    h.run(h.params(GIB, &options)).await.unwrap();

    let record = h
        .store
        .mirror_image_get(MIRRORING, &image_id())
        .await
        .unwrap();
    assert_eq!(record.state, MirrorImageState::Enabled);
    assert!(!record.global_image_id.is_empty());

    let notice = notices.try_recv().unwrap();
    assert_eq!(notice.image_id, image_id());
    assert_eq!(notice.global_image_id, record.global_image_id);
    assert_eq!(notice.state, MirrorImageState::Enabled);
}

#[tokio::test]
async fn per_image_mirror_mode_does_not_enable() {
    let h = Harness::new();
    h.store.set_mirror_mode(MIRRORING, MirrorMode::Image);
    let options = ImageOptions::new().with_features(full_features());

    h.run(h.params(GIB, &options)).await.unwrap();

    assert!(h
        .store
        .mirror_image_get(MIRRORING, &image_id())
        .await
        .unwrap_err()
        .is_not_found());
    // The journal still exists: it is a feature artifact, not a mirror one.
    assert!(h.journal.created(&image_id()).is_some());
}

#[tokio::test]
async fn replica_uses_supplied_global_id_regardless_of_mode() {
    let h = Harness::new();
    let options = ImageOptions::new().with_features(full_features());
    let params = h.replica_params(&options, "abcd-ef01-2345", "primary-uuid-5678");

    h.run(params).await.unwrap();

    let record = h
        .store
        .mirror_image_get(MIRRORING, &image_id())
        .await
        .unwrap();
    assert_eq!(record.state, MirrorImageState::Enabled);
    assert_eq!(record.global_image_id, "abcd-ef01-2345");

    // The journal tag is owned by the remote primary.
    let journal = h.journal.created(&image_id()).unwrap();
    assert_eq!(journal.mirror_uuid, "primary-uuid-5678");
}

#[tokio::test]
async fn existing_enabled_record_short_circuits() {
    let h = Harness::new();
    h.store.set_mirror_mode(MIRRORING, MirrorMode::Pool);
    h.store.seed_mirror_image(
        MIRRORING,
        &image_id(),
        MirrorImage {
            global_image_id: "pre-existing".to_string(),
            state: MirrorImageState::Enabled,
        },
    );
    let mut notices = h.notifier.subscribe();
    let options = ImageOptions::new().with_features(full_features());

    h.run(h.params(GIB, &options)).await.unwrap();

    // The record is untouched and no notification went out.
    let record = h
        .store
        .mirror_image_get(MIRRORING, &image_id())
        .await
        .unwrap();
    assert_eq!(record.global_image_id, "pre-existing");
    assert!(matches!(notices.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn disabling_record_is_reenabled() {
    let h = Harness::new();
    h.store.set_mirror_mode(MIRRORING, MirrorMode::Pool);
    h.store.seed_mirror_image(
        MIRRORING,
        &image_id(),
        MirrorImage {
            global_image_id: "old-uuid".to_string(),
            state: MirrorImageState::Disabling,
        },
    );
    let options = ImageOptions::new().with_features(full_features());

    h.run(h.params(GIB, &options)).await.unwrap();

    let record = h
        .store
        .mirror_image_get(MIRRORING, &image_id())
        .await
        .unwrap();
    assert_eq!(record.state, MirrorImageState::Enabled);
    assert_ne!(record.global_image_id, "old-uuid");
}

#[tokio::test]
async fn duplicate_create_conflicts_and_preserves_first_image() {
    let h = Harness::new();
    let options = ImageOptions::new().with_features(FeatureSet::LAYERING);

    h.run(h.params(GIB, &options)).await.unwrap();
    let after_first = h.store.snapshot();

    let err = h.run(h.params(GIB, &options)).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(h.store.snapshot(), after_first);
}

#[tokio::test]
async fn failure_at_each_step_restores_pool() {
    let injected = || Error::store_io("injected");
    let cases: Vec<(&str, fn(&Harness))> = vec![
        ("id object create", |h| {
            h.store.inject_error(StoreOp::Create, Error::store_io("injected"))
        }),
        ("id write", |h| {
            h.store.inject_error(StoreOp::SetId, Error::store_io("injected"))
        }),
        ("directory add", |h| {
            h.store.inject_error(StoreOp::DirAdd, Error::store_io("injected"))
        }),
        ("header create", |h| {
            h.store
                .inject_error_after(StoreOp::Create, 1, Error::store_io("injected"))
        }),
        ("header write", |h| {
            h.store
                .inject_error(StoreOp::WriteHeader, Error::store_io("injected"))
        }),
        ("stripe layout", |h| {
            h.store
                .inject_error(StoreOp::SetStripeUnitCount, Error::store_io("injected"))
        }),
        ("object map resize", |h| {
            h.store
                .inject_error(StoreOp::ObjectMapResize, Error::store_io("injected"))
        }),
        ("mirror mode fetch", |h| {
            h.store
                .inject_error(StoreOp::MirrorModeGet, Error::store_io("injected"))
        }),
        ("journal create", |h| {
            h.journal.inject_create_error(Error::store_io("injected"))
        }),
        ("mirror record fetch", |h| {
            h.store
                .inject_error(StoreOp::MirrorImageGet, Error::store_io("injected"))
        }),
        ("mirror record write", |h| {
            h.store
                .inject_error(StoreOp::MirrorImageSet, Error::store_io("injected"))
        }),
    ];

    for (label, inject) in cases {
        let h = Harness::new();
        h.store.set_mirror_mode(MIRRORING, MirrorMode::Pool);
        h.store.add_peer_pool("fast-ssd", PoolId::new(3));
        let options = ImageOptions::new()
            .with_features(full_features())
            .with_striping(64 * 1024, 4)
            .with_data_pool("fast-ssd");
        let params = h.params(GIB, &options);
        let before = h.store.snapshot();

        inject(&h);
        let err = h.run(params).await.unwrap_err();

        assert_eq!(err, injected(), "failure at {label}");
        assert_eq!(h.store.snapshot(), before, "pool state after {label}");
        assert!(h.journal.is_empty(), "journal after {label}");
    }
}

#[tokio::test]
async fn secondary_cleanup_failures_keep_first_error() {
    let h = Harness::new();
    h.store.set_mirror_mode(MIRRORING, MirrorMode::Pool);
    let options = ImageOptions::new().with_features(full_features());
    let params = h.params(GIB, &options);

    // Fail the mirror record write, then sabotage two cleanup steps: the
    // object-map removal (the first remove of the unwind) and the journal
    // removal.
    h.store
        .inject_error(StoreOp::MirrorImageSet, Error::store_io("first"));
    h.store
        .inject_error(StoreOp::Remove, Error::store_io("secondary"));
    h.journal.inject_remove_error(Error::store_io("secondary"));

    let err = h.run(params).await.unwrap_err();
    assert_eq!(err, Error::store_io("first"));

    // The unwind pressed on past the failed steps: header, directory entry,
    // and id object are gone; the object map and journal remain as debris.
    assert!(h.store.object_exists(&object_map_name(&image_id())));
    assert!(!h.journal.is_empty());
    assert!(!h.store.object_exists(&header_object_name(&image_id())));
    assert!(!h.store.object_exists(&id_object_name(&image_name())));
    assert!(h
        .store
        .dir_get(IMAGE_DIRECTORY, &image_name())
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn fresh_pool_is_switched_to_self_managed_snapshots() {
    let h = Harness::fresh_pool();
    let options = ImageOptions::new().with_features(FeatureSet::LAYERING);

    h.run(h.params(GIB, &options)).await.unwrap();

    assert!(h.store.self_managed_snapshots());
    assert_eq!(h.store.live_snapshot_count(), 0);
}

#[tokio::test]
async fn pool_probe_can_be_disabled() {
    let h = Harness::fresh_pool();
    let options = ImageOptions::new().with_features(FeatureSet::LAYERING);
    let params = h.params(GIB, &options);

    CreateRequest::new(
        h.store.clone(),
        h.journal.clone(),
        h.notifier.clone(),
        params,
    )
    .pool_validation(false)
    .send()
    .await
    .unwrap();

    assert!(!h.store.self_managed_snapshots());
}

#[tokio::test]
async fn pool_probe_failure_aborts_before_side_effects() {
    let h = Harness::fresh_pool();
    let options = ImageOptions::new().with_features(FeatureSet::LAYERING);
    let before = h.store.snapshot();

    // The snapshot allocation failing means the pool cannot hold images.
    h.store
        .inject_error(StoreOp::SnapCreate, Error::invalid_argument("not configured"));
    let err = h.run(h.params(GIB, &options)).await.unwrap_err();
    assert_eq!(err, Error::invalid_argument("not configured"));
    assert_eq!(h.store.snapshot(), before);

    // A directory probe error other than not-found also aborts.
    h.store.inject_error(StoreOp::Stat, Error::store_io("probe"));
    let err = h.run(h.params(GIB, &options)).await.unwrap_err();
    assert_eq!(err, Error::store_io("probe"));
    assert_eq!(h.store.snapshot(), before);
}

#[tokio::test]
async fn invalid_parameters_fail_without_side_effects() {
    let h = Harness::new();
    let before = h.store.snapshot();

    let order_low = h.params(GIB, &ImageOptions::new().with_order(11));
    assert!(matches!(
        h.run(order_low).await.unwrap_err(),
        Error::OutOfRange { value: 11, .. }
    ));

    let order_high = h.params(GIB, &ImageOptions::new().with_order(26));
    assert!(matches!(
        h.run(order_high).await.unwrap_err(),
        Error::OutOfRange { value: 26, .. }
    ));

    let half_striped = h.params(GIB, &ImageOptions::new().with_striping(0, 3));
    assert!(matches!(
        h.run(half_striped).await.unwrap_err(),
        Error::InvalidArgument(_)
    ));

    let bad_unit = h.params(GIB, &ImageOptions::new().with_striping((1 << 22) + 1, 1));
    assert!(matches!(
        h.run(bad_unit).await.unwrap_err(),
        Error::InvalidArgument(_)
    ));

    let unknown_pool = h.params(GIB, &ImageOptions::new().with_data_pool("no-such-pool"));
    assert!(h.run(unknown_pool).await.unwrap_err().is_not_found());

    // A replica request without journaling is a caller bug.
    let options = ImageOptions::new().with_features(FeatureSet::LAYERING);
    let replica = h.replica_params(&options, "abcd-ef01-2345", "primary-uuid");
    assert!(h.run(replica).await.unwrap_err().is_fatal());

    assert_eq!(h.store.snapshot(), before);
}

#[tokio::test]
async fn malformed_mirror_mode_rolls_back() {
    let h = Harness::new();
    h.store.set_raw_mirror_mode(MIRRORING, 7);
    let options = ImageOptions::new().with_features(full_features());
    let before = h.store.snapshot();

    let err = h.run(h.params(GIB, &options)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(h.store.snapshot(), before);
}

#[tokio::test]
async fn striped_image_with_data_pool_records_layout() {
    let h = Harness::new();
    h.store.add_peer_pool("fast-ssd", PoolId::new(3));
    let options = ImageOptions::new()
        .with_striping(64 * 1024, 4)
        .with_data_pool("fast-ssd");

    h.run(h.params(GIB, &options)).await.unwrap();

    let header = h
        .store
        .read_header(&header_object_name(&image_id()))
        .await
        .unwrap();
    assert!(header.features.contains(FeatureSet::STRIPINGV2));
    assert!(header.features.contains(FeatureSet::DATA_POOL));
    assert_eq!(header.data_pool_id, PoolId::new(3));
    // The primary pool id is embedded when data lives elsewhere.
    assert_eq!(header.object_prefix, "rbd_data.2.10af6b8b4567");

    assert_eq!(
        h.store
            .stripe_unit_count(&header_object_name(&image_id())),
        Some((64 * 1024, 4))
    );

    let map_len = h
        .store
        .object_map_len(&object_map_name(&image_id()))
        .await
        .unwrap();
    assert_eq!(map_len, 256);
}

#[tokio::test]
async fn create_image_resolves_options_against_defaults() {
    let h = Harness::new();

    create_image(
        h.store.clone(),
        h.journal.clone(),
        h.notifier.clone(),
        image_name(),
        image_id(),
        GIB,
        &ImageOptions::new(),
        &h.defaults,
    )
    .await
    .unwrap();

    let header = h
        .store
        .read_header(&header_object_name(&image_id()))
        .await
        .unwrap();
    assert_eq!(header.features, FeatureSet::default());
    assert_eq!(header.order, 22);
    // The default feature set carries an object map.
    assert!(h.store.object_exists(&object_map_name(&image_id())));
}
