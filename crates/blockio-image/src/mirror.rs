//! Mirroring watcher seam
//!
//! Pools with mirroring enabled have watchers (the mirror daemons) that act
//! on image-updated notices. Delivery is best-effort: a watcher that misses
//! a notice catches up from the mirroring index on its next pass, so notify
//! failures are logged and never propagated.

use async_trait::async_trait;
use tokio::sync::broadcast;

use blockio_common::{ImageId, MirrorImageState, Result};

/// Notice that an image's mirroring state changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpdateNotice {
    /// New mirroring state of the image
    pub state: MirrorImageState,
    /// Image whose record changed
    pub image_id: ImageId,
    /// Global id shared by the image's replicas
    pub global_image_id: String,
}

/// Channel to the pool's mirroring watchers
#[async_trait]
pub trait MirrorNotifier: Send + Sync {
    /// Post an image-updated notice
    async fn notify_image_updated(&self, notice: ImageUpdateNotice) -> Result<()>;
}

/// Fan-out notifier over a broadcast channel.
///
/// Watchers subscribe for notices; with no subscribers a send simply drops
/// the notice, matching the watch-less pool case.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<ImageUpdateNotice>,
}

impl BroadcastNotifier {
    /// Create a notifier buffering up to `capacity` undelivered notices per
    /// subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to image-updated notices
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ImageUpdateNotice> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(16)
    }
}

#[async_trait]
impl MirrorNotifier for BroadcastNotifier {
    async fn notify_image_updated(&self, notice: ImageUpdateNotice) -> Result<()> {
        // A send error only means nobody is subscribed.
        let _ = self.tx.send(notice);
        Ok(())
    }
}
