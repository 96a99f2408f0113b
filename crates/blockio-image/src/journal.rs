//! Journal subsystem seam
//!
//! Journal metadata has its own create and remove state machines owned by
//! the journaling subsystem; the image pipeline only hands over the resolved
//! parameters and observes the final status. [`MemoryJournal`] is the
//! in-process implementation backing tests and embedded deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use blockio_common::{Error, ImageId, Result};

/// Parameters for creating an image's journal and its first tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalCreateParams {
    /// Image the journal belongs to
    pub image_id: ImageId,
    /// Journal object size exponent
    pub order: u8,
    /// Number of journal objects written round-robin
    pub splay_width: u8,
    /// Pool holding the journal objects; empty means the image's pool
    pub pool: String,
    /// Tag class for the first tag, or the new-class sentinel
    pub tag_class: u64,
    /// Tag owner: the local-primary sentinel or a remote primary's uuid
    pub mirror_uuid: String,
    /// Client id registered for the image
    pub client_id: String,
}

/// The external journaling subsystem's create/remove machines
#[async_trait]
pub trait JournalSubsystem: Send + Sync {
    /// Create journal metadata and the first tag for an image
    async fn create_journal(&self, params: JournalCreateParams) -> Result<()>;

    /// Remove an image's journal metadata
    async fn remove_journal(&self, image_id: &ImageId, client_id: &str) -> Result<()>;
}

/// In-process journal subsystem
#[derive(Default)]
pub struct MemoryJournal {
    journals: Mutex<HashMap<String, JournalCreateParams>>,
    create_faults: Mutex<Vec<Error>>,
    remove_faults: Mutex<Vec<Error>>,
}

impl MemoryJournal {
    /// Create an empty journal subsystem
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error for the next `create_journal` call
    pub fn inject_create_error(&self, err: Error) {
        self.create_faults.lock().push(err);
    }

    /// Queue an error for the next `remove_journal` call
    pub fn inject_remove_error(&self, err: Error) {
        self.remove_faults.lock().push(err);
    }

    /// Parameters the journal for `image_id` was created with, if any
    #[must_use]
    pub fn created(&self, image_id: &ImageId) -> Option<JournalCreateParams> {
        self.journals.lock().get(image_id.as_str()).cloned()
    }

    /// Whether no journals exist
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.journals.lock().is_empty()
    }
}

#[async_trait]
impl JournalSubsystem for MemoryJournal {
    async fn create_journal(&self, params: JournalCreateParams) -> Result<()> {
        if let Some(err) = self.create_faults.lock().pop() {
            return Err(err);
        }
        let mut journals = self.journals.lock();
        if journals.contains_key(params.image_id.as_str()) {
            return Err(Error::conflict(format!("journal {}", params.image_id)));
        }
        debug!(image_id = %params.image_id, order = params.order, "journal created");
        journals.insert(params.image_id.to_string(), params);
        Ok(())
    }

    async fn remove_journal(&self, image_id: &ImageId, _client_id: &str) -> Result<()> {
        if let Some(err) = self.remove_faults.lock().pop() {
            return Err(err);
        }
        self.journals
            .lock()
            .remove(image_id.as_str())
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("journal {image_id}")))
    }
}
