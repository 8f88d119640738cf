//! Copy-on-write configuration snapshots.
//!
//! Readers take an `Arc<ConfigModel>` and keep it for the lifetime of one
//! execution. A reload links a whole new model and swaps it in atomically;
//! if linking fails the current snapshot stays active.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{error, info};

use super::link::{link_with_epoch, ConfigErrors};
use super::model::ConfigModel;
use crate::domain::Document;

pub struct SnapshotStore {
    current: ArcSwap<ConfigModel>,
    epoch: AtomicU64,

    /// Serializes reloads so epochs are stored in order
    reload_lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(model: ConfigModel) -> Self {
        let epoch = model.epoch();
        Self {
            current: ArcSwap::from_pointee(model),
            epoch: AtomicU64::new(epoch),
            reload_lock: Mutex::new(()),
        }
    }

    /// Link `document` as the first snapshot
    pub fn from_document(document: Document) -> Result<Self, ConfigErrors> {
        Ok(Self::new(link_with_epoch(document, 0)?))
    }

    /// The active snapshot
    pub fn current(&self) -> Arc<ConfigModel> {
        self.current.load_full()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Validate `document` and make it the active snapshot.
    ///
    /// On failure the previous snapshot remains active and every validation
    /// error is returned.
    pub fn reload(&self, document: Document) -> Result<Arc<ConfigModel>, ConfigErrors> {
        let _guard = self.reload_lock.lock();
        let next_epoch = self.epoch.load(Ordering::Acquire).saturating_add(1);

        match link_with_epoch(document, next_epoch) {
            Ok(model) => {
                let model = Arc::new(model);
                self.current.store(model.clone());
                self.epoch.store(next_epoch, Ordering::Release);
                info!(
                    epoch = next_epoch,
                    warnings = model.warnings().len(),
                    "Configuration reloaded"
                );
                Ok(model)
            }
            Err(errors) => {
                error!(
                    epoch = self.epoch(),
                    errors = errors.errors().len(),
                    "Configuration reload rejected, keeping current snapshot"
                );
                Err(errors)
            }
        }
    }
}
