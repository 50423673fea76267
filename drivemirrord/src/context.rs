use std::sync::Arc;

use drivemirror_core::RemoteDrive;

use crate::sync::index::MirrorStore;

/// Shared handles the engines are built from. The caller owns both and
/// decides when the store is closed.
#[derive(Clone)]
pub struct DriveContext {
    pub remote: Arc<dyn RemoteDrive>,
    pub store: Arc<MirrorStore>,
}

impl DriveContext {
    pub fn new(remote: Arc<dyn RemoteDrive>, store: Arc<MirrorStore>) -> Self {
        Self { remote, store }
    }
}
