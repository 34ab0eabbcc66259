//! Capabilities handed to each pipeline run.

use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::media::MediaRegistry;
use crate::source::KeySource;
use snapvault_common::{CollectionId, ItemId, UserId};
use snapvault_crypto::PrimitiveProvider;
use snapvault_storage::{ObjectTransport, TransferService};

/// Everything a pipeline may touch.
///
/// A context is cheap to clone; each spawned pipeline owns its own copy and
/// shares nothing mutable with other pipelines except the media registry.
#[derive(Clone)]
pub struct PipelineContext {
    pub user_id: UserId,
    pub keys: Arc<dyn KeySource>,
    pub transfers: Arc<dyn TransferService>,
    pub transport: Arc<dyn ObjectTransport>,
    pub provider: Arc<dyn PrimitiveProvider>,
    pub media: Arc<MediaRegistry>,
    pub config: PipelineConfig,
}

impl PipelineContext {
    /// Create a context with a fresh media registry and default limits.
    pub fn new(
        user_id: UserId,
        keys: Arc<dyn KeySource>,
        transfers: Arc<dyn TransferService>,
        transport: Arc<dyn ObjectTransport>,
        provider: Arc<dyn PrimitiveProvider>,
    ) -> Self {
        Self {
            user_id,
            keys,
            transfers,
            transport,
            provider,
            media: Arc::new(MediaRegistry::new()),
            config: PipelineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_media(mut self, media: Arc<MediaRegistry>) -> Self {
        self.media = media;
        self
    }
}

/// Associated data binding an item's ciphertext to its location.
pub(crate) fn item_aad(collection_id: &CollectionId, item_id: &ItemId) -> Vec<u8> {
    let collection = collection_id.as_str();
    format!("snapvault-item:{}:{}/{}", collection.len(), collection, item_id).into_bytes()
}
