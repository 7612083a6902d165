use chat_grapher_schemas::RunStats;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::importer::ChatImporter;
use crate::processor::ConversationProcessor;

/// The one import a service runs at a time.
///
/// An import runs on its own task and frees the slot when it ends, whether
/// or not the caller that started it is still waiting for the result.
#[derive(Default)]
pub struct ImportSlot {
    active: Mutex<Option<CancellationToken>>,
}

impl ImportSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_busy(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Ask the running import to stop scheduling; false when idle
    pub async fn cancel(&self) -> bool {
        match self.active.lock().await.as_ref() {
            Some(token) => {
                token.cancel();
                info!("Cancellation requested for the running import");
                true
            }
            None => false,
        }
    }

    /// Spawn an import of `location`, or `None` while another one holds the slot
    pub async fn start(
        self: &Arc<Self>,
        processor: Arc<ConversationProcessor>,
        importer: Box<dyn ChatImporter>,
        location: PathBuf,
    ) -> Option<JoinHandle<Result<RunStats>>> {
        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock().await;
            if active.is_some() {
                return None;
            }
            *active = Some(cancel.clone());
        }

        let slot = Arc::clone(self);
        Some(tokio::spawn(async move {
            let result = processor
                .process_import(importer.as_ref(), &location, &cancel)
                .await;
            slot.active.lock().await.take();
            debug!("Import slot released after {}", location.display());
            result
        }))
    }
}
