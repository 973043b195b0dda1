use dg_core::core::{
    build_fine_tune_job, parse_requested_status, CreateFineTuneCommand, EntityKind, FineTune,
    ModelDescriptor, NotFoundError, PipelineError, Status,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::CatalogService;

/// Status callback for a training run. `model` is kept only with DONE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FineTuneStatusUpdate {
    pub entity_id: Uuid,
    pub status: String,
    #[serde(default)]
    pub model: Option<ModelDescriptor>,
}

impl CatalogService {
    pub async fn create_fine_tune(
        &self,
        command: CreateFineTuneCommand,
    ) -> Result<FineTune, PipelineError> {
        let dataset = self.dataset(command.dataset_id).await?;
        let planned = command.into_fine_tune(dataset.project_id, self.clock.now());
        let job = build_fine_tune_job(&planned, &dataset)?;

        let fine_tune = self
            .blocking(move |store| store.insert_fine_tune(&planned))
            .await?;
        info!(
            fine_tune_id = %fine_tune.id,
            dataset_id = %dataset.id,
            version = fine_tune.version,
            "fine-tune planned"
        );

        if let Err(e) = self.queue.submit(&job).await {
            warn!(fine_tune_id = %fine_tune.id, error = %e, "job submission failed, fine-tune left in PLANNING");
            return Err(e);
        }
        Ok(fine_tune)
    }

    pub async fn fine_tune(&self, id: Uuid) -> Result<FineTune, PipelineError> {
        self.blocking(move |store| store.get_fine_tune(&id))
            .await?
            .ok_or_else(|| {
                NotFoundError::Entity {
                    kind: EntityKind::FineTune,
                    id,
                }
                .into()
            })
    }

    pub async fn delete_fine_tune(&self, id: Uuid) -> Result<(), PipelineError> {
        let _guard = self.locks.lock(id).await;
        let at = self.clock.now();
        self.blocking(move |store| store.update_fine_tune_status(&id, Status::Deleted, None, at))
            .await?;
        info!(fine_tune_id = %id, "fine-tune deleted");
        Ok(())
    }

    pub async fn update_fine_tune_status(
        &self,
        update: FineTuneStatusUpdate,
    ) -> Result<FineTune, PipelineError> {
        let id = update.entity_id;
        let _guard = self.locks.lock(id).await;
        let current = self.fine_tune(id).await?;

        let requested = parse_requested_status(current.status, &update.status).inspect_err(|e| {
            warn!(fine_tune_id = %id, current = %current.status, error = %e, "status update rejected");
        })?;
        let model = update.model.filter(|_| requested == Status::Done);

        let at = self.clock.now();
        self.blocking(move |store| {
            store.update_fine_tune_status(&id, requested, model.as_ref(), at)
        })
        .await?;

        info!(fine_tune_id = %id, from = %current.status, to = %requested, "fine-tune status committed");
        self.fine_tune(id).await
    }
}
