use std::collections::HashMap;

use dg_core::core::tabular::{export_csv, export_filename, parse_for_append, parse_table};
use dg_core::core::{
    build_dataset_job, check_correction_links, check_row_widths, parse_requested_status,
    CreateDatasetCommand, DataItem, Dataset, EntityKind, ItemView, JobDescription, NotFoundError,
    PipelineError, Provenance, Status, ValidationError,
};
use dg_store::{export_view, load_view, DatasetView};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::CatalogService;

/// Inbound status callback from the external worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub entity_id: Uuid,
    pub status: String,
}

/// One row of an item replacement.
///
/// A row naming the `id` of a stored item keeps that id, so corrections
/// pointing at it stay valid. Its stored provenance and generation time
/// carry over unless the row sets them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemInput {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub values: Vec<String>,
    #[serde(default)]
    pub corrects_id: Option<Uuid>,
    #[serde(default)]
    pub provenance: Option<Provenance>,
    #[serde(default)]
    pub generation_time_seconds: Option<f64>,
    #[serde(default)]
    pub deleted: bool,
}

impl ItemInput {
    fn into_item(self, stored: &HashMap<Uuid, DataItem>) -> Result<DataItem, ValidationError> {
        let Some(id) = self.id else {
            return Ok(DataItem {
                corrects_id: self.corrects_id,
                provenance: self.provenance,
                generation_time_seconds: self.generation_time_seconds.unwrap_or(0.0),
                deleted: self.deleted,
                ..DataItem::new(self.values)
            });
        };
        let previous = stored.get(&id).ok_or(ValidationError::UnknownItemId(id))?;
        Ok(DataItem {
            id,
            values: self.values,
            corrects_id: self.corrects_id,
            provenance: self.provenance.or_else(|| previous.provenance.clone()),
            generation_time_seconds: self
                .generation_time_seconds
                .unwrap_or(previous.generation_time_seconds),
            deleted: self.deleted,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub dataset_id: Uuid,
    pub files: usize,
    pub items: usize,
    pub total_generation_time: f64,
}

#[derive(Debug, Clone)]
pub struct ExportedCsv {
    pub filename: String,
    pub body: Vec<u8>,
}

impl CatalogService {
    // -----------------------------------------------------------------------
    // Creation and submission
    // -----------------------------------------------------------------------

    /// Plans a dataset and queues its generation job.
    ///
    /// Everything that can be validated is validated before the first
    /// write. The dataset is stored in PLANNING before the queue write, so
    /// a failed submission leaves a PLANNING dataset that can be resubmitted.
    pub async fn create_dataset(
        &self,
        command: CreateDatasetCommand,
    ) -> Result<Dataset, PipelineError> {
        command.validate()?;
        self.require_project(command.project_id).await?;
        let corpus = self.corpus(command.corpus_id).await?;
        let prompt = self.prompt(command.prompt_id).await?;
        if corpus.project_id != command.project_id {
            return Err(NotFoundError::Corpus(corpus.id).into());
        }
        if prompt.project_id != command.project_id {
            return Err(NotFoundError::Prompt(prompt.id).into());
        }

        let history = self.prompt_history(&prompt).await?;
        let planned = command.into_dataset(history, self.default_output_chars, self.clock.now());
        let job = build_dataset_job(&planned, &corpus, &prompt)?;

        let dataset = self
            .blocking(move |store| store.insert_dataset(&planned, &[]))
            .await?;
        info!(dataset_id = %dataset.id, version = dataset.version, "dataset planned");

        self.submit_or_keep_planning(&dataset, &job).await?;
        Ok(dataset)
    }

    /// Rebuilds and requeues the job of a dataset still in PLANNING.
    pub async fn resubmit_dataset(&self, id: Uuid) -> Result<Dataset, PipelineError> {
        let _guard = self.locks.lock(id).await;
        let dataset = self.dataset(id).await?;
        if dataset.status != Status::Planning {
            return Err(ValidationError::NotResubmittable {
                kind: EntityKind::Dataset,
                id,
                status: dataset.status,
            }
            .into());
        }

        let corpus_id = dataset
            .corpus_id
            .ok_or(ValidationError::MissingValue("corpus_id"))?;
        let prompt_id = dataset
            .prompt_id
            .ok_or(ValidationError::MissingValue("prompt_id"))?;
        let corpus = self.corpus(corpus_id).await?;
        let prompt = self.prompt(prompt_id).await?;
        let job = build_dataset_job(&dataset, &corpus, &prompt)?;

        self.submit_or_keep_planning(&dataset, &job).await?;
        Ok(dataset)
    }

    async fn submit_or_keep_planning(
        &self,
        dataset: &Dataset,
        job: &JobDescription,
    ) -> Result<(), PipelineError> {
        if let Err(e) = self.queue.submit(job).await {
            warn!(dataset_id = %dataset.id, error = %e, "job submission failed, dataset left in PLANNING");
            return Err(e);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads and deletion
    // -----------------------------------------------------------------------

    pub async fn dataset(&self, id: Uuid) -> Result<Dataset, PipelineError> {
        self.blocking(move |store| store.get_dataset(&id))
            .await?
            .ok_or_else(|| dataset_not_found(id))
    }

    pub async fn dataset_items(
        &self,
        id: Uuid,
        view: ItemView,
    ) -> Result<DatasetView, PipelineError> {
        self.blocking(move |store| load_view(store, &id, &view))
            .await?
            .ok_or_else(|| dataset_not_found(id))
    }

    /// Soft delete: the row and its items stay, the status becomes DELETED.
    pub async fn delete_dataset(&self, id: Uuid) -> Result<(), PipelineError> {
        let _guard = self.locks.lock(id).await;
        let at = self.clock.now();
        self.blocking(move |store| store.update_dataset_status(&id, Status::Deleted, at))
            .await?;
        info!(dataset_id = %id, "dataset deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Status lifecycle and ingestion
    // -----------------------------------------------------------------------

    /// Applies a worker status callback.
    ///
    /// DONE first runs ingestion; items, total time and the new status are
    /// committed together, and on any failure nothing is.
    pub async fn update_dataset_status(
        &self,
        update: StatusUpdate,
        cancel: &CancellationToken,
    ) -> Result<Dataset, PipelineError> {
        let id = update.entity_id;
        let _guard = self.locks.lock(id).await;
        let dataset = self.dataset(id).await?;

        let requested = parse_requested_status(dataset.status, &update.status).inspect_err(|e| {
            warn!(dataset_id = %id, current = %dataset.status, error = %e, "status update rejected");
        })?;

        let at = self.clock.now();
        if requested == Status::Done {
            let outcome = self.ingestor.ingest(&dataset, cancel).await.inspect_err(|e| {
                warn!(dataset_id = %id, error = %e, "ingestion aborted, status unchanged");
            })?;
            self.blocking(move |store| {
                store.commit_ingestion(&id, &outcome, Some(Status::Done), at)
            })
            .await?;
        } else {
            self.blocking(move |store| store.update_dataset_status(&id, requested, at))
                .await?;
        }

        info!(dataset_id = %id, from = %dataset.status, to = %requested, "dataset status committed");
        self.dataset(id).await
    }

    /// Runs ingestion on demand and commits its rows without touching the
    /// status.
    pub async fn ingest_dataset(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, PipelineError> {
        let _guard = self.locks.lock(id).await;
        let dataset = self.dataset(id).await?;

        let outcome = self.ingestor.ingest(&dataset, cancel).await.inspect_err(|e| {
            warn!(dataset_id = %id, error = %e, "on-demand ingestion aborted");
        })?;
        let report = IngestReport {
            dataset_id: id,
            files: outcome.files,
            items: outcome.items.len(),
            total_generation_time: outcome.total_generation_time,
        };

        let at = self.clock.now();
        self.blocking(move |store| store.commit_ingestion(&id, &outcome, None, at))
            .await?;
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Item edits and CSV interchange
    // -----------------------------------------------------------------------

    /// Deletes every item and stores `rows` in their place.
    ///
    /// Rows may only name ids already stored for this dataset, and every
    /// correction must point at an earlier row of the new set.
    pub async fn replace_items(
        &self,
        id: Uuid,
        rows: Vec<ItemInput>,
    ) -> Result<u32, PipelineError> {
        let _guard = self.locks.lock(id).await;
        let dataset = self.dataset(id).await?;
        check_row_widths(&dataset.field_names, rows.iter().map(|r| r.values.as_slice()))?;

        let stored: HashMap<Uuid, DataItem> = self
            .blocking(move |store| store.list_items(&id))
            .await?
            .into_iter()
            .map(|item| (item.id, item))
            .collect();
        let items = rows
            .into_iter()
            .map(|row| row.into_item(&stored))
            .collect::<Result<Vec<_>, _>>()?;
        check_correction_links(&items)?;

        let at = self.clock.now();
        let count = self
            .blocking(move |store| store.replace_items(&id, &items, at))
            .await?;
        info!(dataset_id = %id, items = count, "dataset items replaced");
        Ok(count)
    }

    pub async fn export_csv(&self, id: Uuid) -> Result<ExportedCsv, PipelineError> {
        let view = self
            .blocking(move |store| load_view(store, &id, &export_view()))
            .await?
            .ok_or_else(|| dataset_not_found(id))?;
        let project = self.require_project(view.dataset.project_id).await?;

        let items: Vec<&DataItem> = view.items.iter().collect();
        let body = export_csv(&view.dataset.field_names, &items)?;
        Ok(ExportedCsv {
            filename: export_filename(&project.name, view.dataset.version),
            body,
        })
    }

    /// Appends uploaded rows to an existing version. Returns the new item
    /// count.
    pub async fn append_csv(&self, id: Uuid, upload: Vec<u8>) -> Result<u32, PipelineError> {
        let _guard = self.locks.lock(id).await;
        let dataset = self.dataset(id).await?;
        let rows = parse_for_append(&upload, &dataset.field_names)?;

        let items: Vec<DataItem> = rows.into_iter().map(DataItem::new).collect();
        let appended = items.len();
        let at = self.clock.now();
        let count = self
            .blocking(move |store| store.append_items(&id, &items, at))
            .await?;
        info!(dataset_id = %id, appended, total = count, "csv rows appended");
        Ok(count)
    }

    /// Creates the next version of a dataset from an uploaded table whose
    /// header becomes the new schema.
    pub async fn new_version_from_csv(
        &self,
        id: Uuid,
        upload: Vec<u8>,
    ) -> Result<Dataset, PipelineError> {
        let previous = self.dataset(id).await?;
        let table = parse_table(&upload)?;

        let mut next = previous.derive_from_table(table.header, self.clock.now());
        let items: Vec<DataItem> = table.rows.into_iter().map(DataItem::new).collect();
        next.generate_examples_number = u32::try_from(items.len()).unwrap_or(u32::MAX);

        let stored = self
            .blocking(move |store| store.insert_dataset(&next, &items))
            .await?;
        info!(
            dataset_id = %stored.id,
            previous_id = %id,
            version = stored.version,
            "dataset version created from csv"
        );
        Ok(stored)
    }
}

fn dataset_not_found(id: Uuid) -> PipelineError {
    NotFoundError::Entity {
        kind: EntityKind::Dataset,
        id,
    }
    .into()
}
