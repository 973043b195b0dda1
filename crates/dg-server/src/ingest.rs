use std::sync::Arc;
use std::time::Instant;

use dg_core::core::results::{is_result_file, result_prefix};
use dg_core::core::{
    BlobFuture, BlobStore, Dataset, ExternalError, IngestionOutcome, IntegrityError,
    PipelineError, ResultAccumulator,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bootstrap::ResultsSettings;

/// Downloads a dataset's result files and converts them into rows.
///
/// The engine never writes: it returns the complete outcome or an error,
/// and committing is up to the caller. Running it twice re-reads and
/// re-converts everything.
pub struct ResultsIngestor {
    blob: Arc<dyn BlobStore>,
    settings: ResultsSettings,
}

impl ResultsIngestor {
    pub fn new(blob: Arc<dyn BlobStore>, settings: ResultsSettings) -> Self {
        Self { blob, settings }
    }

    pub async fn ingest(
        &self,
        dataset: &Dataset,
        cancel: &CancellationToken,
    ) -> Result<IngestionOutcome, PipelineError> {
        let started = Instant::now();
        let prefix = result_prefix(&self.settings.prefix, dataset.id);
        let keys = self.result_files(&prefix, cancel).await?;
        if keys.is_empty() {
            return Err(IntegrityError::NoResultFiles { prefix }.into());
        }

        let mut accumulator = ResultAccumulator::new(dataset.id, &dataset.field_names);
        for key in &keys {
            let file_started = Instant::now();
            let bytes = cancellable(cancel, self.blob.get(key)).await?;
            accumulator.push_file(key, &bytes)?;
            debug!(
                dataset_id = %dataset.id,
                key = %key,
                bytes = bytes.len(),
                elapsed_ms = file_started.elapsed().as_millis() as u64,
                "result file converted"
            );
        }

        let outcome = accumulator.finish();
        info!(
            dataset_id = %dataset.id,
            files = outcome.files,
            items = outcome.items.len(),
            total_generation_time = outcome.total_generation_time,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "results converted"
        );
        Ok(outcome)
    }

    /// Walks every page under `prefix` and keeps result-file keys.
    async fn result_files(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, PipelineError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = cancellable(
                cancel,
                self.blob
                    .list(prefix, continuation.as_deref(), self.settings.page_size),
            )
            .await?;
            keys.extend(
                page.keys
                    .into_iter()
                    .filter(|key| is_result_file(key, &self.settings.extension)),
            );
            match page.next {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        Ok(keys)
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: BlobFuture<'_, T>,
) -> Result<T, PipelineError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExternalError::Cancelled.into()),
        result = operation => result.map_err(PipelineError::from),
    }
}
