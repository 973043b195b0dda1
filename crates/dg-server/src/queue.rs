use std::sync::Arc;

use dg_core::core::{
    job_key, BlobStore, Clock, ExternalError, JobClass, JobDescription, PipelineError,
};
use tracing::info;

use crate::bootstrap::QueueSettings;

pub const JOB_CONTENT_TYPE: &str = "application/json";

/// Write-once hand-off of job descriptions to the external worker.
///
/// A successful submit only means the job was accepted for eventual
/// processing. Nothing here changes entity status.
pub struct JobQueue {
    blob: Arc<dyn BlobStore>,
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    pub fn new(blob: Arc<dyn BlobStore>, settings: QueueSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            blob,
            settings,
            clock,
        }
    }

    fn class_prefix(&self, class: JobClass) -> &str {
        match class {
            JobClass::DatasetGeneration => &self.settings.dataset_job_class,
            JobClass::FineTune => &self.settings.fine_tune_job_class,
        }
    }

    /// Serializes and writes `job`, returning the object key.
    pub async fn submit(&self, job: &JobDescription) -> Result<String, PipelineError> {
        let body = job.to_json().map_err(ExternalError::from)?;
        let key = job_key(
            self.class_prefix(job.class()),
            self.clock.now(),
            job.entity_id(),
        );
        self.blob.put(&key, JOB_CONTENT_TYPE, body).await?;
        info!(key = %key, entity_id = %job.entity_id(), "job submitted");
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use dg_core::core::{BlobError, FineTuneJob, ModelId, RunnerId};
    use uuid::Uuid;

    use super::*;
    use crate::blob::MemoryBlobStore;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn fine_tune_job(id: Uuid) -> JobDescription {
        JobDescription::FineTune(FineTuneJob {
            fine_tune_id: id,
            dataset_id: Uuid::new_v4(),
            dataset_version: 2,
            base_model: ModelId::new("mistral-7b"),
            runner: RunnerId::new("axolotl"),
            input_field: "question".into(),
            output_field: "answer".into(),
            epochs: 3,
            learning_rate: 2e-4,
            lora_rank: 16,
        })
    }

    fn queue(blob: Arc<MemoryBlobStore>) -> JobQueue {
        let clock = FixedClock(Utc.with_ymd_and_hms(2024, 11, 30, 23, 59, 58).unwrap());
        JobQueue::new(blob, QueueSettings::default(), Arc::new(clock))
    }

    #[tokio::test]
    async fn test_submit_writes_json_under_class_prefix() {
        let blob = Arc::new(MemoryBlobStore::new());
        let id = Uuid::new_v4();

        let key = queue(Arc::clone(&blob))
            .submit(&fine_tune_job(id))
            .await
            .expect("submit");

        assert_eq!(key, format!("fine_tune/241130235958_{id}.json"));
        assert_eq!(blob.put_count(), 1);
        assert_eq!(blob.content_type(&key).as_deref(), Some(JOB_CONTENT_TYPE));
        let body: serde_json::Value =
            serde_json::from_slice(&blob.body(&key).expect("stored")).expect("json body");
        assert_eq!(body["kind"], "fine_tune");
        assert_eq!(body["dataset_version"], 2);
    }

    #[tokio::test]
    async fn test_resubmit_within_the_same_second_keeps_first_job() {
        let blob = Arc::new(MemoryBlobStore::new());
        let queue = queue(Arc::clone(&blob));
        let id = Uuid::new_v4();

        let key = queue.submit(&fine_tune_job(id)).await.expect("submit");
        let err = queue.submit(&fine_tune_job(id)).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::External(ExternalError::Blob(BlobError::AlreadyExists(ref k)))
                if *k == key
        ));
        assert_eq!(blob.put_count(), 1);
        assert_eq!(blob.keys(), [key]);
    }

    #[tokio::test]
    async fn test_submit_surfaces_store_failure() {
        let blob = Arc::new(MemoryBlobStore::new());
        blob.set_unreachable(true);

        let err = queue(Arc::clone(&blob))
            .submit(&fine_tune_job(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::External(ExternalError::Blob(BlobError::Unreachable(_)))
        ));
        assert_eq!(blob.put_count(), 0);
    }
}
