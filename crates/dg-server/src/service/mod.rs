mod datasets;
mod fine_tunes;

use std::collections::HashSet;
use std::sync::Arc;

use dg_core::core::{
    Clock, Corpus, ExternalError, LanguageCode, NotFoundError, PipelineError, Project, Prompt,
    ValidationError,
};
use dg_store::{CatalogStore, StoreError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ingest::ResultsIngestor;
use crate::locks::EntityLocks;
use crate::queue::JobQueue;

pub use datasets::{ExportedCsv, IngestReport, ItemInput, StatusUpdate};
pub use fine_tunes::FineTuneStatusUpdate;

// ---------------------------------------------------------------------------
// Reference registration payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCorpus {
    pub project_id: Uuid,
    pub name: String,
    pub location: String,
    pub language: LanguageCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPrompt {
    pub project_id: Uuid,
    pub text: String,
    #[serde(default)]
    pub revises: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// CatalogService — every use case behind the HTTP surface
// ---------------------------------------------------------------------------

pub struct CatalogService {
    store: Arc<dyn CatalogStore>,
    queue: JobQueue,
    ingestor: ResultsIngestor,
    clock: Arc<dyn Clock>,
    locks: EntityLocks,
    default_output_chars: u32,
}

impl CatalogService {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        queue: JobQueue,
        ingestor: ResultsIngestor,
        clock: Arc<dyn Clock>,
        default_output_chars: u32,
    ) -> Self {
        Self {
            store,
            queue,
            ingestor,
            clock,
            locks: EntityLocks::new(),
            default_output_chars,
        }
    }

    /// Runs a store call on the blocking pool.
    async fn blocking<T, F>(&self, call: F) -> Result<T, PipelineError>
    where
        F: FnOnce(&dyn CatalogStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || call(store.as_ref()))
            .await
            .map_err(|e| ExternalError::Store(format!("store task failed: {e}")))?
            .map_err(PipelineError::from)
    }

    pub async fn create_project(&self, input: NewProject) -> Result<Project, PipelineError> {
        if input.name.trim().is_empty() {
            return Err(ValidationError::MissingValue("name").into());
        }
        let project = Project {
            id: Uuid::new_v4(),
            name: input.name,
            created_at: self.clock.now(),
        };
        let stored = project.clone();
        self.blocking(move |store| store.insert_project(&stored))
            .await?;
        Ok(project)
    }

    pub async fn create_corpus(&self, input: NewCorpus) -> Result<Corpus, PipelineError> {
        if input.location.trim().is_empty() {
            return Err(ValidationError::MissingValue("location").into());
        }
        if input.language.is_blank() {
            return Err(ValidationError::MissingValue("language").into());
        }
        self.require_project(input.project_id).await?;

        let corpus = Corpus {
            id: Uuid::new_v4(),
            project_id: input.project_id,
            name: input.name,
            location: input.location,
            language: input.language,
            created_at: self.clock.now(),
        };
        let stored = corpus.clone();
        self.blocking(move |store| store.insert_corpus(&stored))
            .await?;
        Ok(corpus)
    }

    pub async fn create_prompt(&self, input: NewPrompt) -> Result<Prompt, PipelineError> {
        self.require_project(input.project_id).await?;
        if let Some(previous) = input.revises {
            let previous = self.prompt(previous).await?;
            if previous.project_id != input.project_id {
                return Err(NotFoundError::Prompt(previous.id).into());
            }
        }

        let prompt = Prompt {
            id: Uuid::new_v4(),
            project_id: input.project_id,
            text: input.text,
            revises: input.revises,
            created_at: self.clock.now(),
        };
        let stored = prompt.clone();
        self.blocking(move |store| store.insert_prompt(&stored))
            .await?;
        Ok(prompt)
    }

    // -- reference lookups --

    async fn require_project(&self, id: Uuid) -> Result<Project, PipelineError> {
        self.blocking(move |store| store.get_project(&id))
            .await?
            .ok_or_else(|| NotFoundError::Project(id).into())
    }

    async fn corpus(&self, id: Uuid) -> Result<Corpus, PipelineError> {
        self.blocking(move |store| store.get_corpus(&id))
            .await?
            .ok_or_else(|| NotFoundError::Corpus(id).into())
    }

    async fn prompt(&self, id: Uuid) -> Result<Prompt, PipelineError> {
        self.blocking(move |store| store.get_prompt(&id))
            .await?
            .ok_or_else(|| NotFoundError::Prompt(id).into())
    }

    /// Earlier revisions of `prompt`, oldest first. Stops at a missing link
    /// or a cycle.
    async fn prompt_history(&self, prompt: &Prompt) -> Result<Vec<Uuid>, PipelineError> {
        let start = prompt.revises;
        let current = prompt.id;
        self.blocking(move |store| {
            let mut seen = HashSet::from([current]);
            let mut history = Vec::new();
            let mut next = start;
            while let Some(id) = next {
                if !seen.insert(id) {
                    break;
                }
                let Some(previous) = store.get_prompt(&id)? else {
                    break;
                };
                history.push(previous.id);
                next = previous.revises;
            }
            history.reverse();
            Ok(history)
        })
        .await
    }
}
