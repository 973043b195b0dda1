use std::collections::HashSet;
use std::io::{Error as IoError, ErrorKind};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dg_core::core::{
    next_version, Corpus, DataItem, Dataset, EntityKind, ExternalError, FineTune,
    IngestionOutcome, LanguageCode, ModelDescriptor, ModelId, NotFoundError, PipelineError,
    Project, Prompt, RunnerId, Status,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::de::DeserializeOwned;
use uuid::Uuid;

const SCHEMA_VERSION: i32 = 1;
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS corpora (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    name TEXT NOT NULL,
    location TEXT NOT NULL,
    language TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS prompts (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    text TEXT NOT NULL,
    revises TEXT REFERENCES prompts(id),
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS datasets (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    version INTEGER NOT NULL,
    model TEXT NOT NULL,
    runner TEXT NOT NULL,
    input_field TEXT NOT NULL,
    output_field TEXT NOT NULL,
    field_names TEXT NOT NULL,
    field_descriptions TEXT NOT NULL,
    output_size_chars INTEGER,
    corpus_id TEXT,
    prompt_id TEXT,
    prompt_history TEXT NOT NULL,
    total_generation_time REAL NOT NULL DEFAULT 0,
    generate_examples_number INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (project_id, version)
);

CREATE TABLE IF NOT EXISTS items (
    id TEXT PRIMARY KEY,
    dataset_id TEXT NOT NULL REFERENCES datasets(id),
    position INTEGER NOT NULL,
    item_values TEXT NOT NULL,
    corrects_id TEXT,
    provenance TEXT,
    generation_time REAL NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_items_dataset ON items(dataset_id, position);

CREATE TABLE IF NOT EXISTS fine_tunes (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    version INTEGER NOT NULL,
    dataset_id TEXT NOT NULL REFERENCES datasets(id),
    base_model TEXT NOT NULL,
    runner TEXT NOT NULL,
    input_field TEXT NOT NULL,
    output_field TEXT NOT NULL,
    params TEXT NOT NULL,
    model TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (project_id, version)
);
"#;

const DATASET_COLUMNS: &str = "id, project_id, version, model, runner, input_field, output_field,
    field_names, field_descriptions, output_size_chars, corpus_id, prompt_id, prompt_history,
    total_generation_time, generate_examples_number, status, created_at, updated_at";

const FINE_TUNE_COLUMNS: &str = "id, project_id, version, dataset_id, base_model, runner,
    input_field, output_field, params, model, status, created_at, updated_at";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: Uuid },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => NotFoundError::Entity { kind, id }.into(),
            other => ExternalError::Store(other.to_string()).into(),
        }
    }
}

/// Persisted entity store. Every multi-row change is a single transaction.
pub trait CatalogStore: Send + Sync {
    fn init(&self) -> Result<(), StoreError>;

    fn insert_project(&self, project: &Project) -> Result<(), StoreError>;
    fn get_project(&self, id: &Uuid) -> Result<Option<Project>, StoreError>;
    fn insert_corpus(&self, corpus: &Corpus) -> Result<(), StoreError>;
    fn get_corpus(&self, id: &Uuid) -> Result<Option<Corpus>, StoreError>;
    fn insert_prompt(&self, prompt: &Prompt) -> Result<(), StoreError>;
    fn get_prompt(&self, id: &Uuid) -> Result<Option<Prompt>, StoreError>;

    /// Inserts `dataset` with `version = max(project versions) + 1` and
    /// `items` in the same transaction. Returns the stored dataset.
    fn insert_dataset(&self, dataset: &Dataset, items: &[DataItem])
        -> Result<Dataset, StoreError>;
    fn get_dataset(&self, id: &Uuid) -> Result<Option<Dataset>, StoreError>;
    /// Highest non-deleted version of the project.
    fn latest_dataset(&self, project_id: &Uuid) -> Result<Option<Dataset>, StoreError>;
    fn update_dataset_status(
        &self,
        id: &Uuid,
        status: Status,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// All items of a dataset, deleted ones included, in stored order.
    fn list_items(&self, dataset_id: &Uuid) -> Result<Vec<DataItem>, StoreError>;
    /// Appends after the current last item and recomputes
    /// `generate_examples_number`. Returns the new live item count.
    fn append_items(
        &self,
        dataset_id: &Uuid,
        items: &[DataItem],
        at: DateTime<Utc>,
    ) -> Result<u32, StoreError>;
    /// Deletes every item of the dataset and stores `items` in their place.
    fn replace_items(
        &self,
        dataset_id: &Uuid,
        items: &[DataItem],
        at: DateTime<Utc>,
    ) -> Result<u32, StoreError>;
    /// Merges the outcome's items into the dataset, records the summed
    /// generation time and, when given, the new status.
    ///
    /// An outcome item whose id is already stored is refreshed in place and
    /// keeps its position and deleted flag. New ids are appended. Ingested
    /// rows missing from the outcome are marked deleted, so corrections
    /// pointing at them stay resolvable. Uploaded rows are left alone.
    fn commit_ingestion(
        &self,
        dataset_id: &Uuid,
        outcome: &IngestionOutcome,
        status: Option<Status>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn insert_fine_tune(&self, fine_tune: &FineTune) -> Result<FineTune, StoreError>;
    fn get_fine_tune(&self, id: &Uuid) -> Result<Option<FineTune>, StoreError>;
    /// `model` is only written when present; an absent descriptor keeps the
    /// stored one.
    fn update_fine_tune_status(
        &self,
        id: &Uuid,
        status: Status,
        model: Option<&ModelDescriptor>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

pub struct SqliteCatalogStore {
    conn: Mutex<Connection>,
}

impl SqliteCatalogStore {
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("sqlite mutex poisoned")
    }
}

impl CatalogStore for SqliteCatalogStore {
    fn init(&self) -> Result<(), StoreError> {
        let conn = self.lock_conn();
        let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        conn.execute_batch(SCHEMA_SQL)?;
        if version < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        Ok(())
    }

    // -- references --

    fn insert_project(&self, project: &Project) -> Result<(), StoreError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO projects (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![
                project.id.to_string(),
                project.name.as_str(),
                project.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_project(&self, id: &Uuid) -> Result<Option<Project>, StoreError> {
        let conn = self.lock_conn();
        let project = conn
            .query_row(
                "SELECT id, name, created_at FROM projects WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    let id: String = row.get(0)?;
                    let created_at: String = row.get(2)?;
                    Ok(Project {
                        id: parse_uuid(0, &id)?,
                        name: row.get(1)?,
                        created_at: parse_datetime_utc(2, &created_at)?,
                    })
                },
            )
            .optional()?;
        Ok(project)
    }

    fn insert_corpus(&self, corpus: &Corpus) -> Result<(), StoreError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO corpora (id, project_id, name, location, language, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                corpus.id.to_string(),
                corpus.project_id.to_string(),
                corpus.name.as_str(),
                corpus.location.as_str(),
                corpus.language.as_str(),
                corpus.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_corpus(&self, id: &Uuid) -> Result<Option<Corpus>, StoreError> {
        let conn = self.lock_conn();
        let corpus = conn
            .query_row(
                "SELECT id, project_id, name, location, language, created_at
                 FROM corpora
                 WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    let id: String = row.get(0)?;
                    let project_id: String = row.get(1)?;
                    let language: String = row.get(4)?;
                    let created_at: String = row.get(5)?;
                    Ok(Corpus {
                        id: parse_uuid(0, &id)?,
                        project_id: parse_uuid(1, &project_id)?,
                        name: row.get(2)?,
                        location: row.get(3)?,
                        language: LanguageCode::new(language),
                        created_at: parse_datetime_utc(5, &created_at)?,
                    })
                },
            )
            .optional()?;
        Ok(corpus)
    }

    fn insert_prompt(&self, prompt: &Prompt) -> Result<(), StoreError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO prompts (id, project_id, text, revises, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                prompt.id.to_string(),
                prompt.project_id.to_string(),
                prompt.text.as_str(),
                prompt.revises.map(|id| id.to_string()),
                prompt.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_prompt(&self, id: &Uuid) -> Result<Option<Prompt>, StoreError> {
        let conn = self.lock_conn();
        let prompt = conn
            .query_row(
                "SELECT id, project_id, text, revises, created_at FROM prompts WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    let id: String = row.get(0)?;
                    let project_id: String = row.get(1)?;
                    let revises: Option<String> = row.get(3)?;
                    let created_at: String = row.get(4)?;
                    Ok(Prompt {
                        id: parse_uuid(0, &id)?,
                        project_id: parse_uuid(1, &project_id)?,
                        text: row.get(2)?,
                        revises: revises.map(|v| parse_uuid(3, &v)).transpose()?,
                        created_at: parse_datetime_utc(4, &created_at)?,
                    })
                },
            )
            .optional()?;
        Ok(prompt)
    }

    // -- datasets --

    fn insert_dataset(
        &self,
        dataset: &Dataset,
        items: &[DataItem],
    ) -> Result<Dataset, StoreError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        let current: Option<u32> = tx.query_row(
            "SELECT MAX(version) FROM datasets WHERE project_id = ?1",
            params![dataset.project_id.to_string()],
            |row| row.get(0),
        )?;
        let mut stored = dataset.clone();
        stored.version = next_version(current);

        tx.execute(
            &format!(
                "INSERT INTO datasets ({DATASET_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
            ),
            params![
                stored.id.to_string(),
                stored.project_id.to_string(),
                stored.version,
                stored.model.as_str(),
                stored.runner.as_str(),
                stored.input_field.as_str(),
                stored.output_field.as_str(),
                serde_json::to_string(&stored.field_names)?,
                serde_json::to_string(&stored.field_descriptions)?,
                stored.output_size_chars,
                stored.corpus_id.map(|id| id.to_string()),
                stored.prompt_id.map(|id| id.to_string()),
                serde_json::to_string(&stored.prompt_history)?,
                stored.total_generation_time_seconds,
                stored.generate_examples_number,
                stored.status.as_str(),
                stored.created_at.to_rfc3339(),
                stored.updated_at.to_rfc3339(),
            ],
        )?;
        insert_items(&tx, &stored.id, 0, items)?;
        tx.commit()?;
        Ok(stored)
    }

    fn get_dataset(&self, id: &Uuid) -> Result<Option<Dataset>, StoreError> {
        let conn = self.lock_conn();
        let dataset = conn
            .query_row(
                &format!("SELECT {DATASET_COLUMNS} FROM datasets WHERE id = ?1"),
                params![id.to_string()],
                dataset_from_row,
            )
            .optional()?;
        Ok(dataset)
    }

    fn latest_dataset(&self, project_id: &Uuid) -> Result<Option<Dataset>, StoreError> {
        let conn = self.lock_conn();
        let dataset = conn
            .query_row(
                &format!(
                    "SELECT {DATASET_COLUMNS} FROM datasets
                     WHERE project_id = ?1 AND status != ?2
                     ORDER BY version DESC
                     LIMIT 1"
                ),
                params![project_id.to_string(), Status::Deleted.as_str()],
                dataset_from_row,
            )
            .optional()?;
        Ok(dataset)
    }

    fn update_dataset_status(
        &self,
        id: &Uuid,
        status: Status,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE datasets SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), at.to_rfc3339(), id.to_string()],
        )?;
        ensure_changed(changed, EntityKind::Dataset, id)
    }

    // -- items --

    fn list_items(&self, dataset_id: &Uuid) -> Result<Vec<DataItem>, StoreError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, item_values, corrects_id, provenance, generation_time, deleted
             FROM items
             WHERE dataset_id = ?1
             ORDER BY position ASC",
        )?;

        let rows = stmt.query_map(params![dataset_id.to_string()], |row| {
            let id: String = row.get(0)?;
            let values: String = row.get(1)?;
            let corrects_id: Option<String> = row.get(2)?;
            let provenance: Option<String> = row.get(3)?;

            Ok(DataItem {
                id: parse_uuid(0, &id)?,
                values: parse_json(1, &values)?,
                corrects_id: corrects_id.map(|v| parse_uuid(2, &v)).transpose()?,
                provenance: provenance.map(|v| parse_json(3, &v)).transpose()?,
                generation_time_seconds: row.get(4)?,
                deleted: row.get(5)?,
            })
        })?;

        let items = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn append_items(
        &self,
        dataset_id: &Uuid,
        items: &[DataItem],
        at: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        ensure_dataset(&tx, dataset_id)?;

        let start = next_position(&tx, dataset_id)?;
        insert_items(&tx, dataset_id, start, items)?;
        let count = recount(&tx, dataset_id, at)?;
        tx.commit()?;
        Ok(count)
    }

    fn replace_items(
        &self,
        dataset_id: &Uuid,
        items: &[DataItem],
        at: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        ensure_dataset(&tx, dataset_id)?;

        tx.execute(
            "DELETE FROM items WHERE dataset_id = ?1",
            params![dataset_id.to_string()],
        )?;
        insert_items(&tx, dataset_id, 0, items)?;
        let count = recount(&tx, dataset_id, at)?;
        tx.commit()?;
        Ok(count)
    }

    fn commit_ingestion(
        &self,
        dataset_id: &Uuid,
        outcome: &IngestionOutcome,
        status: Option<Status>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        ensure_dataset(&tx, dataset_id)?;

        let incoming: HashSet<Uuid> = outcome.items.iter().map(|item| item.id).collect();
        let previous = ingested_ids(&tx, dataset_id)?;
        for stale in previous.difference(&incoming) {
            tx.execute(
                "UPDATE items SET deleted = 1 WHERE id = ?1",
                params![stale.to_string()],
            )?;
        }

        let mut fresh = Vec::new();
        for item in &outcome.items {
            let changed = tx.execute(
                "UPDATE items
                 SET item_values = ?1, provenance = ?2, generation_time = ?3
                 WHERE id = ?4 AND dataset_id = ?5",
                params![
                    serde_json::to_string(&item.values)?,
                    item.provenance
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    item.generation_time_seconds,
                    item.id.to_string(),
                    dataset_id.to_string(),
                ],
            )?;
            if changed == 0 {
                fresh.push(item.clone());
            }
        }
        let start = next_position(&tx, dataset_id)?;
        insert_items(&tx, dataset_id, start, &fresh)?;
        tx.execute(
            "UPDATE datasets
             SET total_generation_time = ?1,
                 status = COALESCE(?2, status),
                 updated_at = ?3
             WHERE id = ?4",
            params![
                outcome.total_generation_time,
                status.map(|s| s.as_str()),
                at.to_rfc3339(),
                dataset_id.to_string(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    // -- fine-tunes --

    fn insert_fine_tune(&self, fine_tune: &FineTune) -> Result<FineTune, StoreError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        let current: Option<u32> = tx.query_row(
            "SELECT MAX(version) FROM fine_tunes WHERE project_id = ?1",
            params![fine_tune.project_id.to_string()],
            |row| row.get(0),
        )?;
        let mut stored = fine_tune.clone();
        stored.version = next_version(current);

        tx.execute(
            &format!(
                "INSERT INTO fine_tunes ({FINE_TUNE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                stored.id.to_string(),
                stored.project_id.to_string(),
                stored.version,
                stored.dataset_id.to_string(),
                stored.base_model.as_str(),
                stored.runner.as_str(),
                stored.input_field.as_str(),
                stored.output_field.as_str(),
                serde_json::to_string(&stored.params)?,
                stored.model.as_ref().map(serde_json::to_string).transpose()?,
                stored.status.as_str(),
                stored.created_at.to_rfc3339(),
                stored.updated_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(stored)
    }

    fn get_fine_tune(&self, id: &Uuid) -> Result<Option<FineTune>, StoreError> {
        let conn = self.lock_conn();
        let fine_tune = conn
            .query_row(
                &format!("SELECT {FINE_TUNE_COLUMNS} FROM fine_tunes WHERE id = ?1"),
                params![id.to_string()],
                |row| {
                    let id: String = row.get(0)?;
                    let project_id: String = row.get(1)?;
                    let dataset_id: String = row.get(3)?;
                    let base_model: String = row.get(4)?;
                    let runner: String = row.get(5)?;
                    let params: String = row.get(8)?;
                    let model: Option<String> = row.get(9)?;
                    let status: String = row.get(10)?;
                    let created_at: String = row.get(11)?;
                    let updated_at: String = row.get(12)?;

                    Ok(FineTune {
                        id: parse_uuid(0, &id)?,
                        project_id: parse_uuid(1, &project_id)?,
                        version: row.get(2)?,
                        dataset_id: parse_uuid(3, &dataset_id)?,
                        base_model: ModelId::new(base_model),
                        runner: RunnerId::new(runner),
                        input_field: row.get(6)?,
                        output_field: row.get(7)?,
                        params: parse_json(8, &params)?,
                        model: model.map(|v| parse_json(9, &v)).transpose()?,
                        status: parse_status(10, &status)?,
                        created_at: parse_datetime_utc(11, &created_at)?,
                        updated_at: parse_datetime_utc(12, &updated_at)?,
                    })
                },
            )
            .optional()?;
        Ok(fine_tune)
    }

    fn update_fine_tune_status(
        &self,
        id: &Uuid,
        status: Status,
        model: Option<&ModelDescriptor>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let model = model.map(serde_json::to_string).transpose()?;
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE fine_tunes
             SET status = ?1, model = COALESCE(?2, model), updated_at = ?3
             WHERE id = ?4",
            params![status.as_str(), model, at.to_rfc3339(), id.to_string()],
        )?;
        ensure_changed(changed, EntityKind::FineTune, id)
    }
}

// ---------------------------------------------------------------------------
// Transaction helpers
// ---------------------------------------------------------------------------

fn insert_items(
    tx: &Transaction<'_>,
    dataset_id: &Uuid,
    start: i64,
    items: &[DataItem],
) -> Result<(), StoreError> {
    let mut stmt = tx.prepare(
        "INSERT INTO items
         (id, dataset_id, position, item_values, corrects_id, provenance, generation_time, deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for (offset, item) in (start..).zip(items) {
        stmt.execute(params![
            item.id.to_string(),
            dataset_id.to_string(),
            offset,
            serde_json::to_string(&item.values)?,
            item.corrects_id.map(|id| id.to_string()),
            item.provenance
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            item.generation_time_seconds,
            item.deleted,
        ])?;
    }
    Ok(())
}

/// Ids of the dataset's rows that came from ingestion, i.e. carry provenance.
fn ingested_ids(tx: &Transaction<'_>, dataset_id: &Uuid) -> Result<HashSet<Uuid>, StoreError> {
    let mut stmt =
        tx.prepare("SELECT id FROM items WHERE dataset_id = ?1 AND provenance IS NOT NULL")?;
    let ids = stmt
        .query_map(params![dataset_id.to_string()], |row| {
            let id: String = row.get(0)?;
            parse_uuid(0, &id)
        })?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}

fn ensure_dataset(tx: &Transaction<'_>, dataset_id: &Uuid) -> Result<(), StoreError> {
    let exists = tx
        .query_row(
            "SELECT 1 FROM datasets WHERE id = ?1",
            params![dataset_id.to_string()],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    ensure_changed(usize::from(exists), EntityKind::Dataset, dataset_id)
}

fn ensure_changed(changed: usize, kind: EntityKind, id: &Uuid) -> Result<(), StoreError> {
    if changed == 0 {
        return Err(StoreError::NotFound { kind, id: *id });
    }
    Ok(())
}

fn next_position(tx: &Transaction<'_>, dataset_id: &Uuid) -> Result<i64, StoreError> {
    let position = tx.query_row(
        "SELECT COALESCE(MAX(position) + 1, 0) FROM items WHERE dataset_id = ?1",
        params![dataset_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(position)
}

/// Sets `generate_examples_number` to the live item count and returns it.
fn recount(tx: &Transaction<'_>, dataset_id: &Uuid, at: DateTime<Utc>) -> Result<u32, StoreError> {
    let count: u32 = tx.query_row(
        "SELECT COUNT(*) FROM items WHERE dataset_id = ?1 AND deleted = 0",
        params![dataset_id.to_string()],
        |row| row.get(0),
    )?;
    tx.execute(
        "UPDATE datasets SET generate_examples_number = ?1, updated_at = ?2 WHERE id = ?3",
        params![count, at.to_rfc3339(), dataset_id.to_string()],
    )?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn dataset_from_row(row: &Row<'_>) -> rusqlite::Result<Dataset> {
    let id: String = row.get(0)?;
    let project_id: String = row.get(1)?;
    let model: String = row.get(3)?;
    let runner: String = row.get(4)?;
    let field_names: String = row.get(7)?;
    let field_descriptions: String = row.get(8)?;
    let corpus_id: Option<String> = row.get(10)?;
    let prompt_id: Option<String> = row.get(11)?;
    let prompt_history: String = row.get(12)?;
    let status: String = row.get(15)?;
    let created_at: String = row.get(16)?;
    let updated_at: String = row.get(17)?;

    Ok(Dataset {
        id: parse_uuid(0, &id)?,
        project_id: parse_uuid(1, &project_id)?,
        version: row.get(2)?,
        model: ModelId::new(model),
        runner: RunnerId::new(runner),
        input_field: row.get(5)?,
        output_field: row.get(6)?,
        field_names: parse_json(7, &field_names)?,
        field_descriptions: parse_json(8, &field_descriptions)?,
        output_size_chars: row.get(9)?,
        corpus_id: corpus_id.map(|v| parse_uuid(10, &v)).transpose()?,
        prompt_id: prompt_id.map(|v| parse_uuid(11, &v)).transpose()?,
        prompt_history: parse_json(12, &prompt_history)?,
        total_generation_time_seconds: row.get(13)?,
        generate_examples_number: row.get(14)?,
        status: parse_status(15, &status)?,
        created_at: parse_datetime_utc(16, &created_at)?,
        updated_at: parse_datetime_utc(17, &updated_at)?,
    })
}

fn parse_status(column: usize, value: &str) -> rusqlite::Result<Status> {
    value
        .parse()
        .map_err(|_| sql_text_parse_error(column, "status", value))
}

fn parse_uuid(column: usize, value: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(value).map_err(|_| sql_text_parse_error(column, "uuid", value))
}

fn parse_datetime_utc(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| sql_text_parse_error(column, "datetime", value))
}

fn parse_json<T: DeserializeOwned>(column: usize, value: &str) -> rusqlite::Result<T> {
    serde_json::from_str(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn sql_text_parse_error(column: usize, field: &'static str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        Type::Text,
        Box::new(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid {field}: {value}"),
        )),
    )
}
