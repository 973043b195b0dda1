use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{
    IntegrityError, LanguageCode, ModelId, RunnerId, Status, ValidationError, PROVENANCE_KEYS,
};

// ---------------------------------------------------------------------------
// References resolved when building jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Source documents a generation job reads from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Corpus {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub location: String,
    pub language: LanguageCode,
    pub created_at: DateTime<Utc>,
}

/// A generation prompt. `revises` points at the revision it replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub id: Uuid,
    pub project_id: Uuid,
    pub text: String,
    pub revises: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// DataItem — one row, positionally aligned to the dataset's field_names
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub document_id: String,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataItem {
    pub id: Uuid,
    pub values: Vec<String>,
    /// Earlier item this one supersedes. Never cascades deletion.
    pub corrects_id: Option<Uuid>,
    pub provenance: Option<Provenance>,
    pub generation_time_seconds: f64,
    pub deleted: bool,
}

impl DataItem {
    pub fn new(values: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            values,
            corrects_id: None,
            provenance: None,
            generation_time_seconds: 0.0,
            deleted: false,
        }
    }

    pub fn is_correction(&self) -> bool {
        self.corrects_id.is_some()
    }
}

// ---------------------------------------------------------------------------
// Dataset
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Unique per project, assigned as `max(existing) + 1` by the store.
    pub version: u32,
    pub model: ModelId,
    pub runner: RunnerId,
    pub input_field: String,
    pub output_field: String,
    /// The dataset's schema: column order of every item's `values`.
    pub field_names: Vec<String>,
    /// Per-field instructions for multi-field JSON outputs.
    #[serde(default)]
    pub field_descriptions: BTreeMap<String, String>,
    pub output_size_chars: Option<u32>,
    pub corpus_id: Option<Uuid>,
    pub prompt_id: Option<Uuid>,
    /// Prior prompt revisions, oldest first.
    pub prompt_history: Vec<Uuid>,
    pub total_generation_time_seconds: f64,
    pub generate_examples_number: u32,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Dataset {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.field_names.iter().position(|f| f == name)
    }

    /// Builds the next version of this dataset from an uploaded table whose
    /// header becomes the new schema. Generation metadata is inherited; the
    /// input/output selectors are kept when the new header still declares
    /// them and otherwise fall back to the first and last column.
    pub fn derive_from_table(&self, header: Vec<String>, now: DateTime<Utc>) -> Dataset {
        let keep_or = |field: &str, fallback: Option<&String>| {
            if header.iter().any(|h| h == field) {
                field.to_owned()
            } else {
                fallback.cloned().unwrap_or_default()
            }
        };
        let input_field = keep_or(&self.input_field, header.first());
        let output_field = keep_or(&self.output_field, header.last());
        let field_descriptions = self
            .field_descriptions
            .iter()
            .filter(|(name, _)| header.contains(name))
            .map(|(name, text)| (name.clone(), text.clone()))
            .collect();

        Dataset {
            id: Uuid::new_v4(),
            project_id: self.project_id,
            version: self.version + 1,
            model: self.model.clone(),
            runner: self.runner.clone(),
            input_field,
            output_field,
            field_names: header,
            field_descriptions,
            output_size_chars: self.output_size_chars,
            corpus_id: self.corpus_id,
            prompt_id: self.prompt_id,
            prompt_history: self.prompt_history.clone(),
            total_generation_time_seconds: 0.0,
            generate_examples_number: 0,
            status: Status::Done,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// FineTune
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub size: String,
    pub dtype: String,
    pub quantization: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    pub epochs: u32,
    pub learning_rate: f64,
    pub lora_rank: u32,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            epochs: 3,
            learning_rate: 2e-4,
            lora_rank: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FineTune {
    pub id: Uuid,
    pub project_id: Uuid,
    pub version: u32,
    pub dataset_id: Uuid,
    pub base_model: ModelId,
    pub runner: RunnerId,
    pub input_field: String,
    pub output_field: String,
    pub params: TrainingParams,
    /// Populated only once the run reports DONE.
    pub model: Option<ModelDescriptor>,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Invariants
// ---------------------------------------------------------------------------

pub fn next_version(current_max: Option<u32>) -> u32 {
    current_max.map_or(1, |v| v + 1)
}

/// Rejects empty schemas, blank names, duplicates and the names result
/// files reserve for provenance.
pub fn validate_field_names(field_names: &[String]) -> Result<(), ValidationError> {
    if field_names.is_empty() {
        return Err(ValidationError::EmptyFieldNames);
    }
    let mut seen = HashSet::with_capacity(field_names.len());
    for (column, name) in field_names.iter().enumerate() {
        if name.trim().is_empty() {
            return Err(ValidationError::BlankFieldName { column: column + 1 });
        }
        if PROVENANCE_KEYS.contains(&name.as_str()) {
            return Err(ValidationError::ReservedFieldName(name.clone()));
        }
        if !seen.insert(name.as_str()) {
            return Err(ValidationError::DuplicateFieldName(name.clone()));
        }
    }
    Ok(())
}

/// Every row must carry exactly one value per declared field. Rows are
/// numbered from 1 in errors.
pub fn check_row_widths<'a, I>(field_names: &[String], rows: I) -> Result<(), IntegrityError>
where
    I: IntoIterator<Item = &'a [String]>,
{
    let expected = field_names.len();
    for (i, values) in rows.into_iter().enumerate() {
        if values.len() != expected {
            return Err(IntegrityError::RowWidth {
                row: i + 1,
                expected,
                found: values.len(),
            });
        }
    }
    Ok(())
}

/// Item ids must be unique, and every `corrects_id` must name an item that
/// comes earlier in `items`. Rows are numbered from 1 in errors.
pub fn check_correction_links(items: &[DataItem]) -> Result<(), ValidationError> {
    let mut earlier = HashSet::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        if let Some(target) = item.corrects_id {
            if !earlier.contains(&target) {
                return Err(ValidationError::DanglingCorrection {
                    row: i + 1,
                    corrects_id: target,
                });
            }
        }
        if !earlier.insert(item.id) {
            return Err(ValidationError::DuplicateItemId(item.id));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Current view — which items a sample or listing shows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct ItemView {
    pub include_corrections: bool,
    pub limit: Option<usize>,
}

/// Non-deleted items in stored order. Correcting items are left out unless
/// `include_corrections` is set.
pub fn current_view<'a>(items: &'a [DataItem], view: &ItemView) -> Vec<&'a DataItem> {
    items
        .iter()
        .filter(|item| !item.deleted)
        .filter(|item| view.include_corrections || !item.is_correction())
        .take(view.limit.unwrap_or(usize::MAX))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn dataset(field_names: &[&str]) -> Dataset {
        let now = Utc::now();
        Dataset {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            version: 4,
            model: ModelId::new("llama3-8b"),
            runner: RunnerId::new("vllm"),
            input_field: "question".into(),
            output_field: "answer".into(),
            field_names: names(field_names),
            field_descriptions: BTreeMap::from([
                ("answer".to_string(), "a short answer".to_string()),
                ("complexity".to_string(), "simple or hard".to_string()),
            ]),
            output_size_chars: Some(800),
            corpus_id: Some(Uuid::new_v4()),
            prompt_id: Some(Uuid::new_v4()),
            prompt_history: vec![Uuid::new_v4()],
            total_generation_time_seconds: 12.5,
            generate_examples_number: 100,
            status: Status::Done,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_next_version() {
        assert_eq!(next_version(None), 1);
        assert_eq!(next_version(Some(1)), 2);
        assert_eq!(next_version(Some(41)), 42);
    }

    #[test]
    fn test_validate_field_names() {
        assert!(validate_field_names(&names(&["a", "b"])).is_ok());
        assert!(matches!(
            validate_field_names(&[]),
            Err(ValidationError::EmptyFieldNames)
        ));
        assert!(matches!(
            validate_field_names(&names(&["a", "a"])),
            Err(ValidationError::DuplicateFieldName(ref n)) if n == "a"
        ));
        assert!(matches!(
            validate_field_names(&names(&["a", " "])),
            Err(ValidationError::BlankFieldName { column: 2 })
        ));
    }

    #[test]
    fn test_validate_field_names_rejects_provenance_keys() {
        for reserved in PROVENANCE_KEYS {
            assert!(matches!(
                validate_field_names(&names(&["question", reserved])),
                Err(ValidationError::ReservedFieldName(ref n)) if n == reserved
            ));
        }
        assert!(validate_field_names(&names(&["document", "offset"])).is_ok());
    }

    #[test]
    fn test_check_correction_links() {
        let original = DataItem::new(names(&["q", "a"]));
        let mut correction = DataItem::new(names(&["q", "a2"]));
        correction.corrects_id = Some(original.id);
        assert!(check_correction_links(&[original.clone(), correction.clone()]).is_ok());

        let err = check_correction_links(&[correction.clone(), original.clone()]).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::DanglingCorrection { row: 1, corrects_id }
                if corrects_id == original.id
        ));

        let err = check_correction_links(std::slice::from_ref(&correction)).unwrap_err();
        assert!(matches!(err, ValidationError::DanglingCorrection { row: 1, .. }));

        let mut self_link = DataItem::new(names(&["x", "y"]));
        self_link.corrects_id = Some(self_link.id);
        assert!(check_correction_links(&[self_link]).is_err());

        let err = check_correction_links(&[original.clone(), original.clone()]).unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateItemId(id) if id == original.id));
    }

    #[test]
    fn test_check_row_widths_reports_first_bad_row() {
        let fields = names(&["a", "b"]);
        let rows = [names(&["1", "2"]), names(&["3"]), names(&["4", "5", "6"])];
        let err = check_row_widths(&fields, rows.iter().map(|r| r.as_slice())).unwrap_err();
        assert!(matches!(
            err,
            IntegrityError::RowWidth {
                row: 2,
                expected: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn test_current_view_filters_deleted_and_corrections() {
        let original = DataItem::new(names(&["q", "a"]));
        let mut correction = DataItem::new(names(&["q", "a2"]));
        correction.corrects_id = Some(original.id);
        let mut removed = DataItem::new(names(&["x", "y"]));
        removed.deleted = true;
        let items = vec![original.clone(), correction.clone(), removed];

        let view = current_view(&items, &ItemView::default());
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id, original.id);

        let with_corrections = current_view(
            &items,
            &ItemView {
                include_corrections: true,
                limit: None,
            },
        );
        assert_eq!(with_corrections.len(), 2);
        assert_eq!(with_corrections[1].id, correction.id);

        let limited = current_view(
            &items,
            &ItemView {
                include_corrections: true,
                limit: Some(1),
            },
        );
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_derive_from_table_inherits_metadata() {
        let previous = dataset(&["question", "answer", "complexity"]);
        let now = Utc::now();
        let next = previous.derive_from_table(names(&["question", "answer"]), now);

        assert_ne!(next.id, previous.id);
        assert_eq!(next.version, 5);
        assert_eq!(next.status, Status::Done);
        assert_eq!(next.model, previous.model);
        assert_eq!(next.runner, previous.runner);
        assert_eq!(next.prompt_id, previous.prompt_id);
        assert_eq!(next.corpus_id, previous.corpus_id);
        assert_eq!(next.field_names, names(&["question", "answer"]));
        assert_eq!(next.input_field, "question");
        assert_eq!(next.output_field, "answer");
        assert_eq!(next.total_generation_time_seconds, 0.0);
        assert_eq!(next.field_descriptions.len(), 1);
        assert!(next.field_descriptions.contains_key("answer"));
    }

    #[test]
    fn test_derive_from_table_falls_back_to_edge_columns() {
        let previous = dataset(&["question", "answer"]);
        let next =
            previous.derive_from_table(names(&["prompt", "topic", "completion"]), Utc::now());
        assert_eq!(next.input_field, "prompt");
        assert_eq!(next.output_field, "completion");
    }
}
