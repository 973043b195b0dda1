use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{
    validate_field_names, Corpus, Dataset, FineTune, JobClass, LanguageCode, ModelId,
    PipelineError, Prompt, RunnerId, Status, TrainingParams, ValidationError,
};

// ---------------------------------------------------------------------------
// Create commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDatasetCommand {
    pub project_id: Uuid,
    pub corpus_id: Uuid,
    pub prompt_id: Uuid,
    pub model: ModelId,
    pub runner: RunnerId,
    pub input_field: String,
    pub output_field: String,
    pub field_names: Vec<String>,
    pub generate_examples_number: u32,
    #[serde(default)]
    pub field_descriptions: BTreeMap<String, String>,
    #[serde(default)]
    pub output_size_chars: Option<u32>,
}

impl CreateDatasetCommand {
    /// Shape checks that need no resolved references.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.model.is_blank() {
            return Err(ValidationError::MissingValue("model"));
        }
        if self.runner.is_blank() {
            return Err(ValidationError::MissingValue("runner"));
        }
        if self.generate_examples_number == 0 {
            return Err(ValidationError::ZeroTargetCount);
        }
        validate_field_names(&self.field_names)?;
        check_selectors(&self.field_names, &self.input_field, &self.output_field)?;
        for described in self.field_descriptions.keys() {
            if !self.field_names.contains(described) {
                return Err(ValidationError::UndeclaredField {
                    role: "described",
                    field: described.clone(),
                });
            }
        }
        Ok(())
    }

    /// Plans a PLANNING dataset. The version is provisional; the store
    /// assigns the real one on insert.
    pub fn into_dataset(
        self,
        prompt_history: Vec<Uuid>,
        default_output_chars: u32,
        now: DateTime<Utc>,
    ) -> Dataset {
        let output_size_chars = if self.field_descriptions.is_empty() {
            self.output_size_chars
        } else {
            Some(self.output_size_chars.unwrap_or(default_output_chars))
        };
        Dataset {
            id: Uuid::new_v4(),
            project_id: self.project_id,
            version: 0,
            model: self.model,
            runner: self.runner,
            input_field: self.input_field,
            output_field: self.output_field,
            field_names: self.field_names,
            field_descriptions: self.field_descriptions,
            output_size_chars,
            corpus_id: Some(self.corpus_id),
            prompt_id: Some(self.prompt_id),
            prompt_history,
            total_generation_time_seconds: 0.0,
            generate_examples_number: self.generate_examples_number,
            status: Status::Planning,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFineTuneCommand {
    pub dataset_id: Uuid,
    pub base_model: ModelId,
    pub runner: RunnerId,
    pub input_field: String,
    pub output_field: String,
    #[serde(default)]
    pub params: TrainingParams,
}

impl CreateFineTuneCommand {
    pub fn into_fine_tune(self, project_id: Uuid, now: DateTime<Utc>) -> FineTune {
        FineTune {
            id: Uuid::new_v4(),
            project_id,
            version: 0,
            dataset_id: self.dataset_id,
            base_model: self.base_model,
            runner: self.runner,
            input_field: self.input_field,
            output_field: self.output_field,
            params: self.params,
            model: None,
            status: Status::Planning,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Job descriptions — immutable payloads handed to the external worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetJob {
    pub dataset_id: Uuid,
    pub corpus_name: String,
    pub corpus_location: String,
    pub language: LanguageCode,
    pub prompt: String,
    pub examples: u32,
    pub model: ModelId,
    pub runner: RunnerId,
    pub input_field: String,
    pub output_field: String,
    pub field_names: Vec<String>,
    /// JSON object text mapping field name to description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_size_chars: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FineTuneJob {
    pub fine_tune_id: Uuid,
    pub dataset_id: Uuid,
    pub dataset_version: u32,
    pub base_model: ModelId,
    pub runner: RunnerId,
    pub input_field: String,
    pub output_field: String,
    pub epochs: u32,
    pub learning_rate: f64,
    pub lora_rank: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobDescription {
    DatasetGeneration(DatasetJob),
    FineTune(FineTuneJob),
}

impl JobDescription {
    pub fn class(&self) -> JobClass {
        match self {
            Self::DatasetGeneration(_) => JobClass::DatasetGeneration,
            Self::FineTune(_) => JobClass::FineTune,
        }
    }

    pub fn entity_id(&self) -> Uuid {
        match self {
            Self::DatasetGeneration(job) => job.dataset_id,
            Self::FineTune(job) => job.fine_tune_id,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Assembles the generation payload for a planned dataset.
///
/// Fails before anything is queued when the corpus has no name, the prompt
/// is empty, or the input/output selectors are not declared in
/// `field_names`: once the job runs remotely such a schema error could no
/// longer be diagnosed.
pub fn build_dataset_job(
    dataset: &Dataset,
    corpus: &Corpus,
    prompt: &Prompt,
) -> Result<JobDescription, PipelineError> {
    if corpus.name.trim().is_empty() {
        return Err(ValidationError::EmptyCorpusName.into());
    }
    if prompt.text.trim().is_empty() {
        return Err(ValidationError::EmptyPromptText.into());
    }
    check_selectors(&dataset.field_names, &dataset.input_field, &dataset.output_field)?;

    let (fields_description, output_size_chars) = if dataset.field_descriptions.is_empty() {
        (None, None)
    } else {
        let text = serde_json::to_string(&dataset.field_descriptions)?;
        (Some(text), dataset.output_size_chars)
    };

    Ok(JobDescription::DatasetGeneration(DatasetJob {
        dataset_id: dataset.id,
        corpus_name: corpus.name.clone(),
        corpus_location: corpus.location.clone(),
        language: corpus.language.clone(),
        prompt: prompt.text.clone(),
        examples: dataset.generate_examples_number,
        model: dataset.model.clone(),
        runner: dataset.runner.clone(),
        input_field: dataset.input_field.clone(),
        output_field: dataset.output_field.clone(),
        field_names: dataset.field_names.clone(),
        fields_description,
        output_size_chars,
    }))
}

/// Assembles the training payload. The source dataset must be DONE and must
/// declare the selected fields.
pub fn build_fine_tune_job(
    fine_tune: &FineTune,
    dataset: &Dataset,
) -> Result<JobDescription, ValidationError> {
    if dataset.status != Status::Done {
        return Err(ValidationError::DatasetNotDone {
            id: dataset.id,
            status: dataset.status,
        });
    }
    if fine_tune.base_model.is_blank() {
        return Err(ValidationError::MissingValue("base_model"));
    }
    if fine_tune.runner.is_blank() {
        return Err(ValidationError::MissingValue("runner"));
    }
    check_selectors(
        &dataset.field_names,
        &fine_tune.input_field,
        &fine_tune.output_field,
    )?;

    Ok(JobDescription::FineTune(FineTuneJob {
        fine_tune_id: fine_tune.id,
        dataset_id: dataset.id,
        dataset_version: dataset.version,
        base_model: fine_tune.base_model.clone(),
        runner: fine_tune.runner.clone(),
        input_field: fine_tune.input_field.clone(),
        output_field: fine_tune.output_field.clone(),
        epochs: fine_tune.params.epochs,
        learning_rate: fine_tune.params.learning_rate,
        lora_rank: fine_tune.params.lora_rank,
    }))
}

/// Queue key: `{class}/{yyMMddHHmmss}_{entity_id}.json`.
pub fn job_key(class_prefix: &str, submitted_at: DateTime<Utc>, entity_id: Uuid) -> String {
    format!(
        "{class_prefix}/{}_{entity_id}.json",
        submitted_at.format("%y%m%d%H%M%S")
    )
}

fn check_selectors(
    field_names: &[String],
    input_field: &str,
    output_field: &str,
) -> Result<(), ValidationError> {
    for (role, field) in [("input", input_field), ("output", output_field)] {
        if !field_names.iter().any(|f| f == field) {
            return Err(ValidationError::UndeclaredField {
                role,
                field: field.to_owned(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
