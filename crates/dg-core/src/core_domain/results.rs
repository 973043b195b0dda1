use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::{DataItem, IntegrityError, Provenance};

// ---------------------------------------------------------------------------
// Result document — the worker's output, one file per shard
// ---------------------------------------------------------------------------

const TOTAL_TIME_KEY: &str = "total_generation_time";
const ANNOTATIONS_KEY: &str = "annotations";

const DOCUMENT_ID_KEY: &str = "document_id";
const START_KEY: &str = "start_offset";
const END_KEY: &str = "end_offset";
const INFERENCE_TIME_KEY: &str = "inference_time_seconds";

/// Annotation keys read as provenance. They never reach the dynamic field
/// map, so a dataset schema cannot declare them.
pub const PROVENANCE_KEYS: [&str; 4] = [DOCUMENT_ID_KEY, START_KEY, END_KEY, INFERENCE_TIME_KEY];

/// One worker-produced record before projection onto a dataset schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub provenance: Provenance,
    pub inference_time_seconds: f64,
    /// Every key that is not provenance: the user-declared fields plus
    /// whatever informational extras the worker chose to add.
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultDocument {
    pub total_generation_time: f64,
    pub annotations: Vec<Annotation>,
}

/// Parses a result file. Only the envelope is typed; unknown top-level keys
/// are ignored and missing optional numbers count as zero.
pub fn parse_result_document(key: &str, bytes: &[u8]) -> Result<ResultDocument, IntegrityError> {
    let malformed = |reason: String| IntegrityError::MalformedResult {
        key: key.to_owned(),
        reason,
    };

    let root: Value = serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))?;
    let root = root
        .as_object()
        .ok_or_else(|| malformed("top level is not an object".into()))?;

    let total_generation_time = root
        .get(TOTAL_TIME_KEY)
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    let raw_annotations = root
        .get(ANNOTATIONS_KEY)
        .and_then(Value::as_array)
        .ok_or_else(|| malformed(format!("missing {ANNOTATIONS_KEY} array")))?;

    let annotations = raw_annotations
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            raw.as_object()
                .map(annotation_from_object)
                .ok_or_else(|| malformed(format!("annotation {i} is not an object")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ResultDocument {
        total_generation_time,
        annotations,
    })
}

fn annotation_from_object(object: &Map<String, Value>) -> Annotation {
    let text = |name: &str| object.get(name).map(stringify).unwrap_or_default();
    let fields = object
        .iter()
        .filter(|(name, _)| !PROVENANCE_KEYS.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    Annotation {
        provenance: Provenance {
            document_id: text(DOCUMENT_ID_KEY),
            start: text(START_KEY),
            end: text(END_KEY),
        },
        inference_time_seconds: object
            .get(INFERENCE_TIME_KEY)
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        fields,
    }
}

/// Renders a dynamic value as a cell. Strings are taken verbatim so that
/// values are not wrapped in quotes; null becomes the empty string.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

impl Annotation {
    /// Orders this annotation's dynamic fields by `field_names`. A single
    /// missing name rejects the annotation.
    pub fn project(
        &self,
        field_names: &[String],
        key: &str,
        index: usize,
    ) -> Result<Vec<String>, IntegrityError> {
        field_names
            .iter()
            .map(|name| {
                self.fields
                    .get(name)
                    .map(stringify)
                    .ok_or_else(|| IntegrityError::FieldNotFound {
                        field: name.clone(),
                        key: key.to_owned(),
                        annotation: index,
                    })
            })
            .collect()
    }

    pub fn into_item(self, id: Uuid, values: Vec<String>) -> DataItem {
        DataItem {
            id,
            values,
            corrects_id: None,
            provenance: Some(self.provenance),
            generation_time_seconds: self.inference_time_seconds,
            deleted: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Ingestion — accumulate documents into rows for one dataset
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct IngestionOutcome {
    pub total_generation_time: f64,
    pub items: Vec<DataItem>,
    pub files: usize,
}

/// Collects rows across result files. Nothing leaves the accumulator until
/// [`ResultAccumulator::finish`], so a failure on any file discards the
/// whole batch.
#[derive(Debug)]
pub struct ResultAccumulator<'a> {
    dataset_id: Uuid,
    field_names: &'a [String],
    outcome: IngestionOutcome,
}

impl<'a> ResultAccumulator<'a> {
    pub fn new(dataset_id: Uuid, field_names: &'a [String]) -> Self {
        Self {
            dataset_id,
            field_names,
            outcome: IngestionOutcome::default(),
        }
    }

    pub fn push_file(&mut self, key: &str, bytes: &[u8]) -> Result<(), IntegrityError> {
        let document = parse_result_document(key, bytes)?;
        let mut rows = Vec::with_capacity(document.annotations.len());
        for (index, annotation) in document.annotations.into_iter().enumerate() {
            let values = annotation.project(self.field_names, key, index)?;
            let id = ingested_item_id(self.dataset_id, key, index);
            rows.push(annotation.into_item(id, values));
        }
        // Times add up: shards may have run in parallel on separate workers.
        self.outcome.total_generation_time += document.total_generation_time;
        self.outcome.items.extend(rows);
        self.outcome.files += 1;
        Ok(())
    }

    pub fn finish(self) -> IngestionOutcome {
        self.outcome
    }
}

/// Stable id of the `index`-th annotation of result file `key`. Re-reading
/// the same files yields the same ids, so corrections that point at
/// ingested rows survive a re-ingestion.
pub fn ingested_item_id(dataset_id: Uuid, key: &str, index: usize) -> Uuid {
    Uuid::new_v5(&dataset_id, format!("{key}#{index}").as_bytes())
}

/// Converts a full set of `(key, body)` result files in one call.
pub fn convert_results<'k, I>(
    dataset_id: Uuid,
    field_names: &[String],
    files: I,
) -> Result<IngestionOutcome, IntegrityError>
where
    I: IntoIterator<Item = (&'k str, &'k [u8])>,
{
    let mut accumulator = ResultAccumulator::new(dataset_id, field_names);
    for (key, bytes) in files {
        accumulator.push_file(key, bytes)?;
    }
    Ok(accumulator.finish())
}

/// Prefix under which the worker writes a dataset's result files.
pub fn result_prefix(root: &str, dataset_id: Uuid) -> String {
    format!("{}/{dataset_id}/", root.trim_end_matches('/'))
}

pub fn is_result_file(key: &str, extension: &str) -> bool {
    let extension = extension.trim_start_matches('.');
    key.rsplit_once('.')
        .is_some_and(|(stem, ext)| !stem.ends_with('/') && ext.eq_ignore_ascii_case(extension))
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

    #[test]
    fn test_single_annotation_scenario() {
        let fields = names(&["question", "answer", "complexity"]);
        let body = br#"{
            "total_generation_time": 2.5,
            "annotations": [
                {"question": "Q1", "answer": "A1", "complexity": "simple", "document_id": "d1"}
            ]
        }"#;

        let outcome =
            convert_results(Uuid::nil(), &fields, [("r/part-0.json", &body[..])]).expect("ingest");

        assert_eq!(outcome.total_generation_time, 2.5);
        assert_eq!(outcome.files, 1);
        assert_eq!(outcome.items.len(), 1);
        let item = &outcome.items[0];
        assert_eq!(item.values, names(&["Q1", "A1", "simple"]));
        assert_eq!(item.generation_time_seconds, 0.0);
        assert!(!item.deleted);
        assert!(item.corrects_id.is_none());
        let provenance = item.provenance.as_ref().expect("provenance");
        assert_eq!(provenance.document_id, "d1");
        assert_eq!(provenance.start, "");
    }

    #[test]
    fn test_projection_follows_declared_order_and_ignores_extras() {
        let fields = names(&["b", "a"]);
        let body = br#"{"annotations": [
            {"a": "first", "b": 2, "score": 0.93, "document_id": "doc",
             "start_offset": 120, "end_offset": 480, "inference_time_seconds": 1.25}
        ]}"#;

        let outcome =
            convert_results(Uuid::nil(), &fields, [("k.json", &body[..])]).expect("ingest");
        let item = &outcome.items[0];
        assert_eq!(item.values, names(&["2", "first"]));
        assert_eq!(item.generation_time_seconds, 1.25);
        assert_eq!(outcome.total_generation_time, 0.0);
        let provenance = item.provenance.as_ref().expect("provenance");
        assert_eq!(provenance.start, "120");
        assert_eq!(provenance.end, "480");
    }

    #[test]
    fn test_total_time_is_summed_across_files() {
        let fields = names(&["q"]);
        let first = br#"{"total_generation_time": 1.5, "annotations": [{"q": "x"}]}"#;
        let second = br#"{"total_generation_time": 4.0, "annotations": [{"q": "y"}, {"q": "z"}]}"#;

        let outcome = convert_results(
            Uuid::nil(),
            &fields,
            [("a.json", &first[..]), ("b.json", &second[..])],
        )
        .expect("ingest");
        assert_eq!(outcome.total_generation_time, 5.5);
        let values: Vec<_> = outcome.items.iter().map(|i| i.values[0].as_str()).collect();
        assert_eq!(values, ["x", "y", "z"]);
    }

    #[test]
    fn test_missing_field_in_second_file_fails_everything() {
        let fields = names(&["question", "answer"]);
        let good = br#"{"annotations": [{"question": "Q1", "answer": "A1"}]}"#;
        let bad = br#"{"annotations": [{"question": "Q2"}]}"#;

        let err = convert_results(
            Uuid::nil(),
            &fields,
            [("good.json", &good[..]), ("bad.json", &bad[..])],
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "field answer not found in annotation");
        assert!(matches!(
            err,
            IntegrityError::FieldNotFound { ref key, annotation: 0, .. } if key == "bad.json"
        ));
    }

    #[test]
    fn test_malformed_documents() {
        let fields = names(&["q"]);
        for body in [&b"not json"[..], b"[1, 2]", b"{\"total_generation_time\": 1}"] {
            let err = convert_results(Uuid::nil(), &fields, [("x.json", body)]).unwrap_err();
            assert!(matches!(err, IntegrityError::MalformedResult { .. }), "{err}");
        }
    }

    #[test]
    fn test_stringify_values() {
        assert_eq!(stringify(&Value::String("plain".into())), "plain");
        assert_eq!(stringify(&Value::Null), "");
        assert_eq!(stringify(&serde_json::json!(3)), "3");
        assert_eq!(stringify(&serde_json::json!(true)), "true");
        assert_eq!(stringify(&serde_json::json!(["a", 1])), "[\"a\",1]");
    }

    #[test]
    fn test_result_file_filter() {
        assert!(is_result_file("results/abc/part-0.json", "json"));
        assert!(is_result_file("results/abc/part-0.JSON", ".json"));
        assert!(!is_result_file("results/abc/_SUCCESS", "json"));
        assert!(!is_result_file("results/abc/log.txt", "json"));
        assert!(!is_result_file("results/abc/.json", "json"));
    }

    #[test]
    fn test_result_prefix() {
        let id = Uuid::nil();
        assert_eq!(result_prefix("results/", id), format!("results/{id}/"));
    }

    #[test]
    fn test_ingested_ids_are_stable_per_dataset() {
        let fields = names(&["q"]);
        let body = br#"{"annotations": [{"q": "x"}, {"q": "y"}]}"#;
        let dataset_id = Uuid::new_v4();

        let first =
            convert_results(dataset_id, &fields, [("p.json", &body[..])]).expect("ingest");
        let again =
            convert_results(dataset_id, &fields, [("p.json", &body[..])]).expect("ingest");
        let ids: Vec<_> = first.items.iter().map(|i| i.id).collect();
        assert_eq!(ids, again.items.iter().map(|i| i.id).collect::<Vec<_>>());
        assert_ne!(ids[0], ids[1]);
        assert_eq!(ids[1], ingested_item_id(dataset_id, "p.json", 1));

        let other =
            convert_results(Uuid::new_v4(), &fields, [("p.json", &body[..])]).expect("ingest");
        assert_ne!(other.items[0].id, ids[0]);
    }
}
