use dg_core::core::{current_view, DataItem, Dataset, ItemView};
use serde::Serialize;
use uuid::Uuid;

use crate::store::{CatalogStore, StoreError};

/// A dataset together with the items a listing, sample or export shows.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetView {
    pub dataset: Dataset,
    pub items: Vec<DataItem>,
}

/// Loads a dataset and filters its items through [`current_view`].
///
/// Deleted items never appear. Correcting items appear only when the view
/// asks for them. Returns `None` for an unknown dataset id.
pub fn load_view(
    store: &dyn CatalogStore,
    dataset_id: &Uuid,
    view: &ItemView,
) -> Result<Option<DatasetView>, StoreError> {
    let Some(dataset) = store.get_dataset(dataset_id)? else {
        return Ok(None);
    };
    let items = store.list_items(dataset_id)?;
    let items = current_view(&items, view).into_iter().cloned().collect();
    Ok(Some(DatasetView { dataset, items }))
}

/// The rows written to a CSV download: every live item, corrections
/// included, in stored order.
pub fn export_view() -> ItemView {
    ItemView {
        include_corrections: true,
        limit: None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use dg_core::core::{ModelId, Project, RunnerId, Status};

    use super::*;
    use crate::store::SqliteCatalogStore;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn seeded() -> (SqliteCatalogStore, Uuid, Vec<DataItem>) {
        let store = SqliteCatalogStore::new_in_memory().expect("in-memory store");
        store.init().expect("init schema");
        let project = Project {
            id: Uuid::new_v4(),
            name: "p".to_string(),
            created_at: Utc::now(),
        };
        store.insert_project(&project).expect("insert project");

        let original = DataItem::new(names(&["q1", "a1"]));
        let mut correction = DataItem::new(names(&["q1", "a1-fixed"]));
        correction.corrects_id = Some(original.id);
        let mut removed = DataItem::new(names(&["q2", "a2"]));
        removed.deleted = true;
        let later = DataItem::new(names(&["q3", "a3"]));
        let items = vec![original, correction, removed, later];

        let now = Utc::now();
        let dataset = Dataset {
            id: Uuid::new_v4(),
            project_id: project.id,
            version: 0,
            model: ModelId::new("m"),
            runner: RunnerId::new("r"),
            input_field: "question".to_string(),
            output_field: "answer".to_string(),
            field_names: names(&["question", "answer"]),
            field_descriptions: BTreeMap::new(),
            output_size_chars: None,
            corpus_id: None,
            prompt_id: None,
            prompt_history: vec![],
            total_generation_time_seconds: 0.0,
            generate_examples_number: 3,
            status: Status::Done,
            created_at: now,
            updated_at: now,
        };
        let stored = store.insert_dataset(&dataset, &items).expect("insert");
        (store, stored.id, items)
    }

    #[test]
    fn test_load_view_defaults_to_current_rows() {
        let (store, id, items) = seeded();
        let view = load_view(&store, &id, &ItemView::default())
            .expect("load")
            .expect("exists");
        let ids: Vec<_> = view.items.iter().map(|i| i.id).collect();
        assert_eq!(ids, [items[0].id, items[3].id]);
    }

    #[test]
    fn test_load_view_with_corrections_and_limit() {
        let (store, id, items) = seeded();
        let view = load_view(
            &store,
            &id,
            &ItemView {
                include_corrections: true,
                limit: Some(2),
            },
        )
        .expect("load")
        .expect("exists");
        let ids: Vec<_> = view.items.iter().map(|i| i.id).collect();
        assert_eq!(ids, [items[0].id, items[1].id]);
    }

    #[test]
    fn test_export_view_keeps_corrections_drops_deleted() {
        let (store, id, _) = seeded();
        let view = load_view(&store, &id, &export_view())
            .expect("load")
            .expect("exists");
        assert_eq!(view.items.len(), 3);
        assert!(view.items.iter().all(|i| !i.deleted));
    }

    #[test]
    fn test_load_view_unknown_dataset() {
        let (store, _, _) = seeded();
        assert!(load_view(&store, &Uuid::new_v4(), &ItemView::default())
            .expect("load")
            .is_none());
    }
}
