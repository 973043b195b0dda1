use std::net::SocketAddr;
use std::sync::Arc;

use dg_core::core::SystemClock;
use dg_server::blob::MemoryBlobStore;
use dg_server::bootstrap::{QueueSettings, ResultsSettings};
use dg_server::handler::{self, AppState};
use dg_server::ingest::ResultsIngestor;
use dg_server::queue::JobQueue;
use dg_server::service::CatalogService;
use dg_store::{CatalogStore, SqliteCatalogStore};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// TestServer — a real dg server over an in-memory catalog and blob store
// ---------------------------------------------------------------------------

pub struct TestServer {
    pub addr: SocketAddr,
    pub blob: Arc<MemoryBlobStore>,
    pub client: reqwest::Client,
    _handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let store = SqliteCatalogStore::new_in_memory().expect("in-memory store");
        store.init().expect("init schema");
        let blob = Arc::new(MemoryBlobStore::new());
        let clock = Arc::new(SystemClock);

        let service = CatalogService::new(
            Arc::new(store),
            JobQueue::new(blob.clone(), QueueSettings::default(), clock.clone()),
            ResultsIngestor::new(blob.clone(), ResultsSettings::default()),
            clock,
            2000,
        );
        let app = handler::router(Arc::new(AppState::new(service)));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind server");
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self {
            addr,
            blob,
            client: reqwest::Client::new(),
            _handle: handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .expect("request should succeed")
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("request should succeed")
    }

    pub async fn upload_csv(&self, path: &str, body: &[u8]) -> reqwest::Response {
        let part = reqwest::multipart::Part::bytes(body.to_vec())
            .file_name("upload.csv")
            .mime_str("text/csv")
            .expect("mime");
        let form = reqwest::multipart::Form::new().part("file", part);
        self.client
            .post(self.url(path))
            .multipart(form)
            .send()
            .await
            .expect("request should succeed")
    }

    /// Registers a project, corpus and prompt and returns the dataset
    /// creation body that references them.
    pub async fn seed(&self) -> Value {
        let project: Value = self
            .post_json("/projects", &json!({"name": "Support Bot"}))
            .await
            .json()
            .await
            .expect("project json");
        let corpus: Value = self
            .post_json(
                "/corpora",
                &json!({
                    "project_id": project["id"],
                    "name": "faq",
                    "location": "corpora/faq",
                    "language": "en"
                }),
            )
            .await
            .json()
            .await
            .expect("corpus json");
        let prompt: Value = self
            .post_json(
                "/prompts",
                &json!({"project_id": project["id"], "text": "Ask about the FAQ"}),
            )
            .await
            .json()
            .await
            .expect("prompt json");

        json!({
            "project_id": project["id"],
            "corpus_id": corpus["id"],
            "prompt_id": prompt["id"],
            "model": "llama3-8b",
            "runner": "vllm",
            "input_field": "question",
            "output_field": "answer",
            "field_names": ["question", "answer", "complexity"],
            "generate_examples_number": 10
        })
    }

    /// Drops a worker result file for `dataset_id` into the blob store.
    pub fn put_result(&self, dataset_id: &str, name: &str, body: &Value) {
        self.blob.insert(
            format!("results/{dataset_id}/{name}"),
            serde_json::to_vec(body).expect("result json"),
        );
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self._handle.abort();
    }
}

pub fn sample_results() -> Value {
    json!({
        "total_generation_time": 3.5,
        "annotations": [
            {"question": "How do I reset my password?", "answer": "Use the login page.",
             "complexity": "simple", "document_id": "faq-1", "start_offset": 0, "end_offset": 120},
            {"question": "Can I export my data?", "answer": "Yes, as CSV.",
             "complexity": "simple", "document_id": "faq-2"}
        ]
    })
}
