use std::path::{Path, PathBuf};

use clap::{ArgGroup, Parser, Subcommand};
use colored::Colorize;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "dg-ctl", about = "Operator CLI for the datagen catalog")]
struct Args {
    #[arg(long, default_value = "http://localhost:8080", global = true)]
    api_base: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show a dataset.
    Show { dataset_id: Uuid },
    /// Print the current items of a dataset.
    Items {
        dataset_id: Uuid,
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        include_corrections: bool,
    },
    /// Report a dataset status as the worker would.
    Status { dataset_id: Uuid, status: String },
    /// Report a fine-tune status, with the trained model on DONE.
    ///
    /// The model descriptor is all or nothing: `--size`, `--dtype` and
    /// `--quantization` must be given together.
    #[command(group(
        ArgGroup::new("model")
            .args(["size", "dtype", "quantization"])
            .multiple(true)
    ))]
    FineTuneStatus {
        fine_tune_id: Uuid,
        status: String,
        #[arg(long, requires_all = ["dtype", "quantization"])]
        size: Option<String>,
        #[arg(long, requires_all = ["size", "quantization"])]
        dtype: Option<String>,
        #[arg(long, requires_all = ["size", "dtype"])]
        quantization: Option<String>,
    },
    /// Re-read worker results without changing the status.
    Ingest { dataset_id: Uuid },
    /// Requeue the job of a dataset still in PLANNING.
    Resubmit { dataset_id: Uuid },
    /// Download a dataset as CSV.
    Export {
        dataset_id: Uuid,
        /// Directory the file is written to.
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Append the rows of a CSV file to a dataset.
    Append { dataset_id: Uuid, file: PathBuf },
    /// Create the next dataset version from a CSV file.
    NewVersion { dataset_id: Uuid, file: PathBuf },
}

#[derive(Debug, Serialize)]
struct StatusRequest<'a> {
    entity_id: Uuid,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<ModelDescriptor>,
}

#[derive(Debug, Serialize)]
struct ModelDescriptor {
    size: String,
    dtype: String,
    quantization: String,
}

#[derive(Debug, Deserialize)]
struct DatasetSummary {
    id: Uuid,
    version: u32,
    status: String,
    model: String,
    field_names: Vec<String>,
    generate_examples_number: u32,
    total_generation_time_seconds: f64,
}

#[derive(Debug, Deserialize)]
struct ItemsResponse {
    items: Vec<ItemRow>,
}

#[derive(Debug, Deserialize)]
struct ItemRow {
    values: Vec<String>,
    corrects_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, String> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .map(|v| v.error.message)
            .unwrap_or(body);
        Err(format!("Request failed ({status}): {message}"))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, String> {
        let response = request.send().await.map_err(|err| {
            format!("Connection error: {err}. Please check --api-base and server status.")
        })?;
        Self::check(response).await
    }

    async fn json<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, String> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|err| format!("Unexpected response body: {err}"))
    }

    async fn upload(&self, path: &str, file: &Path) -> Result<serde_json::Value, String> {
        let bytes = tokio::fs::read(file)
            .await
            .map_err(|err| format!("Failed to read {}: {err}", file.display()))?;
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.csv".to_owned());
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(name)
            .mime_str("text/csv")
            .map_err(|err| err.to_string())?;
        let form = reqwest::multipart::Form::new().part("file", part);
        self.json(self.http.post(self.url(path)).multipart(form))
            .await
    }
}

fn print_dataset(dataset: &DatasetSummary) {
    println!(
        "{} {} v{} [{}]",
        "Dataset".bright_cyan(),
        dataset.id,
        dataset.version,
        dataset.status.bold()
    );
    println!("  model:  {}", dataset.model);
    println!("  fields: {}", dataset.field_names.join(", "));
    println!(
        "  items:  {}  generation time: {:.1}s",
        dataset.generate_examples_number, dataset.total_generation_time_seconds
    );
}

/// Pulls the filename out of `attachment; filename="..."`.
fn attachment_filename(disposition: &str) -> Option<String> {
    let (_, rest) = disposition.split_once("filename=")?;
    let name = rest.trim().trim_matches('"');
    (!name.is_empty() && !name.contains('/')).then(|| name.to_owned())
}

async fn export(client: &Client, dataset_id: Uuid, out_dir: &Path) -> Result<PathBuf, String> {
    let response = client
        .send(client.http.get(client.url(&format!("/datasets/{dataset_id}/csv"))))
        .await?;
    let filename = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(attachment_filename)
        .unwrap_or_else(|| format!("dataset_{dataset_id}.csv"));
    let path = out_dir.join(filename);

    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|err| format!("Failed to create {}: {err}", path.display()))?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|err| format!("Download interrupted: {err}"))?;
        file.write_all(&bytes)
            .await
            .map_err(|err| format!("Failed to write {}: {err}", path.display()))?;
    }
    file.flush()
        .await
        .map_err(|err| format!("Failed to write {}: {err}", path.display()))?;
    Ok(path)
}

async fn run(args: Args) -> Result<(), String> {
    let client = Client {
        http: reqwest::Client::new(),
        base: args.api_base.trim_end_matches('/').to_owned(),
    };

    match args.command {
        Command::Show { dataset_id } => {
            let dataset: DatasetSummary = client
                .json(client.http.get(client.url(&format!("/datasets/{dataset_id}"))))
                .await?;
            print_dataset(&dataset);
        }
        Command::Items {
            dataset_id,
            limit,
            include_corrections,
        } => {
            let url = client.url(&format!(
                "/datasets/{dataset_id}/items?limit={limit}&include_corrections={include_corrections}"
            ));
            let page: ItemsResponse = client.json(client.http.get(url)).await?;
            for (i, item) in page.items.iter().enumerate() {
                let marker = if item.corrects_id.is_some() {
                    "*".yellow()
                } else {
                    " ".normal()
                };
                println!("{marker}{:>4}  {}", i + 1, item.values.join(" | "));
            }
            if page.items.is_empty() {
                println!("{}", "No items.".yellow());
            }
        }
        Command::Status { dataset_id, status } => {
            let request = StatusRequest {
                entity_id: dataset_id,
                status: &status,
                model: None,
            };
            let dataset: DatasetSummary = client
                .json(client.http.post(client.url("/datasets/status")).json(&request))
                .await?;
            print_dataset(&dataset);
        }
        Command::FineTuneStatus {
            fine_tune_id,
            status,
            size,
            dtype,
            quantization,
        } => {
            let model = match (size, dtype, quantization) {
                (Some(size), Some(dtype), Some(quantization)) => Some(ModelDescriptor {
                    size,
                    dtype,
                    quantization,
                }),
                _ => None,
            };
            let request = StatusRequest {
                entity_id: fine_tune_id,
                status: &status,
                model,
            };
            let fine_tune: serde_json::Value = client
                .json(client.http.post(client.url("/fine-tunes/status")).json(&request))
                .await?;
            println!(
                "{} {} [{}]",
                "Fine-tune".bright_cyan(),
                fine_tune_id,
                fine_tune["status"].as_str().unwrap_or("?").bold()
            );
        }
        Command::Ingest { dataset_id } => {
            let report: serde_json::Value = client
                .json(client.http.post(client.url(&format!("/datasets/{dataset_id}/ingest"))))
                .await?;
            println!(
                "{} {} items from {} files",
                "Ingested".bright_green(),
                report["items"],
                report["files"]
            );
        }
        Command::Resubmit { dataset_id } => {
            let dataset: DatasetSummary = client
                .json(client.http.post(client.url(&format!("/datasets/{dataset_id}/resubmit"))))
                .await?;
            println!("{}", "Job resubmitted.".bright_green());
            print_dataset(&dataset);
        }
        Command::Export {
            dataset_id,
            out_dir,
        } => {
            let path = export(&client, dataset_id, &out_dir).await?;
            println!("{} {}", "Wrote".bright_green(), path.display());
        }
        Command::Append { dataset_id, file } => {
            let body = client
                .upload(&format!("/datasets/{dataset_id}/csv"), &file)
                .await?;
            println!(
                "{} dataset now has {} items",
                "Appended.".bright_green(),
                body["items"]
            );
        }
        Command::NewVersion { dataset_id, file } => {
            let body = client
                .upload(&format!("/datasets/{dataset_id}/versions"), &file)
                .await?;
            let dataset: DatasetSummary = serde_json::from_value(body)
                .map_err(|err| format!("Unexpected response body: {err}"))?;
            print_dataset(&dataset);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(message) = run(args).await {
        eprintln!("{}", format!("Error: {message}").red());
        std::process::exit(1);
    }
}
