use crate::models::{FileType, Record, SourceDataset};
use bytes::{Bytes, BytesMut};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Failed to fetch file: {0}")]
    Fetch(String),
    #[error("File {name} is {size} bytes, limit is {limit}")]
    TooLarge { name: String, size: u64, limit: u64 },
    #[error("Unsupported file type: {0}")]
    UnsupportedType(String),
    #[error("No content for file {0}")]
    MissingContent(String),
    #[error("Failed to decode file: {0}")]
    Decode(String),
}

/// One file as the client describes it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpload {
    pub name: String,
    #[serde(rename = "type", default)]
    pub file_type: Option<String>,
    #[serde(default, alias = "raw_text")]
    pub raw_text: Option<String>,
    #[serde(default, alias = "signed_url")]
    pub signed_url: Option<String>,
    #[serde(default)]
    pub sheet: Option<String>,
}

impl FileUpload {
    fn resolved_type(&self) -> Result<FileType, ImportError> {
        self.file_type
            .as_deref()
            .and_then(FileType::from_tag)
            .or_else(|| FileType::from_tag(&self.name))
            .filter(|t| *t != FileType::Derived)
            .ok_or_else(|| {
                ImportError::UnsupportedType(self.file_type.clone().unwrap_or_else(|| self.name.clone()))
            })
    }
}

/// Downloads a file, failing as soon as the body passes `max_size`.
pub async fn load_file_from_url(client: &Client, url: &str, name: &str, max_size: u64) -> Result<Bytes, ImportError> {
    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ImportError::Fetch(e.to_string()))?;

    if !response.status().is_success() {
        return Err(ImportError::Fetch(format!("Status: {}", response.status())));
    }

    if let Some(size) = response.content_length().filter(|size| *size > max_size) {
        return Err(ImportError::TooLarge { name: name.to_string(), size, limit: max_size });
    }

    // Content-Length may be absent or wrong, so the limit is also checked per chunk.
    let mut body = BytesMut::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| ImportError::Fetch(format!("Failed to read response bytes: {}", e)))?
    {
        check_size(name, body.len() + chunk.len(), max_size)?;
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

fn check_size(name: &str, size: usize, limit: u64) -> Result<(), ImportError> {
    let size = size as u64;
    if size > limit {
        return Err(ImportError::TooLarge { name: name.to_string(), size, limit });
    }
    Ok(())
}

/// Builds a dataset from one upload. Delimited text and workbooks stay raw
/// until a step first reads them; JSON is decoded right away.
pub async fn import_file(client: &Client, upload: FileUpload, max_size: u64) -> Result<SourceDataset, ImportError> {
    let file_type = upload.resolved_type()?;

    let content = match (&upload.raw_text, &upload.signed_url) {
        (Some(text), _) if file_type != FileType::Xlsx => {
            check_size(&upload.name, text.len(), max_size)?;
            Bytes::from(text.clone())
        }
        (_, Some(url)) => load_file_from_url(client, url, &upload.name, max_size).await?,
        _ => return Err(ImportError::MissingContent(upload.name)),
    };

    let dataset = match file_type {
        FileType::Xlsx => SourceDataset::from_workbook(upload.name, content, upload.sheet),
        FileType::Json => SourceDataset::from_rows(upload.name, FileType::Json, decode_json_rows(&content)?),
        FileType::Csv | FileType::Tsv => {
            let text = String::from_utf8(content.to_vec()).map_err(|e| ImportError::Decode(e.to_string()))?;
            SourceDataset::from_raw_text(upload.name, file_type, text)
        }
        FileType::Derived => return Err(ImportError::UnsupportedType("derived".into())),
    };

    tracing::info!(name = %dataset.name, file_type = ?dataset.file_type, "Imported file");
    Ok(dataset)
}

/// Imports every upload in order; the first failure aborts the batch.
pub async fn import_files(client: &Client, uploads: Vec<FileUpload>, max_size: u64) -> Result<Vec<SourceDataset>, ImportError> {
    let mut datasets = Vec::with_capacity(uploads.len());
    for upload in uploads {
        datasets.push(import_file(client, upload, max_size).await?);
    }
    Ok(datasets)
}

/// Decodes a JSON array of objects. Non-object items are rejected.
fn decode_json_rows(content: &[u8]) -> Result<Vec<Record>, ImportError> {
    let value: Value = serde_json::from_slice(content).map_err(|e| ImportError::Decode(e.to_string()))?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(row) => vec![Value::Object(row)],
        _ => return Err(ImportError::Decode("expected an array of objects".into())),
    };

    items
        .into_iter()
        .map(|item| match item {
            Value::Object(row) => Ok(row),
            other => Err(ImportError::Decode(format!("expected an object row, got {}", other))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upload(name: &str, file_type: Option<&str>, raw_text: Option<&str>) -> FileUpload {
        FileUpload {
            name: name.into(),
            file_type: file_type.map(str::to_string),
            raw_text: raw_text.map(str::to_string),
            signed_url: None,
            sheet: None,
        }
    }

    #[tokio::test]
    async fn csv_text_stays_raw() {
        let client = Client::new();
        let dataset = import_file(&client, upload("people.csv", Some("text/csv"), Some("Name\nann\n")), 1024)
            .await
            .unwrap();
        assert_eq!(dataset.file_type, FileType::Csv);
        assert!(dataset.needs_materialization());
        assert!(dataset.rows.is_empty());
    }

    #[tokio::test]
    async fn type_falls_back_to_file_name() {
        let client = Client::new();
        let dataset = import_file(&client, upload("scores.tsv", None, Some("a\tb\n1\t2\n")), 1024)
            .await
            .unwrap();
        assert_eq!(dataset.file_type, FileType::Tsv);
    }

    #[tokio::test]
    async fn json_is_decoded_eagerly() {
        let client = Client::new();
        let text = json!([{"Name": "ann", "Age": 31}, {"Name": "bob", "Age": 42}]).to_string();
        let dataset = import_file(&client, upload("people.json", Some("json"), Some(&text)), 1024)
            .await
            .unwrap();
        assert!(!dataset.needs_materialization());
        assert_eq!(dataset.rows.len(), 2);
        assert_eq!(dataset.columns, vec!["Name", "Age"]);
    }

    #[tokio::test]
    async fn json_scalars_are_rejected() {
        let client = Client::new();
        let err = import_file(&client, upload("bad.json", Some("json"), Some("[1, 2]")), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Decode(_)));
    }

    #[tokio::test]
    async fn oversized_text_is_rejected() {
        let client = Client::new();
        let err = import_file(&client, upload("big.csv", Some("csv"), Some("a,b,c\n1,2,3\n")), 4)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::TooLarge { size: 12, limit: 4, .. }));
    }

    #[tokio::test]
    async fn missing_content_and_unknown_types_fail() {
        let client = Client::new();
        let err = import_file(&client, upload("book.xlsx", None, Some("not bytes")), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::MissingContent(_)));

        let err = import_file(&client, upload("notes.txt", None, Some("hi")), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedType(_)));
    }

    /// Serves `connections` requests with a chunked body and no Content-Length.
    fn serve_chunked(chunks: &'static [&'static str], connections: usize) -> String {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming().take(connections) {
                let mut stream = stream.unwrap();
                let mut request = [0u8; 1024];
                let _ = stream.read(&mut request);
                let mut response = String::from("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n");
                for chunk in chunks {
                    response.push_str(&format!("{:x}\r\n{}\r\n", chunk.len(), chunk));
                }
                response.push_str("0\r\n\r\n");
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{}/people.csv", addr)
    }

    #[tokio::test]
    async fn download_stops_once_body_passes_the_limit() {
        let url = serve_chunked(&["Name\nann\n", "bob\ncat\n", "dan\neve\n"], 2);
        let client = Client::builder().no_proxy().build().unwrap();

        let err = load_file_from_url(&client, &url, "people.csv", 12).await.unwrap_err();
        assert!(matches!(err, ImportError::TooLarge { limit: 12, .. }));

        let body = load_file_from_url(&client, &url, "people.csv", 1024).await.unwrap();
        assert_eq!(&body[..], b"Name\nann\nbob\ncat\ndan\neve\n");
    }

    #[test]
    fn upload_accepts_type_key() {
        let upload: FileUpload = serde_json::from_value(json!({
            "name": "people.csv",
            "type": "csv",
            "rawText": "Name\nann\n"
        }))
        .unwrap();
        assert_eq!(upload.file_type.as_deref(), Some("csv"));
        assert!(upload.raw_text.is_some());
    }
}
