//! Evidence file writer.
//!
//! JSON artifacts are pretty-printed with a four-space indent; CSV artifacts
//! are rendered from an array of objects. Every write returns the SHA-256 of
//! the bytes on disk for the run ledger.

use crate::error::{CoreError, CoreResult};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Format of a written artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Json,
    Csv,
}

impl ArtifactFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Json => "json",
            ArtifactFormat::Csv => "csv",
        }
    }
}

/// A file that was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenArtifact {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: usize,
    pub format: ArtifactFormat,
}

/// Writes evidence files, creating parent directories as needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvidenceWriter;

impl EvidenceWriter {
    pub fn new() -> Self {
        Self
    }

    /// Writes `value` as indented JSON.
    pub async fn write_json(&self, path: &Path, value: &Value) -> CoreResult<WrittenArtifact> {
        let bytes = to_json_bytes(value)?;
        self.write_bytes(path, bytes, ArtifactFormat::Json).await
    }

    /// Writes rows as CSV.
    ///
    /// `columns` fixes the header; when it is empty every key seen in the
    /// rows is used, in first-seen order.
    pub async fn write_csv(
        &self,
        path: &Path,
        rows: &[Value],
        columns: &[String],
    ) -> CoreResult<WrittenArtifact> {
        let bytes = to_csv_bytes(rows, columns)?;
        self.write_bytes(path, bytes, ArtifactFormat::Csv).await
    }

    async fn write_bytes(
        &self,
        path: &Path,
        bytes: Vec<u8>,
        format: ArtifactFormat,
    ) -> CoreResult<WrittenArtifact> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::io(parent, e))?;
        }
        let sha256 = hex::encode(Sha256::digest(&bytes));
        let len = bytes.len();
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| CoreError::io(path, e))?;

        debug!(path = %path.display(), bytes = len, "Artifact written");
        info!("Evidence saved to {}", path.display());

        Ok(WrittenArtifact {
            path: path.to_path_buf(),
            sha256,
            bytes: len,
            format,
        })
    }
}

/// Serialises a value with a four-space indent.
pub fn to_json_bytes<T: Serialize + ?Sized>(value: &T) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    Ok(out)
}

/// Renders rows as CSV. Non-object rows land in a single `value` column.
pub fn to_csv_bytes(rows: &[Value], columns: &[String]) -> CoreResult<Vec<u8>> {
    let objects: Vec<Map<String, Value>> = rows
        .iter()
        .map(|row| match row {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        })
        .collect();

    let header: Vec<String> = if columns.is_empty() {
        let mut seen: Vec<String> = Vec::new();
        for object in &objects {
            for key in object.keys() {
                if !seen.contains(key) {
                    seen.push(key.clone());
                }
            }
        }
        seen
    } else {
        columns.to_vec()
    };

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&header)?;
    for object in &objects {
        let record: Vec<String> = header
            .iter()
            .map(|column| cell(object.get(column)))
            .collect();
        writer.write_record(&record)?;
    }
    writer
        .into_inner()
        .map_err(|e| CoreError::Serialization(format!("CSV: {}", e)))
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(nested) => nested.to_string(),
    }
}

/// Rows for a CSV rendition: arrays as-is, a single object as one row.
pub fn rows_of(payload: &Value) -> Vec<Value> {
    match payload {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_uses_four_space_indent() {
        let bytes = to_json_bytes(&json!({"a": [1]})).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "{\n    \"a\": [\n        1\n    ]\n}");
    }

    #[test]
    fn test_csv_with_fixed_columns() {
        let rows = vec![
            json!({"id": "1", "email": "a@example.com", "extra": true}),
            json!({"id": "2"}),
        ];
        let bytes = to_csv_bytes(&rows, &["id".to_string(), "email".to_string()]).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "id,email\n1,a@example.com\n2,\n"
        );
    }

    #[test]
    fn test_csv_infers_columns_and_serialises_nested() {
        let rows = vec![
            json!({"labels": ["a", "b"], "name": "web"}),
            json!({"name": "api", "owner": {"login": "octo"}}),
        ];
        let text = String::from_utf8(to_csv_bytes(&rows, &[]).unwrap()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("labels,name,owner"));
        assert_eq!(lines.next(), Some("\"[\"\"a\"\",\"\"b\"\"]\",web,"));
        assert_eq!(lines.next(), Some(",api,\"{\"\"login\"\":\"\"octo\"\"}\""));
    }

    #[test]
    fn test_rows_of() {
        assert_eq!(rows_of(&json!([1, 2])).len(), 2);
        assert_eq!(rows_of(&json!({"a": 1})).len(), 1);
        assert!(rows_of(&Value::Null).is_empty());
    }

    #[tokio::test]
    async fn test_write_json_creates_dirs_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c/kms-list_keys.json");
        let written = EvidenceWriter::new()
            .write_json(&path, &json!({"Keys": []}))
            .await
            .unwrap();

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(written.sha256, hex::encode(Sha256::digest(&on_disk)));
        assert_eq!(written.bytes, on_disk.len());
        assert_eq!(written.format, ArtifactFormat::Json);
    }

    #[tokio::test]
    async fn test_write_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.csv");
        EvidenceWriter::new()
            .write_csv(&path, &[json!({"id": 1})], &[])
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "id\n1\n");
    }
}
