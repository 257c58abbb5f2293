use anyhow::Context;
use memoria_core::NewDocument;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One line of a `.jsonl` ingest file. `source_type` falls back to the
/// `--source-type` flag.
#[derive(Debug, Deserialize)]
struct JsonlDocument {
    #[serde(default)]
    source_type: Option<String>,
    text: String,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

/// Read every input file into submissions, in argument order.
///
/// `.jsonl` files hold one document per line; anything else is a single
/// plain-text document tagged with its path.
pub async fn load_documents(paths: &[PathBuf], source_type: &str) -> anyhow::Result<Vec<NewDocument>> {
    let mut docs = Vec::new();
    for path in paths {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read '{}'", path.display()))?;
        if is_jsonl(path) {
            docs.extend(parse_jsonl(&content, source_type).with_context(|| {
                format!("Invalid JSONL in '{}'", path.display())
            })?);
        } else {
            docs.push(text_document(&content, source_type, path));
        }
    }
    Ok(docs)
}

fn is_jsonl(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl"))
}

/// Parse JSONL content, skipping blank lines.
pub fn parse_jsonl(content: &str, default_source_type: &str) -> anyhow::Result<Vec<NewDocument>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            let doc: JsonlDocument = serde_json::from_str(line)
                .with_context(|| format!("line {}", n + 1))?;
            Ok(NewDocument {
                source_type: doc
                    .source_type
                    .unwrap_or_else(|| default_source_type.to_string()),
                text: doc.text,
                metadata: doc.metadata,
            })
        })
        .collect()
}

/// A whole file as one document.
pub fn text_document(content: &str, source_type: &str, path: &Path) -> NewDocument {
    NewDocument::new(source_type, content).with_metadata(
        "path",
        serde_json::Value::String(path.display().to_string()),
    )
}
