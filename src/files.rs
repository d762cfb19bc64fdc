//! Upload validation and storage.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::FileConfig;
use crate::error::{Error, Result};

const DANGEROUS_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "bat", "cmd", "com", "msi", "scr", "sh", "bash", "ps1", "vbs", "php",
    "phtml", "jsp", "asp", "aspx", "js", "py", "pl", "rb", "jar", "html", "htm", "svg",
];

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "csv", "json"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedFile {
    pub original_name: String,
    pub sanitized_name: String,
    pub extension: String,
    pub size: usize,
}

impl ValidatedFile {
    pub fn is_text(&self) -> bool {
        TEXT_EXTENSIONS.contains(&self.extension.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFile {
    pub id: String,
    pub original_name: String,
    pub stored_name: String,
    pub path: PathBuf,
    pub extension: String,
    pub size: usize,
    pub sha256: String,
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = sanitized.trim_start_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, Clone)]
pub struct FileValidator {
    max_size: usize,
    allowed: Vec<String>,
}

impl FileValidator {
    pub fn new(config: &FileConfig) -> Self {
        Self {
            max_size: config.max_file_size,
            allowed: config.allowed_extensions.iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    pub fn validate(&self, filename: &str, bytes: &[u8]) -> Result<ValidatedFile> {
        let name = filename.trim();
        if name.is_empty() {
            return Err(Error::RejectedFile("missing file name".to_string()));
        }
        if name.contains("..") || name.contains('/') || name.contains('\\') || name.contains('\0') {
            return Err(Error::RejectedFile(format!("illegal file name: {}", name)));
        }
        if bytes.is_empty() {
            return Err(Error::RejectedFile("file is empty".to_string()));
        }
        if bytes.len() > self.max_size {
            return Err(Error::RejectedFile(format!(
                "file is {} bytes, limit is {}",
                bytes.len(),
                self.max_size
            )));
        }

        let lower = name.to_lowercase();
        let mut parts = lower.split('.');
        parts.next();
        let extensions: Vec<&str> = parts.collect();
        if let Some(bad) = extensions.iter().find(|e| DANGEROUS_EXTENSIONS.contains(*e)) {
            return Err(Error::RejectedFile(format!("dangerous extension .{}", bad)));
        }
        let extension = extensions
            .last()
            .copied()
            .ok_or_else(|| Error::RejectedFile("file has no extension".to_string()))?;
        if !self.allowed.iter().any(|a| a == extension) {
            return Err(Error::RejectedFile(format!("extension .{} is not allowed", extension)));
        }

        check_content(extension, bytes)?;

        Ok(ValidatedFile {
            original_name: name.to_string(),
            sanitized_name: sanitize_filename(name),
            extension: extension.to_string(),
            size: bytes.len(),
        })
    }
}

fn check_content(extension: &str, bytes: &[u8]) -> Result<()> {
    match extension {
        "pdf" if !bytes.starts_with(b"%PDF") => {
            Err(Error::RejectedFile("content is not a PDF".to_string()))
        }
        "docx" | "xlsx" if !bytes.starts_with(b"PK\x03\x04") => {
            Err(Error::RejectedFile(format!("content is not a .{} archive", extension)))
        }
        ext if TEXT_EXTENSIONS.contains(&ext) => {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| Error::RejectedFile("text file is not valid UTF-8".to_string()))?;
            if text.contains('\0') {
                return Err(Error::RejectedFile("text file contains NUL bytes".to_string()));
            }
            if ext == "json" {
                serde_json::from_str::<serde_json::Value>(text)
                    .map_err(|e| Error::RejectedFile(format!("invalid JSON: {}", e)))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Writes validated uploads as `{uuid}_{sanitized}` under the upload dir.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn store(&self, file: &ValidatedFile, bytes: &[u8]) -> Result<StoredFile> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let id = Uuid::new_v4().to_string();
        let stored_name = format!("{}_{}", id, file.sanitized_name);
        let path = self.dir.join(&stored_name);

        if let Err(e) = tokio::fs::write(&path, bytes).await {
            warn!(path = %path.display(), "failed to write upload: {}", e);
            return Err(e.into());
        }

        let stored = StoredFile {
            id,
            original_name: file.original_name.clone(),
            stored_name,
            path,
            extension: file.extension.clone(),
            size: bytes.len(),
            sha256: sha256_hex(bytes),
        };
        info!(file = %stored.stored_name, size = stored.size, "upload stored");
        Ok(stored)
    }
}
