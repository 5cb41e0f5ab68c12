use anyhow::Result;
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;

static FILE_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-f]{64}\.[a-z0-9]{1,8}$").unwrap());

/// URI prefix under which stored files are served.
pub const URI_PREFIX: &str = "/uploads/";

/// A file accepted into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// `<sha256>.<ext>`
    pub id: String,
    pub uri: String,
    pub mime: String,
}

/// Content-addressed file store for attachments and avatars.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        fs::create_dir_all(root.as_ref()).await?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    /// Save file data and return its id and public URI. The extension comes
    /// from the sniffed content, then from the client supplied name.
    pub async fn save(&self, data: Bytes, file_name: Option<&str>) -> Result<StoredFile> {
        let (ext, mime) = detect_type(&data, file_name);
        let mut hasher = Sha256::new();
        hasher.update(&data);
        let hash = format!("{:x}", hasher.finalize());
        let id = format!("{}.{}", hash, ext);
        let dir = self.root.join(&hash[..2]);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(&id), data).await?;
        Ok(StoredFile {
            uri: format!("{}{}", URI_PREFIX, id),
            id,
            mime,
        })
    }

    /// On-disk path for a file id, or `None` when the id is not one this
    /// store could have produced.
    pub fn file_path(&self, id: &str) -> Option<PathBuf> {
        if !FILE_ID_RE.is_match(id) {
            return None;
        }
        Some(self.root.join(&id[..2]).join(id))
    }
}

fn detect_type(data: &[u8], file_name: Option<&str>) -> (String, String) {
    if let Some(kind) = infer::get(data) {
        return (kind.extension().to_string(), kind.mime_type().to_string());
    }
    let guessed_ext = file_name
        .and_then(|n| Path::new(n).extension())
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()));
    match guessed_ext {
        Some(ext) => {
            let mime = mime_guess::from_ext(&ext).first_or_octet_stream().to_string();
            (ext, mime)
        }
        None => ("bin".into(), "application/octet-stream".into()),
    }
}

/// Content type for a stored id, from its extension.
pub fn mime_for(id: &str) -> String {
    mime_guess::from_path(id).first_or_octet_stream().to_string()
}

pub fn is_image(data: &[u8]) -> bool {
    infer::is_image(data)
}
