//! Inline binary payloads written to the working directory.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::error::{RelayError, Result};

const DEFAULT_EXTENSION: &str = "png";
const MAX_NAME_ATTEMPTS: usize = 5;

/// Extension for a mime type, or the default when unknown.
pub fn extension_for_mime(mime_type: &str) -> &'static str {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "image/bmp" => "bmp",
        "image/tiff" => "tiff",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/mpeg" => "mp3",
        "application/pdf" => "pdf",
        _ => DEFAULT_EXTENSION,
    }
}

/// Writes payloads under a directory with collision-resistant names.
#[derive(Debug, Clone)]
pub struct MediaWriter {
    dir: PathBuf,
}

impl MediaWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist `data` and return its path relative to the directory.
    pub async fn write(&self, mime_type: &str, data: &[u8]) -> Result<PathBuf> {
        let extension = extension_for_mime(mime_type);
        tokio::fs::create_dir_all(&self.dir).await?;

        for _ in 0..MAX_NAME_ATTEMPTS {
            let name = format!(
                "img-{}-{}.{extension}",
                chrono::Utc::now().timestamp_millis(),
                &uuid::Uuid::new_v4().simple().to_string()[..8],
            );
            let path = self.dir.join(&name);
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            match file {
                Ok(mut file) => {
                    file.write_all(data).await?;
                    file.flush().await?;
                    tracing::debug!(path = %path.display(), bytes = data.len(), "Wrote inline payload");
                    return Ok(PathBuf::from(name));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(RelayError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "could not find a free file name for inline payload",
        )))
    }
}

/// Markdown image reference for a relative path.
pub fn markdown_image(relative: &Path) -> String {
    format!("![image]({})", relative.to_string_lossy().replace('\\', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_and_unknown_mime_types() {
        assert_eq!(extension_for_mime("image/jpeg"), "jpg");
        assert_eq!(extension_for_mime("IMAGE/WEBP; charset=binary"), "webp");
        assert_eq!(extension_for_mime("application/x-unknown"), "png");
    }

    #[tokio::test]
    async fn writes_unique_files_under_directory() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MediaWriter::new(dir.path());

        let first = writer.write("image/png", b"one").await.unwrap();
        let second = writer.write("image/png", b"two").await.unwrap();

        assert_ne!(first, second);
        assert!(first.is_relative());
        let name = first.to_string_lossy().to_string();
        assert!(name.starts_with("img-") && name.ends_with(".png"), "{name}");
        assert_eq!(std::fs::read(dir.path().join(&first)).unwrap(), b"one");
        assert_eq!(markdown_image(&first), format!("![image]({name})"));
    }
}
