//! Model downloader with resumable `.partial` files and progress callbacks.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use narrator_core::types::ModelInfo;
use narrator_core::{Error, Result};

/// Download progress snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    pub model: &'static str,
    pub percent: f32,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub complete: bool,
}

/// Check if a model file exists under the given models directory.
pub fn model_exists(models_dir: &Path, model: &ModelInfo) -> bool {
    model_path(models_dir, model).is_file()
}

/// Get the path to a model file under the given models directory.
pub fn model_path(models_dir: &Path, model: &ModelInfo) -> PathBuf {
    models_dir.join(model.filename)
}

fn partial_path(models_dir: &Path, model: &ModelInfo) -> PathBuf {
    models_dir.join(format!("{}.partial", model.filename))
}

/// Download a model unless it is already present, resuming a previous
/// partial download with an HTTP range request.
pub async fn download_model(
    models_dir: &Path,
    model: &ModelInfo,
    on_progress: impl Fn(DownloadProgress),
) -> Result<PathBuf> {
    tokio::fs::create_dir_all(models_dir)
        .await
        .map_err(|e| Error::io(models_dir, e))?;

    let dest = model_path(models_dir, model);

    if model_exists(models_dir, model) {
        on_progress(DownloadProgress {
            model: model.name,
            percent: 100.0,
            bytes_done: model.expected_size,
            bytes_total: model.expected_size,
            complete: true,
        });
        return Ok(dest);
    }

    let partial = partial_path(models_dir, model);
    let existing_size = if partial.is_file() {
        tokio::fs::metadata(&partial)
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    } else {
        0
    };

    let client = reqwest::Client::new();
    let mut req = client.get(model.url);
    if existing_size > 0 {
        req = req.header("Range", format!("bytes={existing_size}-"));
    }

    let resp = req
        .send()
        .await
        .map_err(|e| Error::Download(format!("{}: request failed: {e}", model.name)))?;

    let resumed = resp.status() == reqwest::StatusCode::PARTIAL_CONTENT;
    if !resp.status().is_success() {
        return Err(Error::Download(format!(
            "{}: server returned {}",
            model.name,
            resp.status()
        )));
    }

    let total_size = if resumed {
        resp.headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .unwrap_or(model.expected_size)
    } else {
        resp.content_length().unwrap_or(model.expected_size)
    };

    // A full response to a range request restarts the file from zero.
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(resumed)
        .truncate(!resumed)
        .open(&partial)
        .await
        .map_err(|e| Error::io(&partial, e))?;

    let mut bytes_done = if resumed { existing_size } else { 0 };
    let mut stream = resp.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| Error::Download(format!("{}: stream error: {e}", model.name)))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| Error::io(&partial, e))?;

        bytes_done += chunk.len() as u64;
        on_progress(DownloadProgress {
            model: model.name,
            percent: (bytes_done as f32 / total_size.max(1) as f32 * 100.0).min(100.0),
            bytes_done,
            bytes_total: total_size,
            complete: false,
        });
    }

    file.flush().await.map_err(|e| Error::io(&partial, e))?;
    drop(file);

    tokio::fs::rename(&partial, &dest)
        .await
        .map_err(|e| Error::io(&dest, e))?;

    on_progress(DownloadProgress {
        model: model.name,
        percent: 100.0,
        bytes_done: total_size,
        bytes_total: total_size,
        complete: true,
    });

    Ok(dest)
}

/// `bytes 100-199/1000` → `1000`.
fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use narrator_core::types::KOKORO_VOICES;
    use std::sync::Mutex;

    #[test]
    fn content_range_total() {
        assert_eq!(parse_content_range_total("bytes 100-199/1000"), Some(1000));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
    }

    #[tokio::test]
    async fn existing_model_is_not_downloaded() {
        let dir = std::env::temp_dir().join(format!("narrator-models-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(model_path(&dir, &KOKORO_VOICES), b"voices").unwrap();
        assert!(model_exists(&dir, &KOKORO_VOICES));

        let seen = Mutex::new(Vec::new());
        let path = download_model(&dir, &KOKORO_VOICES, |p| seen.lock().unwrap().push(p))
            .await
            .unwrap();

        assert_eq!(path, dir.join(KOKORO_VOICES.filename));
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].complete);
    }
}
