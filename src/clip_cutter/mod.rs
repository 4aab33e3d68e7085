//! ClipCutter - tail extraction from recorded segments
//!
//! Cuts the last N seconds of a segment file into a standalone clip with
//! a stream-copy ffmpeg invocation (`-sseof`). The clip lands in a
//! working directory as a temporary artifact; the caller uploads it and
//! removes it afterwards.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use uuid::Uuid;

/// Cut the last `seconds` of `input` into a new file under `out_dir`.
///
/// The output is removed again if ffmpeg fails, so a failed cut leaves
/// nothing behind.
pub async fn cut_last_seconds(input: &Path, seconds: u64, out_dir: &Path) -> Result<PathBuf> {
    if !tokio::fs::try_exists(input).await.unwrap_or(false) {
        return Err(Error::NotFound(format!(
            "Clip source {} does not exist",
            input.display()
        )));
    }

    tokio::fs::create_dir_all(out_dir).await?;
    let output = out_dir.join(format!("clip_{}.mp4", Uuid::new_v4()));

    let status = Command::new("ffmpeg")
        .args([
            "-nostdin",
            "-hide_banner",
            "-loglevel",
            "error",
            "-sseof",
            &format!("-{}", seconds),
            "-i",
        ])
        .arg(input)
        .args(["-c", "copy", "-y"])
        .arg(&output)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| Error::Process(format!("ffmpeg spawn failed: {}", e)))?;

    if !status.success() {
        let _ = tokio::fs::remove_file(&output).await;
        return Err(Error::Process(format!(
            "clip cut exited with {:?}",
            status.code()
        )));
    }

    tracing::debug!(
        input = %input.display(),
        output = %output.display(),
        seconds,
        "Clip cut complete"
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_input_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = cut_last_seconds(&tmp.path().join("absent.mp4"), 30, tmp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_cut_leaves_no_output() {
        let tmp = tempfile::tempdir().unwrap();
        // Not a real media file, so a stream copy will fail
        let input = tmp.path().join("broken.mp4");
        tokio::fs::write(&input, b"not a video").await.unwrap();

        let result = cut_last_seconds(&input, 30, tmp.path()).await;

        if result.is_err() {
            let clips: Vec<_> = std::fs::read_dir(tmp.path())
                .unwrap()
                .filter(|e| {
                    e.as_ref()
                        .unwrap()
                        .file_name()
                        .to_string_lossy()
                        .starts_with("clip_")
                })
                .collect();
            assert!(clips.is_empty());
        }
    }
}
