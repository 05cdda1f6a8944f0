use nanoid::nanoid;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs as async_fs;
use tracing::info;

use crate::agent::AgentError;

/// One recorded moment of the page: what it looked like and its DOM.
#[derive(Clone, Debug)]
pub struct TraceFrame {
    pub label: String,
    pub url: Option<String>,
    pub png: Vec<u8>,
    pub dom: Option<String>,
    pub captured_at_ms: u128,
}

impl TraceFrame {
    pub fn new(label: impl Into<String>, url: Option<String>, png: Vec<u8>, dom: Option<String>) -> Self {
        Self {
            label: label.into(),
            url,
            png,
            dom,
            captured_at_ms: now_ms(),
        }
    }
}

#[derive(Serialize)]
struct Manifest<'a> {
    run_id: &'a str,
    frames: Vec<FrameEntry<'a>>,
}

#[derive(Serialize)]
struct FrameEntry<'a> {
    index: usize,
    label: &'a str,
    url: Option<&'a str>,
    captured_at_ms: u128,
    screenshot: String,
    dom: Option<String>,
}

/// Buffers frames in memory while tracing and writes them out as a bundle on stop.
///
/// The recorder never captures on its own: primitives only [`mark`](Self::mark) what
/// happened, and the next screenshot taken for the run becomes that step's frame.
#[derive(Debug)]
pub struct TraceRecorder {
    run_id: String,
    frames: Vec<TraceFrame>,
    pending: Option<String>,
}

impl TraceRecorder {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self { run_id: run_id.into(), frames: Vec::new(), pending: None }
    }

    /// Labels the next frame. A later mark before any frame replaces this one.
    pub fn mark(&mut self, label: impl Into<String>) {
        self.pending = Some(label.into());
    }

    /// Label for a frame being pushed now; `"screenshot"` when nothing was marked.
    pub fn take_label(&mut self) -> String {
        self.pending.take().unwrap_or_else(|| "screenshot".to_string())
    }

    pub fn push(&mut self, frame: TraceFrame) {
        self.frames.push(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Writes the bundle next to `path` and renames it into place, replacing any previous bundle.
    /// Readers see either the old bundle, the new one, or nothing.
    pub async fn write(self, path: &Path) -> Result<PathBuf, AgentError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| AgentError::Trace(format!("invalid trace path {}", path.display())))?;
        let staging = path.with_file_name(format!(".{}.tmp-{}", name, nanoid!(8)));

        if let Err(e) = self.write_into(&staging).await {
            let _ = async_fs::remove_dir_all(&staging).await;
            return Err(e);
        }

        if let Ok(meta) = async_fs::metadata(path).await {
            let removed = if meta.is_dir() {
                async_fs::remove_dir_all(path).await
            } else {
                async_fs::remove_file(path).await
            };
            if let Err(e) = removed {
                let _ = async_fs::remove_dir_all(&staging).await;
                return Err(AgentError::Trace(format!("remove old bundle: {}", e)));
            }
        }
        if let Err(e) = async_fs::rename(&staging, path).await {
            let _ = async_fs::remove_dir_all(&staging).await;
            return Err(AgentError::Trace(format!("rename: {}", e)));
        }
        info!(path = %path.display(), frames = self.frames.len(), "trace bundle saved");
        Ok(path.to_path_buf())
    }

    async fn write_into(&self, dir: &Path) -> Result<(), AgentError> {
        async_fs::create_dir_all(dir)
            .await
            .map_err(|e| AgentError::Trace(format!("create_dir: {}", e)))?;

        let mut entries = Vec::with_capacity(self.frames.len());
        for (i, frame) in self.frames.iter().enumerate() {
            let screenshot = format!("frame_{:03}.png", i);
            async_fs::write(dir.join(&screenshot), &frame.png)
                .await
                .map_err(|e| AgentError::Trace(format!("write: {}", e)))?;
            let dom = match &frame.dom {
                Some(html) => {
                    let name = format!("frame_{:03}.html", i);
                    async_fs::write(dir.join(&name), html)
                        .await
                        .map_err(|e| AgentError::Trace(format!("write: {}", e)))?;
                    Some(name)
                }
                None => None,
            };
            entries.push(FrameEntry {
                index: i,
                label: &frame.label,
                url: frame.url.as_deref(),
                captured_at_ms: frame.captured_at_ms,
                screenshot,
                dom,
            });
        }

        let manifest = Manifest { run_id: &self.run_id, frames: entries };
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| AgentError::Trace(format!("manifest: {}", e)))?;
        async_fs::write(dir.join("trace.json"), json)
            .await
            .map_err(|e| AgentError::Trace(format!("write: {}", e)))?;
        Ok(())
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(label: &str) -> TraceFrame {
        TraceFrame::new(label, Some("https://example.com/".into()), vec![1, 2, 3], Some("<html></html>".into()))
    }

    #[test]
    fn marks_label_the_next_frame_only() {
        let mut rec = TraceRecorder::new("r");
        rec.mark("navigate https://www.bing.com");
        rec.mark("click 10,20");
        assert_eq!(rec.take_label(), "click 10,20");
        assert_eq!(rec.take_label(), "screenshot");
        assert!(rec.is_empty());
    }

    #[tokio::test]
    async fn writes_manifest_and_frames() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("trace");
        let mut rec = TraceRecorder::new("run-1");
        rec.push(frame("navigate"));
        rec.push(TraceFrame::new("click", None, vec![9], None));
        assert_eq!(rec.len(), 2);

        let out = rec.write(&target).await.unwrap();
        assert_eq!(out, target);
        assert_eq!(std::fs::read(target.join("frame_000.png")).unwrap(), vec![1, 2, 3]);
        assert!(target.join("frame_000.html").exists());
        assert!(!target.join("frame_001.html").exists());

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(target.join("trace.json")).unwrap()).unwrap();
        assert_eq!(manifest["run_id"], "run-1");
        assert_eq!(manifest["frames"][1]["label"], "click");
        assert_eq!(manifest["frames"][0]["dom"], "frame_000.html");
    }

    #[tokio::test]
    async fn replaces_previous_bundle_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("trace");
        let mut first = TraceRecorder::new("a");
        first.push(frame("one"));
        first.push(frame("two"));
        first.write(&target).await.unwrap();

        let mut second = TraceRecorder::new("b");
        second.push(frame("only"));
        second.write(&target).await.unwrap();

        assert!(!target.join("frame_001.png").exists());
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["trace"]);
    }

    #[tokio::test]
    async fn failed_write_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        // parent is a regular file, so staging cannot be created
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let target = blocker.join("trace");

        let mut rec = TraceRecorder::new("c");
        rec.push(frame("x"));
        let err = rec.write(&target).await.unwrap_err();
        assert!(matches!(err, AgentError::Trace(_)));
        assert!(!target.exists());
    }
}
