// src/integrity/manifest.rs

//! Append-then-finalize manifest writer.
//!
//! Records go through a bounded channel to one writer task that appends
//! each as a JSON line to `<dir>/<name>.partial.jsonl` and flushes it.
//! [`ManifestWriter::finalize`] drains the channel, compacts the partial
//! file into `<dir>/<name>.json`, removes the partial file and uploads the
//! document. If the process dies first, [`finalize_existing`] performs the
//! same compaction from a fresh process.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("manifest I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest record could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("corrupt manifest line {line} in {path}")]
    Corrupt { path: PathBuf, line: usize },

    #[error("no manifest named '{0}' to finalize")]
    Missing(String),

    #[error("manifest writer is closed")]
    Closed,

    #[error("manifest writer task failed: {0}")]
    Join(String),

    #[error("artifact upload failed: {0}")]
    Upload(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ManifestError + '_ {
    move |source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn partial_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.partial.jsonl"))
}

pub fn final_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

/// Destination for finalized manifests.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload the file at `path` under `name`; returns its location.
    async fn upload(&self, name: &str, path: &Path) -> Result<String, ManifestError>;
}

/// Copies artifacts into a local directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn upload(&self, name: &str, path: &Path) -> Result<String, ManifestError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(io_err(&self.root))?;
        let dest = self.root.join(name);
        fs::copy(path, &dest).await.map_err(io_err(path))?;
        info!(from = %path.display(), to = %dest.display(), "uploaded artifact");
        Ok(format!("file://{}", dest.display()))
    }
}

/// Summary of a completed finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizedManifest {
    pub path: PathBuf,
    pub count: usize,
    pub location: String,
}

#[derive(Debug)]
enum WriterMsg {
    Record(Value),
    Finish(oneshot::Sender<usize>),
}

/// Cloneable sender side of a [`ManifestWriter`].
#[derive(Debug, Clone)]
pub struct ManifestHandle {
    tx: mpsc::Sender<WriterMsg>,
}

impl ManifestHandle {
    /// Queue `record` for appending. Waits only when the channel is full.
    pub async fn append(&self, record: Value) -> Result<(), ManifestError> {
        self.tx
            .send(WriterMsg::Record(record))
            .await
            .map_err(|_| ManifestError::Closed)
    }
}

pub struct ManifestWriter {
    dir: PathBuf,
    name: String,
    store: Arc<dyn ArtifactStore>,
    tx: mpsc::Sender<WriterMsg>,
    task: JoinHandle<Result<usize, ManifestError>>,
}

/// Make sure the next append starts on a fresh line.
///
/// An unterminated last line is either a complete record that lost only its
/// newline, which is kept, or a fragment torn by a crash, which is cut off.
async fn repair_torn_tail(path: &Path, file: &mut File) -> Result<(), ManifestError> {
    let bytes = fs::read(path).await.map_err(io_err(path))?;
    if bytes.is_empty() || bytes.ends_with(b"\n") {
        return Ok(());
    }

    let keep = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |i| i + 1);
    let tail = &bytes[keep..];

    if matches!(serde_json::from_slice::<Value>(tail), Ok(Value::Object(_))) {
        debug!(path = %path.display(), "terminating last manifest record");
        file.write_all(b"\n").await.map_err(io_err(path))?;
    } else {
        warn!(
            path = %path.display(),
            dropped_bytes = tail.len(),
            fragment = %String::from_utf8_lossy(tail),
            "dropping torn manifest line before resuming"
        );
        file.set_len(keep as u64).await.map_err(io_err(path))?;
    }
    file.flush().await.map_err(io_err(path))?;
    Ok(())
}

impl ManifestWriter {
    /// Open (or continue) `<dir>/<name>.partial.jsonl` and spawn the writer.
    pub async fn start(
        dir: impl Into<PathBuf>,
        name: impl Into<String>,
        store: Arc<dyn ArtifactStore>,
        capacity: usize,
    ) -> Result<Self, ManifestError> {
        let dir = dir.into();
        let name = name.into();
        fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;

        let path = partial_path(&dir, &name);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err(&path))?;
        repair_torn_tail(&path, &mut file).await?;

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(writer_loop(path.clone(), file, rx));
        info!(path = %path.display(), "manifest writer started");

        Ok(Self {
            dir,
            name,
            store,
            tx,
            task,
        })
    }

    pub fn handle(&self) -> ManifestHandle {
        ManifestHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn partial_path(&self) -> PathBuf {
        partial_path(&self.dir, &self.name)
    }

    /// Drain, close, compact, delete the partial file and upload.
    pub async fn finalize(self) -> Result<FinalizedManifest, ManifestError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterMsg::Finish(ack_tx)).await.is_ok() {
            if let Ok(count) = ack_rx.await {
                debug!(count, "manifest writer drained");
            }
        }
        drop(self.tx);

        match self.task.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(join) => return Err(ManifestError::Join(join.to_string())),
        }

        finalize_existing(&self.dir, &self.name, self.store.as_ref()).await
    }
}

async fn writer_loop(
    path: PathBuf,
    mut file: File,
    mut rx: mpsc::Receiver<WriterMsg>,
) -> Result<usize, ManifestError> {
    let mut count = 0usize;
    let mut finish: Option<oneshot::Sender<usize>> = None;

    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Record(record) => {
                append_line(&path, &mut file, &record).await?;
                count += 1;
            }
            WriterMsg::Finish(ack) => {
                // Stop accepting new records but keep draining what is queued.
                rx.close();
                match finish {
                    None => finish = Some(ack),
                    Some(_) => drop(ack),
                }
            }
        }
    }

    file.sync_all().await.map_err(io_err(&path))?;
    drop(file);
    if let Some(ack) = finish {
        let _ = ack.send(count);
    }
    debug!(path = %path.display(), count, "manifest writer closed");
    Ok(count)
}

async fn append_line(path: &Path, file: &mut File, record: &Value) -> Result<(), ManifestError> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    file.write_all(line.as_bytes()).await.map_err(io_err(path))?;
    file.flush().await.map_err(io_err(path))?;
    Ok(())
}

/// Compact a partial file left on disk into the final document and upload.
///
/// Safe to re-run: a missing partial file next to an existing final
/// document means a previous run got as far as the rename, so only the
/// upload is repeated.
pub async fn finalize_existing(
    dir: &Path,
    name: &str,
    store: &dyn ArtifactStore,
) -> Result<FinalizedManifest, ManifestError> {
    let partial = partial_path(dir, name);
    let target = final_path(dir, name);

    let count = match fs::read_to_string(&partial).await {
        Ok(text) => {
            let records = parse_partial(&partial, &text)?;
            let count = records.len();
            let doc = json!({
                "name": name,
                "count": count,
                "records": records,
            });
            let tmp = dir.join(format!("{name}.json.tmp"));
            fs::write(&tmp, serde_json::to_vec_pretty(&doc)?)
                .await
                .map_err(io_err(&tmp))?;
            fs::rename(&tmp, &target).await.map_err(io_err(&target))?;
            fs::remove_file(&partial).await.map_err(io_err(&partial))?;
            info!(path = %target.display(), count, "manifest compacted");
            count
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let text = match fs::read_to_string(&target).await {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ManifestError::Missing(name.to_string()));
                }
                Err(e) => return Err(io_err(&target)(e)),
            };
            let doc: Value = serde_json::from_str(&text)?;
            doc.get("count").and_then(Value::as_u64).unwrap_or(0) as usize
        }
        Err(e) => return Err(io_err(&partial)(e)),
    };

    let location = store.upload(&format!("{name}.json"), &target).await?;
    Ok(FinalizedManifest {
        path: target,
        count,
        location,
    })
}

fn parse_partial(path: &Path, text: &str) -> Result<Vec<Value>, ManifestError> {
    let lines: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .collect();
    let last = lines.len().saturating_sub(1);

    let mut records = Vec::with_capacity(lines.len());
    for (i, (lineno, line)) in lines.iter().enumerate() {
        match serde_json::from_str::<Value>(line) {
            Ok(v) => records.push(v),
            Err(_) if i == last => {
                warn!(path = %path.display(), line = lineno + 1, "skipping torn trailing manifest line");
            }
            Err(_) => {
                return Err(ManifestError::Corrupt {
                    path: path.to_path_buf(),
                    line: lineno + 1,
                });
            }
        }
    }
    Ok(records)
}
