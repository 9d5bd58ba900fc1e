//! The concurrent core: fetches each layer (local tar or registry blob),
//! extracts it into its own directory, and does so under a bounded
//! in-flight byte budget with retries — spec §4.3 and §5.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use snafu::{IntoError, ResultExt};
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use walkdir::WalkDir;

use crate::archive;
use crate::config::ThrottleConfig;
use crate::error;
use crate::layer::Reader;
use crate::models::DownloadResult;
use crate::registry::Registry;

pub type BoxAsyncRead = Pin<Box<dyn AsyncRead + Send>>;

/// Threads a cancellation signal and per-request timeout through every
/// blocking call a worker makes.
#[derive(Clone)]
pub struct Ctx {
    pub cancel: CancellationToken,
    pub read_timeout: Duration,
}

impl Ctx {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            read_timeout,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Abstracts over "open a pre-extracted local `layer.tar`" vs. "`GET` a
/// registry blob" — the one capability a worker needs to obtain a layer's
/// bytes.
#[async_trait]
pub trait LayerReader: Send + Sync {
    async fn read_layer(&self, ctx: &Ctx, layer_id: &str) -> crate::Result<(BoxAsyncRead, u64)>;
}

/// Reads layers from already-extracted `layer.tar` files on disk (produced
/// by the Manifest Resolver for a local image).
pub struct LocalLayerReader {
    pub layer_tar_paths: HashMap<String, PathBuf>,
}

#[async_trait]
impl LayerReader for LocalLayerReader {
    async fn read_layer(&self, _ctx: &Ctx, layer_id: &str) -> crate::Result<(BoxAsyncRead, u64)> {
        let missing = || {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no extracted layer.tar for {layer_id}"),
            )
        };
        let path = self
            .layer_tar_paths
            .get(layer_id)
            .cloned()
            .ok_or_else(|| error::FileSystemSnafu.into_error(missing()))?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .context(error::FileSystemSnafu)?;
        let file = tokio::fs::File::open(&path)
            .await
            .context(error::FileSystemSnafu)?;
        Ok((Box::pin(file), metadata.len()))
    }
}

/// Reads layers as blobs from a remote registry.
pub struct RemoteLayerReader {
    pub registry: Registry,
    pub repository: String,
}

#[async_trait]
impl LayerReader for RemoteLayerReader {
    async fn read_layer(&self, ctx: &Ctx, layer_id: &str) -> crate::Result<(BoxAsyncRead, u64)> {
        tokio::select! {
            _ = ctx.cancel.cancelled() => crate::error::CancelledSnafu.fail(),
            result = self.registry.fetch_blob(&self.repository, layer_id) => {
                let (stream, size) = result?;
                let reader = Reader::new(tokio_util::io::StreamReader::new(stream));
                Ok((Box::pin(reader), size))
            }
        }
    }
}

/// Downloads and extracts every unique, non-empty layer in `layers`, under
/// `budget`'s in-flight byte cap, per spec §4.3/§5.
pub async fn download_layers(
    ctx: &Ctx,
    layers: &[String],
    sizes: Option<&HashMap<String, u64>>,
    img_path: &Path,
    reader: Arc<dyn LayerReader>,
    budget: ThrottleConfig,
) -> crate::Result<HashMap<String, DownloadResult>> {
    let mut seen = std::collections::HashSet::new();
    let mut unique: Vec<String> = Vec::new();
    for layer in layers {
        if layer.is_empty() || !seen.insert(layer.clone()) {
            continue;
        }
        unique.push(layer.clone());
    }

    // Absent size information sorts as 0 but must NOT be mistaken for a
    // layer the caller has told us is empty — only an explicit 0 entry in
    // `sizes` means "known to carry no filesystem diff".
    let declared_size = |layer: &str| -> u64 {
        sizes.and_then(|s| s.get(layer)).copied().unwrap_or(0)
    };
    let known_empty = |layer: &str| -> bool { sizes.is_some_and(|s| s.get(layer) == Some(&0)) };
    unique.sort_by(|a, b| declared_size(b).cmp(&declared_size(a)));

    let total = unique.len();
    let (tx, mut rx) = mpsc::channel::<DownloadResult>(total.max(1));
    let accumulated = Arc::new(AtomicI64::new(0));
    let notify = Arc::new(Notify::new());

    for layer_id in unique {
        let size = declared_size(&layer_id) as i64;
        let empty = known_empty(&layer_id);

        accumulated.fetch_add(size, Ordering::SeqCst);

        let worker_ctx = ctx.clone();
        let worker_reader = reader.clone();
        let worker_img_path = img_path.to_path_buf();
        let worker_tx = tx.clone();
        let worker_accumulated = accumulated.clone();
        let worker_notify = notify.clone();
        let max_attempts = budget.max_attempts;

        tokio::spawn(async move {
            let result = run_worker(&worker_ctx, &worker_reader, &worker_img_path, &layer_id, size as u64, empty, max_attempts).await;
            worker_accumulated.fetch_sub(size, Ordering::SeqCst);
            worker_notify.notify_waiters();
            let _ = worker_tx.send(result).await;
        });

        // Admission: before scheduling the next layer, wait while in-flight
        // bytes exceed the budget. A bounded re-check interval backstops
        // missed wakeups rather than relying solely on Notify.
        while accumulated.load(Ordering::SeqCst) as u64 > budget.budget_bytes {
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            }
        }
    }
    drop(tx);

    let mut results = HashMap::with_capacity(total);
    let mut last_error: Option<String> = None;
    while let Some(result) = rx.recv().await {
        if let Some(error) = result.error.as_ref() {
            last_error = Some(error.clone());
        }
        results.insert(result.layer_id.clone(), result);
    }

    if let Some(error) = last_error {
        trace!(target: "acquire", "layer acquisition completed with at least one error: {error}");
    }

    Ok(results)
}

async fn run_worker(
    ctx: &Ctx,
    reader: &Arc<dyn LayerReader>,
    img_path: &Path,
    layer_id: &str,
    declared_size: u64,
    known_empty: bool,
    max_attempts: u32,
) -> DownloadResult {
    if known_empty {
        let dir = img_path.join(layer_id);
        if let Err(source) = tokio::fs::create_dir_all(&dir).await {
            return DownloadResult {
                layer_id: layer_id.to_string(),
                decompressed_size: 0,
                declared_tar_size: 0,
                error: Some(source.to_string()),
            };
        }
        return DownloadResult {
            layer_id: layer_id.to_string(),
            decompressed_size: 0,
            declared_tar_size: 0,
            error: None,
        };
    }

    let dir = img_path.join(layer_id);
    if dir.exists() {
        // Open Question (spec §9): a prior run's directory presence is
        // trusted as a completion marker rather than guarded by a sentinel
        // file. See DESIGN.md. `decompressed_size` still has to reflect the
        // layer's real on-disk size here, not 0 — callers key "empty layer"
        // off this value, and a previously-extracted non-empty layer must
        // not be mistaken for one just because this run skipped the fetch.
        return DownloadResult {
            layer_id: layer_id.to_string(),
            decompressed_size: directory_size(&dir),
            declared_tar_size: declared_size,
            error: None,
        };
    }

    let mut last_error = None;
    for attempt in 0..max_attempts {
        if ctx.cancelled() {
            return DownloadResult {
                layer_id: layer_id.to_string(),
                decompressed_size: 0,
                declared_tar_size: declared_size,
                error: Some("cancelled".to_string()),
            };
        }

        let fetch = tokio::time::timeout(ctx.read_timeout, reader.read_layer(ctx, layer_id)).await;
        let (stream, _size) = match fetch {
            Ok(Ok(pair)) => pair,
            Ok(Err(error)) => {
                last_error = Some(error.to_string());
                continue;
            }
            Err(_) => {
                last_error = Some("read timed out".to_string());
                continue;
            }
        };

        if let Err(source) = tokio::fs::create_dir_all(&dir).await {
            // Filesystem error creating the directory is not retried.
            return DownloadResult {
                layer_id: layer_id.to_string(),
                decompressed_size: 0,
                declared_tar_size: declared_size,
                error: Some(source.to_string()),
            };
        }

        match archive::extract_all(stream, &dir, None).await {
            Ok(decompressed_size) => {
                return DownloadResult {
                    layer_id: layer_id.to_string(),
                    decompressed_size,
                    declared_tar_size: declared_size,
                    error: None,
                };
            }
            Err(error) => {
                let _ = tokio::fs::remove_dir_all(&dir).await;
                last_error = Some(error.to_string());
                trace!(target: "acquire", "attempt {attempt} for layer {layer_id} failed: {last_error:?}");
            }
        }
    }

    DownloadResult {
        layer_id: layer_id.to_string(),
        decompressed_size: 0,
        declared_tar_size: declared_size,
        error: last_error,
    }
}

/// Sums the on-disk size of every regular file under `dir`. Used only for
/// the "already extracted" fast path, where no fresh extraction reports a
/// decompressed byte count.
fn directory_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct AlwaysFails;

    #[async_trait]
    impl LayerReader for AlwaysFails {
        async fn read_layer(&self, _ctx: &Ctx, _layer_id: &str) -> crate::Result<(BoxAsyncRead, u64)> {
            error::FetchBlobSnafu {
                digest: "sha256:dead".to_string(),
                reason: "connection reset".to_string(),
            }
            .fail()
        }
    }

    struct CountingTarReader {
        bytes: Vec<u8>,
        reads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LayerReader for CountingTarReader {
        async fn read_layer(&self, _ctx: &Ctx, _layer_id: &str) -> crate::Result<(BoxAsyncRead, u64)> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let cursor = std::io::Cursor::new(self.bytes.clone());
            Ok((Box::pin(cursor) as BoxAsyncRead, self.bytes.len() as u64))
        }
    }

    async fn fixture_tar() -> Vec<u8> {
        let mut builder = tokio_tar::Builder::new(Vec::new());
        let contents = b"hello".to_vec();
        let mut header = tokio_tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "file.txt", contents.as_slice())
            .await
            .unwrap();
        builder.into_inner().await.unwrap()
    }

    #[tokio::test]
    async fn known_empty_layer_creates_directory_without_reading() {
        let dest = tempfile::tempdir().unwrap();
        let ctx = Ctx::new(Duration::from_secs(5));
        let result = run_worker(&ctx, &Arc::new(AlwaysFails), dest.path(), "layer-zero", 0, true, 3).await;

        assert!(result.error.is_none());
        assert_eq!(result.decompressed_size, 0);
        assert!(dest.path().join("layer-zero").is_dir());
    }

    #[tokio::test]
    async fn existing_directory_is_treated_as_already_downloaded() {
        let dest = tempfile::tempdir().unwrap();
        let layer_dir = dest.path().join("layer-a");
        std::fs::create_dir_all(&layer_dir).unwrap();
        std::fs::write(layer_dir.join("file.txt"), vec![0u8; 42]).unwrap();
        let reads = Arc::new(AtomicUsize::new(0));
        let reader: Arc<dyn LayerReader> = Arc::new(CountingTarReader {
            bytes: fixture_tar().await,
            reads: reads.clone(),
        });
        let ctx = Ctx::new(Duration::from_secs(5));

        let result = run_worker(&ctx, &reader, dest.path(), "layer-a", 123, false, 3).await;

        assert!(result.error.is_none());
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        assert_eq!(result.decompressed_size, 42);
    }

    #[tokio::test]
    async fn retries_exhaust_and_report_the_last_error() {
        let dest = tempfile::tempdir().unwrap();
        let ctx = Ctx::new(Duration::from_secs(5));
        let result = run_worker(&ctx, &Arc::new(AlwaysFails), dest.path(), "layer-b", 10, false, 3).await;

        assert!(result.error.is_some());
        assert!(!dest.path().join("layer-b").exists());
    }

    #[tokio::test]
    async fn successful_fetch_extracts_into_its_own_directory() {
        let dest = tempfile::tempdir().unwrap();
        let reads = Arc::new(AtomicUsize::new(0));
        let reader: Arc<dyn LayerReader> = Arc::new(CountingTarReader {
            bytes: fixture_tar().await,
            reads,
        });
        let ctx = Ctx::new(Duration::from_secs(5));

        let result = run_worker(&ctx, &reader, dest.path(), "layer-c", 5, false, 3).await;

        assert!(result.error.is_none());
        assert!(dest.path().join("layer-c").join("file.txt").is_file());
    }

    #[tokio::test]
    async fn download_layers_dedupes_and_skips_empty_ids() {
        let dest = tempfile::tempdir().unwrap();
        let reader: Arc<dyn LayerReader> = Arc::new(CountingTarReader {
            bytes: fixture_tar().await,
            reads: Arc::new(AtomicUsize::new(0)),
        });
        let ctx = Ctx::new(Duration::from_secs(5));
        let layers = vec![
            "layer-x".to_string(),
            "layer-x".to_string(),
            String::new(),
            "layer-y".to_string(),
        ];

        let results = download_layers(
            &ctx,
            &layers,
            None,
            dest.path(),
            reader,
            ThrottleConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.contains_key("layer-x"));
        assert!(results.contains_key("layer-y"));
    }
}
