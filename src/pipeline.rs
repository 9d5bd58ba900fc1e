//! The four operations exposed to the scan orchestrator: probe a local
//! image's metadata, fully materialize a local image, pull a remote image's
//! layers, and fetch Cosign signature payloads.
//!
//! Per-layer acquisition errors do not fail these calls outright — each
//! function's return type carries both whatever layer data it did manage to
//! produce and an optional aggregate error, mirroring the "report one error
//! while still returning the successful layers" contract of the acquirer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use snafu::{OptionExt, ResultExt};
use tokio::io::AsyncReadExt;

use crate::acquire::{self, Ctx, LayerReader, LocalLayerReader, RemoteLayerReader};
use crate::config::ThrottleConfig;
use crate::error;
use crate::harvest::{self, AppScanner, OsPackageReader};
use crate::history;
use crate::models::{DistributionManifest, ImageInfo, ImageMeta, LayerFiles, SignatureData};
use crate::registry::Registry;
use crate::resolver;
use crate::runtime;
use crate::uri::ImageRef;

/// Probes a local runtime for an image's metadata, without exporting it.
pub async fn get_local_image_meta(ctx: &Ctx, repo: &str, tag: &str) -> crate::Result<ImageMeta> {
    let image = ImageRef::local(repo, tag);
    let (local_runtime, repo, tag) = runtime::connect_for(&image)?;
    tokio::select! {
        _ = ctx.cancel.cancelled() => error::CancelledSnafu.fail(),
        result = local_runtime.image_meta(&repo, &tag) => result,
    }
}

/// The result of fully loading a locally resident image.
pub struct LoadedImage {
    pub info: ImageInfo,
    pub layer_files: HashMap<String, LayerFiles>,
    pub tar_layer_ids: Vec<String>,
    /// Set when one or more layers failed to acquire or harvest; the rest of
    /// the struct still reflects whatever layers did succeed.
    pub layer_error: Option<crate::Error>,
}

/// Fully materializes a locally resident image: exports it through the
/// runtime, resolves its manifest, acquires and extracts every layer,
/// harvests each extracted directory, then reconciles the result against the
/// runtime's digest list and build history.
///
/// Owns the scratch `imgPath/repo/` lifecycle — created fresh on entry,
/// holding the exported tarball and intermediate per-layer tars, and removed
/// before returning regardless of outcome.
#[allow(clippy::too_many_arguments)]
pub async fn load_local_image(
    ctx: &Ctx,
    repo: &str,
    tag: &str,
    img_path: &Path,
    budget: ThrottleConfig,
    max_file_size: u64,
    os_reader: &dyn OsPackageReader,
    app_scanner: Option<&dyn AppScanner>,
) -> crate::Result<LoadedImage> {
    let image = ImageRef::local(repo, tag);
    let (local_runtime, repo, tag) = runtime::connect_for(&image)?;

    let scratch = img_path.join("repo");
    tokio::fs::create_dir_all(&scratch)
        .await
        .context(error::FileSystemSnafu)?;

    let result = load_local_image_inner(
        ctx,
        &local_runtime,
        &repo,
        &tag,
        img_path,
        &scratch,
        budget,
        max_file_size,
        os_reader,
        app_scanner,
    )
    .await;

    let _ = tokio::fs::remove_dir_all(&scratch).await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn load_local_image_inner(
    ctx: &Ctx,
    local_runtime: &runtime::LocalRuntime,
    repo: &str,
    tag: &str,
    img_path: &Path,
    scratch: &Path,
    budget: ThrottleConfig,
    max_file_size: u64,
    os_reader: &dyn OsPackageReader,
    app_scanner: Option<&dyn AppScanner>,
) -> crate::Result<LoadedImage> {
    let meta = local_runtime.image_meta(repo, tag).await?;
    let history_entries = local_runtime.history(repo, tag).await?;

    let tar_path = scratch.join("image.tar");
    local_runtime.export_image(repo, tag, &tar_path).await?;

    let resolved = resolver::resolve_manifest(&tar_path, scratch).await?;

    let reader: Arc<dyn LayerReader> = Arc::new(LocalLayerReader {
        layer_tar_paths: resolved.layer_tar_paths.clone(),
    });
    let results =
        acquire::download_layers(ctx, &resolved.layer_ids, None, img_path, reader, budget)
            .await?;

    let (mut layer_files, layer_error) = harvest_results(&results, img_path, max_file_size, os_reader, app_scanner);

    let (layers_out, cmds_out) = history::reconcile(
        &meta.layers,
        &resolved.layer_ids,
        &history_entries,
        &mut layer_files,
    )?;

    Ok(LoadedImage {
        info: ImageInfo {
            id: meta.id,
            digest: meta.digest,
            layers: layers_out,
            cmds: cmds_out,
            envs: resolved.envs,
            labels: resolved.labels,
            repo_tags: meta.repo_tags,
        },
        layer_files,
        tar_layer_ids: resolved.layer_ids,
        layer_error,
    })
}

/// The result of downloading a remote image's layers directly (no local
/// manifest to resolve — the registry already names layers by their
/// content-addressable digest, so no tar-ID rekeying is needed).
pub struct DownloadedLayers {
    pub layer_files: HashMap<String, LayerFiles>,
    pub layer_error: Option<crate::Error>,
}

/// Downloads and harvests every layer of a remote image directly from the
/// registry, under the same throttled acquirer used for local images.
pub async fn download_remote_image(
    ctx: &Ctx,
    registry: Registry,
    repository: &str,
    img_path: &Path,
    layers: &[String],
    sizes: Option<&HashMap<String, u64>>,
    budget: ThrottleConfig,
    max_file_size: u64,
    os_reader: &dyn OsPackageReader,
    app_scanner: Option<&dyn AppScanner>,
) -> crate::Result<DownloadedLayers> {
    let reader: Arc<dyn LayerReader> = Arc::new(RemoteLayerReader {
        registry,
        repository: repository.to_string(),
    });
    let results = acquire::download_layers(ctx, layers, sizes, img_path, reader, budget).await?;

    let (layer_files, layer_error) =
        harvest_results(&results, img_path, max_file_size, os_reader, app_scanner);

    Ok(DownloadedLayers {
        layer_files,
        layer_error,
    })
}

/// Harvests every successfully acquired layer directory, skipping (and
/// recording) any that failed to download. Returns the harvested map plus
/// the last acquisition or harvest error encountered, if any.
fn harvest_results(
    results: &HashMap<String, crate::models::DownloadResult>,
    img_path: &Path,
    max_file_size: u64,
    os_reader: &dyn OsPackageReader,
    app_scanner: Option<&dyn AppScanner>,
) -> (HashMap<String, LayerFiles>, Option<crate::Error>) {
    let mut layer_files = HashMap::with_capacity(results.len());
    let mut layer_error = None;

    for (layer_id, result) in results {
        if let Some(reason) = &result.error {
            layer_error = Some(
                error::FetchBlobSnafu {
                    digest: layer_id.clone(),
                    reason: reason.clone(),
                }
                .build(),
            );
            continue;
        }

        let dir = img_path.join(layer_id);
        match harvest::harvest_layer(&dir, max_file_size, os_reader, app_scanner) {
            Ok(mut files) => {
                // `size` reflects the layer's decompressed tar size, not the
                // harvested package-byte total: history::reconcile treats
                // `size == 0` as "no filesystem diff," and a layer with a
                // real diff but no recognized package files must not be
                // mistaken for one.
                files.size = result.decompressed_size;
                layer_files.insert(layer_id.clone(), files);
            }
            Err(error) => layer_error = Some(error),
        }
    }

    (layer_files, layer_error)
}

/// Derives the conventional Cosign signature tag for an image digest:
/// `sha256:<hex>` becomes `sha256-<hex>.sig`.
fn signature_tag(digest: &str) -> crate::Result<String> {
    let (algorithm, value) = digest
        .split_once(':')
        .context(error::MalformedRefSnafu {
            reason: "digest is missing an algorithm prefix",
        })?;
    Ok(format!("{algorithm}-{value}.sig"))
}

/// Fetches a Cosign signature image's raw manifest and each of its layer
/// payloads (small JSON blobs), keyed by layer digest.
pub async fn get_signature_data_for_image(
    ctx: &Ctx,
    registry: &Registry,
    repo: &str,
    digest: &str,
) -> crate::Result<SignatureData> {
    let tag = signature_tag(digest)?;

    let manifest_json = tokio::select! {
        _ = ctx.cancel.cancelled() => return error::CancelledSnafu.fail(),
        result = registry.fetch_manifest_raw(repo, &tag) => result?,
    };
    let manifest: DistributionManifest =
        serde_json::from_str(&manifest_json).context(error::ImageManifestParseSnafu)?;

    let mut payloads = HashMap::with_capacity(manifest.layers.len());
    for layer in &manifest.layers {
        if ctx.cancel.is_cancelled() {
            return error::CancelledSnafu.fail();
        }
        let (stream, _size) = registry.fetch_blob(repo, &layer.digest).await?;
        let mut reader = tokio_util::io::StreamReader::new(stream);
        let mut payload = String::new();
        reader
            .read_to_string(&mut payload)
            .await
            .context(error::FileSystemSnafu)?;
        payloads.insert(layer.digest.clone(), payload);
    }

    Ok(SignatureData {
        manifest: manifest_json,
        payloads,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signature_tag_follows_cosign_convention() {
        let tag = signature_tag("sha256:abcdef0123").unwrap();
        assert_eq!(tag, "sha256-abcdef0123.sig");
    }

    #[test]
    fn signature_tag_rejects_digest_without_algorithm() {
        assert!(signature_tag("abcdef0123").is_err());
    }
}
