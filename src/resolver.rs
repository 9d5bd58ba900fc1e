//! Parses an image tarball's `manifest.json` and per-layer sidecar JSON into
//! a single bottom-up view of layer identity, environment and command
//! history, plus the on-disk location of each layer's extracted `layer.tar`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use snafu::{ensure, OptionExt, ResultExt};
use tokio::fs::File;

use crate::archive;
use crate::error;
use crate::models::{LayerManifest, LayerMetadata};

/// The resolved, bottom-up view of an image tarball's manifest.
#[derive(Debug, Clone, Default)]
pub struct ResolvedManifest {
    /// Internal per-layer directory IDs, oldest first.
    pub layer_ids: Vec<String>,
    /// Space-joined `config.cmd` per layer, same order as `layer_ids`.
    pub cmds: Vec<String>,
    /// Accumulated `config.env` entries across every layer.
    pub envs: Vec<String>,
    /// Merged `config.labels` across every layer.
    pub labels: HashMap<String, String>,
    /// Internal per-layer directory id (same keys as `layer_ids`) to its
    /// extracted `layer.tar` on disk.
    pub layer_tar_paths: HashMap<String, PathBuf>,
}

fn is_manifest_or_sidecar(name: &str) -> bool {
    name == "manifest.json" || name.ends_with("/json")
}

/// Resolves `manifest.json` and its layer sidecars out of `tar_path`,
/// opening the tarball twice: once to pull `manifest.json` and every sidecar
/// JSON into memory, once to extract the declared `layer.tar` entries to
/// `dest_dir`.
pub async fn resolve_manifest(tar_path: &Path, dest_dir: &Path) -> crate::Result<ResolvedManifest> {
    let first_pass = File::open(tar_path).await.context(error::FileSystemSnafu)?;
    let memory = archive::extract_to_memory(first_pass, is_manifest_or_sidecar, u64::MAX).await?;

    let manifest_bytes = memory
        .get("manifest.json")
        .context(error::ManifestMissingSnafu)?;
    let manifests: Vec<LayerManifest> =
        serde_json::from_slice(manifest_bytes).context(error::ManifestParseSnafu)?;
    let manifest = manifests.first().context(error::ManifestMissingSnafu)?;
    ensure!(!manifest.layers.is_empty(), error::ManifestMissingSnafu);

    let layers_set: std::collections::HashSet<&str> =
        manifest.layers.iter().map(String::as_str).collect();
    let second_pass = File::open(tar_path).await.context(error::FileSystemSnafu)?;
    let extracted =
        archive::extract_to_disk(second_pass, |name| layers_set.contains(name), dest_dir).await?;

    let mut layer_ids = Vec::with_capacity(manifest.layers.len());
    let mut cmds = Vec::with_capacity(manifest.layers.len());
    let mut envs = Vec::new();
    let mut labels = HashMap::new();
    let mut layer_tar_paths = HashMap::with_capacity(manifest.layers.len());

    for layer_path in manifest.layers.iter() {
        let id = layer_path
            .strip_suffix("/layer.tar")
            .unwrap_or(layer_path.as_str())
            .to_string();
        let sidecar_path = layer_path.replace("layer.tar", "json");
        let sidecar_bytes = memory
            .get(&sidecar_path)
            .context(error::ManifestMissingSnafu)?;
        let metadata: LayerMetadata =
            serde_json::from_slice(sidecar_bytes).context(error::LayerMetadataParseSnafu)?;

        // `extracted` is keyed by the full in-tar path (e.g. "layer1/layer.tar");
        // every other output here is keyed by the stripped directory id, so
        // rekey on the way out rather than forcing callers to reconstruct the
        // "<id>/layer.tar" path themselves.
        if let Some(on_disk) = extracted.get(layer_path) {
            layer_tar_paths.insert(id.clone(), on_disk.clone());
        }

        layer_ids.push(id);
        cmds.push(metadata.config.cmd.join(" "));
        envs.extend(metadata.config.env);
        labels.extend(metadata.config.labels);
    }

    // manifest.json lists layers top-down; downstream code wants bottom-up.
    layer_ids.reverse();
    cmds.reverse();

    Ok(ResolvedManifest {
        layer_ids,
        cmds,
        envs,
        labels,
        layer_tar_paths,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{LayerMetadataConfig, LayerMetadataBuilder};
    use tokio_tar::{Builder as TarBuilder, Header};

    async fn build_image_tar() -> Vec<u8> {
        let manifest = serde_json::json!([{
            "Config": "config.json",
            "RepoTags": ["example:latest"],
            "Layers": ["layer1/layer.tar", "layer2/layer.tar"],
        }]);
        let layer1_meta = LayerMetadataBuilder::default()
            .id("layer1")
            .config(LayerMetadataConfig {
                cmd: vec!["FROM base".to_string()],
                env: vec!["A=1".to_string()],
                labels: HashMap::new(),
            })
            .build()
            .unwrap();
        let layer2_meta = LayerMetadataBuilder::default()
            .id("layer2")
            .config(LayerMetadataConfig {
                cmd: vec!["RUN x".to_string()],
                env: vec![],
                labels: HashMap::new(),
            })
            .build()
            .unwrap();

        let mut builder = TarBuilder::new(Vec::new());
        let entries: Vec<(String, Vec<u8>)> = vec![
            (
                "manifest.json".to_string(),
                serde_json::to_vec(&manifest).unwrap(),
            ),
            (
                "layer1/json".to_string(),
                serde_json::to_vec(&layer1_meta).unwrap(),
            ),
            (
                "layer2/json".to_string(),
                serde_json::to_vec(&layer2_meta).unwrap(),
            ),
            ("layer1/layer.tar".to_string(), b"layer-one-bytes".to_vec()),
            ("layer2/layer.tar".to_string(), b"layer-two-bytes".to_vec()),
        ];
        for (name, contents) in entries {
            let mut header = Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_slice())
                .await
                .unwrap();
        }
        builder.into_inner().await.unwrap()
    }

    #[tokio::test]
    async fn resolves_manifest_into_bottom_up_order() {
        let tar_bytes = build_image_tar().await;
        let src_dir = tempfile::tempdir().unwrap();
        let tar_path = src_dir.path().join("image.tar");
        tokio::fs::write(&tar_path, tar_bytes).await.unwrap();
        let dest_dir = tempfile::tempdir().unwrap();

        let resolved = resolve_manifest(&tar_path, dest_dir.path()).await.unwrap();

        assert_eq!(resolved.layer_ids, vec!["layer2", "layer1"]);
        assert_eq!(resolved.cmds, vec!["RUN x", "FROM base"]);
        assert_eq!(resolved.envs, vec!["A=1".to_string()]);
        assert!(resolved.layer_tar_paths.contains_key("layer1"));
        assert!(resolved.layer_tar_paths.contains_key("layer2"));
    }
}
