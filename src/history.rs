//! Aligns three divergent views of layer identity — the tarball's internal
//! directory IDs, the runtime's content-addressable digests, and the build
//! history (which includes zero-size, filesystem-less entries) — into one
//! canonical, history-indexed view.

use std::collections::HashMap;

use snafu::ensure;

use crate::error;
use crate::models::{HistoryEntry, LayerFiles};

/// Rekeys `layer_files` from internal tar IDs to runtime digests and
/// produces history-aligned `(layers, cmds)` arrays, per spec §4.5.
///
/// A length mismatch between `meta_layers` and `tar_layer_ids` is a
/// `Package` error: the positional rekey is meaningless once the two lists
/// disagree on count.
pub fn reconcile(
    meta_layers: &[String],
    tar_layer_ids: &[String],
    history: &[HistoryEntry],
    layer_files: &mut HashMap<String, LayerFiles>,
) -> crate::Result<(Vec<String>, Vec<String>)> {
    ensure!(
        meta_layers.len() == tar_layer_ids.len(),
        error::LayerCountMismatchSnafu {
            meta_len: meta_layers.len(),
            tar_len: tar_layer_ids.len(),
        }
    );

    for (tar_id, digest) in tar_layer_ids.iter().zip(meta_layers.iter()) {
        if let Some(files) = layer_files.remove(tar_id) {
            layer_files.insert(digest.clone(), files);
        }
    }

    let mut layers_out = Vec::with_capacity(history.len());
    let mut cmds_out = Vec::with_capacity(history.len());
    let mut ml = 0usize;

    for entry in history {
        cmds_out.push(entry.cmd.clone());
        if entry.size == 0 {
            layers_out.push(String::new());
            continue;
        }

        // Skip any runtime layer whose files resolved to a zero-size entry
        // or that never resolved at all — it carries no filesystem diff.
        while ml < meta_layers.len() {
            match layer_files.get(&meta_layers[ml]) {
                Some(files) if files.size == 0 => {
                    layer_files.remove(&meta_layers[ml]);
                    ml += 1;
                }
                None => ml += 1,
                Some(_) => break,
            }
        }

        if ml < meta_layers.len() {
            layers_out.push(meta_layers[ml].clone());
            ml += 1;
        } else {
            layers_out.push(String::new());
        }
    }

    Ok((layers_out, cmds_out))
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(cmd: &str, size: u64) -> HistoryEntry {
        HistoryEntry {
            cmd: cmd.to_string(),
            size,
        }
    }

    fn files(size: u64) -> LayerFiles {
        LayerFiles {
            size,
            pkgs: HashMap::new(),
            apps: HashMap::new(),
        }
    }

    #[test]
    fn two_layer_image_aligns_directly() {
        let meta_layers = vec!["sha256:A".to_string(), "sha256:B".to_string()];
        let tar_layer_ids = vec!["tar1".to_string(), "tar2".to_string()];
        let history = vec![entry("FROM base", 100), entry("RUN x", 50)];
        let mut layer_files = HashMap::from([
            ("tar1".to_string(), files(100)),
            ("tar2".to_string(), files(50)),
        ]);

        let (layers, cmds) =
            reconcile(&meta_layers, &tar_layer_ids, &history, &mut layer_files).unwrap();

        assert_eq!(layers, vec!["sha256:A", "sha256:B"]);
        assert_eq!(cmds, vec!["FROM base", "RUN x"]);
        assert!(layer_files.contains_key("sha256:A"));
        assert!(layer_files.contains_key("sha256:B"));
        assert!(!layer_files.contains_key("tar1"));
    }

    #[test]
    fn empty_history_entry_maps_to_empty_string() {
        let meta_layers = vec!["sha256:A".to_string(), "sha256:B".to_string()];
        let tar_layer_ids = vec!["tar1".to_string(), "tar2".to_string()];
        let history = vec![entry("", 100), entry("ENV k=v", 0), entry("", 200)];
        let mut layer_files = HashMap::from([
            ("tar1".to_string(), files(100)),
            ("tar2".to_string(), files(200)),
        ]);

        let (layers, _) =
            reconcile(&meta_layers, &tar_layer_ids, &history, &mut layer_files).unwrap();

        assert_eq!(layers, vec!["sha256:A", "", "sha256:B"]);
    }

    #[test]
    fn zero_sized_runtime_layer_is_skipped() {
        let meta_layers = vec![
            "sha256:A".to_string(),
            "sha256:Zero".to_string(),
            "sha256:B".to_string(),
        ];
        let tar_layer_ids = vec!["tar1".to_string(), "tar2".to_string(), "tar3".to_string()];
        let history = vec![entry("", 100), entry("", 50)];
        let mut layer_files = HashMap::from([
            ("tar1".to_string(), files(100)),
            ("tar2".to_string(), files(0)),
            ("tar3".to_string(), files(50)),
        ]);

        let (layers, _) =
            reconcile(&meta_layers, &tar_layer_ids, &history, &mut layer_files).unwrap();

        assert_eq!(layers, vec!["sha256:A", "sha256:B"]);
        assert!(!layer_files.contains_key("sha256:Zero"));
    }

    #[test]
    fn length_mismatch_is_a_package_error() {
        let meta_layers = vec!["sha256:A".to_string()];
        let tar_layer_ids = vec!["tar1".to_string(), "tar2".to_string()];
        let history = vec![entry("", 100)];
        let mut layer_files = HashMap::new();

        let result = reconcile(&meta_layers, &tar_layer_ids, &history, &mut layer_files);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), error::ErrorKind::Package);
    }
}
