//! Walks an extracted layer directory and collects the payload files
//! downstream vulnerability analysis cares about: OS package databases,
//! application package manifests, content manifests, and build-info files.
//!
//! RPM/DPKG parsing and application-ecosystem scanning are external
//! collaborators (spec-level Non-goals) — this module defines the seam as a
//! trait and ships only a raw-bytes default.

use std::collections::HashMap;
use std::path::Path;

use snafu::ResultExt;
use walkdir::WalkDir;

use crate::error;
use crate::models::{AppPackage, LayerFiles};

const DPKG_STATUS_DIR_PREFIX: &str = "var/lib/dpkg/";
const CONTENT_MANIFEST_PREFIX: &str = "root/buildinfo/content_manifests/";
const DOCKERFILE_PREFIX: &str = "root/buildinfo/Dockerfile-";

/// Reads OS package database files selected by their well-known paths.
pub trait OsPackageReader: Send + Sync {
    /// The set of relative paths (from a layer root) this reader recognizes.
    fn known_paths(&self) -> &[&str];
    /// Reads an RPM database file into a normalized package listing.
    fn read_rpm(&self, path: &Path) -> crate::Result<Vec<u8>>;
    /// Reads a DPKG `status` file into a normalized package listing.
    fn read_dpkg_status(&self, path: &Path) -> crate::Result<Vec<u8>>;
}

/// Recognizes and parses application-ecosystem package manifests
/// (package-lock.json, requirements.txt, Gemfile.lock, and the like).
pub trait AppScanner: Send + Sync {
    fn is_app_pkg_file(&self, relpath: &str, fullpath: &Path) -> bool;
    fn scan(&self, relpath: &str, fullpath: &Path) -> crate::Result<Vec<AppPackage>>;
}

/// The well-known OS package database paths this crate recognizes out of the
/// box. Callers needing real RPM/DPKG parsing inject their own
/// [`OsPackageReader`]; this one hands back raw bytes.
pub struct DefaultOsPackageReader;

const KNOWN_PATHS: &[&str] = &[
    "var/lib/rpm/Packages",
    "var/lib/rpm/Packages.db",
    "var/lib/rpm/rpmdb.sqlite",
    "var/lib/dpkg/status",
    "lib/apk/db/installed",
];

impl OsPackageReader for DefaultOsPackageReader {
    fn known_paths(&self) -> &[&str] {
        KNOWN_PATHS
    }

    fn read_rpm(&self, path: &Path) -> crate::Result<Vec<u8>> {
        std::fs::read(path).context(error::FileSystemSnafu)
    }

    fn read_dpkg_status(&self, path: &Path) -> crate::Result<Vec<u8>> {
        std::fs::read(path).context(error::FileSystemSnafu)
    }
}

fn is_rpm_path(relpath: &str) -> bool {
    relpath == "var/lib/rpm/Packages"
        || relpath == "var/lib/rpm/Packages.db"
        || relpath == "var/lib/rpm/rpmdb.sqlite"
}

fn is_apk_path(relpath: &str) -> bool {
    relpath == "lib/apk/db/installed"
}

fn is_dpkg_status_path(relpath: &str) -> bool {
    relpath == "var/lib/dpkg/status"
}

fn is_content_manifest(relpath: &str) -> bool {
    relpath.starts_with(CONTENT_MANIFEST_PREFIX) && relpath.ends_with(".json")
}

fn is_build_info(relpath: &str) -> bool {
    relpath.starts_with(DOCKERFILE_PREFIX)
}

/// Walks `dir` and harvests the files this crate's selection predicate
/// matches, per spec §4.4. Per-file parse failures are swallowed (the file
/// is simply omitted); only directory-walk I/O errors propagate. The walk
/// itself is synchronous (`walkdir` has no async variant); callers operating
/// many layers concurrently should run this behind their own `spawn_blocking`
/// if the layer trees are large.
///
/// The returned `LayerFiles.size` is left at `0`; the caller (which already
/// knows the layer's decompressed tar size from its `DownloadResult`) fills
/// it in. Harvested-byte totals would conflate "no filesystem diff" with
/// "no package DBs found," and `history::reconcile` treats a zero `size` as
/// the former.
pub fn harvest_layer(
    dir: &Path,
    max_file_size: u64,
    os_reader: &dyn OsPackageReader,
    app_scanner: Option<&dyn AppScanner>,
) -> crate::Result<LayerFiles> {
    let mut result = LayerFiles::default();

    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };
        if metadata.len() > max_file_size {
            continue;
        }
        let relpath = match entry.path().strip_prefix(dir) {
            Ok(relpath) => relpath.to_string_lossy().to_string(),
            Err(_) => continue,
        };
        let fullpath = entry.path();

        if is_rpm_path(&relpath) || is_apk_path(&relpath) {
            if let Ok(bytes) = os_reader.read_rpm(fullpath) {
                result.pkgs.insert(relpath, bytes);
            }
        } else if is_dpkg_status_path(&relpath) || relpath.starts_with(DPKG_STATUS_DIR_PREFIX) {
            if let Ok(bytes) = os_reader.read_dpkg_status(fullpath) {
                result.pkgs.insert(relpath, bytes);
            }
        } else if app_scanner.is_some_and(|s| s.is_app_pkg_file(&relpath, fullpath)) {
            if let Ok(packages) = app_scanner.unwrap().scan(&relpath, fullpath) {
                result.apps.insert(relpath, packages);
            }
        } else if is_content_manifest(&relpath) || is_build_info(&relpath) {
            if let Ok(bytes) = std::fs::read(fullpath) {
                result.pkgs.insert(relpath, bytes);
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    #[test]
    fn harvests_known_os_package_paths_and_skips_oversize() {
        let dir = tempfile::tempdir().unwrap();
        let rpm_dir = dir.path().join("var/lib/rpm");
        fs::create_dir_all(&rpm_dir).unwrap();
        fs::write(rpm_dir.join("Packages"), b"rpm-bytes").unwrap();

        let big_dir = dir.path().join("root/buildinfo");
        fs::create_dir_all(&big_dir).unwrap();
        fs::write(big_dir.join("Dockerfile-huge"), vec![0u8; 2048]).unwrap();

        let result = harvest_layer(dir.path(), 1024, &DefaultOsPackageReader, None).unwrap();

        assert!(result.pkgs.contains_key("var/lib/rpm/Packages"));
        assert!(!result.pkgs.contains_key("root/buildinfo/Dockerfile-huge"));
    }

    #[test]
    fn harvests_dockerfile_build_info() {
        let dir = tempfile::tempdir().unwrap();
        let build_dir = dir.path().join("root/buildinfo");
        fs::create_dir_all(&build_dir).unwrap();
        fs::write(build_dir.join("Dockerfile-example"), b"FROM scratch").unwrap();

        let result =
            harvest_layer(dir.path(), 1024 * 1024, &DefaultOsPackageReader, None).unwrap();

        assert!(result.pkgs.contains_key("root/buildinfo/Dockerfile-example"));
    }
}
