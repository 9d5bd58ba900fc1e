use derive_builder::Builder;
use serde::de::Error as SerdeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::env::consts;
use std::fmt;

/// Handles all the supported media type enumerations used by the registry
/// and local-runtime access layers. OCI allows custom types; unrecognized
/// ones are not currently modeled as a distinct variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    ImageIndex,
    Manifest,
    Config,
    Layer(Compression),
    DockerManifestList,
    DockerManifest,
    DockerContainerImage,
    DockerImageRootfs(Compression),
}

impl MediaType {
    pub fn compression(&self) -> Compression {
        match self {
            Self::DockerImageRootfs(compression) => {
                if *compression == Compression::None {
                    Compression::Gzip
                } else {
                    compression.clone()
                }
            }
            Self::Layer(compression) => compression.clone(),
            _ => Compression::None,
        }
    }
}

impl Serialize for MediaType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let string = match self {
            Self::ImageIndex => "application/vnd.oci.image.index.v1+json".into(),
            Self::Manifest => "application/vnd.oci.image.manifest.v1+json".into(),
            Self::Config => "application/vnd.oci.image.config.v1+json".into(),
            Self::Layer(compression) => format!(
                "application/vnd.oci.image.layer.v1.tar{}",
                compression.to_ext()
            ),
            Self::DockerManifestList => {
                "application/vnd.docker.distribution.manifest.list.v2+json".into()
            }
            Self::DockerManifest => "application/vnd.docker.distribution.manifest.v2+json".into(),
            Self::DockerContainerImage => "application/vnd.docker.container.image.v1+json".into(),
            Self::DockerImageRootfs(compression) => format!(
                "application/vnd.docker.image.rootfs.diff.tar{}",
                compression.to_ext()
            ),
        };
        serializer.serialize_str(string.as_str())
    }
}

impl<'de> Deserialize<'de> for MediaType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        if string.starts_with("application/vnd.docker.image.rootfs.diff.tar") {
            let compression = Compression::new(string.as_str());
            Ok(MediaType::DockerImageRootfs(compression))
        } else if string.starts_with("application/vnd.oci.image.layer.v1.tar") {
            let compression = Compression::new(string.as_str());
            Ok(MediaType::Layer(compression))
        } else {
            match string.as_ref() {
                "application/vnd.docker.distribution.manifest.list.v2+json" => {
                    Ok(MediaType::DockerManifestList)
                }
                "application/vnd.docker.distribution.manifest.v2+json" => {
                    Ok(MediaType::DockerManifest)
                }
                "application/vnd.docker.container.image.v1+json" => {
                    Ok(MediaType::DockerContainerImage)
                }
                "application/vnd.oci.image.manifest.v1+json" => Ok(MediaType::Manifest),
                "application/vnd.oci.image.index.v1+json" => Ok(MediaType::ImageIndex),
                "application/vnd.oci.image.config.v1+json" => Ok(MediaType::Config),
                variant => Err(D::Error::unknown_variant(
                    variant,
                    &[
                        "application/vnd.docker.image.rootfs.diff.tar.*",
                        "application/vnd.docker.container.image.v1+json",
                        "application/vnd.docker.distribution.manifest.list.v2+json",
                        "application/vnd.docker.distribution.manifest.v2+json",
                        "application/vnd.oci.image.index.v1+json",
                        "application/vnd.oci.image.manifest.v1+json",
                        "application/vnd.oci.image.config.v1+json",
                    ],
                )),
            }
        }
    }
}

/// The compression algorithm wrapping a layer blob, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Bzip2,
    Lz4,
    Xz,
    Zstd,
    None,
}

impl Compression {
    pub fn new(string: &str) -> Self {
        if string.ends_with(".gz") || string.ends_with(".gzip2") {
            Compression::Gzip
        } else if string.ends_with(".xz") {
            Compression::Xz
        } else if string.ends_with(".lz4") {
            Compression::Lz4
        } else if string.ends_with(".zst") {
            Compression::Zstd
        } else if string.ends_with(".bz2") || string.ends_with(".bzip2") {
            Compression::Bzip2
        } else {
            Compression::None
        }
    }

    pub fn to_ext(&self) -> &str {
        match self {
            Self::Gzip => ".gz",
            Self::Bzip2 => ".bz2",
            Self::Lz4 => ".lz4",
            Self::Xz => ".xz",
            Self::Zstd => ".zst",
            Self::None => "",
        }
    }
}

/// Represents the commonly used `<os>/<architecture>` platform identifier.
#[derive(Builder, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[builder(setter(into))]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

impl Default for Platform {
    fn default() -> Self {
        let arch = match consts::ARCH {
            "arm" | "aarch64" | "longaarch64" => "arm64",
            _ => "amd64",
        };
        Self {
            os: "linux".to_string(),
            architecture: arch.to_string(),
        }
    }
}

impl From<String> for Platform {
    fn from(value: String) -> Self {
        match value.split_once('/') {
            Some((os, architecture)) => Self {
                architecture: architecture.to_string(),
                os: os.to_string(),
            },
            None => Self {
                architecture: value,
                ..Default::default()
            },
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{}/{}", self.os, self.architecture))
    }
}

/// The format of a `manifest.json` file inside a legacy tarball export of an
/// image, as produced by `docker/podman/finch/nerdctl save`.
#[derive(Builder, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
#[builder(setter(into))]
pub struct LayerManifest {
    pub config: String,
    #[serde(default)]
    pub repo_tags: Vec<String>,
    pub layers: Vec<String>,
}

/// The per-layer sidecar JSON found alongside each `layer.tar` inside the
/// tarball, at `<id>/json`.
#[derive(Builder, Debug, Clone, Serialize, Deserialize)]
#[builder(setter(into))]
pub struct LayerMetadata {
    pub id: String,
    #[serde(default)]
    #[builder(default)]
    pub parent: Option<String>,
    #[serde(default)]
    #[builder(default)]
    pub created: Option<String>,
    #[serde(default)]
    #[builder(default)]
    pub config: LayerMetadataConfig,
}

#[derive(Builder, Debug, Clone, Default, Serialize, Deserialize)]
#[builder(setter(into))]
pub struct LayerMetadataConfig {
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// One entry of an image's build history, bottom-up. A zero `size` entry is
/// a metadata-only instruction that produced no filesystem diff.
#[derive(Builder, Debug, Clone, Default, Serialize, Deserialize)]
#[builder(setter(into))]
pub struct HistoryEntry {
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub size: u64,
}

/// Metadata about an image, as surfaced by the local runtime or parsed from
/// a registry manifest — `layers` is the ordered list of content-addressable
/// layer digests, bottom-up.
#[derive(Builder, Debug, Clone, Default, Serialize, Deserialize)]
#[builder(setter(into))]
pub struct ImageMeta {
    pub id: String,
    pub digest: String,
    #[serde(default)]
    pub layers: Vec<String>,
    #[serde(default)]
    pub envs: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub repo_tags: Vec<String>,
}

/// A single ecosystem package entry discovered by an `AppScanner`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppPackage {
    pub ecosystem: String,
    pub name: String,
    pub version: String,
}

/// The harvested output for a single extracted layer directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerFiles {
    pub size: u64,
    #[serde(default)]
    pub pkgs: HashMap<String, Vec<u8>>,
    #[serde(default)]
    pub apps: HashMap<String, Vec<AppPackage>>,
}

/// The outcome of acquiring and extracting a single layer.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub layer_id: String,
    pub decompressed_size: u64,
    pub declared_tar_size: u64,
    pub error: Option<String>,
}

/// The canonical, history-aligned view of an image returned to the
/// orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    pub digest: String,
    pub layers: Vec<String>,
    pub cmds: Vec<String>,
    pub envs: Vec<String>,
    pub labels: HashMap<String, String>,
    pub repo_tags: Vec<String>,
}

/// The result of a Cosign signature-data fetch: the signature image's raw
/// manifest JSON and each layer's JSON payload keyed by blob digest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureData {
    pub manifest: String,
    pub payloads: HashMap<String, String>,
}

/// A single content-addressable blob reference inside a distribution
/// manifest: a layer or the config blob. `media_type` is a plain string
/// rather than the strict `MediaType` enum — Cosign signature layers carry
/// types such as `application/vnd.dev.cosign.simplesigning.v1+json` that
/// `MediaType` doesn't model, and this crate only ever needs `digest` off a
/// `Descriptor`, never to branch on its type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// The minimal shape of an OCI/Docker distribution manifest this crate reads
/// back off the registry — just enough to enumerate a signature image's
/// layer blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionManifest {
    pub schema_version: usize,
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

/// The officially supported error codes defined by the OCI distribution
/// specification, used to decode registry error bodies.
#[derive(Serialize, Deserialize, Eq, PartialEq, Debug)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BlobUnknown,
    BlobUploadInvalid,
    BlobUploadUnknown,
    DigestInvalid,
    ManifestBlobUnknown,
    ManifestInvalid,
    ManifestUnknown,
    NameInvalid,
    NameUnknown,
    SizeInvalid,
    Unauthorized,
    Denied,
    Unsupported,
    #[serde(rename = "TOOMANYREQUESTS")]
    TooManyRequests,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = if let Some(message) = self.message.as_ref() {
            if let Some(detail) = self.detail.as_ref() {
                format!("{message}: {detail}")
            } else {
                message.clone()
            }
        } else if let Some(detail) = self.detail.as_ref() {
            detail.clone()
        } else {
            "unknown error occurred".to_string()
        };
        let code = match self.code {
            ErrorCode::BlobUnknown => "blob unknown",
            ErrorCode::BlobUploadInvalid => "blob upload invalid",
            ErrorCode::BlobUploadUnknown => "blob upload unknown",
            ErrorCode::Denied => "denied",
            ErrorCode::DigestInvalid => "digest invalid",
            ErrorCode::ManifestBlobUnknown => "manifest blob unknown",
            ErrorCode::ManifestInvalid => "manifest invalid",
            ErrorCode::ManifestUnknown => "manifest unknown",
            ErrorCode::NameInvalid => "name invalid",
            ErrorCode::NameUnknown => "name unknown",
            ErrorCode::SizeInvalid => "size invalid",
            ErrorCode::TooManyRequests => "too many requests",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Unsupported => "unsupported",
        };
        f.write_fmt(format_args!("[{code}] {message}"))
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub errors: Vec<ErrorInfo>,
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "{}",
            self.errors
                .iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join("\n")
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn platform_defaults_to_linux() {
        let platform = Platform::default();
        assert_eq!(platform.os, "linux");
    }

    #[test]
    fn platform_parses_os_slash_arch() {
        let platform: Platform = "linux/arm64".to_string().into();
        assert_eq!(platform.os, "linux");
        assert_eq!(platform.architecture, "arm64");
        assert_eq!(platform.to_string(), "linux/arm64");
    }

    #[test]
    fn media_type_round_trips_layer_gzip() {
        let media_type = MediaType::Layer(Compression::Gzip);
        let json = serde_json::to_string(&media_type).unwrap();
        let parsed: MediaType = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, media_type);
    }
}
