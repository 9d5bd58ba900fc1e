use snafu::Snafu;

use crate::models::Platform;

/// The stable error taxonomy surfaced to the orchestrator (spec §7).
///
/// `None` itself is not a variant here — it is simply `Ok(())`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ContainerApi,
    ImageNotFound,
    DriverApiNotSupport,
    FileSystem,
    Package,
    RegistryApi,
}

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    // -- ContainerApi --
    #[snafu(display("failed to reach local container runtime: {source}"))]
    ContainerApi { source: bollard::errors::Error },
    #[snafu(display("local container runtime returned an unexpected response: {reason}"))]
    ContainerApiResponse { reason: String },

    // -- DriverApiNotSupport --
    #[snafu(display("local runtime does not support exporting images"))]
    DriverApiNotSupport,

    // -- ImageNotFound --
    #[snafu(display("image '{repo}:{tag}' was not found locally"))]
    LocalImageNotFound { repo: String, tag: String },
    #[snafu(display("no image was found in the registry matching: {uri}"))]
    RemoteImageNotFound { uri: String },
    #[snafu(display("index does not contain an image for the platform: {platform}"))]
    PlatformNotFound { platform: Platform },

    // -- FileSystem --
    #[snafu(display("failed to interact with a scratch or layer directory: {source}"))]
    FileSystem { source: std::io::Error },
    #[snafu(display("failed to create temporary directory: {source}"))]
    Temp { source: std::io::Error },
    #[snafu(display("failed to join worker task: {source}"))]
    Join { source: tokio::task::JoinError },

    // -- Package (malformed tarball / manifest) --
    #[snafu(display("image tar is missing manifest.json or it is empty"))]
    ManifestMissing,
    #[snafu(display("failed to parse manifest.json: {source}"))]
    ManifestParse { source: serde_json::Error },
    #[snafu(display("failed to parse layer sidecar metadata: {source}"))]
    LayerMetadataParse { source: serde_json::Error },
    #[snafu(display("failed to interact with tar archive: {source}"))]
    Archive { source: std::io::Error },
    #[snafu(display(
        "runtime reported {meta_len} layers but the tarball declares {tar_len}: layer identity cannot be reconciled"
    ))]
    LayerCountMismatch { meta_len: usize, tar_len: usize },
    #[snafu(display("failed to deserialize image manifest: {source}"))]
    ImageManifestParse { source: serde_json::Error },
    #[snafu(display("failed to deserialize image configuration: {source}"))]
    ImageConfigParse { source: serde_json::Error },

    // -- RegistryApi --
    #[snafu(display("failed to make request to oci registry: {source}"))]
    Request { source: reqwest::Error },
    #[snafu(display("failed to fetch blob '{digest}' from registry: {reason}"))]
    FetchBlob { digest: String, reason: String },
    #[snafu(display("failed to fetch manifest from registry: {reason}"))]
    FetchManifest { reason: String },
    #[snafu(display("registry did not return a content-length for the blob"))]
    ContentLengthMissing,
    #[snafu(display("registry content-length header was not a valid number: {source}"))]
    ContentLengthNotNumber { source: std::num::ParseIntError },
    #[snafu(display("registry returned an invalid header: {source}"))]
    ImproperHeader { source: reqwest::header::ToStrError },
    #[snafu(display("invalid url: {source}"))]
    Url { source: url::ParseError },
    #[snafu(display("malformed image reference: {reason}"))]
    MalformedRef { reason: String },
    #[snafu(display("request was cancelled before completion"))]
    Cancelled,
    #[snafu(display("failed to deserialize registry error body: {source}"))]
    ErrorDeserialize { source: reqwest::Error },
    #[snafu(display("failed to deserialize registry response body: {source}"))]
    ResponseDeserialize { source: reqwest::Error },
    #[snafu(display("failed to deserialize registry response body: {source}"))]
    BodyDeserialize { source: serde_json::Error },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ContainerApi { .. } | Error::ContainerApiResponse { .. } => {
                ErrorKind::ContainerApi
            }
            Error::DriverApiNotSupport => ErrorKind::DriverApiNotSupport,
            Error::LocalImageNotFound { .. }
            | Error::RemoteImageNotFound { .. }
            | Error::PlatformNotFound { .. } => ErrorKind::ImageNotFound,
            Error::FileSystem { .. } | Error::Temp { .. } | Error::Join { .. } => {
                ErrorKind::FileSystem
            }
            Error::ManifestMissing
            | Error::ManifestParse { .. }
            | Error::LayerMetadataParse { .. }
            | Error::Archive { .. }
            | Error::LayerCountMismatch { .. }
            | Error::ImageManifestParse { .. }
            | Error::ImageConfigParse { .. } => ErrorKind::Package,
            Error::Request { .. }
            | Error::FetchBlob { .. }
            | Error::FetchManifest { .. }
            | Error::ContentLengthMissing
            | Error::ContentLengthNotNumber { .. }
            | Error::ImproperHeader { .. }
            | Error::Url { .. }
            | Error::MalformedRef { .. }
            | Error::Cancelled
            | Error::ErrorDeserialize { .. }
            | Error::ResponseDeserialize { .. }
            | Error::BodyDeserialize { .. } => ErrorKind::RegistryApi,
        }
    }
}
