use crate::client::{RegistryClient, Token};
use crate::models::ErrorResponse;
use crate::uri::RegistryUri;
use crate::{error, Result};
use bytes::Bytes;
use futures::stream::{Stream, TryStreamExt};
use reqwest::Response;
use serde::de::DeserializeOwned;
use snafu::{ensure, OptionExt, ResultExt};
use url::Url;

/// A read-only client to a specific OCI registry. Authorization is supplied
/// by the caller (as a pre-resolved [`Token`]) — discovering credentials
/// against a docker config file, keyring, or cloud-provider token exchange
/// is an external collaborator's concern.
#[derive(Clone, Debug)]
pub struct Registry {
    uri: RegistryUri,
    client: RegistryClient,
}

unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

impl Registry {
    pub fn new(uri: RegistryUri, auth: Option<Token>) -> Self {
        Self {
            uri,
            client: RegistryClient::new(auth),
        }
    }

    pub fn set_secure(&mut self, flag: bool) {
        self.uri.set_secure(flag);
    }

    pub fn uri(&self) -> &RegistryUri {
        &self.uri
    }

    pub fn url(&self) -> crate::Result<Url> {
        self.uri.clone().try_into()
    }

    /// Fetch a blob from the registry: `GET <registry_url>/v2/<repo>/blobs/<digest>`.
    pub async fn fetch_blob(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<(
        impl Stream<Item = std::result::Result<Bytes, std::io::Error>>,
        u64,
    )> {
        let response = self
            .client
            .get_blob(self.url()?, repository.into(), digest.into())
            .await?;
        trace!(target: "registry", "get_blob: {:?}", response);
        ensure!(
            response.status().is_success(),
            error::FetchBlobSnafu {
                digest: digest.to_string(),
                reason: response
                    .json::<ErrorResponse>()
                    .await
                    .context(error::ErrorDeserializeSnafu)?
                    .to_string(),
            }
        );
        let size: u64 = response
            .headers()
            .clone()
            .get("Content-Length")
            .context(error::ContentLengthMissingSnafu)?
            .to_str()
            .context(error::ImproperHeaderSnafu)?
            .parse()
            .context(error::ContentLengthNotNumberSnafu)?;
        Ok((response.bytes_stream().map_err(std::io::Error::other), size))
    }

    /// Check for the existence of a blob in the registry.
    pub async fn check_blob(&self, repository: &str, digest: &str) -> Result<bool> {
        let response = self
            .client
            .head_blob(self.url()?, repository.into(), digest.into())
            .await?;
        trace!(target: "registry", "head_blob: {:?}", response);
        Ok(response.status().is_success())
    }

    /// Fetch a manifest from the registry — this could be an image index or
    /// an image manifest.
    pub async fn fetch_manifest<T>(&self, repository: &str, reference: &str) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let response = self
            .client
            .get_manifest(self.url()?, repository.into(), reference.into())
            .await?;
        trace!(target: "registry", "get_manifest: {:?}", response);
        ensure!(
            response.status().is_success(),
            error::FetchManifestSnafu {
                reason: response
                    .json::<ErrorResponse>()
                    .await
                    .context(error::ErrorDeserializeSnafu)?
                    .to_string(),
            }
        );
        Self::body(response).await
    }

    /// Fetch a manifest's raw JSON text, used for Cosign signature retrieval
    /// where the orchestrator wants the literal payload, not a parsed type.
    pub async fn fetch_manifest_raw(&self, repository: &str, reference: &str) -> Result<String> {
        let response = self
            .client
            .get_manifest(self.url()?, repository.into(), reference.into())
            .await?;
        trace!(target: "registry", "get_manifest (raw): {:?}", response);
        ensure!(
            response.status().is_success(),
            error::FetchManifestSnafu {
                reason: response
                    .json::<ErrorResponse>()
                    .await
                    .context(error::ErrorDeserializeSnafu)?
                    .to_string(),
            }
        );
        response.text().await.context(error::ResponseDeserializeSnafu)
    }

    async fn body<T>(response: Response) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        let value: serde_json::Value = response
            .json()
            .await
            .context(error::ResponseDeserializeSnafu)?;
        trace!(target: "registry", "response body: {}", serde_json::to_string_pretty(&value).unwrap_or_default());
        serde_json::from_value(value).context(error::BodyDeserializeSnafu)
    }
}
