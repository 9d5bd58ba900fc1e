use std::fmt::Debug;
use std::sync::Arc;

use crate::{error, Result};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use snafu::ResultExt;
use url::Url;

/// A caller-resolved registry credential. Discovering one (docker config
/// files, keyring, cloud-provider token exchange) is an external concern;
/// this crate only ever carries a token it's handed.
#[derive(Debug, Clone)]
pub enum Token {
    Bearer(String),
    Basic { username: String, password: String },
}

/// A trait for a client implementing read-only requests to an oci registry.
/// This is primarily implemented to allow for ease of unittesting this
/// crate.
#[async_trait]
pub(crate) trait RegistryClientImpl: Send + Sync + Debug {
    /// HEAD {uri}/v2/{repository}/blobs/{digest}
    async fn head_blob(&self, uri: &Url, repository: &str, digest: &str) -> Result<Response>;
    /// GET {uri}/v2/{repository}/blobs/{digest}
    async fn get_blob(&self, uri: &Url, repository: &str, digest: &str) -> Result<Response>;
    /// GET {uri}/v2/{repository}/manifests/{reference}
    async fn get_manifest(&self, uri: &Url, repository: &str, reference: &str) -> Result<Response>;
}

/// Implements a simple registry client using reqwest.
#[derive(Debug)]
pub struct SimpleRegistryClient {
    client: reqwest::Client,
    auth: Option<Token>,
}

impl SimpleRegistryClient {
    pub fn new(auth: Option<Token>) -> Self {
        Self {
            client: reqwest::Client::new(),
            auth,
        }
    }

    pub(crate) fn auth(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = self.auth.as_ref() {
            match token {
                Token::Bearer(t) => request.bearer_auth(t),
                Token::Basic { username, password } => request.basic_auth(username, Some(password)),
            }
        } else {
            request
        }
    }
}

#[async_trait]
impl RegistryClientImpl for SimpleRegistryClient {
    async fn head_blob(&self, uri: &Url, repository: &str, digest: &str) -> Result<Response> {
        let request = self.client.head(
            uri.join(&format!("/v2/{}/blobs/{}", repository, digest))
                .context(error::UrlSnafu)?,
        );
        self.auth(request).send().await.context(error::RequestSnafu)
    }

    async fn get_blob(&self, uri: &Url, repository: &str, digest: &str) -> Result<Response> {
        let request = self.client.get(
            uri.join(&format!("/v2/{}/blobs/{}", repository, digest))
                .context(error::UrlSnafu)?,
        );
        self.auth(request).send().await.context(error::RequestSnafu)
    }

    async fn get_manifest(&self, uri: &Url, repository: &str, reference: &str) -> Result<Response> {
        let request = self.client.get(
            uri.join(&format!("/v2/{}/manifests/{}", repository, reference))
                .context(error::UrlSnafu)?,
        );
        self.auth(request).send().await.context(error::RequestSnafu)
    }
}

/// Handle to a registry client. This primarily is utilized as an intercept
/// point for unittesting.
#[derive(Clone, Debug)]
pub struct RegistryClient {
    client: Arc<dyn RegistryClientImpl>,
}

impl RegistryClient {
    pub fn new(auth: Option<Token>) -> Self {
        Self {
            client: Arc::new(SimpleRegistryClient::new(auth)),
        }
    }

    pub async fn head_blob(
        &self,
        uri: Url,
        repository: String,
        digest: String,
    ) -> Result<Response> {
        self.client
            .head_blob(&uri, repository.as_str(), digest.as_str())
            .await
    }

    pub async fn get_blob(&self, uri: Url, repository: String, digest: String) -> Result<Response> {
        self.client
            .get_blob(&uri, repository.as_str(), digest.as_str())
            .await
    }

    pub async fn get_manifest(
        &self,
        uri: Url,
        repository: String,
        reference: String,
    ) -> Result<Response> {
        self.client
            .get_manifest(&uri, repository.as_str(), reference.as_str())
            .await
    }
}

unsafe impl Send for RegistryClient {}
unsafe impl Sync for RegistryClient {}
