use crate::models::MediaType;
use crate::registry::Registry;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::StreamReader;

/// A layer represents a blob associated with an image manifest (a content
/// layer or an image config blob). Operations for reading a blob from a
/// registry operate off this object.
#[derive(Debug, Serialize, Deserialize, Clone, Builder)]
#[builder(setter(into))]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    media_type: MediaType,
    size: usize,
    digest: String,
}

impl Layer {
    pub fn new(media_type: MediaType, size: usize, digest: String) -> Self {
        Self {
            media_type,
            size,
            digest,
        }
    }

    /// Open this layer's blob for reading from the given registry and
    /// repository.
    pub async fn open(&self, registry: &Registry, repository: &str) -> crate::Result<Reader> {
        let (reader, _) = registry
            .fetch_blob(repository, self.digest.as_str())
            .await?;
        Ok(Reader::new(StreamReader::new(reader)))
    }

    /// Media type of the layer
    pub fn media_type(&self) -> &MediaType {
        &self.media_type
    }

    /// Digest string for the layer
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Reader wraps a layer's blob stream in a uniform `AsyncRead`, regardless of
/// whether the bytes came from a registry response stream or a local tar
/// entry.
pub struct Reader {
    inner: Pin<Box<dyn AsyncRead + Send>>,
}

impl Reader {
    /// Create a reader from any `AsyncRead` source.
    pub fn new(inner: impl AsyncRead + Send + 'static) -> Self {
        Self {
            inner: Box::pin(inner),
        }
    }
}

impl AsyncRead for Reader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.get_mut().inner.as_mut().poll_read(cx, buf)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::Compression;

    #[test]
    fn test_layer_accessors() {
        let layer = Layer::new(
            MediaType::Layer(Compression::Gzip),
            1234,
            "sha256:abc".to_string(),
        );
        assert_eq!(layer.size(), 1234);
        assert_eq!(layer.digest(), "sha256:abc");
    }
}
