use snafu::{OptionExt, ResultExt};
use std::fmt;
use std::fmt::Formatter;
use std::str::FromStr;
use url::Url;

use crate::error;

/// Identifies an image either as locally resident (accessed through a
/// container runtime socket) or as a remote reference (accessed through a
/// registry HTTP API).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Local {
        /// `None` means the caller's configured default socket.
        socket: Option<String>,
        repo: String,
        tag: String,
    },
    Remote {
        registry: RegistryUri,
        repo: String,
        reference: Reference,
    },
}

impl ImageRef {
    /// Build a local image reference, splitting a `tcp://host:port/` prefix
    /// embedded in `repo` off into the socket field if present.
    pub fn local(repo: &str, tag: &str) -> Self {
        let (socket, repo) = split_socket_prefix(repo);
        Self::Local {
            socket,
            repo: repo.to_string(),
            tag: tag.to_string(),
        }
    }

    /// Parse a remote image reference of the form
    /// `registry[:port]/repository[:tag|@digest]`.
    pub fn remote(input: &str) -> crate::Result<Self> {
        let (registry, object) = input.split_once('/').context(error::MalformedRefSnafu {
            reason: "only a registry was provided in the reference",
        })?;
        let (repo, reference) = if let Some((repo, digest)) = object.split_once('@') {
            let (algorithm, value) = digest.split_once(':').context(error::MalformedRefSnafu {
                reason: "no algorithm was provided for the digest",
            })?;
            (
                repo,
                Reference::Digest {
                    algorithm: Algorithm::from_str(algorithm)?,
                    value: value.to_string(),
                },
            )
        } else if let Some((repo, tag)) = object.split_once(':') {
            (repo, Reference::Tag(tag.to_string()))
        } else {
            (object, Reference::Tag("latest".to_string()))
        };
        Ok(Self::Remote {
            registry: RegistryUri::from_str(registry)?,
            repo: repo.to_string(),
            reference,
        })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { socket, repo, tag } => {
                if let Some(socket) = socket {
                    write!(f, "{socket}{repo}:{tag}")
                } else {
                    write!(f, "{repo}:{tag}")
                }
            }
            Self::Remote {
                registry,
                repo,
                reference,
            } => write!(f, "{}/{repo}{reference}", registry.base),
        }
    }
}

/// Splits the `tcp://host:port/` socket prefix from a local repo string, per
/// the runtime socket syntax: the prefix up to (and including) the first `/`
/// after the scheme is the socket URL, the rest is the repository.
fn split_socket_prefix(repo: &str) -> (Option<String>, &str) {
    if let Some(rest) = repo.strip_prefix("tcp://") {
        if let Some(idx) = rest.find('/') {
            let (host_port, tail) = rest.split_at(idx);
            return (
                Some(format!("tcp://{host_port}/")),
                tail.trim_start_matches('/'),
            );
        }
    }
    (None, repo)
}

/// Uri to a specific registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryUri {
    /// Registry host (and optional path prefix), without scheme.
    base: String,
    /// Whether to connect with https or not.
    is_secure: bool,
}

impl RegistryUri {
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    pub fn set_secure(&mut self, flag: bool) {
        self.is_secure = flag;
    }
}

impl FromStr for RegistryUri {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, is_secure) = if let Some(rest) = s.strip_prefix("http://") {
            (rest, false)
        } else if let Some(rest) = s.strip_prefix("https://") {
            (rest, true)
        } else {
            (s, !(s.contains("localhost") || s.contains("127.0.0.1")))
        };
        Ok(Self {
            base: base.to_string(),
            is_secure,
        })
    }
}

impl TryInto<Url> for RegistryUri {
    type Error = crate::error::Error;

    fn try_into(self) -> Result<Url, Self::Error> {
        Url::parse(&format!(
            "{}://{}",
            if self.is_secure { "https" } else { "http" },
            self.base
        ))
        .context(crate::error::UrlSnafu)
    }
}

/// Represents a reference to a specific object via a tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Tag(String),
    Digest { algorithm: Algorithm, value: String },
}

impl FromStr for Reference {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((algorithm, value)) = s.split_once(':') {
            Ok(Self::Digest {
                algorithm: Algorithm::from_str(algorithm)?,
                value: value.to_string(),
            })
        } else {
            Ok(Self::Tag(s.to_string()))
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag(tag) => write!(f, ":{tag}"),
            Self::Digest { algorithm, value } => write!(f, "@{algorithm}:{value}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Algorithm {
    #[default]
    Sha256,
    Sha512,
}

impl FromStr for Algorithm {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            _ => error::MalformedRefSnafu {
                reason: format!("unsupported digest algorithm: {s}"),
            }
            .fail(),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => f.write_str("sha256"),
            Self::Sha512 => f.write_str("sha512"),
        }
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    #[test]
    fn test_registry_from_str() {
        let registry = super::RegistryUri::from_str("localhost:5000").unwrap();
        assert_eq!(registry.base, "localhost:5000");
        assert!(!registry.is_secure);
        let registry = super::RegistryUri::from_str("public.ecr.aws/bottlerocket").unwrap();
        assert_eq!(registry.base, "public.ecr.aws/bottlerocket");
        assert!(registry.is_secure);
    }

    #[test]
    fn test_registry_into_url() {
        let registry = super::RegistryUri::from_str("localhost:5000").unwrap();
        let url: super::Url = registry.try_into().unwrap();
        assert_eq!(url.as_str(), "http://localhost:5000/");
    }

    #[test]
    fn test_algorithm_from_str() {
        let algorithm = super::Algorithm::from_str("sha256").unwrap();
        assert_eq!(algorithm, super::Algorithm::Sha256);
    }

    #[test]
    fn test_reference_from_str() {
        let reference = super::Reference::from_str("latest").unwrap();
        assert_eq!(reference, super::Reference::Tag("latest".to_string()));
        let reference = super::Reference::from_str("sha256:1234567890abcdef").unwrap();
        assert_eq!(
            reference,
            super::Reference::Digest {
                algorithm: super::Algorithm::Sha256,
                value: "1234567890abcdef".to_string(),
            }
        );
    }

    #[test]
    fn test_image_ref_remote() {
        let image = super::ImageRef::remote("fake.io/bottlerocket/test:latest").unwrap();
        match image {
            super::ImageRef::Remote {
                registry,
                repo,
                reference,
            } => {
                assert_eq!(registry.base, "fake.io");
                assert_eq!(repo, "bottlerocket/test");
                assert_eq!(reference, super::Reference::Tag("latest".to_string()));
            }
            _ => panic!("expected a remote reference"),
        }
    }

    #[test]
    fn test_image_ref_local_splits_socket() {
        let image = super::ImageRef::local("tcp://host:1234/myrepo", "latest");
        match image {
            super::ImageRef::Local { socket, repo, tag } => {
                assert_eq!(socket.as_deref(), Some("tcp://host:1234/"));
                assert_eq!(repo, "myrepo");
                assert_eq!(tag, "latest");
            }
            _ => panic!("expected a local reference"),
        }
    }

    #[test]
    fn test_image_ref_local_without_socket() {
        let image = super::ImageRef::local("myrepo", "latest");
        match image {
            super::ImageRef::Local { socket, repo, tag } => {
                assert_eq!(socket, None);
                assert_eq!(repo, "myrepo");
                assert_eq!(tag, "latest");
            }
            _ => panic!("expected a local reference"),
        }
    }
}
