//! Image reference parsing.
//!
//! Accepts Docker-style references and normalizes them:
//! - `alpine` → `docker.io/library/alpine:latest`
//! - `alpine:3.20` → `docker.io/library/alpine:3.20`
//! - `ghcr.io/org/app@sha256:…` is kept as-is.

use std::fmt;

use crate::{Error, Result};

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";
const OFFICIAL_NAMESPACE: &str = "library";

/// A normalized image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Reference {
    /// Registry hostname (e.g., `docker.io`, `ghcr.io`).
    pub registry: String,
    /// Repository path (e.g., `library/alpine`, `org/app`).
    pub repository: String,
    /// Tag or digest selecting the image within the repository.
    pub identifier: Identifier,
}

/// Tag or digest part of a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Identifier {
    /// Named tag (e.g., `latest`, `3.20`).
    Tag(String),
    /// Content-addressable digest (`sha256:…`).
    Digest(String),
}

impl Reference {
    /// Parses a reference string, filling in registry, namespace, and
    /// tag defaults.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidReference("empty reference".into()));
        }

        // A digest pins the image; a tag may still follow the repository.
        let (name, digest) = match input.split_once('@') {
            Some((name, digest)) if digest.contains(':') => (name, Some(digest)),
            Some((_, digest)) => {
                return Err(Error::InvalidReference(format!("malformed digest: {digest}")));
            }
            None => (input, None),
        };

        // The first path segment is a registry only if it looks like a host.
        let (registry, remainder) = match name.split_once('/') {
            Some((host, rest)) if looks_like_host(host) => (host.to_owned(), rest.to_owned()),
            _ => (DEFAULT_REGISTRY.to_owned(), name.to_owned()),
        };

        let (repository, identifier) = if let Some(digest) = digest {
            (remainder, Identifier::Digest(digest.to_owned()))
        } else {
            match remainder.rsplit_once(':') {
                Some((repo, tag)) => (repo.to_owned(), Identifier::Tag(tag.to_owned())),
                None => (remainder, Identifier::Tag(DEFAULT_TAG.to_owned())),
            }
        };

        if repository.is_empty() {
            return Err(Error::InvalidReference(format!("missing repository: {input}")));
        }

        // Bare official images live under the `library` namespace.
        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("{OFFICIAL_NAMESPACE}/{repository}")
        } else {
            repository
        };

        Ok(Self {
            registry,
            repository,
            identifier,
        })
    }

    /// Returns the registry API base URL.
    pub fn api_base(&self) -> String {
        let host = match self.registry.as_str() {
            "docker.io" => "registry-1.docker.io",
            other => other,
        };
        format!("https://{host}/v2")
    }

    /// Returns the tag or digest string used in API request paths.
    pub fn identifier_str(&self) -> &str {
        match &self.identifier {
            Identifier::Tag(t) | Identifier::Digest(t) => t,
        }
    }
}

/// Returns `true` if a leading path segment names a registry host.
fn looks_like_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match &self.identifier {
            Identifier::Tag(t) => write!(f, ":{t}"),
            Identifier::Digest(d) => write!(f, "@{d}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_gets_all_defaults() {
        let r = Reference::parse("alpine").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.identifier, Identifier::Tag("latest".into()));
    }

    #[test]
    fn explicit_tag_is_kept() {
        let r = Reference::parse("alpine:3.20").unwrap();
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.identifier, Identifier::Tag("3.20".into()));
    }

    #[test]
    fn user_repository_is_not_namespaced() {
        let r = Reference::parse("someuser/tool:v2").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "someuser/tool");
    }

    #[test]
    fn custom_registry_host_is_detected() {
        let r = Reference::parse("ghcr.io/org/app:latest").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/app");
    }

    #[test]
    fn localhost_with_port_is_a_registry() {
        let r = Reference::parse("localhost:5000/test").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "test");
        assert_eq!(r.identifier, Identifier::Tag("latest".into()));
    }

    #[test]
    fn digest_reference_is_pinned() {
        let r = Reference::parse("alpine@sha256:abc123").unwrap();
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.identifier, Identifier::Digest("sha256:abc123".into()));
    }

    #[test]
    fn digest_without_algorithm_is_rejected() {
        assert!(Reference::parse("alpine@abc123").is_err());
        assert!(Reference::parse("").is_err());
    }

    #[test]
    fn display_round_trips() {
        let r = Reference::parse("ghcr.io/org/app:v2").unwrap();
        assert_eq!(r.to_string(), "ghcr.io/org/app:v2");
    }
}
