//! OCI Distribution registry client.
//!
//! Resolves references against OCI-compliant registries (Docker Hub,
//! GHCR) with anonymous bearer-token auth, multi-platform index
//! resolution, and on-demand layer streaming.

use std::collections::HashMap;
use std::io::Read;

use flate2::read::GzDecoder;
use serde::Deserialize;
use tracing::debug;

use crate::pull::{ImageSource, ResolvedImage};
use crate::reference::Reference;
use crate::store::Manifest;
use crate::{Error, Result};

/// Manifest media types accepted during pull.
const ACCEPT_MANIFEST: &str = "\
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json, \
    application/vnd.docker.distribution.manifest.list.v2+json";

/// Layer media types carrying gzip-compressed tar data.
const GZIP_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.layer.v1.tar+gzip",
    "application/vnd.docker.image.rootfs.diff.tar.gzip",
];

/// Platform selector in an image index entry.
#[derive(Debug, Deserialize)]
struct IndexPlatform {
    architecture: String,
    os: String,
}

/// Entry within an image index (fat manifest).
#[derive(Debug, Deserialize)]
struct IndexEntry {
    digest: String,
    platform: Option<IndexPlatform>,
}

/// Image index / manifest list (multi-platform).
#[derive(Debug, Deserialize)]
struct ImageIndex {
    manifests: Vec<IndexEntry>,
}

/// Bearer token response from a registry auth endpoint.
#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// Registry client with per-repository bearer-token caching.
#[derive(Debug, Default)]
pub struct Client {
    tokens: HashMap<String, String>,
}

impl Client {
    /// Creates a client with an empty token cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches and resolves the manifest, following an image index down
    /// to the platform-specific manifest when needed.
    fn pull_manifest(&mut self, reference: &Reference) -> Result<Manifest> {
        let url = manifest_url(reference, reference.identifier_str());
        let body = self.get(reference, &url, Some(ACCEPT_MANIFEST))?;
        let value: serde_json::Value = serde_json::from_slice(&body)?;

        if value.get("manifests").is_some() {
            let index: ImageIndex = serde_json::from_value(value)?;
            let entry = select_platform(&index)?;
            debug!(digest = %entry.digest, "resolved index to platform manifest");
            let platform_url = manifest_url(reference, &entry.digest);
            let platform_body = self.get(reference, &platform_url, Some(ACCEPT_MANIFEST))?;
            Ok(serde_json::from_slice(&platform_body)?)
        } else {
            Ok(serde_json::from_value(value)?)
        }
    }

    /// Downloads a blob fully into memory (config-sized blobs only).
    fn fetch_blob(&mut self, reference: &Reference, digest: &str) -> Result<Vec<u8>> {
        let url = blob_url(reference, digest);
        self.get(reference, &url, None)
    }

    /// Opens a streaming reader over a blob (layer-sized blobs).
    fn blob_reader(&mut self, reference: &Reference, digest: &str) -> Result<Box<dyn Read>> {
        let url = blob_url(reference, digest);
        let token = self.token_for(reference);

        let mut req = ureq::get(&url);
        if let Some(ref t) = token {
            req = req.header("Authorization", &format!("Bearer {t}"));
        }
        let resp = req.call().map_err(|e| Error::Http(e.to_string()))?;
        Ok(Box::new(resp.into_body().into_reader()))
    }

    /// Performs an authenticated GET and returns the response body.
    fn get(&mut self, reference: &Reference, url: &str, accept: Option<&str>) -> Result<Vec<u8>> {
        let token = self.token_for(reference);

        let mut req = ureq::get(url);
        if let Some(accept) = accept {
            req = req.header("Accept", accept);
        }
        if let Some(ref t) = token {
            req = req.header("Authorization", &format!("Bearer {t}"));
        }

        let resp = req.call().map_err(|e| Error::Http(e.to_string()))?;
        let mut body = Vec::new();
        resp.into_body()
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(body)
    }

    /// Returns a cached bearer token, fetching one for known registries.
    fn token_for(&mut self, reference: &Reference) -> Option<String> {
        let key = format!("{}/{}", reference.registry, reference.repository);
        if let Some(token) = self.tokens.get(&key) {
            return Some(token.clone());
        }

        let (realm, service) = match reference.registry.as_str() {
            "docker.io" => ("https://auth.docker.io/token", "registry.docker.io"),
            "ghcr.io" => ("https://ghcr.io/token", "ghcr.io"),
            _ => return None,
        };

        let token = fetch_bearer_token(realm, service, &reference.repository).ok()?;
        self.tokens.insert(key, token.clone());
        Some(token)
    }
}

impl ImageSource for Client {
    fn resolve(&mut self, reference: &str) -> Result<Box<dyn ResolvedImage + '_>> {
        let parsed = Reference::parse(reference)?;
        debug!(reference = %parsed, "resolving manifest");
        let manifest = self.pull_manifest(&parsed)?;
        let config = self.fetch_blob(&parsed, &manifest.config.digest)?;
        Ok(Box::new(RegistryImage {
            client: self,
            reference: parsed,
            manifest,
            config,
        }))
    }
}

/// A manifest resolved from a registry; layers stream on demand.
struct RegistryImage<'a> {
    client: &'a mut Client,
    reference: Reference,
    manifest: Manifest,
    config: Vec<u8>,
}

impl ResolvedImage for RegistryImage<'_> {
    fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn config_bytes(&self) -> &[u8] {
        &self.config
    }

    fn layer_reader(&mut self, digest: &str) -> Result<Box<dyn Read + '_>> {
        let media_type = self
            .manifest
            .layers
            .iter()
            .find(|layer| layer.digest == digest)
            .and_then(|layer| layer.media_type.clone());
        let raw = self.client.blob_reader(&self.reference, digest)?;
        if is_gzip(media_type.as_deref()) {
            Ok(Box::new(GzDecoder::new(raw)))
        } else {
            Ok(raw)
        }
    }
}

/// Manifest endpoint for a tag or digest.
fn manifest_url(reference: &Reference, selector: &str) -> String {
    format!(
        "{}/{}/manifests/{}",
        reference.api_base(),
        reference.repository,
        selector
    )
}

/// Blob endpoint for a digest.
fn blob_url(reference: &Reference, digest: &str) -> String {
    format!(
        "{}/{}/blobs/{}",
        reference.api_base(),
        reference.repository,
        digest
    )
}

/// Fetches an anonymous pull token from a registry auth endpoint.
fn fetch_bearer_token(realm: &str, service: &str, repository: &str) -> Result<String> {
    let url = format!("{realm}?service={service}&scope=repository:{repository}:pull");

    let resp = ureq::get(&url)
        .call()
        .map_err(|e| Error::Http(e.to_string()))?;
    let mut body = Vec::new();
    resp.into_body()
        .into_reader()
        .read_to_end(&mut body)
        .map_err(|e| Error::Http(e.to_string()))?;

    let parsed: TokenResponse = serde_json::from_slice(&body)?;
    Ok(parsed.token)
}

/// Selects the index entry matching the host architecture and `linux`.
fn select_platform(index: &ImageIndex) -> Result<&IndexEntry> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    index
        .manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|p| p.architecture == arch && p.os == "linux")
        })
        .ok_or_else(|| Error::NoPlatform {
            arch: arch.to_owned(),
            os: "linux".to_owned(),
        })
}

/// Returns `true` if the media type indicates gzip compression.
///
/// Registries in practice compress layers even when the descriptor
/// omits the media type, so an absent type is treated as gzip.
fn is_gzip(media_type: Option<&str>) -> bool {
    media_type.is_none_or(|m| GZIP_MEDIA_TYPES.contains(&m) || m.ends_with("+gzip"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_detection_follows_media_type() {
        assert!(is_gzip(Some("application/vnd.oci.image.layer.v1.tar+gzip")));
        assert!(is_gzip(Some("application/vnd.docker.image.rootfs.diff.tar.gzip")));
        assert!(is_gzip(None));
        assert!(!is_gzip(Some("application/vnd.oci.image.layer.v1.tar")));
    }

    #[test]
    fn platform_selection_prefers_host_arch_on_linux() {
        let index = ImageIndex {
            manifests: vec![
                IndexEntry {
                    digest: "sha256:windows".into(),
                    platform: Some(IndexPlatform {
                        architecture: "amd64".into(),
                        os: "windows".into(),
                    }),
                },
                IndexEntry {
                    digest: "sha256:linux-amd64".into(),
                    platform: Some(IndexPlatform {
                        architecture: "amd64".into(),
                        os: "linux".into(),
                    }),
                },
                IndexEntry {
                    digest: "sha256:linux-arm64".into(),
                    platform: Some(IndexPlatform {
                        architecture: "arm64".into(),
                        os: "linux".into(),
                    }),
                },
            ],
        };

        let entry = select_platform(&index).unwrap();
        assert!(entry.digest.starts_with("sha256:linux-"));
    }

    #[test]
    fn empty_index_has_no_platform() {
        let index = ImageIndex { manifests: vec![] };
        assert!(matches!(
            select_platform(&index),
            Err(Error::NoPlatform { .. })
        ));
    }
}
