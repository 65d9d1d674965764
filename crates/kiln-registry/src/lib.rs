//! Docker Registry v2 client for kiln: a `Registry` trait kept
//! deliberately narrow (exactly the operations the core needs) plus one
//! default implementation that talks to a real registry over HTTP.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use kiln_types::{KilnError, KilnErrorKind};
use serde::{Deserialize, Serialize};

/// The subset of an image config the core needs for `ONBUILD` inheritance
/// and label inspection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub on_build: Vec<String>,
    pub parent: Option<String>,
}

/// Registry operations the kiln core consumes. Implementations hide
/// registry-specific deletion quirks (authorization scopes, tag-vs-manifest
/// endpoints) behind a fallback ladder.
pub trait Registry {
    fn tags(&self, repo: &str) -> Result<Vec<String>, KilnError>;
    fn get_config_file(&self, reference: &str) -> Result<ConfigFile, KilnError>;
    fn push_image(&self, reference: &str, labels: &BTreeMap<String, String>) -> Result<(), KilnError>;
    fn delete_image(&self, reference: &str) -> Result<(), KilnError>;
    fn exists(&self, reference: &str) -> Result<bool, KilnError>;
    fn create_repo(&self, repo: &str) -> Result<(), KilnError>;
    fn delete_repo(&self, repo: &str) -> Result<(), KilnError>;
}

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT: &str = concat!("kiln/", env!("CARGO_PKG_VERSION"));

/// A parsed `repository:tag` or `repository@digest` reference.
#[derive(Debug, Clone)]
struct ParsedReference {
    repository: String,
    identifier: String,
    by_digest: bool,
}

fn parse_reference(reference: &str) -> ParsedReference {
    if let Some((repo, digest)) = reference.split_once('@') {
        return ParsedReference { repository: repo.to_string(), identifier: digest.to_string(), by_digest: true };
    }
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => ParsedReference { repository: repo.to_string(), identifier: tag.to_string(), by_digest: false },
        _ => ParsedReference { repository: reference.to_string(), identifier: "latest".to_string(), by_digest: false },
    }
}

/// Which delete endpoint shape worked last time, so subsequent deletes on
/// the same registry instance skip straight to it instead of re-probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteVariant {
    TagReference,
    ManifestDigest,
}

const DELETE_LADDER: [DeleteVariant; 2] = [DeleteVariant::TagReference, DeleteVariant::ManifestDigest];

/// Default `Registry` implementation talking to a Docker Registry HTTP API
/// v2-compatible endpoint.
pub struct DockerRegistryV2Client {
    base_url: String,
    client: reqwest::blocking::Client,
    working_delete_variant: Mutex<Option<DeleteVariant>>,
}

impl DockerRegistryV2Client {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self { base_url: base_url.into().trim_end_matches('/').to_string(), client, working_delete_variant: Mutex::new(None) }
    }

    fn manifest_url(&self, repository: &str, identifier: &str) -> String {
        format!("{}/v2/{}/manifests/{}", self.base_url, repository, identifier)
    }

    fn tags_url(&self, repository: &str) -> String {
        format!("{}/v2/{}/tags/list", self.base_url, repository)
    }

    fn delete_via(&self, variant: DeleteVariant, parsed: &ParsedReference) -> Result<(), KilnError> {
        let identifier = match variant {
            DeleteVariant::TagReference => parsed.identifier.clone(),
            DeleteVariant::ManifestDigest if parsed.by_digest => parsed.identifier.clone(),
            DeleteVariant::ManifestDigest => {
                return Err(KilnError::new(KilnErrorKind::RuntimeError, "manifest-digest delete requires a digest reference"));
            }
        };
        let url = self.manifest_url(&parsed.repository, &identifier);
        let response = self
            .client
            .delete(&url)
            .send()
            .map_err(|e| KilnError::new(KilnErrorKind::RuntimeError, format!("delete request failed: {e}")))?;
        match response.status() {
            reqwest::StatusCode::OK | reqwest::StatusCode::ACCEPTED | reqwest::StatusCode::NOT_FOUND => Ok(()),
            status => Err(KilnError::new(KilnErrorKind::RuntimeError, format!("unexpected status during delete: {status}"))),
        }
    }
}

impl Registry for DockerRegistryV2Client {
    fn tags(&self, repo: &str) -> Result<Vec<String>, KilnError> {
        #[derive(Deserialize)]
        struct TagsResponse {
            tags: Vec<String>,
        }
        let url = self.tags_url(repo);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| KilnError::new(KilnErrorKind::RuntimeError, format!("tags request failed: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let parsed: TagsResponse = response
            .json()
            .map_err(|e| KilnError::new(KilnErrorKind::RuntimeError, format!("failed to parse tags response: {e}")))?;
        Ok(parsed.tags)
    }

    fn get_config_file(&self, reference: &str) -> Result<ConfigFile, KilnError> {
        let parsed = parse_reference(reference);
        let url = self.manifest_url(&parsed.repository, &parsed.identifier);
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.docker.distribution.manifest.v2+json")
            .send()
            .map_err(|e| KilnError::new(KilnErrorKind::RuntimeError, format!("config fetch failed: {e}")))?;
        if !response.status().is_success() {
            return Err(KilnError::new(KilnErrorKind::RuntimeError, format!("unexpected status fetching config: {}", response.status())));
        }
        response
            .json::<ConfigFile>()
            .map_err(|e| KilnError::new(KilnErrorKind::RuntimeError, format!("failed to parse config file: {e}")))
    }

    fn push_image(&self, reference: &str, labels: &BTreeMap<String, String>) -> Result<(), KilnError> {
        let parsed = parse_reference(reference);
        let url = self.manifest_url(&parsed.repository, &parsed.identifier);
        let body = serde_json::json!({ "labels": labels });
        let response = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .map_err(|e| KilnError::new(KilnErrorKind::RuntimeError, format!("push request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(KilnError::new(KilnErrorKind::RuntimeError, format!("unexpected status during push: {}", response.status())));
        }
        Ok(())
    }

    fn delete_image(&self, reference: &str) -> Result<(), KilnError> {
        let parsed = parse_reference(reference);

        if let Some(variant) = *self.working_delete_variant.lock().unwrap() {
            if self.delete_via(variant, &parsed).is_ok() {
                return Ok(());
            }
        }

        let mut last_err = None;
        for variant in DELETE_LADDER {
            match self.delete_via(variant, &parsed) {
                Ok(()) => {
                    *self.working_delete_variant.lock().unwrap() = Some(variant);
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(?variant, error = %e, "delete variant failed, trying next");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| KilnError::new(KilnErrorKind::RuntimeError, "no delete variant available")))
    }

    fn exists(&self, reference: &str) -> Result<bool, KilnError> {
        let parsed = parse_reference(reference);
        let url = self.manifest_url(&parsed.repository, &parsed.identifier);
        let response = self
            .client
            .head(&url)
            .send()
            .map_err(|e| KilnError::new(KilnErrorKind::RuntimeError, format!("exists check failed: {e}")))?;
        match response.status() {
            reqwest::StatusCode::OK => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status => Err(KilnError::new(KilnErrorKind::RuntimeError, format!("unexpected status during exists check: {status}"))),
        }
    }

    fn create_repo(&self, _repo: &str) -> Result<(), KilnError> {
        // Docker Registry v2 creates repositories implicitly on first push.
        Ok(())
    }

    fn delete_repo(&self, repo: &str) -> Result<(), KilnError> {
        let tags = self.tags(repo)?;
        for tag in tags {
            self.delete_image(&format!("{repo}:{tag}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reference_splits_tag() {
        let parsed = parse_reference("registry.example.com/app:v1");
        assert_eq!(parsed.repository, "registry.example.com/app");
        assert_eq!(parsed.identifier, "v1");
        assert!(!parsed.by_digest);
    }

    #[test]
    fn parse_reference_splits_digest() {
        let parsed = parse_reference("registry.example.com/app@sha256:deadbeef");
        assert_eq!(parsed.repository, "registry.example.com/app");
        assert_eq!(parsed.identifier, "sha256:deadbeef");
        assert!(parsed.by_digest);
    }

    #[test]
    fn parse_reference_without_tag_defaults_to_latest() {
        let parsed = parse_reference("registry.example.com/app");
        assert_eq!(parsed.identifier, "latest");
    }

    #[test]
    fn parse_reference_with_port_is_not_mistaken_for_tag() {
        let parsed = parse_reference("registry.example.com:5000/app");
        assert_eq!(parsed.repository, "registry.example.com:5000/app");
        assert_eq!(parsed.identifier, "latest");
    }

    #[test]
    fn new_client_trims_trailing_slash() {
        let client = DockerRegistryV2Client::new("https://registry.example.com/");
        assert_eq!(client.base_url, "https://registry.example.com");
    }
}
