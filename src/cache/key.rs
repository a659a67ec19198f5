//! Cache keys and per-ecosystem conventions
//!
//! Keys render as `<artifactType>:<artifactPath>` and are shared verbatim by
//! all three tiers.

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default TTL for cached artifacts (24 hours)
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL for docker artifacts (7 days)
pub const DOCKER_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Cache key: artifact type plus artifact path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    artifact_type: String,
    path: String,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(artifact_type: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            artifact_type: artifact_type.into(),
            path: path.into(),
        }
    }

    /// Parse a rendered `<type>:<path>` key
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.split_once(':') {
            Some((ty, path)) if !ty.is_empty() && !path.is_empty() => Ok(Self::new(ty, path)),
            _ => Err(Error::InvalidRequest(format!(
                "cache key '{}' is not of the form <type>:<path>",
                raw
            ))),
        }
    }

    /// Artifact type (`npm`, `maven`, `docker`, ...)
    #[inline]
    pub fn artifact_type(&self) -> &str {
        &self.artifact_type
    }

    /// Artifact path within its ecosystem
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Default TTL for this key's artifact type
    pub fn default_ttl(&self) -> Duration {
        ttl_for_type(&self.artifact_type)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.artifact_type, self.path)
    }
}

/// TTL policy: docker artifacts live 7 days, everything else 24 hours
pub fn ttl_for_type(artifact_type: &str) -> Duration {
    if artifact_type.eq_ignore_ascii_case("docker") {
        DOCKER_TTL
    } else {
        DEFAULT_TTL
    }
}

/// Guess an artifact type from a path's file name and layout
pub fn guess_artifact_type(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    let file = lower.rsplit('/').next().unwrap_or(&lower);

    if file.ends_with(".prov")
        || file == "index.yaml"
        || (file.ends_with(".tgz") && lower.contains("charts/"))
    {
        return "helm";
    }
    if [".jar", ".pom", ".war", ".aar", ".module"]
        .iter()
        .any(|ext| file.ends_with(ext))
        || file == "maven-metadata.xml"
    {
        return "maven";
    }
    if file.ends_with(".tgz") {
        return "npm";
    }
    if [".whl", ".tar.gz", ".egg", ".zip", ".tar.bz2"]
        .iter()
        .any(|ext| file.ends_with(ext))
    {
        return "pypi";
    }
    if lower.contains("/manifests/") || lower.contains("/blobs/") || file.starts_with("sha256:") {
        return "docker";
    }
    "unknown"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_and_parse() {
        let key = CacheKey::new("npm", "lodash/-/lodash-4.17.21.tgz");
        assert_eq!(key.to_string(), "npm:lodash/-/lodash-4.17.21.tgz");
        assert_eq!(CacheKey::parse(&key.to_string()).unwrap(), key);
    }

    #[test]
    fn test_parse_keeps_colons_in_path() {
        let key = CacheKey::parse("docker:library/nginx/blobs/sha256:abc").unwrap();
        assert_eq!(key.artifact_type(), "docker");
        assert_eq!(key.path(), "library/nginx/blobs/sha256:abc");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(CacheKey::parse("no-separator").is_err());
        assert!(CacheKey::parse(":path").is_err());
        assert!(CacheKey::parse("npm:").is_err());
    }

    #[test]
    fn test_ttl_policy() {
        assert_eq!(ttl_for_type("docker"), Duration::from_secs(168 * 3600));
        assert_eq!(ttl_for_type("npm"), Duration::from_secs(24 * 3600));
        assert_eq!(CacheKey::new("docker", "x").default_ttl(), DOCKER_TTL);
    }

    #[test]
    fn test_guess_artifact_type() {
        assert_eq!(guess_artifact_type("lodash/-/lodash-4.17.21.tgz"), "npm");
        assert_eq!(guess_artifact_type("org/slf4j/slf4j-api/2.0.9/slf4j-api-2.0.9.jar"), "maven");
        assert_eq!(guess_artifact_type("org/x/maven-metadata.xml"), "maven");
        assert_eq!(guess_artifact_type("packages/requests-2.31.0-py3-none-any.whl"), "pypi");
        assert_eq!(guess_artifact_type("charts/nginx-15.0.0.tgz"), "helm");
        assert_eq!(guess_artifact_type("library/nginx/manifests/latest"), "docker");
        assert_eq!(guess_artifact_type("README"), "unknown");
    }
}
