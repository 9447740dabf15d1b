// Numan Thabit 2025
use std::{collections::HashSet, net::SocketAddr, sync::Arc};

use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use url::Url;

use crate::error::LoadCheckError;

/// Declarative description of a target, as it appears in configuration.
#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TargetSpec {
    pub name: String,
    #[serde_as(as = "DisplayFromStr")]
    pub url: Url,
    #[serde(default)]
    pub path: Option<String>,
    /// Marker the response body must contain for a request to count as a success.
    #[serde(default)]
    pub expect_body: Option<String>,
    /// Pin the URL host to this socket address instead of resolving it.
    #[serde(default)]
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub resolve: Option<SocketAddr>,
}

impl TargetSpec {
    pub fn new(name: impl Into<String>, url: Url) -> Self {
        Self {
            name: name.into(),
            url,
            path: None,
            expect_body: None,
            resolve: None,
        }
    }

    pub fn with_expect_body(mut self, marker: impl Into<String>) -> Self {
        self.expect_body = Some(marker.into());
        self
    }
}

/// A named HTTP endpoint exercised during the run. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    name: String,
    base_url: Url,
    request_url: Url,
    expect_body: Option<String>,
    resolve: Option<SocketAddr>,
}

impl Target {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `base_url` joined with the configured request path.
    pub fn request_url(&self) -> &Url {
        &self.request_url
    }

    pub fn expect_body(&self) -> Option<&str> {
        self.expect_body.as_deref()
    }

    pub fn resolve(&self) -> Option<SocketAddr> {
        self.resolve
    }

    fn from_spec(spec: &TargetSpec) -> Result<Self, LoadCheckError> {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(LoadCheckError::invalid("target name must not be empty"));
        }
        match spec.url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(LoadCheckError::invalid(format!(
                    "target {name}: unsupported scheme '{other}' (expected http or https)"
                )))
            }
        }
        if spec.url.host_str().is_none() {
            return Err(LoadCheckError::invalid(format!(
                "target {name}: url {} has no host",
                spec.url
            )));
        }
        let request_url = match spec.path.as_deref() {
            Some(path) if !path.is_empty() => spec.url.join(path).map_err(|err| {
                LoadCheckError::invalid(format!("target {name}: invalid path '{path}': {err}"))
            })?,
            _ => spec.url.clone(),
        };
        Ok(Self {
            name: name.to_string(),
            base_url: spec.url.clone(),
            request_url,
            expect_body: spec.expect_body.clone().filter(|marker| !marker.is_empty()),
            resolve: spec.resolve,
        })
    }
}

/// Ordered, read-only set of targets for one run.
#[derive(Debug, Clone)]
pub struct TargetRegistry {
    targets: Vec<Arc<Target>>,
}

impl TargetRegistry {
    pub fn from_specs(specs: &[TargetSpec]) -> Result<Self, LoadCheckError> {
        if specs.is_empty() {
            return Err(LoadCheckError::invalid("at least one target is required"));
        }
        let mut seen = HashSet::with_capacity(specs.len());
        let mut targets = Vec::with_capacity(specs.len());
        for spec in specs {
            let target = Target::from_spec(spec)?;
            if !seen.insert(target.name.clone()) {
                return Err(LoadCheckError::invalid(format!(
                    "duplicate target name '{}'",
                    target.name
                )));
            }
            targets.push(Arc::new(target));
        }
        Ok(Self { targets })
    }

    pub fn targets(&self) -> &[Arc<Target>] {
        &self.targets
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Target>> {
        self.targets.iter().find(|target| target.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|target| target.name())
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// The two ingress hosts validated on every pull request.
pub fn default_specs() -> Vec<TargetSpec> {
    ["foo", "bar"]
        .into_iter()
        .filter_map(|service| {
            let host = format!("{service}.localhost");
            let url = Url::parse(&format!("http://{host}/")).ok()?;
            Some(TargetSpec::new(host, url).with_expect_body(service))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, url: &str) -> TargetSpec {
        TargetSpec::new(name, Url::parse(url).expect("valid url"))
    }

    #[test]
    fn registry_preserves_declaration_order() {
        let registry = TargetRegistry::from_specs(&[
            spec("foo.localhost", "http://foo.localhost/"),
            spec("bar.localhost", "http://bar.localhost/"),
        ])
        .expect("registry builds");
        let names: Vec<_> = registry.names().collect();
        assert_eq!(names, vec!["foo.localhost", "bar.localhost"]);
        assert!(registry.get("bar.localhost").is_some());
        assert!(registry.get("baz.localhost").is_none());
    }

    #[test]
    fn registry_rejects_empty_list() {
        let err = TargetRegistry::from_specs(&[]).expect_err("empty registry must fail");
        assert!(err.to_string().contains("at least one target"));
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let err = TargetRegistry::from_specs(&[
            spec("foo.localhost", "http://foo.localhost/"),
            spec("foo.localhost", "http://127.0.0.1:8080/"),
        ])
        .expect_err("duplicate names must fail");
        assert!(err.to_string().contains("duplicate target name"));
    }

    #[test]
    fn registry_rejects_non_http_scheme() {
        let err = TargetRegistry::from_specs(&[spec("ftp", "ftp://example.com/")])
            .expect_err("ftp must fail");
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn request_url_joins_path() {
        let mut with_path = spec("foo.localhost", "http://foo.localhost/");
        with_path.path = Some("/healthz".into());
        let registry = TargetRegistry::from_specs(&[with_path]).expect("registry builds");
        let target = &registry.targets()[0];
        assert_eq!(target.request_url().as_str(), "http://foo.localhost/healthz");
        assert_eq!(target.base_url().as_str(), "http://foo.localhost/");
    }

    #[test]
    fn default_specs_cover_both_services() {
        let specs = default_specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "foo.localhost");
        assert_eq!(specs[0].expect_body.as_deref(), Some("foo"));
        assert_eq!(specs[1].url.as_str(), "http://bar.localhost/");
    }
}
