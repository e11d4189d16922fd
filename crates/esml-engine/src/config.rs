//! Loader configuration and import maps.

use serde::{Deserialize, Serialize};
use url::Url;

/// One import-map rule.
///
/// `path` is resolved against the loader's base URL. `scopes` names the
/// local scopes the target module resolves in, in addition to global.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRule {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl ImportRule {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            scopes: Vec::new(),
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }
}

/// Import map: `{ "imports": [{ "name", "path", "scopes" }] }`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportMap {
    #[serde(default)]
    pub imports: Vec<ImportRule>,
}

impl ImportMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an import map from its JSON form
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn with_rule(mut self, rule: ImportRule) -> Self {
        self.imports.push(rule);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.imports.is_empty()
    }
}

/// Module loader configuration
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Base location for top-level specifiers and import-map paths
    pub base_url: Url,

    /// Import map installed when the loader is created
    pub import_map: ImportMap,

    /// Content types accepted as JavaScript (parameters are ignored)
    pub javascript_mime_types: Vec<String>,

    /// Re-check cached modules against the network in the background.
    /// When false the fetch started alongside a cache hit is aborted.
    pub revalidate_cached: bool,

    /// Fail imports that would close a dependency cycle instead of
    /// leaving them pending forever
    pub detect_cycles: bool,

    /// Maximum number of transforms running at once
    pub transform_concurrency: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            import_map: ImportMap::default(),
            javascript_mime_types: vec![
                "application/javascript".into(),
                "text/javascript".into(),
            ],
            revalidate_cached: true,
            detect_cycles: true,
            transform_concurrency: num_cpus::get().max(1),
        }
    }
}

impl LoaderConfig {
    /// Config rooted at `base_url`
    pub fn with_base(base_url: Url) -> Self {
        Self {
            base_url,
            ..Default::default()
        }
    }

    /// Check a response content type against the accepted JavaScript types.
    pub fn is_javascript(&self, content_type: &str) -> bool {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        self.javascript_mime_types
            .iter()
            .any(|mime| mime.eq_ignore_ascii_case(essence))
    }
}

fn default_base_url() -> Url {
    std::env::current_dir()
        .ok()
        .and_then(|dir| Url::from_directory_path(dir).ok())
        .unwrap_or_else(|| Url::parse("file:///").expect("static URL parses"))
}
