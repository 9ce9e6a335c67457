//! Mapping from request URLs to canonical asset paths and cache files.

use crate::error::{CacheError, CacheResult};
use std::path::{Path, PathBuf};
use url::Url;

/// Canonical identity of one requested asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetLocation {
    /// Absolute URL the asset is fetched from
    pub url: Url,
    /// URL path with scheme and host stripped, `index.html` appended to directories
    pub path: String,
    /// Cache-busting token: `?` plus the query, or empty when there is no query
    pub version: String,
    /// Location of the cached copy under the cache root
    pub cache_file: PathBuf,
}

impl AssetLocation {
    /// Canonicalize an absolute request URL against `cache_root`.
    pub fn parse(url: &str, cache_root: &Path) -> CacheResult<Self> {
        let parsed = Url::parse(url).map_err(|e| CacheError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_url(parsed, cache_root)
    }

    /// Canonicalize an already parsed URL.
    pub fn from_url(url: Url, cache_root: &Path) -> CacheResult<Self> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CacheError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        let mut path = url.path().to_string();
        if path.split('/').any(|segment| segment == "..") {
            return Err(CacheError::InvalidUrl {
                url: url.to_string(),
                reason: "path escapes the cache root".to_string(),
            });
        }
        if path.ends_with('/') {
            path.push_str("index.html");
        }

        let version = url.query().map(|q| format!("?{q}")).unwrap_or_default();
        let cache_file = cache_file_for(cache_root, &path);

        Ok(Self {
            url,
            path,
            version,
            cache_file,
        })
    }

    /// File extension of the canonical path, lowercased.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.path)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
    }
}

/// Whether an index key from a foreign cache is safe to map under a root.
pub fn is_canonical_path(path: &str) -> bool {
    path.starts_with('/') && !path.split(['/', '\\']).any(|segment| segment == "..")
}

/// Location of `path` (a canonical path with leading `/`) under `root`.
pub fn cache_file_for(root: &Path, path: &str) -> PathBuf {
    let mut file = root.to_path_buf();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        file.push(segment);
    }
    file
}

/// Content type sent to the game client for a cached file.
pub fn content_type_for(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?;
    match ext.to_ascii_lowercase().as_str() {
        "php" | "html" => Some("text/html"),
        "png" => Some("image/png"),
        "json" => Some("application/json"),
        "css" => Some("text/css"),
        "mp3" => Some("audio/mpeg"),
        "js" => Some("application/x-javascript"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_with_version() {
        let loc = AssetLocation::parse(
            "http://203.104.209.71/kcs2/img/common/a.png?version=5.1.2.0",
            Path::new("/cache"),
        )
        .unwrap();
        assert_eq!(loc.path, "/kcs2/img/common/a.png");
        assert_eq!(loc.version, "?version=5.1.2.0");
        assert_eq!(
            loc.cache_file,
            PathBuf::from("/cache/kcs2/img/common/a.png")
        );
        assert_eq!(loc.extension().as_deref(), Some("png"));
    }

    #[test]
    fn test_bare_question_mark() {
        let loc = AssetLocation::parse("http://1.2.3.4/kcs2/a.png?", Path::new("/c")).unwrap();
        assert_eq!(loc.version, "?");
    }

    #[test]
    fn test_no_query() {
        let loc = AssetLocation::parse("http://1.2.3.4/kcs2/a.png", Path::new("/c")).unwrap();
        assert_eq!(loc.version, "");
    }

    #[test]
    fn test_directory_maps_to_index() {
        let loc =
            AssetLocation::parse("http://1.2.3.4/kcscontents/news/", Path::new("/c")).unwrap();
        assert_eq!(loc.path, "/kcscontents/news/index.html");
        assert_eq!(
            loc.cache_file,
            PathBuf::from("/c/kcscontents/news/index.html")
        );
    }

    #[test]
    fn test_rejects_non_http() {
        assert!(AssetLocation::parse("ftp://1.2.3.4/a.png", Path::new("/c")).is_err());
        assert!(AssetLocation::parse("not a url", Path::new("/c")).is_err());
    }

    #[test]
    fn test_is_canonical_path() {
        assert!(is_canonical_path("/kcs2/img/a.png"));
        assert!(!is_canonical_path("kcs2/img/a.png"));
        assert!(!is_canonical_path("/kcs2/../../etc/passwd"));
        assert!(!is_canonical_path("/kcs2\\..\\a"));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("/kcs2/js/main.js"), Some("application/x-javascript"));
        assert_eq!(content_type_for("/kcs2/version.json"), Some("application/json"));
        assert_eq!(content_type_for("/kcs/sound/a.mp3"), Some("audio/mpeg"));
        assert_eq!(content_type_for("/index.html"), Some("text/html"));
        assert_eq!(content_type_for("/kcs2/resources/a.bin"), None);
    }

    proptest! {
        #[test]
        fn prop_cache_file_stays_under_root(
            segments in prop::collection::vec("[a-zA-Z0-9_.-]{1,12}", 1..6),
            query in proptest::option::of("[a-z0-9=&.]{0,16}"),
        ) {
            let mut url = format!("http://10.0.0.1/{}", segments.join("/"));
            if let Some(q) = &query {
                url.push('?');
                url.push_str(q);
            }
            let root = Path::new("/cache");
            if let Ok(loc) = AssetLocation::parse(&url, root) {
                prop_assert!(loc.cache_file.starts_with(root));
                prop_assert!(loc.path.starts_with('/'));
                prop_assert!(!loc.path.contains('?'));
                match &query {
                    Some(q) => prop_assert_eq!(loc.version, format!("?{q}")),
                    None => prop_assert_eq!(loc.version, ""),
                }
            }
        }

        #[test]
        fn prop_version_does_not_change_path(
            path in "/[a-z]{1,8}/[a-z]{1,8}\\.png",
            v1 in "[a-z0-9]{1,8}",
            v2 in "[a-z0-9]{1,8}",
        ) {
            let root = Path::new("/cache");
            let a = AssetLocation::parse(&format!("http://10.0.0.1{path}?{v1}"), root).unwrap();
            let b = AssetLocation::parse(&format!("http://10.0.0.1{path}?{v2}"), root).unwrap();
            prop_assert_eq!(a.path, b.path);
            prop_assert_eq!(a.cache_file, b.cache_file);
        }
    }
}
