// split-core/src/storage/uri.rs

//! Path syntax for datasets.
//!
//! A [`Uri`] is a single `scheme://host/path` location. A [`UriSpec`] is the
//! full user-facing string: one or more paths joined by `;` or `,`, an
//! optional `?key=value&...` argument list and an optional `#cachefile`
//! suffix.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::{Result, SplitError};

/// A parsed location. `protocol` keeps its `://` suffix and is empty for bare
/// local paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uri {
    pub protocol: String,
    pub host: String,
    pub name: String,
}

impl Uri {
    /// Splits `scheme://host/path`; a plain path has an empty scheme and host.
    pub fn parse(uri: &str) -> Self {
        match uri.find("://") {
            None => Self {
                protocol: String::new(),
                host: String::new(),
                name: uri.to_string(),
            },
            Some(pos) => {
                let protocol = uri[..pos + 3].to_string();
                let rest = &uri[pos + 3..];
                let (host, name) = match rest.find('/') {
                    Some(slash) => (rest[..slash].to_string(), rest[slash..].to_string()),
                    None => (rest.to_string(), "/".to_string()),
                };
                Self { protocol, host, name }
            }
        }
    }

    /// The scheme without the `://` suffix, empty for bare paths.
    pub fn scheme(&self) -> &str {
        self.protocol.trim_end_matches("://")
    }

    /// Path on the local filesystem for bare and `file://` locations.
    pub fn local_path(&self) -> PathBuf {
        PathBuf::from(format!("{}{}", self.host, self.name))
    }

    /// Location of `child` inside this directory.
    pub fn join(&self, child: &str) -> Self {
        let mut name = self.name.trim_end_matches('/').to_string();
        name.push('/');
        name.push_str(child.trim_start_matches('/'));
        Self {
            protocol: self.protocol.clone(),
            host: self.host.clone(),
            name,
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.protocol, self.host, self.name)
    }
}

/// A dataset string split into its paths, arguments and cache file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriSpec {
    /// Path part with arguments and cache suffix removed.
    pub uri: String,
    pub args: BTreeMap<String, String>,
    /// Cache file, already suffixed with `.split{N}.part{K}` when `N != 1`.
    pub cache_file: Option<String>,
}

impl UriSpec {
    /// Parses `paths?key=value&...#cachefile` for worker `rank` of
    /// `world_size`.
    ///
    /// # Errors
    ///
    /// Returns a config error if `#` or `?` appears more than once, the cache
    /// name or path is empty, or an argument is not `key=value`.
    pub fn parse(spec: &str, rank: u32, world_size: u32) -> Result<Self> {
        let mut parts = spec.split('#');
        let head = parts.next().unwrap_or_default();
        let cache = parts.next();
        if parts.next().is_some() {
            return Err(SplitError::config(format!(
                "only one '#' is allowed in a dataset uri: {spec}"
            )));
        }
        let cache_file = match cache {
            None => None,
            Some("") => {
                return Err(SplitError::config(format!("empty cache file name in {spec}")))
            }
            Some(name) if world_size != 1 => {
                Some(format!("{name}.split{world_size}.part{rank}"))
            }
            Some(name) => Some(name.to_string()),
        };

        let mut pieces = head.split('?');
        let uri = pieces.next().unwrap_or_default().to_string();
        let query = pieces.next();
        if pieces.next().is_some() {
            return Err(SplitError::config(format!(
                "only one '?' is allowed in a dataset uri: {spec}"
            )));
        }

        let mut args = BTreeMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let mut kv = pair.split('=');
                match (kv.next(), kv.next(), kv.next()) {
                    (Some(key), Some(value), None) if !key.is_empty() => {
                        args.insert(key.to_string(), value.to_string());
                    }
                    _ => {
                        return Err(SplitError::config(format!(
                            "invalid uri argument '{pair}', expected key=value"
                        )))
                    }
                }
            }
        }

        if uri.is_empty() {
            return Err(SplitError::config(format!("no path in dataset uri: {spec}")));
        }

        Ok(Self { uri, args, cache_file })
    }

    /// Every path named by the spec, in listed order.
    pub fn paths(&self) -> Vec<Uri> {
        split_paths(&self.uri)
    }
}

/// Splits a multi-path string on `;` and `,`, dropping empty segments.
pub fn split_paths(uri: &str) -> Vec<Uri> {
    uri.split(|c: char| c == ';' || c == ',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(Uri::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_path() {
        let uri = Uri::parse("/data/train.txt");
        assert_eq!(uri.protocol, "");
        assert_eq!(uri.host, "");
        assert_eq!(uri.name, "/data/train.txt");
        assert_eq!(uri.scheme(), "");
        assert_eq!(uri.local_path(), PathBuf::from("/data/train.txt"));
    }

    #[test]
    fn test_parse_with_scheme() {
        let uri = Uri::parse("s3://bucket/prefix/part-0");
        assert_eq!(uri.protocol, "s3://");
        assert_eq!(uri.host, "bucket");
        assert_eq!(uri.name, "/prefix/part-0");
        assert_eq!(uri.scheme(), "s3");
        assert_eq!(uri.to_string(), "s3://bucket/prefix/part-0");

        let uri = Uri::parse("file:///tmp/x");
        assert_eq!(uri.host, "");
        assert_eq!(uri.local_path(), PathBuf::from("/tmp/x"));

        let uri = Uri::parse("hdfs://namenode");
        assert_eq!(uri.host, "namenode");
        assert_eq!(uri.name, "/");
    }

    #[test]
    fn test_join() {
        let dir = Uri::parse("mem:///data/");
        assert_eq!(dir.join("a.txt").to_string(), "mem:///data/a.txt");
        let dir = Uri::parse("/data");
        assert_eq!(dir.join("sub").name, "/data/sub");
    }

    #[test]
    fn test_spec_plain() {
        let spec = UriSpec::parse("/data/a.txt", 0, 1).unwrap();
        assert_eq!(spec.uri, "/data/a.txt");
        assert!(spec.args.is_empty());
        assert!(spec.cache_file.is_none());
    }

    #[test]
    fn test_spec_cache_file_suffix() {
        let spec = UriSpec::parse("/data/a.txt#/tmp/cache", 0, 1).unwrap();
        assert_eq!(spec.cache_file.as_deref(), Some("/tmp/cache"));

        let spec = UriSpec::parse("/data/a.txt#/tmp/cache", 2, 4).unwrap();
        assert_eq!(spec.cache_file.as_deref(), Some("/tmp/cache.split4.part2"));
    }

    #[test]
    fn test_spec_args() {
        let spec = UriSpec::parse("/data/a.rec?format=recordio&index=/data/a.idx", 0, 1).unwrap();
        assert_eq!(spec.uri, "/data/a.rec");
        assert_eq!(spec.args.get("format").map(String::as_str), Some("recordio"));
        assert_eq!(spec.args.get("index").map(String::as_str), Some("/data/a.idx"));
    }

    #[test]
    fn test_spec_rejects_malformed() {
        assert!(UriSpec::parse("/a#b#c", 0, 1).is_err());
        assert!(UriSpec::parse("/a?x=1?y=2", 0, 1).is_err());
        assert!(UriSpec::parse("/a?novalue", 0, 1).is_err());
        assert!(UriSpec::parse("/a?k=v=w", 0, 1).is_err());
        assert!(UriSpec::parse("/a#", 0, 1).is_err());
        assert!(UriSpec::parse("?k=v", 0, 1).is_err());
    }

    #[test]
    fn test_multiple_paths() {
        let spec = UriSpec::parse("/a.txt;/b.txt,mem:///c.txt", 0, 1).unwrap();
        let paths = spec.paths();
        assert_eq!(paths.len(), 3);
        assert_eq!(paths[0].name, "/a.txt");
        assert_eq!(paths[1].name, "/b.txt");
        assert_eq!(paths[2].protocol, "mem://");
    }
}
