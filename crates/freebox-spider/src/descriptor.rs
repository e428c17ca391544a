//! Plugin descriptor grammar: `location[;md5;hash]`.
//!
//! A location is one of `file://…`, `http(s)://…`, `assets://…` or a bare
//! path relative to the active source's base URL. The optional hash is
//! compared against [`md5_hex`] of the *resolved location string*, not of
//! the artifact's bytes.

use std::borrow::Cow;
use std::path::PathBuf;

use url::Url;

use crate::error::SpiderError;

/// Separator between a location and its declared hash.
pub const HASH_SEPARATOR: &str = ";md5;";

/// Lowercase hex md5 of a string.
pub fn md5_hex(text: &str) -> String {
    format!("{:x}", md5::compute(text.as_bytes()))
}

/// Where an artifact lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Local file, scheme stripped and percent-escapes decoded.
    File(PathBuf),
    Http(String),
    /// Path below the packaged-assets root.
    Asset(String),
    /// Reference to resolve against the active base URL.
    Relative(String),
}

impl Location {
    pub fn classify(location: &str) -> Self {
        if let Some(rest) = location.strip_prefix("file://") {
            let rest = urlencoding::decode(rest).unwrap_or(Cow::Borrowed(rest));
            Self::File(PathBuf::from(file_path(&rest)))
        } else if location.starts_with("http://") || location.starts_with("https://") {
            Self::Http(location.to_string())
        } else if let Some(rest) = location.strip_prefix("assets://") {
            Self::Asset(rest.to_string())
        } else {
            Self::Relative(location.to_string())
        }
    }
}

/// `file:///C:/x` leaves `/C:/x`; drop the slash before a drive letter.
fn file_path(rest: &str) -> &str {
    let bytes = rest.as_bytes();
    if bytes.len() >= 3 && bytes[0] == b'/' && bytes[1].is_ascii_alphabetic() && bytes[2] == b':' {
        &rest[1..]
    } else {
        rest
    }
}

/// A parsed plugin descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub location: String,
    pub declared_hash: Option<String>,
}

impl Descriptor {
    pub fn parse(raw: &str) -> Result<Self, SpiderError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(SpiderError::DescriptorResolution(
                "descriptor is blank".to_string(),
            ));
        }

        let (location, hash) = match raw.split_once(HASH_SEPARATOR) {
            Some((location, hash)) => (location.trim(), Some(hash.trim())),
            None => (raw, None),
        };
        if location.is_empty() {
            return Err(SpiderError::DescriptorResolution(format!(
                "descriptor '{raw}' has no location"
            )));
        }

        Ok(Self {
            location: location.to_string(),
            declared_hash: hash.filter(|h| !h.is_empty()).map(str::to_lowercase),
        })
    }

    pub fn kind(&self) -> Location {
        Location::classify(&self.location)
    }
}

/// Resolve a URI reference against a base, the way a browser would.
///
/// Backslashes are normalized to slashes first; the file-scheme
/// `file:/x` and `file:///x` forms both resolve.
pub fn resolve_reference(base: &str, reference: &str) -> Result<String, SpiderError> {
    let base = base.trim().replace('\\', "/");
    let reference = reference.trim().replace('\\', "/");
    let base = Url::parse(&base)
        .map_err(|e| SpiderError::DescriptorResolution(format!("bad base url '{base}': {e}")))?;
    let joined = base.join(&reference).map_err(|e| {
        SpiderError::DescriptorResolution(format!("cannot resolve '{reference}' against '{base}': {e}"))
    })?;
    Ok(joined.to_string())
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_hex() {
        assert_eq!(md5_hex("hello"), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_parse_plain() {
        let d = Descriptor::parse("http://example.com/a.jar").unwrap();
        assert_eq!(d.location, "http://example.com/a.jar");
        assert_eq!(d.declared_hash, None);
    }

    #[test]
    fn test_parse_with_hash() {
        let d = Descriptor::parse("http://example.com/a.jar;md5;ABCDEF").unwrap();
        assert_eq!(d.location, "http://example.com/a.jar");
        assert_eq!(d.declared_hash.as_deref(), Some("abcdef"));
    }

    #[test]
    fn test_parse_empty_hash_is_none() {
        let d = Descriptor::parse("./a.js;md5;").unwrap();
        assert_eq!(d.declared_hash, None);
    }

    #[test]
    fn test_parse_blank_rejected() {
        assert!(matches!(
            Descriptor::parse("   "),
            Err(SpiderError::DescriptorResolution(_))
        ));
        assert!(matches!(
            Descriptor::parse(";md5;abc"),
            Err(SpiderError::DescriptorResolution(_))
        ));
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            Location::classify("file:///tmp/a.js"),
            Location::File(PathBuf::from("/tmp/a.js"))
        );
        assert_eq!(
            Location::classify("file:///C:/box/a.js"),
            Location::File(PathBuf::from("C:/box/a.js"))
        );
        assert_eq!(
            Location::classify("https://x.io/a.jar"),
            Location::Http("https://x.io/a.jar".into())
        );
        assert_eq!(
            Location::classify("assets://js/a.js"),
            Location::Asset("js/a.js".into())
        );
        assert_eq!(
            Location::classify("./lib/a.js"),
            Location::Relative("./lib/a.js".into())
        );
    }

    #[test]
    fn test_classify_decodes_escaped_file_paths() {
        let resolved = resolve_reference("file:///tmp/my dir/配置/box.json", "a.js").unwrap();
        assert_eq!(resolved, "file:///tmp/my%20dir/%E9%85%8D%E7%BD%AE/a.js");
        assert_eq!(
            Location::classify(&resolved),
            Location::File(PathBuf::from("/tmp/my dir/配置/a.js"))
        );
        // Unescaped paths pass through.
        assert_eq!(
            Location::classify("file:///tmp/my dir/a.js"),
            Location::File(PathBuf::from("/tmp/my dir/a.js"))
        );
    }

    #[test]
    fn test_resolve_reference_http() {
        assert_eq!(
            resolve_reference("http://a.com/cfg/box.json", "../js/s.js").unwrap(),
            "http://a.com/js/s.js"
        );
        assert_eq!(
            resolve_reference("http://a.com/cfg/box.json", "./s.js").unwrap(),
            "http://a.com/cfg/s.js"
        );
    }

    #[test]
    fn test_resolve_reference_file_forms() {
        assert_eq!(
            resolve_reference("file:///tmp/dir/box.json", "./spider.js").unwrap(),
            "file:///tmp/dir/spider.js"
        );
        assert_eq!(
            resolve_reference("file:/tmp/dir/box.json", "sub\\spider.js").unwrap(),
            "file:///tmp/dir/sub/spider.js"
        );
    }

    #[test]
    fn test_resolve_reference_bad_base() {
        assert!(resolve_reference("not a url", "a.js").is_err());
    }
}
