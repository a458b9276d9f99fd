//! Server path and transcoding helpers.
//!
//! Two separate layers that must never be mixed: percent-encoding for URI
//! payload segments and entity escaping for text embedded in DAV XML bodies.
//! A value that appears inside a `D:href` gets percent-encoded first, then
//! entity-escaped; decoding reverses the order.

use crate::error::{GateError, Result};

/// Root sigil of upstream server paths (`$/a/b.c`).
pub const ROOT_SIGIL: &str = "$";

/// Canonical server-root path.
pub const SERVER_ROOT: &str = "$/";

/// Reserved directory where the upstream stores DAV property blobs.
pub const PROP_FOLDER: &str = ".svnprops";

/// Blob inside [`PROP_FOLDER`] that holds the owning folder's own properties.
pub const DIR_PROP_FILE: &str = ".dirprops";

fn needs_percent(b: u8) -> bool {
    matches!(b, b'%' | b'#' | b' ' | b'^' | b'{' | b'[' | b'}' | b']' | b';' | b'&')
        || !(0x20..=0x7e).contains(&b)
}

/// Percent-encode a payload segment. Non-ASCII characters become the
/// percent-encoded form of their UTF-8 byte sequence.
pub fn encode_percent(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if needs_percent(b) {
            out.push('%');
            out.push_str(&format!("{:02X}", b));
        } else {
            out.push(b as char);
        }
    }
    out
}

/// Exact inverse of [`encode_percent`].
pub fn decode_percent(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| GateError::UnsupportedPath(format!("truncated escape in {s:?}")))?;
            let hex = std::str::from_utf8(hex)
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| GateError::UnsupportedPath(format!("bad escape in {s:?}")))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| GateError::UnsupportedPath(format!("non-UTF-8 after decode: {s:?}")))
}

/// Entity-escape text for embedding in a DAV XML body.
pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Inverse of [`escape_xml`].
pub fn unescape_xml(s: &str) -> String {
    s.replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&amp;", "&")
}

/// Join a server path and a child segment.
pub fn join(parent: &str, segment: &str) -> String {
    let trimmed = segment.trim_matches('/');
    if parent.ends_with('/') {
        format!("{parent}{trimmed}")
    } else {
        format!("{parent}/{trimmed}")
    }
}

/// Split a server path into `(parent, final segment)`.
pub fn split(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => (parent(trimmed).to_string(), trimmed[pos + 1..].to_string()),
        None => (SERVER_ROOT.to_string(), trimmed.to_string()),
    }
}

/// Parent directory of a server path. Stripping the final segment of a
/// top-level path yields the canonical server root.
pub fn parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => {
            let head = &trimmed[..pos];
            if head.is_empty() || head == ROOT_SIGIL {
                SERVER_ROOT.to_string()
            } else {
                head.to_string()
            }
        }
        None => SERVER_ROOT.to_string(),
    }
}

/// True for the canonical server root (either spelling).
pub fn is_server_root(path: &str) -> bool {
    path == SERVER_ROOT || path == ROOT_SIGIL
}

/// Result of a precise path comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMatch {
    /// Byte-for-byte equal.
    Equal,
    /// Equal ignoring ASCII case only.
    CaseMismatch,
    /// Different paths under any policy.
    Different,
}

/// Global case-sensitivity policy for path comparison. All comparisons in the
/// gateway route through this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasePolicy {
    Sensitive,
    Insensitive,
}

impl CasePolicy {
    /// Three-way compare: distinguishes a precise case mismatch from a true
    /// difference, independent of the policy.
    pub fn compare(self, a: &str, b: &str) -> PathMatch {
        if a == b {
            PathMatch::Equal
        } else if a.eq_ignore_ascii_case(b) {
            PathMatch::CaseMismatch
        } else {
            PathMatch::Different
        }
    }

    /// Whether the two paths name the same item under this policy.
    pub fn matches(self, a: &str, b: &str) -> bool {
        match self.compare(a, b) {
            PathMatch::Equal => true,
            PathMatch::CaseMismatch => self == CasePolicy::Insensitive,
            PathMatch::Different => false,
        }
    }

    /// Canonical map key for a path under this policy.
    pub fn key(self, path: &str) -> String {
        match self {
            CasePolicy::Sensitive => path.to_string(),
            CasePolicy::Insensitive => path.to_ascii_lowercase(),
        }
    }

    /// Whether `ancestor` is `path` or one of its ancestors.
    pub fn is_ancestor_or_self(self, ancestor: &str, path: &str) -> bool {
        if self.matches(ancestor, path) || is_server_root(ancestor) {
            return true;
        }
        let prefix = format!("{}/", ancestor.trim_end_matches('/'));
        match self {
            CasePolicy::Sensitive => path.starts_with(&prefix),
            CasePolicy::Insensitive => path
                .get(..prefix.len())
                .map(|head| head.eq_ignore_ascii_case(&prefix))
                .unwrap_or(false),
        }
    }

    /// Path segments of `path` below `root`, or `None` when `path` is not
    /// inside `root`'s subtree.
    pub fn segments_below<'a>(self, root: &str, path: &'a str) -> Option<Vec<&'a str>> {
        if !self.is_ancestor_or_self(root, path) {
            return None;
        }
        if self.matches(root, path) {
            return Some(Vec::new());
        }
        let skip = root.trim_end_matches('/').len() + 1;
        Some(path[skip..].split('/').filter(|s| !s.is_empty()).collect())
    }
}

/// Maps a property-blob path to its logical owner, if `path` points inside a
/// reserved property folder.
///
/// `dir/.svnprops/.dirprops` owns `dir`; `dir/.svnprops/f` owns `dir/f`.
pub fn property_owner(path: &str) -> Option<String> {
    let (prop_dir, name) = split(path);
    let (owner_dir, marker) = split(&prop_dir);
    if marker != PROP_FOLDER {
        return None;
    }
    if name == DIR_PROP_FILE {
        Some(owner_dir)
    } else {
        Some(join(&owner_dir, &name))
    }
}

/// True when `path` names a blob inside a reserved property folder.
pub fn is_property_path(path: &str) -> bool {
    property_owner(path).is_some()
}

/// True when `path` names a reserved property folder itself.
pub fn is_property_folder(path: &str) -> bool {
    split(path).1 == PROP_FOLDER
}
