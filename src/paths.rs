//! Path canonicalization.
//!
//! Scanners on different platforms report the same file in different
//! spellings (`C:\show\shot.exr`, `C:/show//shot.exr`, `./show/shot.exr`).
//! Cache keys are derived from the path when no inode identity is available,
//! so every path is rewritten into a single canonical form first:
//!
//! - forward slashes only
//! - no duplicate separators
//! - no `.` segments
//! - `..` segments kept literally (never resolved)
//! - no trailing slash, except for `/`, a drive root (`C:/`), or a bare
//!   network share (`//server/share`)
//! - a leading `//server/share` prefix is kept as one unit
//!
//! This is purely a string transform. It never touches the filesystem.

/// Rewrite `path` into canonical form.
///
/// Empty input returns an empty string. Canonicalizing an already canonical
/// path returns it unchanged.
///
/// ```
/// use snapfs_gateway::paths::canonicalize;
///
/// assert_eq!(canonicalize(r"C:\show\seq\shot\image.exr"), "C:/show/seq/shot/image.exr");
/// assert_eq!(canonicalize("//server/share//dir/./file.exr"), "//server/share/dir/file.exr");
/// ```
pub fn canonicalize(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }

    let path = path.replace('\\', "/");

    if let Some((prefix, rest)) = split_share_prefix(&path) {
        let mut out = prefix.to_string();
        for seg in segments(rest) {
            out.push('/');
            out.push_str(seg);
        }
        return out;
    }

    let joined = segments(&path).collect::<Vec<_>>().join("/");

    if path.starts_with('/') {
        return format!("/{}", joined);
    }

    // `C:/` is a root in its own right; `C:/foo/` loses the slash like any other
    if joined.len() == 2 && is_drive(&joined) && path.len() > 2 {
        return format!("{}/", joined);
    }

    joined
}

/// Canonicalize an optional path. Absent input passes through as `None`.
pub fn canonicalize_opt(path: Option<&str>) -> Option<String> {
    path.map(canonicalize)
}

/// Split `//server/share[/rest]` into (`//server/share`, `rest`).
///
/// Both the server and share components must be non-empty; `//server` alone
/// or `///x` are treated as ordinary absolute paths.
fn split_share_prefix(path: &str) -> Option<(&str, &str)> {
    let body = path.strip_prefix("//")?;
    let mut parts = body.splitn(3, '/');
    let server = parts.next()?;
    let share = parts.next()?;
    if server.is_empty() || share.is_empty() {
        return None;
    }
    let prefix_len = 2 + server.len() + 1 + share.len();
    let rest = parts.next().unwrap_or("");
    Some((&path[..prefix_len], rest))
}

/// Non-empty, non-`.` segments of a slash-separated string.
fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".")
}

fn is_drive(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
