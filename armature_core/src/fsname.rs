//! Filesystem-safe names for cache keys.
//!
//! A name becomes a single path segment: `\` and `|` are backslash-escaped,
//! `/` becomes `|`, and a leading `.` is escaped so the segment is never a
//! hidden file or a `.name.lock` lock file.

use crate::error::{Error, Result};
use crate::repo::RepoKind;

/// Escape character reserved for path separators.
pub const SEPARATOR_ESCAPE: char = '|';

/// Turn an arbitrary string into a single safe path segment.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    for (i, c) in name.chars().enumerate() {
        match c {
            '\\' | SEPARATOR_ESCAPE => {
                out.push('\\');
                out.push(c);
            }
            '/' => out.push(SEPARATOR_ESCAPE),
            '.' if i == 0 => out.push_str("\\."),
            _ => out.push(c),
        }
    }
    out
}

/// Inverse of [`sanitize`].
pub fn unsanitize(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            SEPARATOR_ESCAPE => out.push('/'),
            _ => out.push(c),
        }
    }
    out
}

/// Cache key for a repository: the sanitized form of `kind:url`.
pub fn repo_id(kind: RepoKind, url: &str) -> String {
    sanitize(&format!("{}:{}", kind.as_str(), url))
}

/// Recover the kind and URL from a repository cache key.
pub fn parse_repo_id(id: &str) -> Result<(RepoKind, String)> {
    let raw = unsanitize(id);
    let (kind, url) = raw
        .split_once(':')
        .ok_or_else(|| Error::UnknownRepoKind { id: id.to_string() })?;
    let kind = RepoKind::parse(kind).ok_or_else(|| Error::UnknownRepoKind { id: id.to_string() })?;
    Ok((kind, url.to_string()))
}
