//! Path helpers for the virtual namespace.
//!
//! Namespace paths are always absolute, `/` separated and compared without
//! regard to case. Nothing in here touches the disk.

use std::cmp::Ordering;
use std::fmt;

pub const SEPARATOR: char = '/';

/// Name of the metadata record stored inside every directory on disk.
pub const DIR_RECORD: &str = ".dirProperties";

/// Names starting with [`DIR_RECORD`] belong to the store, never to a child.
pub fn is_reserved_name(name: &str) -> bool {
    name.starts_with(DIR_RECORD)
}

/// Case-insensitive ordering used for child maps and remerge listings.
pub fn cmp_ignore_case(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
}

pub fn eq_ignore_case(a: &str, b: &str) -> bool {
    cmp_ignore_case(a, b) == Ordering::Equal
}

/// Normalizes separators: collapses a leading `//`, and strips trailing
/// separators from everything except the root.
pub fn fix_path(path: &str) -> String {
    let mut fixed = path;
    while fixed.starts_with("//") {
        fixed = &fixed[1..];
    }
    let trimmed = fixed.trim_end_matches(SEPARATOR);
    if trimmed.is_empty() {
        if fixed.is_empty() {
            return String::new();
        }
        return SEPARATOR.to_string();
    }
    trimmed.to_string()
}

/// Last path component. The root is its own last component.
pub fn get_last(path: &str) -> &str {
    if path == "/" {
        return path;
    }
    match path.rfind(SEPARATOR) {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Parent path; the parent of a top level entry is `/`.
pub fn strip_last(path: &str) -> &str {
    match path.rfind(SEPARATOR) {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

pub fn join(dir: &str, name: &str) -> String {
    if dir.ends_with(SEPARATOR) {
        format!("{dir}{name}")
    } else {
        format!("{dir}{SEPARATOR}{name}")
    }
}

/// `true` if `path` equals `dir` or lies somewhere beneath it.
pub fn is_within(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return true;
    }
    let path = path.to_lowercase();
    let dir = dir.to_lowercase();
    path == dir || path.starts_with(&format!("{dir}/"))
}

/// Segments of an absolute path, skipping empty ones.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|s| !s.is_empty())
}

/// Child-map key. Keeps the original spelling but orders and compares
/// case-insensitively.
#[derive(Clone, Debug)]
pub struct CiName(String);

impl CiName {
    pub fn new(name: impl Into<String>) -> Self {
        CiName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl PartialEq for CiName {
    fn eq(&self, other: &Self) -> bool {
        eq_ignore_case(&self.0, &other.0)
    }
}

impl Eq for CiName {}

impl PartialOrd for CiName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CiName {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_ignore_case(&self.0, &other.0)
    }
}

impl fmt::Display for CiName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CiName {
    fn from(s: &str) -> Self {
        CiName(s.to_string())
    }
}
