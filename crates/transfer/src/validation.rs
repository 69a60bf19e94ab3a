//! Resource id rules.
//!
//! Ids are `/`-separated and relative to the storage root on every platform.

use crate::VfsError;

/// Returns the canonical form of `resource_id`.
///
/// `.` segments and repeated separators are dropped, so `"./docs//a.txt"`
/// becomes `"docs/a.txt"`. Fails with `InvalidResourcePath` for ids that are
/// empty, start at the root, climb with `..`, contain a backslash or NUL, or
/// begin with a drive prefix such as `C:`.
pub fn normalize_resource_id(resource_id: &str) -> Result<String, VfsError> {
    let invalid = |reason: &str| VfsError::invalid_path(format!("{reason}: {resource_id:?}"));

    if resource_id.starts_with('/') {
        return Err(invalid("resource id must be relative"));
    }
    if resource_id.contains(['\\', '\0']) {
        return Err(invalid("resource id contains a reserved character"));
    }

    let mut segments = Vec::new();
    for segment in resource_id.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(invalid("resource id climbs above the root")),
            _ if segments.is_empty() && segment.ends_with(':') => {
                return Err(invalid("resource id starts with a drive prefix"));
            }
            _ => segments.push(segment),
        }
    }
    if segments.is_empty() {
        return Err(invalid("resource id names no resource"));
    }
    Ok(segments.join("/"))
}

/// Last segment of a resource id.
pub fn resource_name(resource_id: &str) -> &str {
    resource_id
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(resource_id)
}

/// Folder ids above `resource_id`, nearest first.
///
/// `"a/b/c.txt"` yields `["a/b", "a"]`.
pub fn ancestor_ids(resource_id: &str) -> Vec<String> {
    let trimmed = resource_id.trim_matches('/');
    let mut ancestors = Vec::new();
    let mut current = trimmed;
    while let Some((parent, _)) = current.rsplit_once('/') {
        if !parent.is_empty() && parent != "." {
            ancestors.push(parent.to_string());
        }
        current = parent;
    }
    ancestors
}
