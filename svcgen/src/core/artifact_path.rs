//! Normalization of model-supplied artifact paths.
//!
//! Artifact file names come from the oracle and are untrusted. Every path is
//! reduced to a canonical `/`-separated relative form before it can reach the
//! filesystem; anything that could escape the target directory is rejected.

use std::fmt;

/// Why a raw path was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathRejection {
    Empty,
    Absolute,
    ParentTraversal,
    NulByte,
    TrailingSeparator,
}

impl fmt::Display for PathRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            PathRejection::Empty => "path is empty",
            PathRejection::Absolute => "path is absolute",
            PathRejection::ParentTraversal => "path contains '..'",
            PathRejection::NulByte => "path contains a NUL byte",
            PathRejection::TrailingSeparator => "path names a directory",
        };
        f.write_str(msg)
    }
}

/// Normalize a raw relative path.
///
/// - Backslashes are treated as separators.
/// - `.` components and repeated separators are dropped.
/// - Absolute paths (`/x`, `\x`, `C:x`), `..` components, NUL bytes and
///   trailing separators are rejected.
pub fn normalize_relative(raw: &str) -> Result<String, PathRejection> {
    if raw.contains('\0') {
        return Err(PathRejection::NulByte);
    }
    let unified = raw.trim().replace('\\', "/");
    if unified.is_empty() {
        return Err(PathRejection::Empty);
    }
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return Err(PathRejection::Absolute);
    }
    if unified.ends_with('/') {
        return Err(PathRejection::TrailingSeparator);
    }

    let mut parts = Vec::new();
    for component in unified.split('/') {
        match component {
            "" | "." => {}
            ".." => return Err(PathRejection::ParentTraversal),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(PathRejection::Empty);
    }
    Ok(parts.join("/"))
}

fn has_drive_prefix(path: &str) -> bool {
    let mut chars = path.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_plain_relative_paths() {
        assert_eq!(normalize_relative("run.sh").as_deref(), Ok("run.sh"));
        assert_eq!(
            normalize_relative("src/app/main.py").as_deref(),
            Ok("src/app/main.py")
        );
    }

    #[test]
    fn strips_current_dir_and_duplicate_separators() {
        assert_eq!(
            normalize_relative("./src//./main.py").as_deref(),
            Ok("src/main.py")
        );
        assert_eq!(
            normalize_relative("src\\lib\\util.js").as_deref(),
            Ok("src/lib/util.js")
        );
    }

    #[test]
    fn rejects_absolute_paths() {
        assert_eq!(normalize_relative("/etc/passwd"), Err(PathRejection::Absolute));
        assert_eq!(
            normalize_relative("\\windows\\x"),
            Err(PathRejection::Absolute)
        );
        assert_eq!(
            normalize_relative("C:/temp/x"),
            Err(PathRejection::Absolute)
        );
    }

    #[test]
    fn rejects_parent_traversal_anywhere() {
        assert_eq!(
            normalize_relative("../secret"),
            Err(PathRejection::ParentTraversal)
        );
        assert_eq!(
            normalize_relative("src/../../secret"),
            Err(PathRejection::ParentTraversal)
        );
    }

    #[test]
    fn allows_dotted_names_that_are_not_traversal() {
        assert_eq!(normalize_relative("..hidden").as_deref(), Ok("..hidden"));
        assert_eq!(normalize_relative(".env").as_deref(), Ok(".env"));
    }

    #[test]
    fn rejects_degenerate_paths() {
        assert_eq!(normalize_relative(""), Err(PathRejection::Empty));
        assert_eq!(normalize_relative("./."), Err(PathRejection::Empty));
        assert_eq!(
            normalize_relative("src/"),
            Err(PathRejection::TrailingSeparator)
        );
        assert_eq!(normalize_relative("a\0b"), Err(PathRejection::NulByte));
    }
}
