//! Root-relative path computation.
//!
//! The native sources report paths in different shapes: FSEvents reports
//! absolute, NFD-decomposed paths, `ReadDirectoryChangesW` reports paths
//! relative to the watched directory, and inotify reports a bare name inside
//! a watched directory. Everything user-visible funnels through here so the
//! rules live in one place: the canonical root prefix is stripped lexically,
//! name comparison is caseless where the host filesystem is (macOS and
//! Windows), and the suffix keeps exactly the bytes the OS supplied. On
//! macOS that means decomposed names stay decomposed; matching them against
//! precomposed input is the consumer's job.

use std::io;
use std::path::{Component, Path, PathBuf};

/// Canonicalize the watch root. Symlinks are followed for the root only;
/// paths below it are never canonicalized.
pub(crate) fn canonical_root(root: &Path) -> io::Result<PathBuf> {
    #[cfg(windows)]
    {
        // fs::canonicalize returns verbatim `\\?\` paths, which the native
        // watch APIs accept but users do not expect in diagnostics
        dunce::canonicalize(root)
    }
    #[cfg(not(windows))]
    {
        std::fs::canonicalize(root)
    }
}

/// Strip the `root` prefix from `path`, lexically. Returns `None` when
/// `path` does not live under `root`. An empty result denotes the root
/// itself.
pub(crate) fn relativize(root: &Path, path: &Path) -> Option<PathBuf> {
    let mut remainder = path.components();
    for root_part in root.components() {
        match remainder.next() {
            Some(part) if components_match(root_part, part) => {}
            _ => return None,
        }
    }
    Some(remainder.as_path().to_path_buf())
}

fn components_match(a: Component<'_>, b: Component<'_>) -> bool {
    match (a, b) {
        (Component::Normal(a), Component::Normal(b)) => names_match(a, b),
        (a, b) => a == b,
    }
}

/// Name equality under the host filesystem's case rules.
///
/// Default APFS/HFS+ and NTFS lookups are case-insensitive, so two reported
/// spellings of one entry must compare equal there. Simple lowercase folding
/// covers ASCII and the BMP letters these filesystems fold themselves.
#[cfg(any(target_os = "macos", windows))]
pub(crate) fn names_match(a: &std::ffi::OsStr, b: &std::ffi::OsStr) -> bool {
    let (Some(a), Some(b)) = (a.to_str(), b.to_str()) else {
        return a == b;
    };
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

#[cfg(not(any(target_os = "macos", windows)))]
pub(crate) fn names_match(a: &std::ffi::OsStr, b: &std::ffi::OsStr) -> bool {
    a == b
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strips_root_prefix() {
        let root = Path::new("/watch/root");
        assert_eq!(
            relativize(root, Path::new("/watch/root/a/b")),
            Some(PathBuf::from("a/b"))
        );
    }

    #[test]
    fn root_itself_is_empty() {
        let root = Path::new("/watch/root");
        assert_eq!(relativize(root, root), Some(PathBuf::new()));
    }

    #[test]
    fn paths_outside_root_are_rejected() {
        let root = Path::new("/watch/root");
        assert_eq!(relativize(root, Path::new("/watch/other/a")), None);
        assert_eq!(relativize(root, Path::new("/watch")), None);
    }

    #[test]
    fn sibling_with_shared_prefix_is_rejected() {
        let root = Path::new("/watch/root");
        assert_eq!(relativize(root, Path::new("/watch/root2/a")), None);
    }

    #[test]
    fn suffix_bytes_are_preserved() {
        // decomposed "ä" (a + combining diaeresis) must come back untouched
        let root = Path::new("/watch/root");
        let rel = relativize(root, Path::new("/watch/root/a\u{0308}file")).unwrap();
        assert_eq!(rel, PathBuf::from("a\u{0308}file"));
    }

    #[cfg(any(target_os = "macos", windows))]
    #[test]
    fn root_comparison_is_caseless() {
        let root = Path::new("/Watch/Root");
        assert_eq!(
            relativize(root, Path::new("/watch/rOOt/File")),
            Some(PathBuf::from("File"))
        );
        assert!(names_match(
            std::ffi::OsStr::new("CrEaTeD"),
            std::ffi::OsStr::new("created")
        ));
    }

    #[cfg(not(any(target_os = "macos", windows)))]
    #[test]
    fn root_comparison_is_case_sensitive() {
        let root = Path::new("/watch/root");
        assert_eq!(relativize(root, Path::new("/watch/Root/file")), None);
    }
}
