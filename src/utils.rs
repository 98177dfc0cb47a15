use std::path::Path;

use walkdir::WalkDir;

pub struct Utils {}

impl Utils {
    /// Current time as Unix seconds (UTC).
    pub fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Total size in bytes of the regular files under `path`. Unreadable
    /// entries are skipped.
    pub fn dir_size(path: &Path) -> u64 {
        WalkDir::new(path)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.metadata().ok())
            .filter(|metadata| metadata.is_file())
            .map(|metadata| metadata.len())
            .sum()
    }

    /// True if `name` can be joined onto a directory without escaping it:
    /// non-empty, no separators, not `.` or `..`.
    pub fn is_single_component(name: &str) -> bool {
        !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains('/')
            && !name.contains('\0')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_dir_size_sums_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), vec![0u8; 10]).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("b"), vec![0u8; 32]).unwrap();

        assert_eq!(Utils::dir_size(dir.path()), 42);
    }

    #[test]
    fn test_dir_size_missing_path_is_zero() {
        assert_eq!(Utils::dir_size(Path::new("/definitely/not/here")), 0);
    }

    #[test]
    fn test_is_single_component() {
        assert!(Utils::is_single_component("2026-10-16_02-30-00"));
        assert!(!Utils::is_single_component(""));
        assert!(!Utils::is_single_component(".."));
        assert!(!Utils::is_single_component("a/b"));
    }
}
