//! Directory traversal for frozen parts and directory-backed stores.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Entries whose file name starts with one of these are skipped,
    /// together with everything below them
    pub skip_prefixes: Vec<String>,
}

/// A regular file discovered during walking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Path relative to the walk root
    pub relative_path: PathBuf,

    pub size: u64,
}

impl FileInfo {
    /// Relative path with `/` separators, as used for object keys and
    /// manifest file names.
    pub fn relative_key(&self) -> String {
        self.relative_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Symlinks resolve to their target; links to directories and broken
    /// links yield `None`.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        let size = if entry.path_is_symlink() {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_file() => resolved.len(),
                _ => return Ok(None),
            }
        } else {
            entry.metadata()?.len()
        };

        Ok(Some(Self {
            path,
            relative_path,
            size,
        }))
    }
}

/// Collect every regular file below `root`, sorted by relative path.
///
/// A missing root is treated as empty.
pub fn walk_files(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut walker = WalkDir::new(root).follow_links(options.follow_links).sort_by_file_name();
    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let mut files = Vec::new();
    let entries = walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_skipped(e, &options.skip_prefixes));

    for entry in entries {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }
        if let Some(info) = FileInfo::from_entry(&entry, root)? {
            files.push(info);
        }
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

/// Immediate subdirectories of `root` (part directories of a frozen table).
pub fn list_subdirs(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut dirs = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        }
    }
    Ok(dirs)
}

fn is_skipped(entry: &DirEntry, prefixes: &[String]) -> bool {
    let name = entry.file_name().to_string_lossy();
    prefixes.iter().any(|p| name.starts_with(p.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_root_is_empty() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_files(&temp_dir.path().join("nope"), &WalkOptions::default())?;
        assert!(files.is_empty());
        Ok(())
    }

    #[test]
    fn test_nested_files_sorted_with_keys() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("all_1_1_0"))?;
        fs::write(temp_dir.path().join("all_1_1_0/data.bin"), b"12345")?;
        fs::write(temp_dir.path().join("all_1_1_0/checksums.txt"), b"12")?;

        let files = walk_files(temp_dir.path(), &WalkOptions::default())?;
        let keys: Vec<String> = files.iter().map(|f| f.relative_key()).collect();
        assert_eq!(keys, vec!["all_1_1_0/checksums.txt", "all_1_1_0/data.bin"]);
        assert_eq!(files.iter().map(|f| f.size).sum::<u64>(), 7);
        Ok(())
    }

    #[test]
    fn test_skip_prefixes_prune_directories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join(".multipart/abc"))?;
        fs::write(temp_dir.path().join(".multipart/abc/00001"), b"part")?;
        fs::write(temp_dir.path().join("object"), b"keep")?;
        fs::write(temp_dir.path().join(".tmp-123"), b"partial")?;

        let options = WalkOptions {
            skip_prefixes: vec![".multipart".to_string(), ".tmp-".to_string()],
            ..Default::default()
        };
        let files = walk_files(temp_dir.path(), &options)?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_key(), "object");
        Ok(())
    }

    #[test]
    fn test_list_subdirs() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("all_2_2_0"))?;
        fs::create_dir(temp_dir.path().join("all_1_1_0"))?;
        fs::write(temp_dir.path().join("format_version.txt"), b"1")?;

        let dirs = list_subdirs(temp_dir.path())?;
        let names: Vec<_> = dirs.iter().map(|d| d.file_name().unwrap().to_string_lossy().into_owned()).collect();
        assert_eq!(names, vec!["all_1_1_0", "all_2_2_0"]);
        Ok(())
    }
}
