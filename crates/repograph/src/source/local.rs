#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{FetchError, PipelineError};
use crate::source::{FileFilter, LoadItem, SourceLoader, skipped};

/// Loads a local checkout. Paths are scanned up front; contents are read
/// on demand.
#[derive(Debug)]
pub struct LocalLoader {
    root: PathBuf,
    filter: FileFilter,
}

impl LocalLoader {
    pub fn new(root: &Path, filter: FileFilter) -> Self {
        Self {
            root: root.to_path_buf(),
            filter,
        }
    }
}

impl SourceLoader for LocalLoader {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn snapshot(&self) -> Option<String> {
        None
    }

    fn candidates(&mut self) -> Result<Vec<String>, PipelineError> {
        let paths = scan_directory(&self.root, &self.filter)?;
        debug!(root = %self.root.display(), candidates = paths.len(), "scanned local checkout");
        Ok(paths)
    }

    fn load(&self, path: &str) -> LoadItem {
        load_one(&self.root, &self.filter, path)
    }
}

fn load_one(root: &Path, filter: &FileFilter, rel_path: &str) -> LoadItem {
    let full_path = root.join(rel_path);
    let size = match fs::metadata(&full_path) {
        Ok(meta) => meta.len(),
        Err(err) => return LoadItem::Failed(local_failure(rel_path, &err)),
    };
    if let Some(reason) = filter.precheck(rel_path, size) {
        return skipped(rel_path, reason);
    }
    match fs::read(&full_path) {
        Ok(bytes) => filter.classify(rel_path, bytes),
        Err(err) => LoadItem::Failed(local_failure(rel_path, &err)),
    }
}

fn local_failure(rel_path: &str, err: &std::io::Error) -> FetchError {
    FetchError {
        path: rel_path.to_string(),
        status: None,
        message: err.to_string(),
        retryable: false,
        retry_after: None,
    }
}

/// Repository-relative, `/`-separated candidate paths in sorted order.
fn scan_directory(root_dir: &Path, filter: &FileFilter) -> std::io::Result<Vec<String>> {
    let mut files = Vec::new();
    let mut stack = vec![root_dir.to_path_buf()];
    let mut first = true;

    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if first => return Err(err),
            Err(_) => continue,
        };
        first = false;

        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(rel_path) = path.strip_prefix(root_dir) else {
                continue;
            };
            let rel_str = rel_path
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                if !filter.is_excluded_dir(&rel_str) {
                    stack.push(path);
                }
            } else if file_type.is_file() && filter.is_candidate(&rel_str) {
                files.push(rel_str);
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::types::SkipReason;

    #[test]
    fn yields_sorted_python_files_and_skips_oversize() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("pkg")).unwrap();
        fs::create_dir_all(dir.path().join("__pycache__")).unwrap();
        fs::write(dir.path().join("pkg/b.py"), "x = 1\n").unwrap();
        fs::write(dir.path().join("a.py"), "y = 2\n").unwrap();
        fs::write(dir.path().join("big.py"), "z = 3\n".repeat(10)).unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        fs::write(dir.path().join("__pycache__/c.py"), "w = 1\n").unwrap();

        let mut config = PipelineConfig::default();
        config.max_file_size = 20;
        let mut loader = LocalLoader::new(dir.path(), FileFilter::new(&config).unwrap());
        let items: Vec<LoadItem> = loader.files().unwrap().collect();

        let loaded: Vec<String> = items
            .iter()
            .filter_map(|item| match item {
                LoadItem::Loaded(file) => Some(file.path.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(loaded, vec!["a.py".to_string(), "pkg/b.py".to_string()]);

        let skipped: Vec<&SkipReason> = items
            .iter()
            .filter_map(|item| match item {
                LoadItem::Skipped(s) => Some(&s.reason),
                _ => None,
            })
            .collect();
        assert_eq!(skipped.len(), 1);
        assert!(matches!(skipped[0], SkipReason::TooLarge { .. }));
    }
}
