use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::languages::{DocExtractor, PythonExtractor};
use crate::config::ScanConfig;
use crate::error::{LinkerError, Result};

/// One documented function found in a source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDoc {
    /// Dotted path of enclosing classes/functions plus the function name
    pub qualified_name: String,

    /// 1-based line of the `def`
    pub line: usize,

    /// Cleaned docstring text
    pub docstring: String,
}

/// A scanned source file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceUnit {
    /// Path as found on disk
    pub path: PathBuf,

    /// Path relative to the scan root
    pub relative_path: PathBuf,

    /// Pipeline name derived from the relative path, unique within a scan
    pub pipeline_name: String,

    /// SHA256 of the file content
    pub content_hash: String,

    /// Documented functions in source order
    pub functions: Vec<FunctionDoc>,
}

/// A file that could not be turned into a SourceUnit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanFailure {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanResult {
    pub units: Vec<SourceUnit>,
    pub failures: Vec<ScanFailure>,
}

/// Walks a source tree and extracts documented functions from every supported file
pub struct SourceScanner {
    config: ScanConfig,
    extractors: Vec<Box<dyn DocExtractor>>,
}

impl SourceScanner {
    pub fn new(config: &ScanConfig) -> Result<Self> {
        let extractors: Vec<Box<dyn DocExtractor>> = vec![Box::new(PythonExtractor::new()?)];

        Ok(Self {
            config: config.clone(),
            extractors,
        })
    }

    /// Scan a directory (or a single file).
    ///
    /// Only a missing root is an error; broken files are collected as failures.
    pub fn scan<P: AsRef<Path>>(&mut self, root: P) -> Result<ScanResult> {
        let root = root.as_ref();
        if !root.exists() {
            return Err(LinkerError::FileSystem(format!(
                "root path does not exist: {}",
                root.display()
            )));
        }

        let mut overrides = OverrideBuilder::new(root);
        for pattern in &self.config.ignore_patterns {
            overrides
                .add(&format!("!{}", pattern))
                .map_err(|e| LinkerError::Config(format!("invalid ignore pattern '{}': {}", pattern, e)))?;
        }
        let overrides = overrides
            .build()
            .map_err(|e| LinkerError::Config(e.to_string()))?;

        // Use ignore crate to respect .gitignore and custom patterns
        let walker = WalkBuilder::new(root)
            .hidden(false)
            .git_ignore(true)
            .overrides(overrides)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();

        let mut result = ScanResult::default();
        let mut taken_names = HashSet::new();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    result.failures.push(ScanFailure {
                        path: walk_error_path(&e).unwrap_or(root).to_path_buf(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            let path = entry.path();

            if !path.is_file() || !self.should_scan_file(path) {
                continue;
            }

            match self.scan_file(path, root) {
                Ok(mut unit) => {
                    if !taken_names.insert(unit.pipeline_name.clone()) {
                        let disambiguated = format!("{}_{}", unit.pipeline_name, &unit.path_hash()[..8]);
                        warn!(
                            "Pipeline name '{}' already used, {} becomes '{}'",
                            unit.pipeline_name,
                            path.display(),
                            disambiguated
                        );
                        taken_names.insert(disambiguated.clone());
                        unit.pipeline_name = disambiguated;
                    }
                    debug!(
                        "Scanned {}: {} documented functions",
                        path.display(),
                        unit.functions.len()
                    );
                    result.units.push(unit);
                }
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    result.failures.push(ScanFailure {
                        path: path.to_path_buf(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(result)
    }

    /// Read and extract one file
    pub fn scan_file(&mut self, path: &Path, root: &Path) -> Result<SourceUnit> {
        let size = std::fs::metadata(path)?.len();
        if size > self.config.max_file_size as u64 {
            return Err(LinkerError::Parser(format!(
                "File {} exceeds maximum size limit ({} bytes)",
                path.display(),
                size
            )));
        }

        let source_content = std::fs::read_to_string(path)?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or_default();
        let extractor = self
            .extractors
            .iter_mut()
            .find(|extractor| extractor.file_extensions().contains(&extension))
            .ok_or_else(|| {
                LinkerError::Parser(format!("Could not detect language for file: {}", path.display()))
            })?;
        let functions = extractor.extract(&source_content, path)?;
        debug!(
            "Extracted {} documented {} functions from {}",
            functions.len(),
            extractor.language_name(),
            path.display()
        );

        let relative_path = relative_to_root(path, root);

        Ok(SourceUnit {
            path: path.to_path_buf(),
            pipeline_name: pipeline_name_for(&relative_path),
            relative_path,
            content_hash: calculate_hash(&source_content),
            functions,
        })
    }

    /// Determine if a file should be scanned based on configuration
    fn should_scan_file(&self, path: &Path) -> bool {
        if self.config.skip_dunder_files {
            let dunder = path
                .file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name.starts_with("__"));
            if dunder {
                return false;
            }
        }

        match path.extension().and_then(|ext| ext.to_str()) {
            Some(extension) => self
                .extractors
                .iter()
                .any(|extractor| extractor.file_extensions().contains(&extension)),
            None => false,
        }
    }
}

impl SourceUnit {
    fn path_hash(&self) -> String {
        calculate_hash(&self.relative_path.to_string_lossy())
    }
}

fn relative_to_root(path: &Path, root: &Path) -> PathBuf {
    match path.strip_prefix(root) {
        Ok(relative) if !relative.as_os_str().is_empty() => relative.to_path_buf(),
        // Scanning a single file
        _ => path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| path.to_path_buf()),
    }
}

/// Stable pipeline name: the relative path with separators flattened to `_`
pub fn pipeline_name_for(relative_path: &Path) -> String {
    relative_path
        .to_string_lossy()
        .replace(['\\', '/'], "_")
}

/// Calculate SHA256 hash of content
fn calculate_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The entry a walk error is about, when the walker knows it
fn walk_error_path(error: &ignore::Error) -> Option<&Path> {
    match error {
        ignore::Error::WithPath { path, .. } => Some(path),
        ignore::Error::Loop { child, .. } => Some(child),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => walk_error_path(err),
        ignore::Error::Partial(errors) => errors.iter().find_map(walk_error_path),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn test_scan_directory_collects_units_and_failures() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("jobs/load.py")
            .write_str("def load():\n    \"\"\"openmetadata:upstream(a:b)\"\"\"\n")
            .unwrap();
        temp.child("jobs/__init__.py")
            .write_str("def hidden():\n    \"\"\"openmetadata:upstream(a:b)\"\"\"\n")
            .unwrap();
        temp.child("jobs/broken.py").write_str("def broken(:\n").unwrap();
        temp.child("README.md").write_str("# not python").unwrap();

        let mut scanner = SourceScanner::new(&ScanConfig::default()).unwrap();
        let result = scanner.scan(temp.path()).unwrap();

        assert_eq!(result.units.len(), 1);
        assert_eq!(result.units[0].pipeline_name, "jobs_load.py");
        assert_eq!(result.units[0].functions[0].qualified_name, "load");
        assert_eq!(result.units[0].content_hash.len(), 64);

        assert_eq!(result.failures.len(), 1);
        assert!(result.failures[0].path.ends_with("broken.py"));
    }

    #[test]
    fn test_colliding_pipeline_names_are_disambiguated() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("a/b_c.py").write_str("x = 1\n").unwrap();
        temp.child("a_b/c.py").write_str("y = 2\n").unwrap();

        let mut scanner = SourceScanner::new(&ScanConfig::default()).unwrap();
        let result = scanner.scan(temp.path()).unwrap();

        let names: HashSet<&str> = result.units.iter().map(|u| u.pipeline_name.as_str()).collect();
        assert_eq!(result.units.len(), 2);
        assert_eq!(names.len(), 2);
        assert!(names.contains("a_b_c.py"));
    }

    #[test]
    fn test_ignore_patterns_exclude_files() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("keep.py").write_str("x = 1\n").unwrap();
        temp.child("vendor/skip.py").write_str("x = 1\n").unwrap();

        let config = ScanConfig {
            ignore_patterns: vec!["vendor/".to_string()],
            ..ScanConfig::default()
        };
        let mut scanner = SourceScanner::new(&config).unwrap();
        let result = scanner.scan(temp.path()).unwrap();

        assert_eq!(result.units.len(), 1);
        assert_eq!(result.units[0].pipeline_name, "keep.py");
    }

    #[test]
    fn test_oversized_file_is_a_failure() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("big.py").write_str(&"# padding\n".repeat(20)).unwrap();

        let config = ScanConfig {
            max_file_size: 16,
            ..ScanConfig::default()
        };
        let mut scanner = SourceScanner::new(&config).unwrap();
        let result = scanner.scan(temp.path()).unwrap();

        assert!(result.units.is_empty());
        assert!(result.failures[0].error.contains("maximum size"));
    }

    #[test]
    fn test_size_is_checked_before_decoding() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("blob.py").write_binary(&[0xff; 64]).unwrap();

        let config = ScanConfig {
            max_file_size: 16,
            ..ScanConfig::default()
        };
        let mut scanner = SourceScanner::new(&config).unwrap();
        let result = scanner.scan(temp.path()).unwrap();

        assert_eq!(result.failures.len(), 1);
        assert!(result.failures[0].error.contains("64 bytes"));
    }

    #[test]
    fn test_walk_error_keeps_entry_path() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error = ignore::Error::WithDepth {
            depth: 2,
            err: Box::new(ignore::Error::WithPath {
                path: PathBuf::from("jobs/private"),
                err: Box::new(ignore::Error::Io(io)),
            }),
        };

        assert_eq!(walk_error_path(&error), Some(Path::new("jobs/private")));
        assert_eq!(walk_error_path(&ignore::Error::UnrecognizedFileType("x".to_string())), None);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let mut scanner = SourceScanner::new(&ScanConfig::default()).unwrap();
        assert!(scanner.scan("/no/such/root").is_err());
    }

    #[test]
    fn test_pipeline_name_flattens_separators() {
        assert_eq!(pipeline_name_for(Path::new("etl/daily/load.py")), "etl_daily_load.py");
    }
}
