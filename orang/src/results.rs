use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::SearchError;

/// An owned regex match: byte span plus the matched text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterMatch {
    pub start: usize,
    pub end: usize,
    pub value: String,
}

impl FilterMatch {
    pub fn new(start: usize, end: usize, value: &str) -> Self {
        Self {
            start,
            end,
            value: value.to_string(),
        }
    }

    /// The synthetic match returned when a negated filter passes. Downstream
    /// code can tell "passed by negation" from "not evaluated".
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }
}

/// A filesystem item that passed every active filter.
#[derive(Debug, Clone)]
pub struct FileMatch {
    pub path: PathBuf,
    pub is_directory: bool,
    pub name_match: Option<FilterMatch>,
    pub extension_match: Option<FilterMatch>,
    pub directory_name_match: Option<FilterMatch>,
    /// Decoded text, present only for content searches over files.
    pub content: Option<String>,
    /// Primary content match. A directory never carries one.
    pub content_match: Option<FilterMatch>,
}

impl FileMatch {
    pub fn new(path: PathBuf, is_directory: bool) -> Self {
        Self {
            path,
            is_directory,
            name_match: None,
            extension_match: None,
            directory_name_match: None,
            content: None,
            content_match: None,
        }
    }

    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// A `FileMatch` plus the base directory it was discovered under, used to
/// compute relative paths for display and destination projection.
#[derive(Debug, Clone)]
pub struct SearchItem {
    pub file_match: FileMatch,
    pub base_directory: PathBuf,
}

impl SearchItem {
    pub fn new(file_match: FileMatch, base_directory: PathBuf) -> Self {
        Self {
            file_match,
            base_directory,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_match.path
    }

    /// Path relative to the base directory, falling back to the full path
    /// when the item lies outside of it.
    pub fn relative_path(&self) -> &Path {
        self.file_match
            .path
            .strip_prefix(&self.base_directory)
            .unwrap_or(&self.file_match.path)
    }

    /// Size in bytes, computed on first observation. Directory sizes are
    /// memoised in the supplied map for the lifetime of one command.
    pub fn size(&self, sizes: &mut DirectorySizeMap) -> u64 {
        if self.file_match.is_directory {
            sizes.directory_size(&self.file_match.path)
        } else {
            fs::metadata(&self.file_match.path)
                .map(|m| m.len())
                .unwrap_or(0)
        }
    }
}

/// Cache of directory sizes observed during one command invocation.
#[derive(Debug, Default)]
pub struct DirectorySizeMap {
    sizes: HashMap<PathBuf, u64>,
}

impl DirectorySizeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn directory_size(&mut self, path: &Path) -> u64 {
        if let Some(size) = self.sizes.get(path) {
            return *size;
        }
        let size = Self::compute(path);
        self.sizes.insert(path.to_path_buf(), size);
        size
    }

    fn compute(path: &Path) -> u64 {
        let Ok(entries) = fs::read_dir(path) else {
            return 0;
        };
        let mut total = 0;
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.is_dir() {
                total += Self::compute(&entry.path());
            } else {
                total += metadata.len();
            }
        }
        total
    }
}

/// Fields results can be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortField {
    Name,
    CreationTime,
    ModifiedTime,
    Size,
    Match,
    Length,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortDescriptor {
    pub field: SortField,
    pub descending: bool,
}

impl SortDescriptor {
    /// Parses one descriptor token: a field name with an optional `:asc` or
    /// `:desc` suffix, e.g. `name`, `size:desc`.
    pub fn parse(token: &str) -> Result<Self, SearchError> {
        let (field, direction) = match token.split_once(':') {
            Some((f, d)) => (f, Some(d)),
            None => (token, None),
        };
        let field = match field.trim() {
            "name" | "n" => SortField::Name,
            "creation-time" | "ct" => SortField::CreationTime,
            "modified-time" | "mt" => SortField::ModifiedTime,
            "size" | "s" => SortField::Size,
            "match" | "m" => SortField::Match,
            "length" | "l" => SortField::Length,
            other => return Err(SearchError::unknown_enum("sort field", other)),
        };
        let descending = match direction.map(str::trim) {
            None | Some("asc") | Some("a") => false,
            Some("desc") | Some("d") => true,
            Some(other) => return Err(SearchError::unknown_enum("sort direction", other)),
        };
        Ok(Self { field, descending })
    }

    /// Parses a comma-separated descriptor list.
    pub fn parse_list(input: &str) -> Result<Vec<Self>, SearchError> {
        input
            .split(',')
            .filter(|t| !t.trim().is_empty())
            .map(Self::parse)
            .collect()
    }
}
