use std::path::{Path, PathBuf};

use config::{Config as ConfigBuilder, File};
use serde::{Deserialize, Serialize};

use crate::errors::{SearchError, SearchResult};
use crate::results::SortDescriptor;

/// Where a root path came from. Order is preserved and duplicates are not
/// collapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathOrigin {
    Argument,
    CurrentDirectory,
    ConfigFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPath {
    pub path: PathBuf,
    pub origin: PathOrigin,
}

impl SearchPath {
    pub fn argument(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            origin: PathOrigin::Argument,
        }
    }

    pub fn current_directory() -> Self {
        Self {
            path: PathBuf::from("."),
            origin: PathOrigin::CurrentDirectory,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchTarget {
    #[default]
    Files,
    Directories,
    All,
}

impl SearchTarget {
    pub fn parse(input: &str) -> SearchResult<Self> {
        match input.trim() {
            "files" | "f" => Ok(SearchTarget::Files),
            "directories" | "d" => Ok(SearchTarget::Directories),
            "all" | "a" => Ok(SearchTarget::All),
            other => Err(SearchError::unknown_enum("search target", other)),
        }
    }

    pub fn includes_files(self) -> bool {
        matches!(self, SearchTarget::Files | SearchTarget::All)
    }

    pub fn includes_directories(self) -> bool {
        matches!(self, SearchTarget::Directories | SearchTarget::All)
    }
}

/// The immutable options record a command is constructed from. Built once
/// by the CLI layer and frozen for the command's lifetime.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub paths: Vec<SearchPath>,
    pub target: SearchTarget,
    pub recurse: bool,
    /// Cap on emitted results after sorting; 0 means unlimited.
    pub max_count: usize,
    /// Cap on matching files plus directories; 0 means unlimited.
    pub max_matching_files: u64,
    pub sort: Vec<SortDescriptor>,
    /// Label understood by `encoding_rs`, applied when no BOM is found.
    pub default_encoding: String,
    pub dry_run: bool,
    pub include_summary: bool,
    pub progress: bool,
    /// Whether size/time columns were requested for display; forces the
    /// result buffer on.
    pub display_columns: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            paths: vec![SearchPath::current_directory()],
            target: SearchTarget::Files,
            recurse: false,
            max_count: 0,
            max_matching_files: 0,
            sort: Vec::new(),
            default_encoding: "utf-8".to_string(),
            dry_run: false,
            include_summary: false,
            progress: false,
            display_columns: false,
        }
    }
}

impl SearchOptions {
    /// The result buffer is engaged iff sorting or property columns were
    /// requested; otherwise results stream.
    pub fn buffered(&self) -> bool {
        !self.sort.is_empty() || self.display_columns
    }

    pub fn validate(&self) -> SearchResult<()> {
        if self.paths.is_empty() {
            return Err(SearchError::config_error("at least one path is required"));
        }
        if encoding_rs::Encoding::for_label(self.default_encoding.as_bytes()).is_none() {
            return Err(SearchError::unknown_enum(
                "encoding",
                self.default_encoding.clone(),
            ));
        }
        Ok(())
    }
}

/// Defaults loadable from a global and a local YAML file, merged CLI-first.
///
/// Locations, in order of precedence (later wins):
/// 1. `$XDG_CONFIG_HOME/orang/config.yaml`
/// 2. `./.orang.yaml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub default_encoding: Option<String>,
    pub include_summary: bool,
    pub progress: bool,
    pub verbosity: Option<String>,
}

impl AppConfig {
    pub fn load() -> SearchResult<Self> {
        Self::load_from(None)
    }

    pub fn load_from(explicit: Option<&Path>) -> SearchResult<Self> {
        let mut builder = ConfigBuilder::builder();

        let candidates = [
            dirs::config_dir().map(|p| p.join("orang/config.yaml")),
            Some(PathBuf::from(".orang.yaml")),
            explicit.map(Path::to_path_buf),
        ];
        for path in candidates.iter().flatten() {
            if path.exists() {
                builder = builder.add_source(File::from(path.as_path()));
            }
        }

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SearchError::config_error(format!("failed to load config: {e}")))
    }

    /// Folds the file-level defaults into an options record the CLI has
    /// already populated; CLI values win. `encoding_overridden` says
    /// whether `--encoding` was actually supplied — an explicit CLI value
    /// is never displaced by the config file, even when it spells out the
    /// built-in default.
    pub fn apply_to(&self, options: &mut SearchOptions, encoding_overridden: bool) {
        if let Some(encoding) = &self.default_encoding {
            if !encoding_overridden {
                options.default_encoding = encoding.clone();
            }
        }
        options.include_summary |= self.include_summary;
        options.progress |= self.progress;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn buffering_follows_sort_and_columns() {
        let mut options = SearchOptions::default();
        assert!(!options.buffered());
        options.sort = SortDescriptor::parse_list("name").unwrap();
        assert!(options.buffered());
        options.sort.clear();
        options.display_columns = true;
        assert!(options.buffered());
    }

    #[test]
    fn validate_rejects_unknown_encoding() {
        let options = SearchOptions {
            default_encoding: "klingon-8".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(SearchError::UnknownEnumValue { .. })
        ));
        assert!(SearchOptions::default().validate().is_ok());
    }

    #[test]
    fn load_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "default_encoding: windows-1252\ninclude_summary: true\n",
        )
        .unwrap();

        let config = AppConfig::load_from(Some(&path)).unwrap();
        assert_eq!(config.default_encoding.as_deref(), Some("windows-1252"));
        assert!(config.include_summary);
        assert!(!config.progress);

        let mut options = SearchOptions::default();
        config.apply_to(&mut options, false);
        assert_eq!(options.default_encoding, "windows-1252");
        assert!(options.include_summary);
    }

    #[test]
    fn cli_values_win_over_config() {
        let config = AppConfig {
            default_encoding: Some("windows-1252".to_string()),
            ..Default::default()
        };
        let mut options = SearchOptions {
            default_encoding: "shift_jis".to_string(),
            ..Default::default()
        };
        config.apply_to(&mut options, true);
        assert_eq!(options.default_encoding, "shift_jis");
    }

    #[test]
    fn explicit_default_encoding_is_not_displaced() {
        let config = AppConfig {
            default_encoding: Some("windows-1252".to_string()),
            ..Default::default()
        };
        // `--encoding utf-8` spells out the built-in default; it still
        // beats the config file.
        let mut options = SearchOptions::default();
        config.apply_to(&mut options, true);
        assert_eq!(options.default_encoding, "utf-8");
    }
}
