use std::fs::Metadata;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use bitflags::bitflags;
use chrono::NaiveDate;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::errors::{SearchError, SearchResult};
use crate::results::{FileMatch, FilterMatch};

/// Compiled patterns are shared process-wide; the same pattern with the same
/// options compiles once.
static REGEX_CACHE: Lazy<DashMap<String, Arc<Regex>>> = Lazy::new(DashMap::new);

bitflags! {
    /// Attribute bits a candidate must carry (`attributes`) or must not
    /// carry (`attributes_to_skip`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileAttributes: u32 {
        const HIDDEN = 1;
        const READ_ONLY = 1 << 1;
        const SYMLINK = 1 << 2;
        const DIRECTORY = 1 << 3;
        const EMPTY = 1 << 4;
        /// Windows-only; never set on Unix.
        const SYSTEM = 1 << 5;
    }
}

impl FileAttributes {
    /// Parses a comma-separated attribute list, e.g. `hidden,read-only`.
    pub fn parse_list(input: &str) -> SearchResult<Self> {
        let mut attrs = FileAttributes::empty();
        for token in input.split(',').filter(|t| !t.trim().is_empty()) {
            attrs |= match token.trim() {
                "hidden" | "h" => FileAttributes::HIDDEN,
                "read-only" | "r" => FileAttributes::READ_ONLY,
                "symlink" | "reparse-point" | "l" => FileAttributes::SYMLINK,
                "directory" | "d" => FileAttributes::DIRECTORY,
                "empty" | "e" => FileAttributes::EMPTY,
                "system" | "s" => FileAttributes::SYSTEM,
                other => return Err(SearchError::unknown_enum("attribute", other)),
            };
        }
        Ok(attrs)
    }

    /// The attributes an on-disk item actually carries. `EMPTY` is only
    /// computed when a mask asks for it, since it may need a directory read.
    pub fn of(path: &Path, metadata: &Metadata, need_empty: bool) -> Self {
        let mut attrs = FileAttributes::empty();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'))
        {
            attrs |= FileAttributes::HIDDEN;
        }
        if metadata.permissions().readonly() {
            attrs |= FileAttributes::READ_ONLY;
        }
        if metadata.file_type().is_symlink() {
            attrs |= FileAttributes::SYMLINK;
        }
        if metadata.is_dir() {
            attrs |= FileAttributes::DIRECTORY;
            if need_empty && is_empty_dir(path) {
                attrs |= FileAttributes::EMPTY;
            }
        } else if need_empty && metadata.len() == 0 {
            attrs |= FileAttributes::EMPTY;
        }
        attrs
    }
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

/// The slice of a path a name filter looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NamePart {
    #[default]
    Name,
    NameWithoutExtension,
    Extension,
    FullName,
}

impl NamePart {
    pub fn parse(input: &str) -> SearchResult<Self> {
        match input.trim() {
            "name" | "n" => Ok(NamePart::Name),
            "name-without-extension" | "w" => Ok(NamePart::NameWithoutExtension),
            "extension" | "e" => Ok(NamePart::Extension),
            "full-name" | "f" => Ok(NamePart::FullName),
            other => Err(SearchError::unknown_enum("name part", other)),
        }
    }

    /// Extracts the configured slice; missing parts evaluate as the empty
    /// string so negated filters still get a verdict.
    pub fn slice_of(self, path: &Path) -> String {
        match self {
            NamePart::Name => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            NamePart::NameWithoutExtension => path
                .file_stem()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            NamePart::Extension => path
                .extension()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            NamePart::FullName => path.to_string_lossy().into_owned(),
        }
    }
}

/// Regex options carried by a filter. `right_to_left`, `ecma_script`,
/// `explicit_capture` and `compiled` are engine-level hints the regex crate
/// does not express; they are accepted and recorded but have no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternOptions {
    pub ignore_case: bool,
    pub multiline: bool,
    pub singleline: bool,
    pub explicit_capture: bool,
    pub ecma_script: bool,
    pub right_to_left: bool,
    pub culture_invariant: bool,
    pub compiled: bool,
}

impl PatternOptions {
    fn cache_key(&self, pattern: &str) -> String {
        format!(
            "{}\u{1f}{}{}{}",
            pattern,
            u8::from(self.ignore_case),
            u8::from(self.multiline),
            u8::from(self.singleline),
        )
    }
}

/// A compiled regular expression, optionally scoped to a capture group,
/// optionally negated. Immutable once built.
#[derive(Debug, Clone)]
pub struct Filter {
    regex: Arc<Regex>,
    pattern: String,
    group_index: Option<usize>,
    pub negate: bool,
    pub options: PatternOptions,
    pub name_part: NamePart,
}

impl Filter {
    pub fn new(pattern: &str, options: PatternOptions) -> SearchResult<Self> {
        let key = options.cache_key(pattern);
        let regex = match REGEX_CACHE.get(&key) {
            Some(entry) => Arc::clone(&entry),
            None => {
                let regex = Arc::new(
                    RegexBuilder::new(pattern)
                        .case_insensitive(options.ignore_case)
                        .multi_line(options.multiline)
                        .dot_matches_new_line(options.singleline)
                        .build()?,
                );
                REGEX_CACHE.insert(key, Arc::clone(&regex));
                regex
            }
        };
        Ok(Self {
            regex,
            pattern: pattern.to_string(),
            group_index: None,
            negate: false,
            options,
            name_part: NamePart::default(),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    pub fn group_index(&self) -> Option<usize> {
        self.group_index
    }

    /// Scopes the filter to a capture group, given by name or number.
    pub fn with_group(mut self, group: &str) -> SearchResult<Self> {
        let index = if let Ok(number) = group.parse::<usize>() {
            if number <= self.regex.captures_len() - 1 {
                Some(number)
            } else {
                None
            }
        } else {
            self.regex
                .capture_names()
                .position(|name| name == Some(group))
        };
        match index {
            Some(index) => {
                self.group_index = Some(index);
                Ok(self)
            }
            None => Err(SearchError::config_error(format!(
                "pattern '{}' has no group '{}'",
                self.pattern, group
            ))),
        }
    }

    pub fn negated(mut self, negate: bool) -> Self {
        self.negate = negate;
        self
    }

    pub fn for_part(mut self, part: NamePart) -> Self {
        self.name_part = part;
        self
    }

    /// Evaluates the filter against an input string. For group-scoped
    /// filters the returned match is the group; a group that did not
    /// participate counts as a non-match. Negation inverts the verdict and
    /// yields a synthetic empty match on inversion.
    pub fn evaluate(&self, input: &str) -> Option<FilterMatch> {
        let hit = match self.group_index {
            None => self
                .regex
                .find(input)
                .map(|m| FilterMatch::new(m.start(), m.end(), m.as_str())),
            Some(index) => self
                .regex
                .captures(input)
                .and_then(|caps| caps.get(index))
                .map(|m| FilterMatch::new(m.start(), m.end(), m.as_str())),
        };
        match (hit, self.negate) {
            (Some(m), false) => Some(m),
            (None, false) => None,
            (Some(_), true) => None,
            (None, true) => Some(FilterMatch::empty()),
        }
    }

    /// Evaluates against the configured name part of a path.
    pub fn evaluate_path(&self, path: &Path) -> Option<FilterMatch> {
        self.evaluate(&self.name_part.slice_of(path))
    }

    /// All matches in the input, in left-to-right non-overlapping order.
    /// Negated filters enumerate nothing.
    pub fn find_all(&self, input: &str) -> Vec<FilterMatch> {
        if self.negate {
            return Vec::new();
        }
        match self.group_index {
            None => self
                .regex
                .find_iter(input)
                .map(|m| FilterMatch::new(m.start(), m.end(), m.as_str()))
                .collect(),
            Some(index) => self
                .regex
                .captures_iter(input)
                .filter_map(|caps| caps.get(index))
                .map(|m| FilterMatch::new(m.start(), m.end(), m.as_str()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl ComparisonOp {
    fn split(input: &str) -> SearchResult<(Self, &str)> {
        let input = input.trim();
        for (prefix, op) in [
            ("<=", ComparisonOp::Le),
            (">=", ComparisonOp::Ge),
            ("<", ComparisonOp::Lt),
            (">", ComparisonOp::Gt),
            ("=", ComparisonOp::Eq),
        ] {
            if let Some(rest) = input.strip_prefix(prefix) {
                return Ok((op, rest.trim()));
            }
        }
        Err(SearchError::config_error(format!(
            "property predicate '{input}' must start with <, <=, =, >= or >"
        )))
    }
}

/// A single comparison against a literal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropertyPredicate<T> {
    pub op: ComparisonOp,
    pub value: T,
}

impl<T: PartialOrd> PropertyPredicate<T> {
    pub fn eval(&self, actual: T) -> bool {
        match self.op {
            ComparisonOp::Lt => actual < self.value,
            ComparisonOp::Le => actual <= self.value,
            ComparisonOp::Eq => actual == self.value,
            ComparisonOp::Ge => actual >= self.value,
            ComparisonOp::Gt => actual > self.value,
        }
    }
}

impl PropertyPredicate<u64> {
    /// Parses a size predicate, e.g. `>10kb`, `<=1mb`, `=0`.
    pub fn parse_size(input: &str) -> SearchResult<Self> {
        let (op, literal) = ComparisonOp::split(input)?;
        let lower = literal.to_ascii_lowercase();
        let (digits, multiplier) = if let Some(d) = lower.strip_suffix("kb") {
            (d, 1024)
        } else if let Some(d) = lower.strip_suffix("mb") {
            (d, 1024 * 1024)
        } else if let Some(d) = lower.strip_suffix("gb") {
            (d, 1024 * 1024 * 1024)
        } else if let Some(d) = lower.strip_suffix('b') {
            (d, 1)
        } else {
            (lower.as_str(), 1)
        };
        let value: u64 = digits
            .trim()
            .parse()
            .map_err(|_| SearchError::config_error(format!("invalid size literal '{literal}'")))?;
        Ok(Self {
            op,
            value: value * multiplier,
        })
    }
}

impl PropertyPredicate<SystemTime> {
    /// Parses a time predicate against a `YYYY-MM-DD` or
    /// `YYYY-MM-DD HH:MM:SS` literal, interpreted as local midnight when no
    /// time of day is given.
    pub fn parse_time(input: &str) -> SearchResult<Self> {
        let (op, literal) = ComparisonOp::split(input)?;
        let datetime = NaiveDate::parse_from_str(literal, "%Y-%m-%d")
            .map(|d| d.and_hms_opt(0, 0, 0).expect("midnight is valid"))
            .or_else(|_| {
                chrono::NaiveDateTime::parse_from_str(literal, "%Y-%m-%d %H:%M:%S")
            })
            .map_err(|_| {
                SearchError::config_error(format!("invalid time literal '{literal}'"))
            })?;
        let value = SystemTime::UNIX_EPOCH
            + std::time::Duration::from_secs(datetime.and_utc().timestamp().max(0) as u64);
        Ok(Self { op, value })
    }
}

/// Optional predicates over creation time, modified time and size.
#[derive(Debug, Clone, Default)]
pub struct FilePropertyFilter {
    pub creation_time: Option<PropertyPredicate<SystemTime>>,
    pub modified_time: Option<PropertyPredicate<SystemTime>>,
    pub size: Option<PropertyPredicate<u64>>,
}

impl FilePropertyFilter {
    pub fn is_empty(&self) -> bool {
        self.creation_time.is_none() && self.modified_time.is_none() && self.size.is_none()
    }

    fn accept(&self, path: &Path, metadata: &Metadata) -> SearchResult<bool> {
        if let Some(predicate) = &self.creation_time {
            let created = metadata
                .created()
                .map_err(|e| SearchError::read_failed(path, e))?;
            if !predicate.eval(created) {
                return Ok(false);
            }
        }
        if let Some(predicate) = &self.modified_time {
            let modified = metadata
                .modified()
                .map_err(|e| SearchError::read_failed(path, e))?;
            if !predicate.eval(modified) {
                return Ok(false);
            }
        }
        if let Some(predicate) = &self.size {
            if metadata.is_dir() {
                return Ok(false);
            }
            if !predicate.eval(metadata.len()) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileEmptyOption {
    #[default]
    Any,
    Empty,
    NonEmpty,
}

impl FileEmptyOption {
    pub fn parse(input: &str) -> SearchResult<Self> {
        match input.trim() {
            "any" => Ok(FileEmptyOption::Any),
            "empty" | "e" => Ok(FileEmptyOption::Empty),
            "non-empty" | "ne" => Ok(FileEmptyOption::NonEmpty),
            other => Err(SearchError::unknown_enum("empty option", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// The conjunction of every active sub-filter. A candidate passes iff all
/// present sub-filters pass.
#[derive(Debug, Clone, Default)]
pub struct FileSystemFilter {
    pub name: Option<Filter>,
    pub extension: Option<Filter>,
    pub content: Option<Filter>,
    pub attributes: FileAttributes,
    pub attributes_to_skip: FileAttributes,
    pub empty: FileEmptyOption,
    pub properties: FilePropertyFilter,
}

impl FileSystemFilter {
    /// Applies the check chain in its fixed order, short-circuiting on the
    /// first failure. The content step is the only one that reads bytes and
    /// runs last; `load` is invoked at most once, for files only.
    pub fn accept<F>(
        &self,
        path: &Path,
        kind: FileKind,
        metadata: &Metadata,
        load: F,
    ) -> SearchResult<Option<FileMatch>>
    where
        F: FnOnce() -> SearchResult<String>,
    {
        let is_directory = kind == FileKind::Directory;
        let need_empty = (self.attributes | self.attributes_to_skip)
            .contains(FileAttributes::EMPTY)
            || self.empty != FileEmptyOption::Any;
        let actual = FileAttributes::of(path, metadata, need_empty);

        if !actual.contains(self.attributes) {
            return Ok(None);
        }
        if actual.intersects(self.attributes_to_skip) {
            return Ok(None);
        }

        let mut result = FileMatch::new(path.to_path_buf(), is_directory);

        if let Some(filter) = &self.name {
            match filter.evaluate_path(path) {
                Some(m) => result.name_match = Some(m),
                None => return Ok(None),
            }
        }
        if let Some(filter) = &self.extension {
            let extension = NamePart::Extension.slice_of(path);
            match filter.evaluate(&extension) {
                Some(m) => result.extension_match = Some(m),
                None => return Ok(None),
            }
        }
        if !self.properties.accept(path, metadata)? {
            return Ok(None);
        }
        match self.empty {
            FileEmptyOption::Any => {}
            FileEmptyOption::Empty => {
                if !actual.contains(FileAttributes::EMPTY) {
                    return Ok(None);
                }
            }
            FileEmptyOption::NonEmpty => {
                if actual.contains(FileAttributes::EMPTY) {
                    return Ok(None);
                }
            }
        }
        if let Some(filter) = &self.content {
            if is_directory {
                return Ok(None);
            }
            let text = load()?;
            match filter.evaluate(&text) {
                Some(m) => {
                    result.content_match = Some(m);
                    result.content = Some(text);
                }
                None => return Ok(None),
            }
        }
        Ok(Some(result))
    }
}
