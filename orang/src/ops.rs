use std::fs;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tracing::debug;

use crate::content::{self, Replacement};
use crate::context::SearchContext;
use crate::errors::{SearchError, SearchResult};
use crate::filters::Filter;
use crate::results::{DirectorySizeMap, SearchItem};

/// Prefix of an operation line; find results are unprefixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpPrefix {
    Add,
    Update,
    Delete,
    Rename,
    Error,
}

impl OpPrefix {
    pub fn as_str(self) -> &'static str {
        match self {
            OpPrefix::Add => "ADD",
            OpPrefix::Update => "UPD",
            OpPrefix::Delete => "DEL",
            OpPrefix::Rename => "REN",
            OpPrefix::Error => "ERR",
        }
    }
}

/// Where primary output lines go. The CLI installs a colouring,
/// file-teeing implementation; tests collect lines in memory.
pub trait OutputSink {
    fn line(&mut self, text: &str);
}

/// Collects emitted lines; used by tests and the sync summary.
#[derive(Debug, Default)]
pub struct CollectSink {
    pub lines: Vec<String>,
}

impl OutputSink for CollectSink {
    fn line(&mut self, text: &str) {
        self.lines.push(text.to_string());
    }
}

/// Column widths computed by the result pipeline for aligned emission.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnWidths {
    pub path: usize,
    pub size: usize,
}

/// What to do when a copy or move target already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictOption {
    #[default]
    Fail,
    Overwrite,
    Skip,
}

impl ConflictOption {
    pub fn parse(input: &str) -> SearchResult<Self> {
        match input.trim() {
            "fail" | "f" => Ok(ConflictOption::Fail),
            "overwrite" | "o" => Ok(ConflictOption::Overwrite),
            "skip" | "s" => Ok(ConflictOption::Skip),
            other => Err(SearchError::unknown_enum("conflict option", other)),
        }
    }
}

/// The per-match seam: every verb supplies one consumer, the walker and
/// pipeline feed it.
pub trait MatchConsumer {
    /// Installed by the pipeline before buffered emission begins.
    fn set_widths(&mut self, _widths: ColumnWidths) {}

    fn consume(&mut self, item: &SearchItem, context: &SearchContext) -> SearchResult<()>;

    fn finish(&mut self, _context: &SearchContext) -> SearchResult<()> {
        Ok(())
    }
}

/// Formats a byte count with thousands separators, e.g. `1 234 567`.
pub fn format_size(size: u64) -> String {
    let digits = size.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    let offset = digits.len() % 3;
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (i + 3 - offset) % 3 == 0 {
            out.push(' ');
        }
        out.push(c);
    }
    out
}

/// Copies a file and stamps the source's modification time onto the copy.
pub fn copy_file_preserving(src: &Path, dst: &Path) -> SearchResult<()> {
    let metadata = fs::metadata(src).map_err(|e| SearchError::read_failed(src, e))?;
    fs::copy(src, dst).map_err(|e| SearchError::write_failed(dst, e))?;
    let mtime = FileTime::from_last_modification_time(&metadata);
    filetime::set_file_mtime(dst, mtime).map_err(|e| SearchError::write_failed(dst, e))?;
    Ok(())
}

/// Pure sink for `find`: writes matched paths, optionally with a size
/// column.
pub struct FindExecutor<'a> {
    pub sink: &'a mut dyn OutputSink,
    pub show_size: bool,
    widths: ColumnWidths,
    sizes: DirectorySizeMap,
}

impl<'a> FindExecutor<'a> {
    pub fn new(sink: &'a mut dyn OutputSink, show_size: bool) -> Self {
        Self {
            sink,
            show_size,
            widths: ColumnWidths::default(),
            sizes: DirectorySizeMap::new(),
        }
    }
}

impl MatchConsumer for FindExecutor<'_> {
    fn set_widths(&mut self, widths: ColumnWidths) {
        self.widths = widths;
    }

    fn consume(&mut self, item: &SearchItem, _context: &SearchContext) -> SearchResult<()> {
        let path = item.relative_path().display().to_string();
        if self.show_size {
            let size = format_size(item.size(&mut self.sizes));
            let path_width = self.widths.path.max(path.len());
            let size_width = self.widths.size.max(size.len());
            self.sink
                .line(&format!("{path:<path_width$}  {size:>size_width$}"));
        } else {
            self.sink.line(&path);
        }
        Ok(())
    }
}

/// Sink for `match`: enumerates every content match of each file.
pub struct MatchExecutor<'a> {
    pub sink: &'a mut dyn OutputSink,
    pub filter: Filter,
}

impl MatchConsumer for MatchExecutor<'_> {
    fn consume(&mut self, item: &SearchItem, _context: &SearchContext) -> SearchResult<()> {
        let Some(content) = &item.file_match.content else {
            return Ok(());
        };
        let path = item.relative_path().display().to_string();
        for m in self.filter.find_all(content) {
            self.sink.line(&format!("{path}:{}: {}", m.start, m.value));
        }
        Ok(())
    }
}

/// Applies the content replacement to every matched file.
pub struct ReplaceExecutor<'a> {
    pub sink: &'a mut dyn OutputSink,
    pub filter: Filter,
    pub template: String,
    pub default_encoding: String,
    pub dry_run: bool,
    /// Invoked with (path, old, new) before writing; the CLI uses it to
    /// print diffs on dry runs.
    pub preview: Option<Box<dyn FnMut(&Path, &str, &str) + 'a>>,
}

impl MatchConsumer for ReplaceExecutor<'_> {
    fn consume(&mut self, item: &SearchItem, context: &SearchContext) -> SearchResult<()> {
        if item.file_match.is_directory {
            return Ok(());
        }
        let path = item.path();
        let result = (|| -> SearchResult<bool> {
            let decoded = content::read_file(path, &self.default_encoding)?;
            let (new_text, count) = content::replace_text(
                &self.filter,
                &decoded.text,
                &Replacement::Template(&self.template),
            );
            if count == 0 {
                return Ok(false);
            }
            if let Some(preview) = &mut self.preview {
                preview(path, &decoded.text, &new_text);
            }
            if !self.dry_run {
                content::write_replaced(path, &decoded, &new_text)?;
            }
            Ok(true)
        })();

        match result {
            Ok(true) => {
                context.telemetry.record_updated();
                self.sink.line(&format!(
                    "UPD {}",
                    item.relative_path().display()
                ));
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                context.telemetry.record_error();
                self.sink.line(&format!("ERR {e}"));
                Ok(())
            }
        }
    }
}

/// Applies the name transform to every matched item.
pub struct RenameExecutor<'a> {
    pub sink: &'a mut dyn OutputSink,
    pub filter: Filter,
    pub template: String,
    pub dry_run: bool,
}

impl MatchConsumer for RenameExecutor<'_> {
    fn consume(&mut self, item: &SearchItem, context: &SearchContext) -> SearchResult<()> {
        let path = item.path();
        let replacement = Replacement::Template(&self.template);
        let Some(new_name) = content::propose_new_name(&self.filter, path, &replacement) else {
            return Ok(());
        };

        // The dry run previews exactly the real run's conflict verdict,
        // including the case-only-rename exemption.
        let result = if self.dry_run {
            content::check_rename(path, &new_name).map(|_| ())
        } else {
            content::rename_path(path, &new_name).map(|_| ())
        };

        match result {
            Ok(()) => {
                context.telemetry.record_renamed();
                self.sink.line(&format!(
                    "REN {} -> {new_name}",
                    item.relative_path().display()
                ));
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                context.telemetry.record_error();
                self.sink.line(&format!("ERR {e}"));
                Ok(())
            }
        }
    }
}

/// Deletes matched items. Without `recursive`, only empty directories go;
/// a non-empty directory is refused per path.
pub struct DeleteExecutor<'a> {
    pub sink: &'a mut dyn OutputSink,
    pub recursive: bool,
    pub dry_run: bool,
}

impl MatchConsumer for DeleteExecutor<'_> {
    fn consume(&mut self, item: &SearchItem, context: &SearchContext) -> SearchResult<()> {
        let path = item.path();
        let result = if item.file_match.is_directory {
            let has_children = fs::read_dir(path)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false);
            if has_children && !self.recursive {
                Err(SearchError::precondition_failed(format!(
                    "{}: non-empty directory requires --recursive",
                    path.display()
                )))
            } else if self.dry_run {
                Ok(())
            } else if self.recursive {
                fs::remove_dir_all(path).map_err(|e| SearchError::write_failed(path, e))
            } else {
                fs::remove_dir(path).map_err(|e| SearchError::write_failed(path, e))
            }
        } else if self.dry_run {
            Ok(())
        } else {
            fs::remove_file(path).map_err(|e| SearchError::write_failed(path, e))
        };

        match result {
            Ok(()) => {
                context.telemetry.record_deleted();
                self.sink
                    .line(&format!("DEL {}", item.relative_path().display()));
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                context.telemetry.record_error();
                self.sink.line(&format!("ERR {e}"));
                Ok(())
            }
        }
    }
}

/// Copies or moves matched items under a destination root, re-creating the
/// relative layout.
pub struct TransferExecutor<'a> {
    pub sink: &'a mut dyn OutputSink,
    pub destination: PathBuf,
    pub conflict: ConflictOption,
    /// True for `move`: the source is removed after a successful copy.
    pub remove_source: bool,
    pub dry_run: bool,
}

impl TransferExecutor<'_> {
    fn transfer(&mut self, item: &SearchItem) -> SearchResult<Option<OpPrefix>> {
        let src = item.path();
        let target = self.destination.join(item.relative_path());

        if item.file_match.is_directory {
            if target.is_dir() {
                return Ok(None);
            }
            if !self.dry_run {
                fs::create_dir_all(&target).map_err(|e| SearchError::write_failed(&target, e))?;
            }
            return Ok(Some(OpPrefix::Add));
        }

        let existed = target.exists();
        if existed {
            match self.conflict {
                ConflictOption::Fail => {
                    return Err(SearchError::AlreadyExists { path: target });
                }
                ConflictOption::Skip => return Ok(None),
                ConflictOption::Overwrite => {}
            }
        }
        if !self.dry_run {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| SearchError::write_failed(parent, e))?;
            }
            copy_file_preserving(src, &target)?;
            if self.remove_source {
                fs::remove_file(src).map_err(|e| SearchError::write_failed(src, e))?;
            }
        }
        debug!(
            "{} {} -> {}",
            if self.remove_source { "moved" } else { "copied" },
            src.display(),
            target.display()
        );
        Ok(Some(if existed { OpPrefix::Update } else { OpPrefix::Add }))
    }
}

impl MatchConsumer for TransferExecutor<'_> {
    fn consume(&mut self, item: &SearchItem, context: &SearchContext) -> SearchResult<()> {
        match self.transfer(item) {
            Ok(Some(prefix)) => {
                match prefix {
                    OpPrefix::Update => context.telemetry.record_updated(),
                    _ => context.telemetry.record_added(),
                }
                self.sink.line(&format!(
                    "{} {}",
                    prefix.as_str(),
                    item.relative_path().display()
                ));
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                context.telemetry.record_error();
                self.sink.line(&format!("ERR {e}"));
                Ok(())
            }
        }
    }
}
