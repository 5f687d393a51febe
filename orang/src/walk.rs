use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use crate::config::{SearchPath, SearchTarget};
use crate::content;
use crate::context::{SearchContext, TerminationReason};
use crate::errors::SearchError;
use crate::filters::{FileAttributes, FileKind, FileSystemFilter, Filter, NamePart};
use crate::results::{FileMatch, SearchItem};

/// Filter-driven traversal of one or more root paths.
pub struct FileSystemSearch<'a> {
    pub filter: &'a FileSystemFilter,
    /// Controls descent only; a rejected directory is still evaluated as a
    /// candidate match.
    pub directory_filter: Option<&'a Filter>,
    pub target: SearchTarget,
    pub recurse: bool,
    pub default_encoding: &'a str,
    pub context: &'a SearchContext,
}

impl<'a> FileSystemSearch<'a> {
    /// Lazy pre-order walk of one root. Per-path errors are counted and
    /// logged inside; the stream only carries matches.
    pub fn walk(&self, root: &SearchPath) -> Walk<'a, '_> {
        Walk::new(self, root)
    }
}

/// One directory on the stack. Children are enumerated lazily, in the
/// order the filesystem returns them, so a directory deleted right after
/// emission is never re-read.
struct DirectoryFrame {
    path: PathBuf,
    entries: Option<std::vec::IntoIter<OsString>>,
}

pub struct Walk<'a, 's> {
    search: &'s FileSystemSearch<'a>,
    base: PathBuf,
    stack: Vec<DirectoryFrame>,
    visited: HashSet<PathBuf>,
    /// A single-file root is evaluated once, without a stack.
    root_file: Option<PathBuf>,
    stop_after_emit: bool,
    done: bool,
}

impl<'a, 's> Walk<'a, 's> {
    fn new(search: &'s FileSystemSearch<'a>, root: &SearchPath) -> Self {
        let mut walk = Self {
            search,
            base: root.path.clone(),
            stack: Vec::new(),
            visited: HashSet::new(),
            root_file: None,
            stop_after_emit: false,
            done: false,
        };
        match fs::symlink_metadata(&root.path) {
            Ok(metadata) if metadata.is_dir() => {
                walk.push_directory(root.path.clone());
            }
            Ok(_) => {
                walk.base = root
                    .path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                walk.root_file = Some(root.path.clone());
            }
            Err(e) => {
                warn!("ERR {}: {}", root.path.display(), e);
                walk.search.context.telemetry.record_error();
                walk.done = true;
            }
        }
        walk
    }

    fn push_directory(&mut self, path: PathBuf) {
        let canonical = match fs::canonicalize(&path) {
            Ok(c) => c,
            Err(e) => {
                self.report_error(&path, &e.into());
                return;
            }
        };
        if !self.visited.insert(canonical) {
            debug!("skipping already visited directory {}", path.display());
            return;
        }
        self.stack.push(DirectoryFrame {
            path,
            entries: None,
        });
    }

    /// Enumerates the top frame on its first poll. `false` when the frame
    /// could not be read and was dropped; the parent stays "searched".
    fn init_top_frame(&mut self) -> bool {
        let Some(frame) = self.stack.last() else {
            return false;
        };
        if frame.entries.is_some() {
            return true;
        }
        let path = frame.path.clone();
        match fs::read_dir(&path) {
            Ok(read) => {
                let mut names = Vec::new();
                for entry in read {
                    match entry {
                        Ok(entry) => names.push(entry.file_name()),
                        Err(e) => self.report_error(&path, &e.into()),
                    }
                }
                trace!("entering {} ({} entries)", path.display(), names.len());
                if let Some(progress) = &self.search.context.progress {
                    progress.report_directory(&path);
                }
                self.stack
                    .last_mut()
                    .expect("frame exists")
                    .entries = Some(names.into_iter());
                true
            }
            Err(e) => {
                // Enumeration failures are never fatal to the traversal.
                self.report_error(&path, &SearchError::read_failed(&path, e));
                self.search.context.telemetry.record_searched_directory();
                self.stack.pop();
                false
            }
        }
    }

    fn report_error(&self, path: &Path, error: &SearchError) {
        warn!("ERR {}: {}", path.display(), error);
        self.search.context.telemetry.record_error();
    }

    /// Evaluates one classified entry; `Some` when it matched and the
    /// search target includes its kind.
    fn evaluate(&self, path: &Path, metadata: &Metadata, is_dir: bool) -> Option<FileMatch> {
        let context = self.search.context;
        if is_dir {
            context.telemetry.record_directory();
        } else {
            context.telemetry.record_file(metadata.len());
        }

        let kind = if is_dir {
            FileKind::Directory
        } else {
            FileKind::File
        };
        let accepted = self.search.filter.accept(path, kind, metadata, || {
            content::read_to_string(path, self.search.default_encoding)
        });
        let mut file_match = match accepted {
            Ok(Some(m)) => m,
            Ok(None) => return None,
            Err(e) => {
                self.report_error(path, &e);
                return None;
            }
        };

        let wanted = if is_dir {
            self.search.target.includes_directories()
        } else {
            self.search.target.includes_files()
        };
        if !wanted {
            return None;
        }

        if let Some(filter) = self.search.directory_filter {
            if let Some(parent) = path.parent() {
                file_match.directory_name_match =
                    filter.evaluate(&NamePart::Name.slice_of(parent));
            }
        }
        Some(file_match)
    }

    fn should_descend(&self, path: &Path, metadata: &Metadata) -> bool {
        if !self.search.recurse {
            return false;
        }
        // Reparse points are not followed unless the attribute settings
        // explicitly include them.
        if metadata.file_type().is_symlink()
            && !self
                .search
                .filter
                .attributes
                .contains(FileAttributes::SYMLINK)
        {
            return false;
        }
        match self.search.directory_filter {
            Some(filter) => filter.evaluate(&NamePart::Name.slice_of(path)).is_some(),
            None => true,
        }
    }

    fn record_match(&mut self, file_match: &FileMatch) {
        let context = self.search.context;
        if file_match.is_directory {
            context.telemetry.record_matching_directory();
        } else {
            context.telemetry.record_matching_file();
        }
        if let Some(progress) = &context.progress {
            progress.report_match();
        }
        if context.max_reached() {
            context.set_termination(TerminationReason::MaxReached);
            self.stop_after_emit = true;
        }
    }
}

impl Iterator for Walk<'_, '_> {
    type Item = SearchItem;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.stop_after_emit {
            self.done = true;
            return None;
        }

        if let Some(path) = self.root_file.take() {
            self.done = true;
            let metadata = match fs::symlink_metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    self.report_error(&path, &SearchError::read_failed(&path, e));
                    return None;
                }
            };
            let file_match = self.evaluate(&path, &metadata, false)?;
            self.record_match(&file_match);
            return Some(SearchItem::new(file_match, self.base.clone()));
        }

        loop {
            if self.search.context.is_canceled() {
                self.search
                    .context
                    .set_termination(TerminationReason::Canceled);
                self.done = true;
                return None;
            }

            if !self.init_top_frame() {
                if self.stack.is_empty() {
                    return None;
                }
                continue;
            }

            let (path, symlink_metadata) = {
                let frame = self.stack.last_mut()?;
                match frame.entries.as_mut().expect("initialized above").next() {
                    Some(name) => {
                        let path = frame.path.join(name);
                        match fs::symlink_metadata(&path) {
                            Ok(metadata) => (path, metadata),
                            Err(e) => {
                                let err = SearchError::read_failed(&path, e);
                                self.report_error(&path, &err);
                                continue;
                            }
                        }
                    }
                    None => {
                        let frame = self.stack.pop().expect("frame exists");
                        trace!("leaving {}", frame.path.display());
                        self.search.context.telemetry.record_searched_directory();
                        continue;
                    }
                }
            };

            let follow_symlinks = self
                .search
                .filter
                .attributes
                .contains(FileAttributes::SYMLINK);
            let is_dir = symlink_metadata.is_dir()
                || (symlink_metadata.file_type().is_symlink()
                    && follow_symlinks
                    && fs::metadata(&path).map(|m| m.is_dir()).unwrap_or(false));
            let file_match = self.evaluate(&path, &symlink_metadata, is_dir);

            if is_dir && self.should_descend(&path, &symlink_metadata) {
                self.push_directory(path);
            }

            if let Some(file_match) = file_match {
                self.record_match(&file_match);
                return Some(SearchItem::new(file_match, self.base.clone()));
            }
        }
    }
}
