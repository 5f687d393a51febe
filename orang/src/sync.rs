use std::collections::HashSet;
use std::fs::{self, File, Metadata};
use std::io::Read;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use filetime::FileTime;
use tracing::{debug, trace};

use crate::config::{SearchPath, SearchTarget};
use crate::context::{SearchContext, TerminationReason};
use crate::errors::{SearchError, SearchResult};
use crate::filters::{FileSystemFilter, Filter};
use crate::ops::{copy_file_preserving, OutputSink};
use crate::walk::FileSystemSearch;

const COMPARE_CHUNK: usize = 64 * 1024;

bitflags! {
    /// What makes two files "equal" for the synchronizer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompareOptions: u8 {
        const ATTRIBUTES = 1;
        const CONTENT = 1 << 1;
        const MODIFIED_TIME = 1 << 2;
        const SIZE = 1 << 3;
    }
}

impl CompareOptions {
    pub fn parse_list(input: &str) -> SearchResult<Self> {
        let mut options = CompareOptions::empty();
        for token in input.split(',').filter(|t| !t.trim().is_empty()) {
            options |= match token.trim() {
                "attributes" | "a" => CompareOptions::ATTRIBUTES,
                "content" | "c" => CompareOptions::CONTENT,
                "modified-time" | "mt" => CompareOptions::MODIFIED_TIME,
                "size" | "s" => CompareOptions::SIZE,
                other => return Err(SearchError::unknown_enum("compare option", other)),
            };
        }
        Ok(options)
    }
}

impl Default for CompareOptions {
    fn default() -> Self {
        CompareOptions::MODIFIED_TIME | CompareOptions::SIZE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    LeftWins,
    RightWins,
    Ask,
}

impl ConflictResolution {
    pub fn parse(input: &str) -> SearchResult<Self> {
        match input.trim() {
            "left-wins" | "l" => Ok(ConflictResolution::LeftWins),
            "right-wins" | "r" => Ok(ConflictResolution::RightWins),
            "ask" | "a" => Ok(ConflictResolution::Ask),
            other => Err(SearchError::unknown_enum("conflict resolution", other)),
        }
    }

    /// Left and right swap between the two passes; `Ask` stays.
    pub fn invert(self) -> Self {
        match self {
            ConflictResolution::LeftWins => ConflictResolution::RightWins,
            ConflictResolution::RightWins => ConflictResolution::LeftWins,
            ConflictResolution::Ask => ConflictResolution::Ask,
        }
    }
}

/// Answer from the interactive conflict prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogResult {
    Yes,
    YesToAll,
    No,
    NoToAll,
    /// Skip this pair without a verdict.
    None,
    Cancel,
}

pub trait ConflictPrompt {
    fn ask(&mut self, question: &str) -> DialogResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    LeftToRight,
    RightToLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    LeftToRightPass,
    Transfer,
    RightToLeftPass,
    Summary,
}

/// Destination-directory listing cached while consecutive siblings share
/// the same parent; holds no file handles.
struct DirectoryData {
    parent: PathBuf,
    files: Vec<(PathBuf, FileTime, u64)>,
}

impl DirectoryData {
    fn load(parent: &Path) -> Self {
        let mut files = Vec::new();
        if let Ok(entries) = fs::read_dir(parent) {
            for entry in entries.flatten() {
                let path = entry.path();
                if let Ok(metadata) = entry.metadata() {
                    if metadata.is_file() {
                        files.push((
                            path,
                            FileTime::from_last_modification_time(&metadata),
                            metadata.len(),
                        ));
                    }
                }
            }
        }
        Self {
            parent: parent.to_path_buf(),
            files,
        }
    }
}

/// Two-pass bidirectional directory synchronizer.
pub struct Synchronizer<'a, 'p> {
    pub filter: &'a FileSystemFilter,
    pub directory_filter: Option<&'a Filter>,
    pub default_encoding: &'a str,
    pub compare: CompareOptions,
    pub dry_run: bool,
    pub context: &'a SearchContext,
    pub sink: &'a mut dyn OutputSink,
    pub prompt: Option<&'p mut dyn ConflictPrompt>,
    conflict: ConflictResolution,
    destination_paths: HashSet<PathBuf>,
    ignored_paths: HashSet<PathBuf>,
    /// Source-side directories deleted during the current pass; their
    /// descendants are not revisited (a dry run never walks into a tree it
    /// already reported as deleted).
    pruned: Vec<PathBuf>,
    dir_data: Option<DirectoryData>,
}

impl<'a, 'p> Synchronizer<'a, 'p> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        filter: &'a FileSystemFilter,
        directory_filter: Option<&'a Filter>,
        default_encoding: &'a str,
        compare: CompareOptions,
        conflict: ConflictResolution,
        dry_run: bool,
        context: &'a SearchContext,
        sink: &'a mut dyn OutputSink,
        prompt: Option<&'p mut dyn ConflictPrompt>,
    ) -> Self {
        let compare = if compare.is_empty() {
            CompareOptions::default()
        } else {
            compare
        };
        Self {
            filter,
            directory_filter,
            default_encoding,
            compare,
            dry_run,
            context,
            sink,
            prompt,
            conflict,
            destination_paths: HashSet::new(),
            ignored_paths: HashSet::new(),
            pruned: Vec::new(),
            dir_data: None,
        }
    }

    /// Runs the `LtoR -> Transfer -> RtoL -> Summary` state machine.
    /// Cancellation and the matching-files cap jump straight to `Summary`.
    pub fn synchronize(&mut self, left: &Path, right: &Path) -> SearchResult<()> {
        let mut state = SyncState::LeftToRightPass;
        loop {
            state = match state {
                SyncState::LeftToRightPass => {
                    self.pass(left, right, Direction::LeftToRight)?;
                    if self.context.termination() == TerminationReason::None {
                        SyncState::Transfer
                    } else {
                        SyncState::Summary
                    }
                }
                SyncState::Transfer => {
                    self.ignored_paths = std::mem::take(&mut self.destination_paths);
                    self.conflict = self.conflict.invert();
                    self.dir_data = None;
                    SyncState::RightToLeftPass
                }
                SyncState::RightToLeftPass => {
                    self.pass(right, left, Direction::RightToLeft)?;
                    SyncState::Summary
                }
                SyncState::Summary => {
                    self.context.log_summary();
                    return Ok(());
                }
            };
        }
    }

    fn pass(&mut self, source: &Path, destination: &Path, direction: Direction) -> SearchResult<()> {
        debug!(
            "sync pass {} -> {}",
            source.display(),
            destination.display()
        );
        let search = FileSystemSearch {
            filter: self.filter,
            directory_filter: self.directory_filter,
            target: SearchTarget::All,
            recurse: true,
            default_encoding: self.default_encoding,
            context: self.context,
        };
        self.pruned.clear();
        for item in search.walk(&SearchPath::argument(source)) {
            if self.context.termination() == TerminationReason::Canceled {
                break;
            }
            let src = item.path().to_path_buf();
            if direction == Direction::RightToLeft && self.ignored_paths.contains(&src) {
                trace!("already harmonized: {}", src.display());
                continue;
            }
            if self.pruned.iter().any(|root| src.starts_with(root)) {
                continue;
            }
            let Ok(relative) = src.strip_prefix(source) else {
                continue;
            };
            let dest = destination.join(relative);
            self.sync_pair(&src, item.file_match.is_directory, &dest, direction)?;
            self.destination_paths.insert(dest);
        }
        Ok(())
    }

    /// Applies the decision table to one source/destination pair. `src` is
    /// always the walked side; preferring the source for a missing or
    /// kind-differing destination happens on the first pass only.
    fn sync_pair(
        &mut self,
        src: &Path,
        src_is_dir: bool,
        dest: &Path,
        direction: Direction,
    ) -> SearchResult<()> {
        let dest_metadata = fs::symlink_metadata(dest).ok();
        let dest_is_dir = dest_metadata.as_ref().is_some_and(Metadata::is_dir);
        let dest_exists = dest_metadata.is_some();
        let kind_matches = dest_exists && (src_is_dir == dest_is_dir);

        // Equality short-circuit for like kinds.
        if kind_matches {
            if src_is_dir {
                if !self.compare.contains(CompareOptions::ATTRIBUTES)
                    || self.attributes_equal(src, dest)
                {
                    return Ok(());
                }
            } else if self.files_equal(src, dest)? {
                return Ok(());
            }
        }

        let prefer_source = if !kind_matches {
            direction == Direction::LeftToRight
        } else if !src_is_dir {
            let src_time = modification_time(src)?;
            let dest_time = modification_time(dest)?;
            if src_time != dest_time {
                // The newer side wins before the conflict policy gets a say.
                src_time > dest_time
            } else {
                match self.resolve_conflict(src, dest)? {
                    Some(prefer) => prefer,
                    None => return Ok(()),
                }
            }
        } else {
            match self.resolve_conflict(src, dest)? {
                Some(prefer) => prefer,
                None => return Ok(()),
            }
        };

        match (src_is_dir, dest_exists, dest_is_dir, prefer_source) {
            // dir / dir exists
            (true, true, true, true) => self.update_attributes(src, dest),
            (true, true, true, false) => self.update_attributes(dest, src),
            // dir / file exists
            (true, true, false, true) => {
                self.delete_file(dest)?;
                self.create_dir(dest)
            }
            (true, true, false, false) => {
                self.delete_dir(src)?;
                self.copy_file(dest, src)
            }
            // dir / missing
            (true, false, _, true) => self.create_dir(dest),
            (true, false, _, false) => self.delete_dir(src),
            // file / dir exists
            (false, true, true, true) => {
                self.delete_dir(dest)?;
                self.copy_file(src, dest)
            }
            (false, true, true, false) => {
                self.delete_file(src)?;
                self.create_dir(src)
            }
            // file / file exists, differ
            (false, true, false, true) => self.overwrite(src, dest),
            (false, true, false, false) => self.overwrite(dest, src),
            // file / missing
            (false, false, _, true) => {
                if direction == Direction::LeftToRight {
                    if let Some(renamed_from) = self.find_renamed_file(src, dest)? {
                        return self.rename(&renamed_from, dest);
                    }
                }
                self.copy_file(src, dest)
            }
            (false, false, _, false) => self.delete_file(src),
        }
    }

    fn resolve_conflict(&mut self, src: &Path, dest: &Path) -> SearchResult<Option<bool>> {
        match self.conflict {
            ConflictResolution::LeftWins => Ok(Some(true)),
            ConflictResolution::RightWins => Ok(Some(false)),
            ConflictResolution::Ask => {
                let question = format!("overwrite {} with {}?", dest.display(), src.display());
                let answer = match &mut self.prompt {
                    Some(prompt) => prompt.ask(&question),
                    None => DialogResult::None,
                };
                match answer {
                    DialogResult::Yes => Ok(Some(true)),
                    DialogResult::YesToAll => {
                        self.conflict = ConflictResolution::LeftWins;
                        Ok(Some(true))
                    }
                    DialogResult::No => Ok(Some(false)),
                    DialogResult::NoToAll => {
                        self.conflict = ConflictResolution::RightWins;
                        Ok(Some(false))
                    }
                    DialogResult::None => Ok(None),
                    DialogResult::Cancel => {
                        self.context.set_termination(TerminationReason::Canceled);
                        Ok(None)
                    }
                }
            }
        }
    }

    fn attributes_equal(&self, a: &Path, b: &Path) -> bool {
        match (fs::metadata(a), fs::metadata(b)) {
            (Ok(ma), Ok(mb)) => ma.permissions() == mb.permissions(),
            _ => true,
        }
    }

    /// Equality of two files under the active compare options.
    fn files_equal(&self, a: &Path, b: &Path) -> SearchResult<bool> {
        let ma = fs::metadata(a).map_err(|e| SearchError::read_failed(a, e))?;
        let mb = fs::metadata(b).map_err(|e| SearchError::read_failed(b, e))?;

        if self.compare.contains(CompareOptions::SIZE) && ma.len() != mb.len() {
            return Ok(false);
        }
        if self.compare.contains(CompareOptions::MODIFIED_TIME)
            && FileTime::from_last_modification_time(&ma)
                != FileTime::from_last_modification_time(&mb)
        {
            return Ok(false);
        }
        if self.compare.contains(CompareOptions::ATTRIBUTES)
            && ma.permissions() != mb.permissions()
        {
            return Ok(false);
        }
        if self.compare.contains(CompareOptions::CONTENT) {
            if ma.len() != mb.len() {
                return Ok(false);
            }
            let mut fa = File::open(a).map_err(|e| SearchError::read_failed(a, e))?;
            if !self.stream_equals(&mut fa, b)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Rename detection: among destination-directory siblings with the
    /// source's mtime and length, exactly one byte-equal file is its
    /// renamed counterpart.
    fn find_renamed_file(&mut self, src: &Path, dest: &Path) -> SearchResult<Option<PathBuf>> {
        let Some(parent) = dest.parent() else {
            return Ok(None);
        };
        let src_metadata = fs::metadata(src).map_err(|e| SearchError::read_failed(src, e))?;
        let src_mtime = FileTime::from_last_modification_time(&src_metadata);
        let src_len = src_metadata.len();

        if self
            .dir_data
            .as_ref()
            .is_none_or(|data| data.parent.as_path() != parent)
        {
            self.dir_data = Some(DirectoryData::load(parent));
        }
        let data = self.dir_data.as_ref().expect("loaded above");

        let candidates: Vec<PathBuf> = data
            .files
            .iter()
            .filter(|(_, mtime, _)| *mtime == src_mtime)
            .filter(|(_, _, len)| *len == src_len)
            .map(|(path, _, _)| path.clone())
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        // One source handle, rewound per candidate.
        let mut src_file = File::open(src).map_err(|e| SearchError::read_failed(src, e))?;
        let mut survivors = Vec::new();
        for candidate in candidates {
            use std::io::Seek;
            src_file
                .seek(std::io::SeekFrom::Start(0))
                .map_err(|e| SearchError::read_failed(src, e))?;
            if self.stream_equals(&mut src_file, &candidate)? {
                survivors.push(candidate);
            }
            if survivors.len() > 1 {
                return Ok(None);
            }
        }
        Ok(survivors.pop())
    }

    fn stream_equals(&self, src: &mut File, other_path: &Path) -> SearchResult<bool> {
        let mut other =
            File::open(other_path).map_err(|e| SearchError::read_failed(other_path, e))?;
        let mut buf_a = vec![0u8; COMPARE_CHUNK];
        let mut buf_b = vec![0u8; COMPARE_CHUNK];
        loop {
            if self.context.is_canceled() {
                self.context.set_termination(TerminationReason::Canceled);
                return Ok(false);
            }
            let read_a = read_full(src, &mut buf_a).map_err(SearchError::from)?;
            let read_b = read_full(&mut other, &mut buf_b)
                .map_err(|e| SearchError::read_failed(other_path, e))?;
            if read_a != read_b || buf_a[..read_a] != buf_b[..read_b] {
                return Ok(false);
            }
            if read_a == 0 {
                return Ok(true);
            }
        }
    }

    fn create_dir(&mut self, path: &Path) -> SearchResult<()> {
        if !self.dry_run {
            fs::create_dir_all(path).map_err(|e| SearchError::write_failed(path, e))?;
        }
        self.context.telemetry.record_added();
        self.sink.line(&format!("ADD {}", path.display()));
        Ok(())
    }

    fn delete_file(&mut self, path: &Path) -> SearchResult<()> {
        if !self.dry_run {
            fs::remove_file(path).map_err(|e| SearchError::write_failed(path, e))?;
        }
        self.context.telemetry.record_deleted();
        self.sink.line(&format!("DEL {}", path.display()));
        Ok(())
    }

    fn delete_dir(&mut self, path: &Path) -> SearchResult<()> {
        if !self.dry_run {
            fs::remove_dir_all(path).map_err(|e| SearchError::write_failed(path, e))?;
        }
        self.pruned.push(path.to_path_buf());
        self.context.telemetry.record_deleted();
        self.sink.line(&format!("DEL {}", path.display()));
        Ok(())
    }

    fn copy_file(&mut self, from: &Path, to: &Path) -> SearchResult<()> {
        if !self.dry_run {
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent).map_err(|e| SearchError::write_failed(parent, e))?;
            }
            copy_file_preserving(from, to)?;
        }
        self.context.telemetry.record_added();
        self.sink.line(&format!("ADD {}", to.display()));
        Ok(())
    }

    fn overwrite(&mut self, from: &Path, to: &Path) -> SearchResult<()> {
        if !self.dry_run {
            copy_file_preserving(from, to)?;
        }
        self.context.telemetry.record_updated();
        self.sink.line(&format!("UPD {}", to.display()));
        Ok(())
    }

    fn rename(&mut self, from: &Path, to: &Path) -> SearchResult<()> {
        if !self.dry_run {
            fs::rename(from, to).map_err(|e| SearchError::write_failed(to, e))?;
        }
        self.context.telemetry.record_renamed();
        self.sink
            .line(&format!("REN {} -> {}", from.display(), to.display()));
        // The old name must not be revisited by the second pass.
        self.destination_paths.insert(from.to_path_buf());
        Ok(())
    }

    fn update_attributes(&mut self, from: &Path, to: &Path) -> SearchResult<()> {
        if !self.dry_run {
            let permissions = fs::metadata(from)
                .map_err(|e| SearchError::read_failed(from, e))?
                .permissions();
            fs::set_permissions(to, permissions).map_err(|e| SearchError::write_failed(to, e))?;
        }
        self.context.telemetry.record_updated();
        self.sink.line(&format!("UPD {}", to.display()));
        Ok(())
    }
}

fn modification_time(path: &Path) -> SearchResult<FileTime> {
    let metadata = fs::metadata(path).map_err(|e| SearchError::read_failed(path, e))?;
    Ok(FileTime::from_last_modification_time(&metadata))
}

/// Reads until the buffer is full or the stream ends.
fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let read = file.read(&mut buf[total..])?;
        if read == 0 {
            break;
        }
        total += read;
    }
    Ok(total)
}
