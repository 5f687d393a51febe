use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use encoding_rs::Encoding;
use filetime::FileTime;
use memmap2::Mmap;
use tempfile::NamedTempFile;
use tracing::{debug, trace};

use crate::errors::{SearchError, SearchResult};
use crate::filters::Filter;
use crate::results::FilterMatch;

/// Files at or above this size are read through a memory map.
pub(crate) const LARGE_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;

/// A decoded file: its text plus what is needed to write it back
/// faithfully.
#[derive(Debug)]
pub struct DecodedFile {
    pub text: String,
    pub encoding: &'static Encoding,
    pub had_bom: bool,
}

fn decode(bytes: &[u8], path: &Path, default_encoding: &str) -> SearchResult<DecodedFile> {
    let (encoding, had_bom) = match Encoding::for_bom(bytes) {
        Some((encoding, _)) => (encoding, true),
        None => {
            let encoding = Encoding::for_label(default_encoding.as_bytes())
                .ok_or_else(|| SearchError::unknown_enum("encoding", default_encoding))?;
            (encoding, false)
        }
    };
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        return Err(SearchError::encoding_error(path, encoding.name()));
    }
    Ok(DecodedFile {
        text: text.into_owned(),
        encoding,
        had_bom,
    })
}

/// Reads and decodes a whole file. Large files go through a memory map,
/// the rest through a plain read, as in the size-stratified search path.
pub fn read_file(path: &Path, default_encoding: &str) -> SearchResult<DecodedFile> {
    let metadata = fs::metadata(path).map_err(|e| SearchError::read_failed(path, e))?;
    if metadata.len() >= LARGE_FILE_THRESHOLD {
        trace!("memory-mapping {}", path.display());
        let file = File::open(path).map_err(|e| SearchError::read_failed(path, e))?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| SearchError::read_failed(path, e))?;
        decode(&mmap, path, default_encoding)
    } else {
        let bytes = fs::read(path).map_err(|e| SearchError::read_failed(path, e))?;
        decode(&bytes, path, default_encoding)
    }
}

/// Convenience wrapper returning just the text.
pub fn read_to_string(path: &Path, default_encoding: &str) -> SearchResult<String> {
    read_file(path, default_encoding).map(|d| d.text)
}

/// What replaces each match: a template with `$1`/`$name` references, or a
/// side-effect-free evaluator.
pub enum Replacement<'a> {
    Template(&'a str),
    Evaluator(&'a dyn Fn(&FilterMatch) -> String),
}

/// Applies the filter's matches to `text` in left-to-right non-overlapping
/// order. Returns the edited buffer and the number of replacements.
pub fn replace_text(filter: &Filter, text: &str, replacement: &Replacement) -> (String, usize) {
    let mut output = String::with_capacity(text.len());
    let mut last = 0;
    let mut count = 0;

    for captures in filter.regex().captures_iter(text) {
        // A group-scoped filter replaces the group span; otherwise the
        // whole match is replaced.
        let span = match filter_group_span(filter, &captures) {
            Some(span) => span,
            None => continue,
        };
        if span.0 < last {
            continue;
        }
        output.push_str(&text[last..span.0]);
        match replacement {
            Replacement::Template(template) => {
                captures.expand(template, &mut output);
            }
            Replacement::Evaluator(evaluator) => {
                let matched = FilterMatch::new(span.0, span.1, &text[span.0..span.1]);
                output.push_str(&evaluator(&matched));
            }
        }
        last = span.1;
        count += 1;
    }
    output.push_str(&text[last..]);
    (output, count)
}

fn filter_group_span(filter: &Filter, captures: &regex::Captures<'_>) -> Option<(usize, usize)> {
    let group = filter.group_index().unwrap_or(0);
    captures.get(group).map(|m| (m.start(), m.end()))
}

/// Writes the edited buffer next to the original and renames it over,
/// restoring permissions and the modification time. No partial write is
/// ever observable at the original path.
pub fn write_replaced(path: &Path, decoded: &DecodedFile, new_text: &str) -> SearchResult<()> {
    let metadata = fs::metadata(path).map_err(|e| SearchError::read_failed(path, e))?;
    let mtime = FileTime::from_last_modification_time(&metadata);
    let parent = path.parent().unwrap_or_else(|| Path::new("."));

    let mut temp =
        NamedTempFile::new_in(parent).map_err(|e| SearchError::write_failed(path, e))?;
    // encoding_rs has no UTF-16 encoder; those two are serialized by hand.
    let bytes: Vec<u8> = match decoded.encoding.name() {
        "UTF-16LE" => new_text
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect(),
        "UTF-16BE" => new_text
            .encode_utf16()
            .flat_map(|unit| unit.to_be_bytes())
            .collect(),
        _ => decoded.encoding.encode(new_text).0.into_owned(),
    };
    if decoded.had_bom {
        let bom: &[u8] = match decoded.encoding.name() {
            "UTF-16LE" => &[0xFF, 0xFE],
            "UTF-16BE" => &[0xFE, 0xFF],
            _ => &[0xEF, 0xBB, 0xBF],
        };
        temp.write_all(bom)
            .map_err(|e| SearchError::write_failed(path, e))?;
    }
    temp.write_all(&bytes)
        .map_err(|e| SearchError::write_failed(path, e))?;
    temp.persist(path)
        .map_err(|e| SearchError::write_failed(path, e.error))?;

    fs::set_permissions(path, metadata.permissions())
        .map_err(|e| SearchError::write_failed(path, e))?;
    filetime::set_file_mtime(path, mtime).map_err(|e| SearchError::write_failed(path, e))?;
    debug!("replaced content of {}", path.display());
    Ok(())
}

/// Applies a replacement to the name part of a path. `None` when the name
/// filter does not match or the replacement leaves the name unchanged.
pub fn propose_new_name(
    filter: &Filter,
    path: &Path,
    replacement: &Replacement,
) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let (new_name, count) = replace_text(filter, name, replacement);
    if count == 0 || new_name == name || new_name.is_empty() {
        return None;
    }
    Some(new_name)
}

/// Resolves the rename target for `path` within its parent, failing with
/// `RenameConflict` when the target already exists as a different file.
/// An existing target that canonicalizes to `path` itself is a case-only
/// change on a case-insensitive filesystem, not a conflict.
pub fn check_rename(path: &Path, new_name: &str) -> SearchResult<PathBuf> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let target = parent.join(new_name);
    if target.exists() {
        let same_file = fs::canonicalize(&target)
            .and_then(|t| fs::canonicalize(path).map(|p| t == p))
            .unwrap_or(false);
        if !same_file {
            return Err(SearchError::rename_conflict(target));
        }
    }
    Ok(target)
}

/// Renames `path` to `new_name` within its parent. A case-only change
/// goes through a unique intermediate name, since a direct rename may be
/// a no-op.
pub fn rename_path(path: &Path, new_name: &str) -> SearchResult<PathBuf> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let target = check_rename(path, new_name)?;

    if target.exists() {
        let intermediate = parent.join(format!(".{new_name}.orang-rename"));
        fs::rename(path, &intermediate).map_err(|e| SearchError::write_failed(path, e))?;
        fs::rename(&intermediate, &target).map_err(|e| SearchError::write_failed(&target, e))?;
    } else {
        fs::rename(path, &target).map_err(|e| SearchError::write_failed(path, e))?;
    }
    debug!("renamed {} -> {}", path.display(), target.display());
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::PatternOptions;
    use std::fs;
    use tempfile::tempdir;

    fn plain(pattern: &str) -> Filter {
        Filter::new(pattern, PatternOptions::default()).unwrap()
    }

    #[test]
    fn decode_utf8_without_bom() {
        let decoded = decode("héllo".as_bytes(), Path::new("x"), "utf-8").unwrap();
        assert_eq!(decoded.text, "héllo");
        assert!(!decoded.had_bom);
    }

    #[test]
    fn decode_honours_bom_over_default() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "hi".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let decoded = decode(&bytes, Path::new("x"), "utf-8").unwrap();
        assert_eq!(decoded.text, "hi");
        assert!(decoded.had_bom);
        assert_eq!(decoded.encoding.name(), "UTF-16LE");
    }

    #[test]
    fn decode_error_surfaces_path() {
        let err = decode(&[0xC3, 0x28], Path::new("bad.txt"), "utf-8").unwrap_err();
        assert!(matches!(err, SearchError::EncodingError { .. }));
    }

    #[test]
    fn replace_with_backreferences() {
        let filter = plain(r"(\w+)@(\w+)");
        let (text, count) = replace_text(
            &filter,
            "mail me at foo@example now",
            &Replacement::Template("$2.$1"),
        );
        assert_eq!(text, "mail me at example.foo now");
        assert_eq!(count, 1);
    }

    #[test]
    fn replace_is_left_to_right_non_overlapping() {
        let filter = plain("aa");
        let (text, count) = replace_text(&filter, "aaaa", &Replacement::Template("b"));
        assert_eq!(text, "bb");
        assert_eq!(count, 2);
    }

    #[test]
    fn replace_group_scoped() {
        let filter = plain(r"v(?P<num>\d+)").with_group("num").unwrap();
        let (text, count) = replace_text(&filter, "v1 v2", &Replacement::Template("9"));
        assert_eq!(text, "v9 v9");
        assert_eq!(count, 2);
    }

    #[test]
    fn replace_with_evaluator() {
        let filter = plain(r"\d+");
        let double = |m: &FilterMatch| (m.value.parse::<u64>().unwrap() * 2).to_string();
        let (text, _) = replace_text(&filter, "2 and 21", &Replacement::Evaluator(&double));
        assert_eq!(text, "4 and 42");
    }

    #[test]
    fn write_replaced_is_atomic_and_preserves_mtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        fs::write(&path, "hello hello").unwrap();
        let mtime = FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(&path, mtime).unwrap();

        let decoded = read_file(&path, "utf-8").unwrap();
        let filter = plain("hello");
        let (new_text, _) = replace_text(&filter, &decoded.text, &Replacement::Template("world"));
        write_replaced(&path, &decoded, &new_text).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "world world");
        let after = FileTime::from_last_modification_time(&fs::metadata(&path).unwrap());
        assert_eq!(after.unix_seconds(), mtime.unix_seconds());
    }

    #[test]
    fn utf16_file_stays_utf16_after_replace() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wide.txt");
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "old text".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        fs::write(&path, &bytes).unwrap();

        let decoded = read_file(&path, "utf-8").unwrap();
        let filter = plain("old");
        let (new_text, _) = replace_text(&filter, &decoded.text, &Replacement::Template("new"));
        write_replaced(&path, &decoded, &new_text).unwrap();

        let written = fs::read(&path).unwrap();
        assert_eq!(&written[..2], &[0xFF, 0xFE]);
        let reread = read_file(&path, "utf-8").unwrap();
        assert_eq!(reread.text, "new text");
        assert_eq!(reread.encoding.name(), "UTF-16LE");
    }

    #[test]
    fn replace_twice_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        fs::write(&path, "spam and spam").unwrap();

        let filter = plain("spam");
        for _ in 0..2 {
            let decoded = read_file(&path, "utf-8").unwrap();
            let (new_text, _) =
                replace_text(&filter, &decoded.text, &Replacement::Template("eggs"));
            write_replaced(&path, &decoded, &new_text).unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "eggs and eggs");
    }

    #[test]
    fn rename_detects_conflict() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();

        let err = rename_path(&a, "b.txt").unwrap_err();
        assert!(matches!(err, SearchError::RenameConflict { .. }));
        assert!(a.exists());
    }

    #[test]
    fn check_rename_treats_same_file_as_non_conflict() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "x").unwrap();
        fs::write(&b, "y").unwrap();

        // The target canonicalizes to the source itself: a case-only
        // style change, not a conflict.
        assert!(check_rename(&a, "a.txt").is_ok());
        assert!(matches!(
            check_rename(&a, "b.txt"),
            Err(SearchError::RenameConflict { .. })
        ));
        assert!(check_rename(&a, "fresh.txt").is_ok());
    }

    #[test]
    fn rename_moves_file() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("old.txt");
        fs::write(&a, "data").unwrap();

        let target = rename_path(&a, "new.txt").unwrap();
        assert!(!a.exists());
        assert_eq!(fs::read_to_string(target).unwrap(), "data");
    }

    #[test]
    fn propose_new_name_skips_non_matches() {
        let filter = plain("draft");
        let replacement = Replacement::Template("final");
        assert_eq!(
            propose_new_name(&filter, Path::new("/x/draft-1.md"), &replacement).as_deref(),
            Some("final-1.md")
        );
        assert!(propose_new_name(&filter, Path::new("/x/done.md"), &replacement).is_none());
    }
}
