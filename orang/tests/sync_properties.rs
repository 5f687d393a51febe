use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use orang::ops::CollectSink;
use orang::{
    CompareOptions, ConflictResolution, FileSystemFilter, SearchContext, Synchronizer,
    TerminationReason,
};
use tempfile::TempDir;

fn write(root: &Path, rel: &str, content: &str) -> PathBuf {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, content).unwrap();
    path
}

fn set_mtime(path: &Path, seconds: i64) {
    filetime::set_file_mtime(path, FileTime::from_unix_time(seconds, 0)).unwrap();
}

fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut map = BTreeMap::new();
    fn visit(root: &Path, dir: &Path, map: &mut BTreeMap<PathBuf, Vec<u8>>) {
        for entry in fs::read_dir(dir).unwrap().flatten() {
            let path = entry.path();
            let rel = path.strip_prefix(root).unwrap().to_path_buf();
            if path.is_dir() {
                map.insert(rel.clone(), Vec::new());
                visit(root, &path, map);
            } else {
                map.insert(rel, fs::read(&path).unwrap());
            }
        }
    }
    visit(root, root, &mut map);
    map
}

fn sync(
    left: &Path,
    right: &Path,
    conflict: ConflictResolution,
    compare: CompareOptions,
    dry_run: bool,
) -> SearchContext {
    let filter = FileSystemFilter::default();
    let context = SearchContext::new(0, false);
    let mut sink = CollectSink::default();
    {
        let mut synchronizer = Synchronizer::new(
            &filter, None, "utf-8", compare, conflict, dry_run, &context, &mut sink, None,
        );
        synchronizer.synchronize(left, right).unwrap();
    }
    assert_ne!(context.termination(), TerminationReason::Canceled);
    context
}

/// After a complete sync, a second run with the same options performs zero
/// mutations.
#[test]
fn sync_convergence() {
    let left = TempDir::new().unwrap();
    let right = TempDir::new().unwrap();
    let a = write(left.path(), "docs/a.txt", "alpha");
    set_mtime(&a, 1_700_000_000);
    let b = write(left.path(), "docs/deep/b.txt", "beta");
    set_mtime(&b, 1_700_000_111);
    write(right.path(), "stale.txt", "stale");

    sync(
        left.path(),
        right.path(),
        ConflictResolution::LeftWins,
        CompareOptions::default(),
        false,
    );
    assert_eq!(snapshot(left.path()), snapshot(right.path()));

    let second = sync(
        left.path(),
        right.path(),
        ConflictResolution::LeftWins,
        CompareOptions::default(),
        false,
    );
    let s = second.telemetry.snapshot();
    assert_eq!(s.added_count, 0);
    assert_eq!(s.updated_count, 0);
    assert_eq!(s.deleted_count, 0);
    assert_eq!(s.renamed_count, 0);
}

/// With every common file differing in content (same size, same mtime),
/// the conflict policy picks the surviving version on both sides.
#[test]
fn sync_policy_mirrors_winning_side() {
    for (conflict, winner) in [
        (ConflictResolution::LeftWins, "LLLL"),
        (ConflictResolution::RightWins, "RRRR"),
    ] {
        let left = TempDir::new().unwrap();
        let right = TempDir::new().unwrap();
        for name in ["a.txt", "b.txt"] {
            let l = write(left.path(), name, "LLLL");
            let r = write(right.path(), name, "RRRR");
            set_mtime(&l, 1_700_000_000);
            set_mtime(&r, 1_700_000_000);
        }

        sync(
            left.path(),
            right.path(),
            conflict,
            CompareOptions::CONTENT | CompareOptions::MODIFIED_TIME,
            false,
        );

        for name in ["a.txt", "b.txt"] {
            assert_eq!(fs::read_to_string(left.path().join(name)).unwrap(), winner);
            assert_eq!(fs::read_to_string(right.path().join(name)).unwrap(), winner);
        }
    }
}

/// A same-content, same-mtime file under a new name on the right is
/// renamed, not copied.
#[test]
fn sync_rename_detection() {
    let left = TempDir::new().unwrap();
    let right = TempDir::new().unwrap();
    let foo = write(left.path(), "docs/foo.txt", "body bytes");
    let bar = write(right.path(), "docs/bar.txt", "body bytes");
    set_mtime(&foo, 1_700_000_000);
    set_mtime(&bar, 1_700_000_000);

    let context = sync(
        left.path(),
        right.path(),
        ConflictResolution::LeftWins,
        CompareOptions::CONTENT | CompareOptions::MODIFIED_TIME,
        false,
    );

    let s = context.telemetry.snapshot();
    assert_eq!(s.renamed_count, 1);
    assert_eq!(s.added_count, 0);
    assert_eq!(s.updated_count, 0);
    assert_eq!(s.deleted_count, 0);
    assert!(right.path().join("docs/foo.txt").exists());
    assert!(!right.path().join("docs/bar.txt").exists());
}

/// Rename soundness: size-or-content mismatches disqualify candidates even
/// when mtimes collide.
#[test]
fn sync_rename_requires_byte_equality() {
    let left = TempDir::new().unwrap();
    let right = TempDir::new().unwrap();
    let foo = write(left.path(), "foo.txt", "AAAA");
    // Same mtime, same size, different bytes: not a rename.
    let near = write(right.path(), "near.txt", "BBBB");
    // Same mtime, different size: not a rename.
    let short = write(right.path(), "short.txt", "A");
    for p in [&foo, &near, &short] {
        set_mtime(p, 1_700_000_000);
    }

    let context = sync(
        left.path(),
        right.path(),
        ConflictResolution::LeftWins,
        CompareOptions::CONTENT | CompareOptions::MODIFIED_TIME,
        false,
    );

    assert_eq!(context.telemetry.snapshot().renamed_count, 0);
    assert!(right.path().join("foo.txt").exists());
}

/// With LeftWins and a newer left copy, the right copy is overwritten
/// once and only once.
#[test]
fn sync_newer_conflict() {
    let left = TempDir::new().unwrap();
    let right = TempDir::new().unwrap();
    let l = write(left.path(), "a.txt", "fresh");
    let r = write(right.path(), "a.txt", "stale");
    set_mtime(&l, 1_704_153_600); // 2024-01-02
    set_mtime(&r, 1_704_067_200); // 2024-01-01

    let context = sync(
        left.path(),
        right.path(),
        ConflictResolution::LeftWins,
        CompareOptions::default(),
        false,
    );

    assert_eq!(fs::read_to_string(&r).unwrap(), "fresh");
    let s = context.telemetry.snapshot();
    assert_eq!(s.updated_count, 1);
    assert_eq!(s.added_count, 0);
    assert_eq!(s.deleted_count, 0);
}

/// Dry-run purity: both trees are byte-identical before and after, while
/// the counters report the planned work.
#[test]
fn sync_dry_run_purity() {
    let left = TempDir::new().unwrap();
    let right = TempDir::new().unwrap();
    let a = write(left.path(), "new/a.txt", "alpha");
    set_mtime(&a, 1_700_000_000);
    write(right.path(), "junk.txt", "junk");
    let left_before = snapshot(left.path());
    let right_before = snapshot(right.path());

    let context = sync(
        left.path(),
        right.path(),
        ConflictResolution::LeftWins,
        CompareOptions::default(),
        true,
    );

    assert_eq!(snapshot(left.path()), left_before);
    assert_eq!(snapshot(right.path()), right_before);
    let s = context.telemetry.snapshot();
    // The new directory and file would be added; the stale file deleted.
    assert_eq!(s.added_count, 2);
    assert_eq!(s.deleted_count, 1);
}

/// A right-only tree is reported as one deletion, in dry and real runs
/// alike.
#[test]
fn sync_deletes_trees_once() {
    for dry_run in [true, false] {
        let left = TempDir::new().unwrap();
        let right = TempDir::new().unwrap();
        write(right.path(), "junk/a.txt", "a");
        write(right.path(), "junk/sub/b.txt", "b");

        let context = sync(
            left.path(),
            right.path(),
            ConflictResolution::LeftWins,
            CompareOptions::default(),
            dry_run,
        );

        assert_eq!(
            context.telemetry.snapshot().deleted_count,
            1,
            "dry_run={dry_run}"
        );
        assert_eq!(right.path().join("junk").exists(), dry_run);
    }
}

/// Filters restrict what the synchronizer touches.
#[test]
fn sync_honours_filters() {
    let left = TempDir::new().unwrap();
    let right = TempDir::new().unwrap();
    write(left.path(), "a.log", "log");
    write(left.path(), "a.txt", "txt");

    let filter = FileSystemFilter {
        extension: Some(
            orang::Filter::new("^log$", orang::PatternOptions::default())
                .unwrap()
                .for_part(orang::NamePart::Extension),
        ),
        ..Default::default()
    };
    let context = SearchContext::new(0, false);
    let mut sink = CollectSink::default();
    {
        let mut synchronizer = Synchronizer::new(
            &filter,
            None,
            "utf-8",
            CompareOptions::default(),
            ConflictResolution::LeftWins,
            false,
            &context,
            &mut sink,
            None,
        );
        synchronizer.synchronize(left.path(), right.path()).unwrap();
    }

    assert!(right.path().join("a.log").exists());
    assert!(!right.path().join("a.txt").exists());
}
