use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use orang::content::{read_file, replace_text, write_replaced, Replacement};
use orang::ops::{CollectSink, DeleteExecutor, ReplaceExecutor};
use orang::{
    FileSystemFilter, Filter, PatternOptions, SearchContext, SearchOptions, SearchPath,
};
use orang::command::{Command, CommandVerb};
use tempfile::TempDir;

fn plain(pattern: &str) -> Filter {
    Filter::new(pattern, PatternOptions::default()).unwrap()
}

/// Byte snapshot of a whole tree, for dry-run purity checks.
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

#[test]
fn fixed_template_replacement_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("doc.txt");
    fs::write(&path, "one pattern, two pattern, red pattern").unwrap();

    let filter = plain("pattern");
    for _ in 0..2 {
        let decoded = read_file(&path, "utf-8").unwrap();
        let (new_text, _) = replace_text(&filter, &decoded.text, &Replacement::Template("fish"));
        write_replaced(&path, &decoded, &new_text).unwrap();
    }

    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "one fish, two fish, red fish"
    );

    // A third run finds matches no longer and leaves the bytes alone.
    let before = fs::read(&path).unwrap();
    let decoded = read_file(&path, "utf-8").unwrap();
    let (new_text, count) = replace_text(&filter, &decoded.text, &Replacement::Template("fish"));
    assert_eq!(count, 0);
    assert_eq!(new_text.as_bytes(), before.as_slice());
}

#[test]
fn replace_ignore_case_scenario() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("x.md"), "hello\nHELLO\n").unwrap();

    let options = SearchOptions {
        paths: vec![SearchPath::argument(temp.path())],
        recurse: true,
        ..Default::default()
    };
    let pattern_options = PatternOptions {
        ignore_case: true,
        ..Default::default()
    };
    let content = Filter::new("hello", pattern_options).unwrap();
    let filter = FileSystemFilter {
        content: Some(content.clone()),
        ..Default::default()
    };

    let context = SearchContext::new(0, false);
    let mut sink = CollectSink::default();
    let mut consumer = ReplaceExecutor {
        sink: &mut sink,
        filter: content,
        template: "world".to_string(),
        default_encoding: "utf-8".to_string(),
        dry_run: false,
        preview: None,
    };
    let command = Command {
        verb: CommandVerb::Replace,
        options: &options,
        filter: &filter,
        directory_filter: None,
    };
    let outcome = command.execute(&context, &mut consumer).unwrap();

    assert!(outcome.matched);
    assert_eq!(
        fs::read_to_string(temp.path().join("x.md")).unwrap(),
        "world\nworld\n"
    );
}

#[test]
fn dry_run_replace_leaves_bytes_untouched() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("a.md"), "hello there").unwrap();
    fs::write(temp.path().join("b.md"), "no match").unwrap();
    let before = snapshot(temp.path());

    let options = SearchOptions {
        paths: vec![SearchPath::argument(temp.path())],
        recurse: true,
        dry_run: true,
        ..Default::default()
    };
    let content = plain("hello");
    let filter = FileSystemFilter {
        content: Some(content.clone()),
        ..Default::default()
    };

    let context = SearchContext::new(0, false);
    let mut sink = CollectSink::default();
    let mut consumer = ReplaceExecutor {
        sink: &mut sink,
        filter: content,
        template: "goodbye".to_string(),
        default_encoding: "utf-8".to_string(),
        dry_run: true,
        preview: None,
    };
    let command = Command {
        verb: CommandVerb::Replace,
        options: &options,
        filter: &filter,
        directory_filter: None,
    };
    command.execute(&context, &mut consumer).unwrap();
    drop(consumer);

    assert_eq!(snapshot(temp.path()), before);
    // Counts report as if the run had executed.
    assert_eq!(context.telemetry.snapshot().updated_count, 1);
    assert_eq!(sink.lines, vec!["UPD a.md"]);
}

#[test]
fn dry_run_delete_reports_every_match() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("one.tmp"), "1").unwrap();
    fs::write(temp.path().join("two.tmp"), "2").unwrap();
    fs::write(temp.path().join("keep.txt"), "3").unwrap();
    let before = snapshot(temp.path());

    let options = SearchOptions {
        paths: vec![SearchPath::argument(temp.path())],
        recurse: true,
        dry_run: true,
        ..Default::default()
    };
    let filter = FileSystemFilter {
        name: Some(plain(r"\.tmp$")),
        ..Default::default()
    };

    let context = SearchContext::new(0, false);
    let mut sink = CollectSink::default();
    let mut consumer = DeleteExecutor {
        sink: &mut sink,
        recursive: false,
        dry_run: true,
    };
    let command = Command {
        verb: CommandVerb::Delete,
        options: &options,
        filter: &filter,
        directory_filter: None,
    };
    command.execute(&context, &mut consumer).unwrap();

    assert_eq!(snapshot(temp.path()), before);
    assert_eq!(context.telemetry.snapshot().deleted_count, 2);
    let mut lines = sink.lines.clone();
    lines.sort();
    assert_eq!(lines, vec!["DEL one.tmp", "DEL two.tmp"]);
}

/// Group-scoped replacement rewrites only the group span.
#[test]
fn group_replacement_end_to_end() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("versions.toml");
    fs::write(&path, "alpha = \"1.2\"\nbeta = \"3.4\"\n").unwrap();

    let filter = plain(r#"= "(?P<version>[\d.]+)""#)
        .with_group("version")
        .unwrap();
    let decoded = read_file(&path, "utf-8").unwrap();
    let (new_text, count) = replace_text(&filter, &decoded.text, &Replacement::Template("0.0"));
    assert_eq!(count, 2);
    assert_eq!(new_text, "alpha = \"0.0\"\nbeta = \"0.0\"\n");
}
