use std::fmt::Write;
use std::path::Path;

use similar::{ChangeTag, TextDiff};

/// Renders a unified diff of a pending replacement, shown on dry runs.
pub fn unified_diff(path: &Path, old: &str, new: &str) -> String {
    let diff = TextDiff::from_lines(old, new);
    let mut out = String::new();
    let _ = writeln!(out, "--- {}", path.display());
    let _ = writeln!(out, "+++ {}", path.display());

    for hunk in diff.unified_diff().context_radius(3).iter_hunks() {
        let _ = writeln!(out, "{}", hunk.header());
        for change in hunk.iter_changes() {
            let sign = match change.tag() {
                ChangeTag::Delete => '-',
                ChangeTag::Insert => '+',
                ChangeTag::Equal => ' ',
            };
            let _ = write!(out, "{sign}{}", change.value());
            if !change.value().ends_with('\n') {
                out.push('\n');
            }
        }
    }
    out
}
