//! Line diffing and windowed diff rendering.
//!
//! [`render_diff`] shows every changed line with its line numbers, but only a
//! small window of unchanged context around each change, so the output grows
//! with the number of edited regions rather than with file size.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::ops::Range;

use similar::{Algorithm, DiffTag as OpTag, capture_diff_slices};

/// Unchanged lines shown on each side of a change.
pub const CONTEXT_LINES: usize = 3;

/// Body emitted when both sides are identical.
pub const NO_CHANGES: &str = "No changes";

const RULE_WIDTH: usize = 60;
const ELLIPSIS: &str = "      ...  │ ";
const SUMMARY_MAX_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffTag {
    Equal,
    Replace,
    Delete,
    Insert,
}

/// One span of an edit script over two line sequences.
///
/// Opcodes returned by [`compute_opcodes`] are maximal and contiguous: the
/// `old` ranges tile the old sequence and the `new` ranges tile the new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffOpcode {
    pub tag: DiffTag,
    pub old: Range<usize>,
    pub new: Range<usize>,
}

impl DiffOpcode {
    #[must_use]
    pub fn is_change(&self) -> bool {
        self.tag != DiffTag::Equal
    }
}

/// Compute a minimal (longest-common-subsequence) edit script between two
/// line sequences.
///
/// Adjacent delete and insert spans are folded into a single `Replace`.
#[must_use]
pub fn compute_opcodes(old: &[&str], new: &[&str]) -> Vec<DiffOpcode> {
    let mut opcodes: Vec<DiffOpcode> = Vec::new();

    for op in capture_diff_slices(Algorithm::Myers, old, new) {
        let (tag, old_range, new_range) = op.as_tag_tuple();
        if old_range.is_empty() && new_range.is_empty() {
            continue;
        }
        let tag = match tag {
            OpTag::Equal => DiffTag::Equal,
            OpTag::Delete => DiffTag::Delete,
            OpTag::Insert => DiffTag::Insert,
            OpTag::Replace => DiffTag::Replace,
        };
        push_merged(
            &mut opcodes,
            DiffOpcode {
                tag,
                old: old_range,
                new: new_range,
            },
        );
    }

    opcodes
}

fn push_merged(opcodes: &mut Vec<DiffOpcode>, next: DiffOpcode) {
    if let Some(last) = opcodes.last_mut() {
        let merged = match (last.tag, next.tag) {
            (a, b) if a == b => Some(a),
            (DiffTag::Equal, _) | (_, DiffTag::Equal) => None,
            _ => Some(DiffTag::Replace),
        };
        if let Some(tag) = merged {
            last.tag = tag;
            last.old.end = next.old.end;
            last.new.end = next.new.end;
            return;
        }
    }
    opcodes.push(next);
}

/// Render a windowed diff of `old` → `new` under a `File changes:` header.
///
/// Identical inputs render the [`NO_CHANGES`] sentinel without diffing.
#[must_use]
pub fn render_diff(old: &str, new: &str, label: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "File changes: {label}");
    out.push_str(&"=".repeat(RULE_WIDTH));
    out.push('\n');

    if old == new {
        out.push_str(NO_CHANGES);
        out.push('\n');
        return out;
    }

    let old_lines: Vec<&str> = old.split('\n').collect();
    let new_lines: Vec<&str> = new.split('\n').collect();
    let opcodes = compute_opcodes(&old_lines, &new_lines);
    let last_old_line = old_lines.len() - 1;

    let first_shown = opcodes
        .iter()
        .find(|op| op.is_change())
        .map_or(old_lines.len(), |op| op.old.start.saturating_sub(CONTEXT_LINES));
    if first_shown > 0 {
        push_ellipsis(&mut out);
    }

    for (idx, op) in opcodes.iter().enumerate() {
        match op.tag {
            DiffTag::Equal => {
                let has_prev = idx > 0;
                let has_next = idx + 1 < opcodes.len();
                let (start, end) = (op.old.start, op.old.end);
                match (has_prev, has_next) {
                    (true, true) if end - start > CONTEXT_LINES * 2 => {
                        push_context(&mut out, &old_lines, op, start..start + CONTEXT_LINES);
                        push_ellipsis(&mut out);
                        let tail = (end - CONTEXT_LINES).max(start + CONTEXT_LINES);
                        push_context(&mut out, &old_lines, op, tail..end);
                    }
                    (true, true) => push_context(&mut out, &old_lines, op, start..end),
                    (true, false) => {
                        push_context(&mut out, &old_lines, op, start..end.min(start + CONTEXT_LINES));
                    }
                    (false, true) => {
                        let from = end.saturating_sub(CONTEXT_LINES).max(start);
                        push_context(&mut out, &old_lines, op, from..end);
                    }
                    (false, false) => {}
                }
            }
            DiffTag::Replace => {
                push_removed(&mut out, &old_lines, op.old.clone());
                push_added(&mut out, &new_lines, op.new.clone());
            }
            DiffTag::Delete => push_removed(&mut out, &old_lines, op.old.clone()),
            DiffTag::Insert => push_added(&mut out, &new_lines, op.new.clone()),
        }
    }

    let last_shown = opcodes
        .iter()
        .rev()
        .find(|op| op.is_change())
        .map(|op| (op.old.end + CONTEXT_LINES).saturating_sub(1).min(last_old_line));
    if last_shown.is_none_or(|line| line < last_old_line) {
        push_ellipsis(&mut out);
    }

    out
}

/// Render a diff prefixed with a short summary of the replaced text.
#[must_use]
pub fn render_focused_diff(
    old: &str,
    new: &str,
    label: &str,
    removed: &str,
    added: &str,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Incremental edit applied to: {label}");
    out.push_str("Changes:\n");
    let _ = writeln!(out, "  - Removed: {:?}", truncate_summary(removed));
    let _ = writeln!(out, "  + Added: {:?}", truncate_summary(added));
    out.push('\n');
    out.push_str(&render_diff(old, new, label));
    out
}

fn truncate_summary(text: &str) -> Cow<'_, str> {
    if text.chars().count() <= SUMMARY_MAX_CHARS {
        return Cow::Borrowed(text);
    }
    let mut truncated: String = text.chars().take(SUMMARY_MAX_CHARS - 3).collect();
    truncated.push_str("...");
    Cow::Owned(truncated)
}

fn push_ellipsis(out: &mut String) {
    out.push_str(ELLIPSIS);
    out.push('\n');
}

fn push_context(out: &mut String, old_lines: &[&str], op: &DiffOpcode, lines: Range<usize>) {
    for i in lines {
        let new_line = op.new.start + (i - op.old.start) + 1;
        let _ = writeln!(out, " {:4} {:4} │ {}", i + 1, new_line, old_lines[i]);
    }
}

fn push_removed(out: &mut String, old_lines: &[&str], lines: Range<usize>) {
    for i in lines {
        let _ = writeln!(out, "-{:4}      │ {}", i + 1, old_lines[i]);
    }
}

fn push_added(out: &mut String, new_lines: &[&str], lines: Range<usize>) {
    for j in lines {
        let _ = writeln!(out, "+     {:4} │ {}", j + 1, new_lines[j]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("line {i}")).collect()
    }

    fn body(rendered: &str) -> Vec<&str> {
        rendered.lines().skip(2).collect()
    }

    fn is_context(line: &str) -> bool {
        line.starts_with(' ') && !line.starts_with(ELLIPSIS.trim_end())
    }

    #[test]
    fn identical_inputs_render_sentinel() {
        let out = render_diff("a\nb\n", "a\nb\n", "src/lib.rs");
        assert!(out.starts_with("File changes: src/lib.rs\n"));
        assert_eq!(body(&out), vec![NO_CHANGES]);
    }

    #[test]
    fn single_change_in_large_file_is_windowed() {
        let old = numbered(100);
        let mut new = old.clone();
        new[49] = "changed".to_string();
        let out = render_diff(&old.join("\n"), &new.join("\n"), "big.txt");
        let lines = body(&out);

        let context = lines.iter().filter(|l| is_context(l)).count();
        let ellipses = lines.iter().filter(|l| l.contains("...")).count();
        assert!(context <= CONTEXT_LINES * 2 + 1, "context lines: {context}");
        assert_eq!(ellipses, 2);
        assert!(lines.contains(&"-  50      │ line 50"));
        assert!(lines.contains(&"+       50 │ changed"));
        assert!(lines.contains(&"   47   47 │ line 47"));
        assert!(lines.contains(&"   53   53 │ line 53"));
    }

    #[test]
    fn change_on_first_line_has_no_leading_ellipsis() {
        let old = numbered(10).join("\n");
        let new = old.replacen("line 1\n", "first\n", 1);
        let out = render_diff(&old, &new, "f");
        let lines = body(&out);
        assert_eq!(lines[0], "-   1      │ line 1");
        assert_eq!(lines[1], "+        1 │ first");
        assert_eq!(*lines.last().unwrap(), ELLIPSIS);
    }

    #[test]
    fn change_on_last_line_has_no_trailing_ellipsis() {
        let old = numbered(10).join("\n");
        let new = old.replace("line 10", "last");
        let out = render_diff(&old, &new, "f");
        let lines = body(&out);
        assert_eq!(lines[0], ELLIPSIS);
        assert_eq!(*lines.last().unwrap(), "+       10 │ last");
    }

    #[test]
    fn distant_changes_split_the_middle_span() {
        let old = numbered(30);
        let mut new = old.clone();
        new[4] = "five".to_string();
        new[24] = "twenty-five".to_string();
        let out = render_diff(&old.join("\n"), &new.join("\n"), "f");
        let lines = body(&out);

        let ellipses = lines.iter().filter(|l| l.contains("...")).count();
        assert_eq!(ellipses, 3);
        assert!(lines.contains(&"    8    8 │ line 8"));
        assert!(!lines.iter().any(|l| l.ends_with("│ line 15")));
        assert!(lines.contains(&"   22   22 │ line 22"));
    }

    #[test]
    fn close_changes_keep_the_whole_gap() {
        let old = numbered(12);
        let mut new = old.clone();
        new[2] = "three".to_string();
        new[7] = "eight".to_string();
        let out = render_diff(&old.join("\n"), &new.join("\n"), "f");
        for n in 4..=7 {
            let expected = format!("{n:5}{n:5} │ line {n}");
            assert!(out.contains(&expected), "missing context line {n}");
        }
    }

    #[test]
    fn pure_insertion_numbers_against_new_file() {
        let out = render_diff("a\nb", "a\nx\nb", "f");
        assert!(out.contains("+        2 │ x"));
        assert!(out.contains("    1    1 │ a"));
        assert!(out.contains("    2    3 │ b"));
    }

    #[test]
    fn opcodes_tile_both_sequences() {
        let old = ["a", "b", "c", "d", "e"];
        let new = ["a", "x", "c", "e", "f"];
        let ops = compute_opcodes(&old, &new);

        let mut old_pos = 0;
        let mut new_pos = 0;
        for pair in ops.windows(2) {
            assert_ne!(pair[0].tag, pair[1].tag, "adjacent opcodes share a tag");
        }
        for op in &ops {
            assert_eq!(op.old.start, old_pos);
            assert_eq!(op.new.start, new_pos);
            old_pos = op.old.end;
            new_pos = op.new.end;
        }
        assert_eq!(old_pos, old.len());
        assert_eq!(new_pos, new.len());
        assert!(ops.iter().any(|op| op.tag == DiffTag::Replace));
    }

    #[test]
    fn focused_diff_summarizes_and_truncates() {
        let long = "x".repeat(120);
        let out = render_focused_diff("a\nb", "a\nc", "f.rs", &long, "c");
        assert!(out.starts_with("Incremental edit applied to: f.rs\nChanges:\n"));
        let removed = out.lines().nth(2).unwrap();
        assert!(removed.ends_with("...\""));
        assert_eq!(removed.len(), "  - Removed: \"".len() + 77 + 4);
        assert!(out.contains("  + Added: \"c\""));
        assert!(out.contains("File changes: f.rs"));
    }
}
