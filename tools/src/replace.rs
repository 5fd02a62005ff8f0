//! Fuzzy locate-and-replace for file edits.
//!
//! Models rarely reproduce whitespace exactly, so an edit target is located by
//! a fixed ladder of increasingly permissive strategies. The first strategy
//! that yields a usable candidate wins; later strategies are never consulted,
//! even if they would also match.
//!
//! A candidate is the literal text of the *original* content. Substitution
//! always operates on that literal, so normalization only affects how the
//! target is found, never what gets written.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("static regex is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplaceError {
    #[error("oldString and newString must be different")]
    NoOp,
    #[error("oldString not found in content")]
    NotFound,
    #[error(
        "oldString matches multiple locations; add surrounding context to make it unique or set replaceAll"
    )]
    Ambiguous,
}

/// Matching rules in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchStrategy {
    Exact,
    LineTrimmed,
    WhitespaceNormalized,
    IndentationFlexible,
}

impl MatchStrategy {
    pub const ORDER: [MatchStrategy; 4] = [
        MatchStrategy::Exact,
        MatchStrategy::LineTrimmed,
        MatchStrategy::WhitespaceNormalized,
        MatchStrategy::IndentationFlexible,
    ];

    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            MatchStrategy::Exact => 0,
            MatchStrategy::LineTrimmed => 1,
            MatchStrategy::WhitespaceNormalized => 2,
            MatchStrategy::IndentationFlexible => 3,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MatchStrategy::Exact => "exact",
            MatchStrategy::LineTrimmed => "line-trimmed",
            MatchStrategy::WhitespaceNormalized => "whitespace-normalized",
            MatchStrategy::IndentationFlexible => "indentation-flexible",
        }
    }

    fn candidates<'c>(self, content: &'c str, find: &str) -> Vec<MatchCandidate<'c>> {
        match self {
            MatchStrategy::Exact => exact(content, find),
            MatchStrategy::LineTrimmed => line_trimmed(content, find),
            MatchStrategy::WhitespaceNormalized => whitespace_normalized(content, find),
            MatchStrategy::IndentationFlexible => indentation_flexible(content, find),
        }
    }
}

/// A located span of the original content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchCandidate<'c> {
    pub strategy: MatchStrategy,
    /// Exact text of the content that will be replaced.
    pub literal: &'c str,
    pub start: usize,
    pub end: usize,
}

impl<'c> MatchCandidate<'c> {
    fn new(strategy: MatchStrategy, content: &'c str, span: Range<usize>) -> Self {
        Self {
            strategy,
            literal: &content[span.clone()],
            start: span.start,
            end: span.end,
        }
    }

    /// Whether the literal occurs exactly once in `content`.
    #[must_use]
    pub fn is_unique_in(&self, content: &str) -> bool {
        content.find(self.literal) == content.rfind(self.literal)
    }
}

/// Find the span an edit of `find` should replace.
///
/// Returns the first candidate, in strategy order, that is usable: unique in
/// `content`, or any candidate at all when `replace_all` is set.
pub fn locate<'c>(
    content: &'c str,
    find: &str,
    replace_all: bool,
) -> Result<MatchCandidate<'c>, ReplaceError> {
    let mut saw_candidate = false;
    for strategy in MatchStrategy::ORDER {
        for candidate in strategy.candidates(content, find) {
            if candidate.literal.is_empty() {
                continue;
            }
            saw_candidate = true;
            if replace_all || candidate.is_unique_in(content) {
                return Ok(candidate);
            }
        }
    }
    if saw_candidate {
        Err(ReplaceError::Ambiguous)
    } else {
        Err(ReplaceError::NotFound)
    }
}

/// Replace `old` with `new` in `content`.
///
/// An empty `old` means the caller is creating a file: `new` is returned as
/// the whole content without searching.
pub fn replace(
    content: &str,
    old: &str,
    new: &str,
    replace_all: bool,
) -> Result<String, ReplaceError> {
    if old == new {
        return Err(ReplaceError::NoOp);
    }
    if old.is_empty() {
        return Ok(new.to_string());
    }
    let candidate = locate(content, old, replace_all)?;
    debug!(strategy = candidate.strategy.as_str(), "located edit target");
    Ok(apply(content, &candidate, new, replace_all))
}

/// Substitute `new` for a located candidate.
#[must_use]
pub fn apply(content: &str, candidate: &MatchCandidate<'_>, new: &str, replace_all: bool) -> String {
    if replace_all {
        content.replace(candidate.literal, new)
    } else {
        content.replacen(candidate.literal, new, 1)
    }
}

/// Byte spans of each `\n`-separated line, newline excluded.
///
/// Mirrors `str::split('\n')`, including the trailing empty line after a final
/// newline.
fn line_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    for (i, byte) in text.bytes().enumerate() {
        if byte == b'\n' {
            spans.push(start..i);
            start = i + 1;
        }
    }
    spans.push(start..text.len());
    spans
}

fn block_span(spans: &[Range<usize>], first: usize, count: usize) -> Range<usize> {
    spans[first].start..spans[first + count - 1].end
}

fn exact<'c>(content: &'c str, find: &str) -> Vec<MatchCandidate<'c>> {
    content
        .find(find)
        .map(|start| MatchCandidate::new(MatchStrategy::Exact, content, start..start + find.len()))
        .into_iter()
        .collect()
}

fn line_trimmed<'c>(content: &'c str, find: &str) -> Vec<MatchCandidate<'c>> {
    let spans = line_spans(content);
    let mut search: Vec<&str> = find.split('\n').collect();
    if search.len() > 1 && search.last().is_some_and(|line| line.is_empty()) {
        search.pop();
    }
    if search.len() > spans.len() {
        return Vec::new();
    }

    for first in 0..=spans.len() - search.len() {
        let matches = search
            .iter()
            .enumerate()
            .all(|(j, wanted)| content[spans[first + j].clone()].trim() == wanted.trim());
        if matches {
            let span = block_span(&spans, first, search.len());
            return vec![MatchCandidate::new(MatchStrategy::LineTrimmed, content, span)];
        }
    }
    Vec::new()
}

fn normalize_whitespace(text: &str) -> String {
    WHITESPACE_RUN.replace_all(text.trim(), " ").into_owned()
}

fn whitespace_normalized<'c>(content: &'c str, find: &str) -> Vec<MatchCandidate<'c>> {
    let spans = line_spans(content);
    let wanted = normalize_whitespace(find);
    let mut found = Vec::new();

    for span in &spans {
        if normalize_whitespace(&content[span.clone()]) == wanted {
            found.push(MatchCandidate::new(
                MatchStrategy::WhitespaceNormalized,
                content,
                span.clone(),
            ));
        }
    }

    let find_lines = find.split('\n').count();
    if find_lines > 1 && find_lines <= spans.len() {
        for first in 0..=spans.len() - find_lines {
            let span = block_span(&spans, first, find_lines);
            if normalize_whitespace(&content[span.clone()]) == wanted {
                found.push(MatchCandidate::new(
                    MatchStrategy::WhitespaceNormalized,
                    content,
                    span,
                ));
            }
        }
    }

    found
}

fn leading_indent(line: &str) -> usize {
    line.bytes().take_while(|b| *b == b' ' || *b == b'\t').count()
}

/// Strip the smallest leading indentation shared by the non-blank lines.
fn strip_common_indent(text: &str) -> String {
    let min_indent = text
        .split('\n')
        .filter(|line| !line.trim().is_empty())
        .map(leading_indent)
        .min();
    let Some(min_indent) = min_indent else {
        return text.to_string();
    };

    text.split('\n')
        .map(|line| {
            if line.trim().is_empty() || line.len() <= min_indent {
                line
            } else {
                &line[min_indent..]
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn indentation_flexible<'c>(content: &'c str, find: &str) -> Vec<MatchCandidate<'c>> {
    let spans = line_spans(content);
    let wanted = strip_common_indent(find);
    let find_lines = find.split('\n').count();
    if find_lines > spans.len() {
        return Vec::new();
    }

    (0..=spans.len() - find_lines)
        .map(|first| block_span(&spans, first, find_lines))
        .filter(|span| strip_common_indent(&content[span.clone()]) == wanted)
        .map(|span| MatchCandidate::new(MatchStrategy::IndentationFlexible, content, span))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_op_fails_before_searching() {
        assert_eq!(
            replace("anything", "same", "same", false),
            Err(ReplaceError::NoOp)
        );
        assert_eq!(replace("", "", "", true), Err(ReplaceError::NoOp));
    }

    #[test]
    fn empty_old_text_returns_new_content() {
        assert_eq!(replace("ignored", "", "fresh", false).unwrap(), "fresh");
    }

    #[test]
    fn exact_unique_match_wins_first() {
        let content = "fn main() {\n    println!(\"hi\");\n}\n";
        let candidate = locate(content, "println!(\"hi\")", false).unwrap();
        assert_eq!(candidate.strategy, MatchStrategy::Exact);
        assert_eq!(candidate.start, content.find("println").unwrap());

        let out = replace(content, "println!(\"hi\")", "println!(\"bye\")", false).unwrap();
        assert_eq!(out, "fn main() {\n    println!(\"bye\");\n}\n");
    }

    #[test]
    fn duplicate_literal_is_ambiguous_without_replace_all() {
        let content = "let x = 1;\nlet y = 2;\nlet x = 1;\n";
        assert_eq!(
            replace(content, "let x = 1;", "let x = 3;", false),
            Err(ReplaceError::Ambiguous)
        );
        let out = replace(content, "let x = 1;", "let x = 3;", true).unwrap();
        assert_eq!(out, "let x = 3;\nlet y = 2;\nlet x = 3;\n");
    }

    #[test]
    fn missing_text_is_not_found() {
        assert_eq!(
            replace("alpha\nbeta\n", "gamma", "delta", false),
            Err(ReplaceError::NotFound)
        );
    }

    #[test]
    fn leading_whitespace_difference_uses_line_trimmed() {
        let content = "impl Foo {\n        fn bar(&self) {\n            todo!()\n        }\n}\n";
        let find = "fn bar(&self) {\n    todo!()\n}";
        let candidate = locate(content, find, false).unwrap();
        assert_eq!(candidate.strategy, MatchStrategy::LineTrimmed);
        assert_eq!(
            candidate.literal,
            "        fn bar(&self) {\n            todo!()\n        }"
        );

        let out = replace(content, find, "fn bar(&self) {}", false).unwrap();
        assert_eq!(out, "impl Foo {\nfn bar(&self) {}\n}\n");
    }

    #[test]
    fn line_trimmed_ignores_trailing_newline_in_pattern() {
        let content = "a\n  b\nc";
        let candidate = locate(content, " b \n", false).unwrap();
        assert_eq!(candidate.strategy, MatchStrategy::LineTrimmed);
        assert_eq!(candidate.literal, "  b");
    }

    #[test]
    fn interior_whitespace_uses_whitespace_normalized() {
        let content = "let  total =   a +  b;\nreturn total;\n";
        let candidate = locate(content, "let total = a + b;", false).unwrap();
        assert_eq!(candidate.strategy, MatchStrategy::WhitespaceNormalized);
        assert_eq!(candidate.literal, "let  total =   a +  b;");
    }

    #[test]
    fn whitespace_normalized_matches_multi_line_blocks() {
        let content = "if  ok {\n\trun( );\n}\n";
        let find = "if ok {\n run( );\n}";
        let candidate = locate(content, find, false).unwrap();
        assert!(candidate.strategy <= MatchStrategy::WhitespaceNormalized);
        assert_eq!(candidate.literal, "if  ok {\n\trun( );\n}");
    }

    #[test]
    fn indentation_flexible_matches_reindented_blocks() {
        let content = "fn f() {\n    if x {\n        y();\n    }\n}\n";
        let find = "if x {\n    y();\n}";
        let candidate = strip_common_indent(find);
        assert_eq!(candidate, "if x {\n    y();\n}");

        let found = indentation_flexible(content, find);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].literal, "    if x {\n        y();\n    }");
    }

    #[test]
    fn strategy_precedence_is_first_usable() {
        // Exact finds two copies (unusable); line-trimmed then finds the first
        // block, which is the same literal and therefore also ambiguous.
        let content = "x = 1\nx = 1\n";
        assert_eq!(locate(content, "x = 1", false), Err(ReplaceError::Ambiguous));
        let first = locate(content, "x = 1", true).unwrap();
        assert_eq!(first.strategy, MatchStrategy::Exact);
    }

    #[test]
    fn replace_all_uses_winning_literal() {
        let content = "  call();\nother();\n  call();\n";
        let out = replace(content, "call();", "done();", true).unwrap();
        assert_eq!(out, "  done();\nother();\n  done();\n");
    }

    #[test]
    fn line_spans_match_split() {
        let text = "a\n\nbc\n";
        let spans = line_spans(text);
        let pieces: Vec<&str> = spans.iter().map(|s| &text[s.clone()]).collect();
        assert_eq!(pieces, text.split('\n').collect::<Vec<_>>());
    }

    #[test]
    fn ranks_follow_order() {
        let ranks: Vec<u8> = MatchStrategy::ORDER.iter().map(|s| s.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }
}
