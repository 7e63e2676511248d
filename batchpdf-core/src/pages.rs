//! Page selection expressions
//!
//! Two resolution modes share this module:
//!
//! - **Selection**: `"1,3,5-12"` resolves against a page count to an ascending
//!   set of unique, 1-based page numbers. A blank expression or `all` selects
//!   every page.
//! - **Partition**: `"every N pages"` splits `[1, page_count]` into contiguous,
//!   non-overlapping groups; the last group may be shorter.
//!
//! Resolution is deterministic: the same expression and page count always
//! produce the same result, independent of term order.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::RangeInclusive;
use thiserror::Error;

lazy_static! {
    static ref TERM: Regex =
        Regex::new(r"^([0-9]+)(?:\s*-\s*([0-9]+))?$").expect("page term pattern is valid");
}

/// Errors produced while resolving a page expression
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PageSelectionError {
    /// Malformed term, reversed range or invalid group size
    #[error("Invalid page expression near '{token}': {reason}")]
    InvalidSyntax { token: String, reason: String },

    /// A referenced page lies outside `[1, page_count]`
    #[error("Page {page} is out of range (document has {page_count} pages)")]
    OutOfRange { page: u64, page_count: u32 },

    /// The expression resolved to no pages at all
    #[error("Page selection is empty")]
    EmptyResult,
}

impl PageSelectionError {
    fn syntax(token: &str, reason: impl Into<String>) -> Self {
        PageSelectionError::InvalidSyntax {
            token: token.to_string(),
            reason: reason.into(),
        }
    }
}

/// Inclusive, 1-based range of pages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl PageRange {
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start >= 1 && start <= end);
        Self { start, end }
    }

    /// Number of pages in the range
    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, page: u32) -> bool {
        (self.start..=self.end).contains(&page)
    }

    pub fn pages(&self) -> RangeInclusive<u32> {
        self.start..=self.end
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Ascending set of unique, 1-based page numbers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageSelection {
    pages: Vec<u32>,
}

impl PageSelection {
    /// Every page of a document with `page_count` pages
    pub fn all(page_count: u32) -> Self {
        Self {
            pages: (1..=page_count).collect(),
        }
    }

    fn from_set(pages: BTreeSet<u32>) -> Self {
        Self {
            pages: pages.into_iter().collect(),
        }
    }

    pub fn pages(&self) -> &[u32] {
        &self.pages
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, page: u32) -> bool {
        self.pages.binary_search(&page).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.pages.iter().copied()
    }

    /// Drop page 1 from an already resolved selection (page numbering)
    pub fn skip_first_page(mut self) -> Result<Self, PageSelectionError> {
        self.pages.retain(|&page| page != 1);
        if self.pages.is_empty() {
            return Err(PageSelectionError::EmptyResult);
        }
        Ok(self)
    }

    /// Collapse the selection into maximal contiguous ranges
    pub fn to_ranges(&self) -> Vec<PageRange> {
        let mut ranges: Vec<PageRange> = Vec::new();
        for &page in &self.pages {
            match ranges.last_mut() {
                Some(last) if last.end + 1 == page => last.end = page,
                _ => ranges.push(PageRange::new(page, page)),
            }
        }
        ranges
    }
}

impl fmt::Display for PageSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranges: Vec<String> = self.to_ranges().iter().map(|r| r.to_string()).collect();
        f.write_str(&ranges.join(","))
    }
}

/// Outcome of resolving an operation's page parameter against one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ResolvedPages {
    Selection { pages: PageSelection },
    Partition { groups: Vec<PageRange> },
}

impl ResolvedPages {
    /// Number of output groups (selection counts as one)
    pub fn group_count(&self) -> usize {
        match self {
            ResolvedPages::Selection { .. } => 1,
            ResolvedPages::Partition { groups } => groups.len(),
        }
    }
}

/// Resolve a selection expression such as `"1,3,5-12"` against `page_count`
pub fn parse_selection(expr: &str, page_count: u32) -> Result<PageSelection, PageSelectionError> {
    let expr = expr.trim();

    if expr.is_empty() || expr.eq_ignore_ascii_case("all") {
        if page_count == 0 {
            return Err(PageSelectionError::EmptyResult);
        }
        return Ok(PageSelection::all(page_count));
    }

    let mut pages = BTreeSet::new();
    for term in expr.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (start, end) = parse_term(term)?;

        if start < 1 || start > u64::from(page_count) {
            return Err(PageSelectionError::OutOfRange {
                page: start,
                page_count,
            });
        }
        if end > u64::from(page_count) {
            return Err(PageSelectionError::OutOfRange {
                page: end,
                page_count,
            });
        }

        // Bounds are checked above, so both fit in u32
        pages.extend(start as u32..=end as u32);
    }

    if pages.is_empty() {
        return Err(PageSelectionError::EmptyResult);
    }

    Ok(PageSelection::from_set(pages))
}

fn parse_term(term: &str) -> Result<(u64, u64), PageSelectionError> {
    let captures = TERM
        .captures(term)
        .ok_or_else(|| PageSelectionError::syntax(term, "expected a page number or range"))?;

    let number = |index: usize| -> Result<Option<u64>, PageSelectionError> {
        captures
            .get(index)
            .map(|m| {
                m.as_str()
                    .parse::<u64>()
                    .map_err(|_| PageSelectionError::syntax(term, "page number is too large"))
            })
            .transpose()
    };

    let start = number(1)?.ok_or_else(|| PageSelectionError::syntax(term, "missing page number"))?;
    let end = number(2)?.unwrap_or(start);

    if start > end {
        return Err(PageSelectionError::syntax(
            term,
            format!("range start {start} is greater than end {end}"),
        ));
    }

    Ok((start, end))
}

/// Split `[1, page_count]` into groups of `group_size` pages
pub fn parse_partition(page_count: u32, group_size: u32) -> Result<Vec<PageRange>, PageSelectionError> {
    if group_size == 0 {
        return Err(PageSelectionError::syntax("0", "group size must be at least 1"));
    }
    if page_count == 0 {
        return Err(PageSelectionError::EmptyResult);
    }

    let mut groups = Vec::with_capacity(page_count.div_ceil(group_size) as usize);
    let mut start = 1u32;
    while start <= page_count {
        let end = start.saturating_add(group_size - 1).min(page_count);
        groups.push(PageRange::new(start, end));
        if end == page_count {
            break;
        }
        start = end + 1;
    }

    Ok(groups)
}

/// Parse an "every N pages" expression and partition the document
pub fn parse_partition_expr(expr: &str, page_count: u32) -> Result<Vec<PageRange>, PageSelectionError> {
    let expr = expr.trim();
    let group_size = expr
        .parse::<u32>()
        .map_err(|_| PageSelectionError::syntax(expr, "expected a positive number of pages"))?;
    parse_partition(page_count, group_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_mixed_terms() {
        let selection = parse_selection("1,3,5-12", 12).unwrap();
        assert_eq!(selection.pages(), &[1, 3, 5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_reversed_range_is_syntax_error() {
        match parse_selection("5-3", 10) {
            Err(PageSelectionError::InvalidSyntax { token, .. }) => assert_eq!(token, "5-3"),
            other => panic!("Expected InvalidSyntax, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicates_merge() {
        assert_eq!(parse_selection("1,1,2", 5).unwrap().pages(), &[1, 2]);
        assert_eq!(parse_selection("2-4,3-5", 5).unwrap().pages(), &[2, 3, 4, 5]);
    }

    #[test]
    fn test_zero_is_out_of_range() {
        assert_eq!(
            parse_selection("0-3", 5),
            Err(PageSelectionError::OutOfRange {
                page: 0,
                page_count: 5
            })
        );
    }

    #[test]
    fn test_past_end_is_out_of_range() {
        assert_eq!(
            parse_selection("2, 4-9", 6),
            Err(PageSelectionError::OutOfRange {
                page: 9,
                page_count: 6
            })
        );
    }

    #[test]
    fn test_order_is_normalized() {
        let a = parse_selection("9,1-2,5", 10).unwrap();
        let b = parse_selection("5,1,9,2", 10).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.pages(), &[1, 2, 5, 9]);
    }

    #[test]
    fn test_whitespace_and_empty_terms() {
        let selection = parse_selection("  3 , ,1 - 2 ,", 4).unwrap();
        assert_eq!(selection.pages(), &[1, 2, 3]);
    }

    #[test]
    fn test_all_and_blank() {
        assert_eq!(parse_selection("", 3).unwrap().pages(), &[1, 2, 3]);
        assert_eq!(parse_selection("ALL", 2).unwrap().pages(), &[1, 2]);
        assert_eq!(parse_selection("all", 0), Err(PageSelectionError::EmptyResult));
    }

    #[test]
    fn test_only_separators_is_empty() {
        assert_eq!(parse_selection(", ,", 4), Err(PageSelectionError::EmptyResult));
    }

    #[test]
    fn test_garbage_terms() {
        for expr in ["a", "1-", "-3", "1-2-3", "1.5", "one"] {
            assert!(
                matches!(
                    parse_selection(expr, 10),
                    Err(PageSelectionError::InvalidSyntax { .. })
                ),
                "{expr} should be rejected"
            );
        }
    }

    #[test]
    fn test_huge_number() {
        assert!(matches!(
            parse_selection("99999999999999999999999", 10),
            Err(PageSelectionError::InvalidSyntax { .. })
        ));
        assert_eq!(
            parse_selection("1-4000000000", 10),
            Err(PageSelectionError::OutOfRange {
                page: 4_000_000_000,
                page_count: 10
            })
        );
    }

    #[test]
    fn test_skip_first_page() {
        let selection = parse_selection("1-3", 5).unwrap().skip_first_page().unwrap();
        assert_eq!(selection.pages(), &[2, 3]);

        let untouched = parse_selection("2,4", 5).unwrap().skip_first_page().unwrap();
        assert_eq!(untouched.pages(), &[2, 4]);

        assert_eq!(
            parse_selection("1", 5).unwrap().skip_first_page(),
            Err(PageSelectionError::EmptyResult)
        );
    }

    #[test]
    fn test_partition() {
        let groups = parse_partition(10, 3).unwrap();
        let pages: Vec<Vec<u32>> = groups.iter().map(|g| g.pages().collect()).collect();
        assert_eq!(
            pages,
            vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9], vec![10]]
        );
    }

    #[test]
    fn test_partition_exact_multiple() {
        let groups = parse_partition(6, 3).unwrap();
        assert_eq!(groups, vec![PageRange::new(1, 3), PageRange::new(4, 6)]);
    }

    #[test]
    fn test_partition_group_larger_than_document() {
        assert_eq!(parse_partition(2, 50).unwrap(), vec![PageRange::new(1, 2)]);
        assert_eq!(
            parse_partition(u32::MAX, u32::MAX).unwrap(),
            vec![PageRange::new(1, u32::MAX)]
        );
    }

    #[test]
    fn test_partition_invalid() {
        assert!(matches!(
            parse_partition(10, 0),
            Err(PageSelectionError::InvalidSyntax { .. })
        ));
        assert_eq!(parse_partition(0, 2), Err(PageSelectionError::EmptyResult));
        assert!(parse_partition_expr("two", 10).is_err());
        assert_eq!(parse_partition_expr(" 5 ", 10).unwrap().len(), 2);
    }

    #[test]
    fn test_to_ranges_and_display() {
        let selection = parse_selection("1,2,3,7,9-10", 12).unwrap();
        assert_eq!(
            selection.to_ranges(),
            vec![
                PageRange::new(1, 3),
                PageRange::new(7, 7),
                PageRange::new(9, 10)
            ]
        );
        assert_eq!(selection.to_string(), "1-3,7,9-10");
    }

    #[test]
    fn test_error_messages_carry_context() {
        let error = parse_selection("3,x", 5).unwrap_err();
        assert!(error.to_string().contains("'x'"));

        let error = parse_selection("8", 5).unwrap_err();
        assert!(error.to_string().contains("Page 8"));
        assert!(error.to_string().contains("5 pages"));
    }
}
