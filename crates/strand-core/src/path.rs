#![forbid(unsafe_code)]

//! Store paths and their segments.
//!
//! A [`Path`] addresses a location in the document tree of the reactive
//! store. Store notifications carry dotted path strings (`"users.0.name"`);
//! [`Path::parse`] casts each token into a typed [`Segment`] so that list
//! positions compare as integers and subscription patterns can carry
//! wildcards.
//!
//! # Segment casting
//!
//! | token        | segment              |
//! |--------------|----------------------|
//! | `"0"`, `"17"`| [`Segment::Index`]   |
//! | `"*"`        | [`Segment::Wildcard`]|
//! | `"**"`       | [`Segment::Glob`]    |
//! | anything else (including `"01"`) | [`Segment::Key`] |
//!
//! Only canonical decimal tokens become indices, so `"01"` stays a key and a
//! path always prints back to the string it was parsed from.
//!
//! # Matching
//!
//! Subscriptions are patterns; mutations are concrete paths. A pattern and a
//! concrete path *overlap* when they agree on every position both of them
//! have, with `*` matching any one segment and `**` matching whatever is
//! left. Overlap covers the three cases the event model cares about: the
//! pattern is an ancestor of the mutation, equal to it, or below it.

use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;

/// Inline capacity for path segments. Most view paths are shallow.
const INLINE_SEGMENTS: usize = 4;

/// Backing storage for [`Path`].
pub type Segments = SmallVec<[Segment; INLINE_SEGMENTS]>;

/// Errors produced while parsing a path string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// Two consecutive dots, or a leading/trailing dot.
    #[error("empty segment at position {position} in path `{path}`")]
    EmptySegment { path: String, position: usize },
}

/// One step of a [`Path`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    /// Object member.
    Key(String),
    /// List position.
    Index(usize),
    /// `*`: any single segment (patterns only).
    Wildcard,
    /// `**`: any suffix, including the empty one (patterns only).
    Glob,
}

impl Segment {
    /// Cast a single path token.
    #[must_use]
    pub fn parse(token: &str) -> Self {
        match token {
            "*" => Self::Wildcard,
            "**" => Self::Glob,
            _ if is_canonical_index(token) => token
                .parse()
                .map_or_else(|_| Self::Key(token.to_owned()), Self::Index),
            _ => Self::Key(token.to_owned()),
        }
    }

    /// Create a key segment.
    #[must_use]
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    /// The list position, if this is an index segment.
    #[must_use]
    pub fn as_index(&self) -> Option<usize> {
        match self {
            Self::Index(i) => Some(*i),
            _ => None,
        }
    }

    /// Whether this segment is `*` or `**`.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard | Self::Glob)
    }

    /// Whether this (pattern) segment accepts `other` at the same position.
    #[must_use]
    pub fn accepts(&self, other: &Segment) -> bool {
        match self {
            Self::Wildcard | Self::Glob => true,
            _ => self == other,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => f.write_str(key),
            Self::Index(i) => write!(f, "{i}"),
            Self::Wildcard => f.write_str("*"),
            Self::Glob => f.write_str("**"),
        }
    }
}

impl From<usize> for Segment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for Segment {
    fn from(token: &str) -> Self {
        Self::parse(token)
    }
}

fn is_canonical_index(token: &str) -> bool {
    !token.is_empty()
        && token.bytes().all(|b| b.is_ascii_digit())
        && (token == "0" || !token.starts_with('0'))
}

/// An ordered sequence of [`Segment`]s.
///
/// The empty path is the store root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    segments: Segments,
}

impl Path {
    /// The root path (no segments).
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a dotted path string, casting each token.
    ///
    /// The empty string parses to the root path.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        if path.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Segments::new();
        for (position, token) in path.split('.').enumerate() {
            if token.is_empty() {
                return Err(PathError::EmptySegment {
                    path: path.to_owned(),
                    position,
                });
            }
            segments.push(Segment::parse(token));
        }
        Ok(Self { segments })
    }

    /// Build a path from already-typed segments.
    pub fn from_segments(segments: impl IntoIterator<Item = Segment>) -> Self {
        Self {
            segments: segments.into_iter().collect(),
        }
    }

    /// The segments of this path.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether this is the root path.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The last segment, if any.
    #[must_use]
    pub fn last(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// The path one level up, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Path> {
        let (_, init) = self.segments.split_last()?;
        Some(Self::from_segments(init.iter().cloned()))
    }

    /// A new path with `segment` appended.
    #[must_use]
    pub fn child(&self, segment: impl Into<Segment>) -> Path {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// A new path with every segment of `tail` appended.
    #[must_use]
    pub fn join(&self, tail: &Path) -> Path {
        let mut segments = self.segments.clone();
        segments.extend(tail.segments.iter().cloned());
        Self { segments }
    }

    /// Append a segment in place.
    pub fn push(&mut self, segment: impl Into<Segment>) {
        self.segments.push(segment.into());
    }

    /// Replace the segment at `depth`. Out-of-range depths are ignored.
    pub fn set_segment(&mut self, depth: usize, segment: Segment) {
        if let Some(slot) = self.segments.get_mut(depth) {
            *slot = segment;
        }
    }

    /// Whether `prefix` is a (non-strict) prefix of this path.
    #[must_use]
    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// Whether no segment is a wildcard.
    #[must_use]
    pub fn is_concrete(&self) -> bool {
        !self.segments.iter().any(Segment::is_wildcard)
    }

    /// Treating `self` as a subscription pattern, whether a mutation at
    /// `concrete` reaches it (ancestor, equal, or descendant).
    #[must_use]
    pub fn overlaps(&self, concrete: &Path) -> bool {
        for (pattern, segment) in self.segments.iter().zip(concrete.segments.iter()) {
            if *pattern == Segment::Glob {
                return true;
            }
            if !pattern.accepts(segment) {
                return false;
            }
        }
        true
    }

    /// Iterate the segments.
    pub fn iter(&self) -> std::slice::Iter<'_, Segment> {
        self.segments.iter()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl FromIterator<Segment> for Path {
    fn from_iter<I: IntoIterator<Item = Segment>>(iter: I) -> Self {
        Self::from_segments(iter)
    }
}

impl<'a> IntoIterator for &'a Path {
    type Item = &'a Segment;
    type IntoIter = std::slice::Iter<'a, Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn p(s: &str) -> Path {
        Path::parse(s).expect("valid path")
    }

    #[test]
    fn casts_numeric_tokens_to_indices() {
        let path = p("users.0.name");
        assert_eq!(
            path.segments(),
            &[
                Segment::key("users"),
                Segment::Index(0),
                Segment::key("name")
            ]
        );
    }

    #[test]
    fn non_canonical_numbers_stay_keys() {
        assert_eq!(Segment::parse("01"), Segment::key("01"));
        assert_eq!(Segment::parse("-1"), Segment::key("-1"));
        assert_eq!(Segment::parse("1e3"), Segment::key("1e3"));
        assert_eq!(Segment::parse("10"), Segment::Index(10));
    }

    #[test]
    fn huge_numeric_token_falls_back_to_key() {
        let token = "99999999999999999999999999";
        assert_eq!(Segment::parse(token), Segment::key(token));
    }

    #[test]
    fn wildcards_parse() {
        let path = p("todos.*.done");
        assert_eq!(path.segments()[1], Segment::Wildcard);
        assert!(!path.is_concrete());
        assert_eq!(p("todos.**").last(), Some(&Segment::Glob));
    }

    #[test]
    fn empty_string_is_root() {
        assert!(p("").is_empty());
        assert_eq!(Path::root().to_string(), "");
    }

    #[test]
    fn empty_segments_rejected() {
        assert_eq!(
            Path::parse("a..b"),
            Err(PathError::EmptySegment {
                path: "a..b".into(),
                position: 1
            })
        );
        assert!(Path::parse(".a").is_err());
        assert!(Path::parse("a.").is_err());
    }

    #[test]
    fn parent_and_child() {
        let path = p("todos.2");
        assert_eq!(path.parent(), Some(p("todos")));
        assert_eq!(p("todos").child(2usize), path);
        assert_eq!(Path::root().parent(), None);
        assert_eq!(p("a").join(&p("b.c")), p("a.b.c"));
    }

    #[test]
    fn set_segment_rewrites_in_place() {
        let mut path = p("todos.2.text");
        path.set_segment(1, Segment::Index(5));
        assert_eq!(path, p("todos.5.text"));
        path.set_segment(9, Segment::Index(0));
        assert_eq!(path, p("todos.5.text"));
    }

    #[test]
    fn overlap_covers_ancestor_equal_descendant() {
        let mutated = p("users.0.name");
        assert!(p("users").overlaps(&mutated));
        assert!(p("users.0.name").overlaps(&mutated));
        assert!(p("users.0.name.first").overlaps(&mutated));
        assert!(p("users.*.name").overlaps(&mutated));
        assert!(p("**").overlaps(&mutated));
        assert!(p("users.**").overlaps(&mutated));
        assert!(!p("users.1.name").overlaps(&mutated));
        assert!(!p("users.*.email").overlaps(&mutated));
        assert!(!p("posts").overlaps(&mutated));
    }

    #[test]
    fn root_pattern_overlaps_everything() {
        assert!(Path::root().overlaps(&p("a.b")));
        assert!(p("a.b").overlaps(&Path::root()));
    }

    proptest! {
        #[test]
        fn display_round_trips(tokens in prop::collection::vec("[a-z]{1,5}|[1-9][0-9]{0,3}|0|\\*|\\*\\*", 0..6)) {
            let text = tokens.join(".");
            let path = Path::parse(&text).expect("generated tokens are non-empty");
            prop_assert_eq!(path.to_string(), text);
            prop_assert_eq!(path.len(), tokens.len());
        }

        #[test]
        fn every_prefix_overlaps(tokens in prop::collection::vec("[a-z]{1,4}|[0-9]", 1..6), cut in 0usize..6) {
            let path = Path::parse(&tokens.join(".")).expect("valid");
            let prefix = Path::from_segments(path.segments().iter().take(cut).cloned());
            prop_assert!(prefix.overlaps(&path));
            prop_assert!(path.starts_with(&prefix));
        }
    }
}
