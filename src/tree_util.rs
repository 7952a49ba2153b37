/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Helpers related to trees.

use std::cmp::Ordering;
use std::io::{self, Write};
use std::iter::Peekable;

use bstr::{BStr, ByteSlice};
use derive_more::Debug;
use itertools::EitherOrBoth;

use crate::util::ImmutBString;

/// Wrapper type that pairs a value of any type with a path string.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct WithPath<T> {
    #[debug("{}", path.as_bstr())]
    path: ImmutBString,
    inner: T,
}

impl<T> WithPath<T> {
    pub fn new(path: impl Into<ImmutBString>, inner: T) -> Self {
        WithPath {
            path: path.into(),
            inner,
        }
    }

    pub fn path(&self) -> &BStr {
        self.path.as_bstr()
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Maps a `WithPath<T>` to `WithPath<U>` by applying a function to
    /// the associated value.
    pub fn map<F: FnOnce(T) -> U, U>(self, f: F) -> WithPath<U> {
        WithPath::new(self.path, f(self.inner))
    }

    /// Unwraps the path and the value, returning both.
    pub fn unzip(self) -> (ImmutBString, T) {
        (self.path, self.inner)
    }
}

/// Indicates whether the inner value within a [`WithPath`] represents a
/// tree that may further be recursed. See [`WithPath::cmp_path`].
pub trait MayRecurse {
    fn may_recurse(&self) -> bool;
}

impl<T: MayRecurse> WithPath<T> {
    /// Compares the paths of two [`WithPath`] instances.
    ///
    /// When comparing paths in a non-recursive listing, the name of a tree
    /// is compared to the name of non-trees as if it was suffixed with a `/`,
    /// because that is where its content would sort in a recursed listing.
    ///
    /// For example, the following is the proper order in a recursed listing:
    ///   - `foo.bar`
    ///   - `foo/bar`
    ///   - `foobar`
    ///
    /// In the non-recursed case, when `foo` is the directory that may contain
    /// `bar`, it still needs to appear after `foo.bar`.
    pub fn cmp_path<U: MayRecurse>(&self, other: &WithPath<U>) -> Ordering {
        let a = self.path();
        let b = other.path();
        let a_is_tree = self.inner().may_recurse();
        let b_is_tree = other.inner().may_recurse();
        if !a_is_tree && !b_is_tree {
            a.cmp(b)
        } else {
            let shortest_len = std::cmp::min(a.len(), b.len());
            match a[..shortest_len].cmp(&b[..shortest_len]) {
                Ordering::Equal => match a.len().cmp(&b.len()) {
                    Ordering::Equal => match (a_is_tree, b_is_tree) {
                        (true, false) => Ordering::Greater,
                        (false, true) => Ordering::Less,
                        _ => Ordering::Equal,
                    },
                    Ordering::Greater if b_is_tree => a[shortest_len..].cmp(b"/".as_bstr()),
                    Ordering::Less if a_is_tree => b"/"[..].cmp(&b[shortest_len..]),
                    o => o,
                },
                o => o,
            }
        }
    }
}

/// Parsing interface for trees.
///
/// A type implementing this trait can be used with [`TreeIter`] to iterate
/// over the parsed entries.
pub trait ParseTree: AsRef<[u8]> {
    /// Inner type of the parsed entry.
    type Inner;
    /// Parsing error.
    type Error: std::fmt::Debug;

    /// Parse one entry from the given buffer, advancing `buf` to the
    /// beginning of the next entry.
    fn parse_one_entry(buf: &mut &[u8]) -> Result<WithPath<Self::Inner>, Self::Error>;

    /// Write one entry into the given buffer.
    fn write_one_entry<W: Write>(entry: &WithPath<Self::Inner>, w: W) -> io::Result<()>;

    /// Iterates the tree.
    fn iter(&self) -> TreeIter<&Self> {
        TreeIter::new(self)
    }
}

impl<T: ParseTree + ?Sized> ParseTree for &T {
    type Inner = T::Inner;
    type Error = T::Error;

    fn parse_one_entry(buf: &mut &[u8]) -> Result<WithPath<Self::Inner>, Self::Error> {
        T::parse_one_entry(buf)
    }

    fn write_one_entry<W: Write>(entry: &WithPath<Self::Inner>, w: W) -> io::Result<()> {
        T::write_one_entry(entry, w)
    }
}

/// An iterator for parsed trees.
pub struct TreeIter<T: ParseTree> {
    tree: T,
    remaining: usize,
}

impl<T: ParseTree> TreeIter<T> {
    pub fn new(t: T) -> Self {
        let remaining = t.as_ref().len();
        TreeIter { tree: t, remaining }
    }
}

impl<T: ParseTree> Iterator for TreeIter<T> {
    type Item = WithPath<T::Inner>;

    fn next(&mut self) -> Option<Self::Item> {
        let buf = self.tree.as_ref();
        let mut buf = &buf[buf.len() - self.remaining..];
        if buf.is_empty() {
            return None;
        }
        let result = T::parse_one_entry(&mut buf).unwrap();
        self.remaining = buf.len();
        Some(result)
    }
}

/// An iterator adaptor that merges items from the two base iterators in
/// ascending order of the path associated with their items.
///
/// See [`merge_join_by_path()`] for more information.
pub struct MergeJoinByPath<I: Iterator, J: Iterator> {
    left: Peekable<I>,
    right: Peekable<J>,
}

/// Create an iterator that merges items from the specified iterators in
/// ascending order of the path associated with their items.
///
/// From iterators `I` and `J` respectively emitting `WithPath<L>` and
/// `WithPath<R>`, the resulting iterator emits
/// `WithPath<EitherOrBoth<L, R>>`.
///
/// Notes:
/// - The specified iterators are expected to be ordered by order of
///   [`WithPath::cmp_path`].
/// - If both iterators have entries with the same path, but one may be
///   recursed and the other may not, they are emitted separately (per
///   [`WithPath::cmp_path`] not returning [`Ordering::Equal`] in that case).
pub fn merge_join_by_path<L, R, I, J>(left: I, right: J) -> MergeJoinByPath<I::IntoIter, J::IntoIter>
where
    I: IntoIterator<Item = WithPath<L>>,
    J: IntoIterator<Item = WithPath<R>>,
    L: MayRecurse,
    R: MayRecurse,
{
    MergeJoinByPath {
        left: left.into_iter().peekable(),
        right: right.into_iter().peekable(),
    }
}

impl<L, R, I, J> Iterator for MergeJoinByPath<I, J>
where
    I: Iterator<Item = WithPath<L>>,
    J: Iterator<Item = WithPath<R>>,
    L: MayRecurse,
    R: MayRecurse,
{
    type Item = WithPath<EitherOrBoth<L, R>>;

    fn next(&mut self) -> Option<Self::Item> {
        let order = match (self.left.peek(), self.right.peek()) {
            (Some(l), Some(r)) => WithPath::cmp_path(l, r),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => return None,
        };
        match order {
            Ordering::Less => self.left.next().map(|l| l.map(EitherOrBoth::Left)),
            Ordering::Greater => self.right.next().map(|r| r.map(EitherOrBoth::Right)),
            Ordering::Equal => {
                let l = self.left.next()?;
                let r = self.right.next()?;
                Some(l.map(|l| EitherOrBoth::Both(l, r.into_inner())))
            }
        }
    }
}

/// An iterator adaptor that emits differences between items from the two
/// base iterators in ascending order of the path associated with their items.
///
/// See [`diff_by_path()`] for more information.
pub struct DiffByPath<I: Iterator, J: Iterator>(MergeJoinByPath<I, J>);

/// Create an iterator that emits differences between items from the specified
/// iterators in ascending order of the path associated with their items.
///
/// This is [`merge_join_by_path()`] with pairs of equal values filtered out.
pub fn diff_by_path<L, R, I, J>(left: I, right: J) -> DiffByPath<I::IntoIter, J::IntoIter>
where
    I: IntoIterator<Item = WithPath<L>>,
    J: IntoIterator<Item = WithPath<R>>,
    L: MayRecurse,
    R: MayRecurse,
{
    DiffByPath(merge_join_by_path(left, right))
}

impl<L, R, I, J> Iterator for DiffByPath<I, J>
where
    I: Iterator<Item = WithPath<L>>,
    J: Iterator<Item = WithPath<R>>,
    L: MayRecurse + PartialEq<R>,
    R: MayRecurse,
{
    type Item = WithPath<EitherOrBoth<L, R>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.find(|entry| match entry.inner() {
            EitherOrBoth::Both(a, b) => a != b,
            _ => true,
        })
    }
}

/// Wrapper type to force non-recursion in `merge_join_by_path` and
/// `diff_by_path`.
#[derive(Debug, PartialEq)]
pub struct NoRecurse<T>(pub T);

impl<T> MayRecurse for NoRecurse<T> {
    fn may_recurse(&self) -> bool {
        false
    }
}

#[test]
fn test_cmp_path() {
    use itertools::Itertools;

    struct Tree(bool);

    impl MayRecurse for Tree {
        fn may_recurse(&self) -> bool {
            self.0
        }
    }

    let examples = ["foo", "bar", "foobar", "foo.bar", "foo_", "foo.", "qux"];
    let example_dirs = examples.iter().map(|x| format!("{}/", x)).collect_vec();
    let all_examples = example_dirs.iter().map(|x| &**x).chain(examples);

    for (a, b) in Itertools::cartesian_product(all_examples.clone(), all_examples) {
        let expected = a.cmp(b);
        let (a_stripped, a_is_tree) = a.strip_suffix('/').map_or((a, false), |x| (x, true));
        let (b_stripped, b_is_tree) = b.strip_suffix('/').map_or((b, false), |x| (x, true));
        let a_path = WithPath::new(a_stripped.as_bytes(), Tree(a_is_tree));
        let b_path = WithPath::new(b_stripped.as_bytes(), Tree(b_is_tree));
        assert_eq!(
            WithPath::cmp_path(&a_path, &b_path),
            expected,
            "comparing {} and {}",
            a,
            b
        );
    }
}

#[test]
fn test_merge_join_by_path() {
    use itertools::Itertools;

    let merged = merge_join_by_path(
        [
            WithPath::new(*b"foo", NoRecurse(1)),
            WithPath::new(*b"hoge", NoRecurse(2)),
            WithPath::new(*b"qux", NoRecurse(3)),
        ],
        [
            WithPath::new(*b"bar", NoRecurse("a")),
            WithPath::new(*b"foo", NoRecurse("b")),
            WithPath::new(*b"fuga", NoRecurse("c")),
            WithPath::new(*b"hoge", NoRecurse("d")),
            WithPath::new(*b"toto", NoRecurse("e")),
        ],
    )
    .collect_vec();
    assert_eq!(
        &merged,
        &[
            WithPath::new(*b"bar", EitherOrBoth::Right(NoRecurse("a"))),
            WithPath::new(*b"foo", EitherOrBoth::Both(NoRecurse(1), NoRecurse("b"))),
            WithPath::new(*b"fuga", EitherOrBoth::Right(NoRecurse("c"))),
            WithPath::new(*b"hoge", EitherOrBoth::Both(NoRecurse(2), NoRecurse("d"))),
            WithPath::new(*b"qux", EitherOrBoth::Left(NoRecurse(3))),
            WithPath::new(*b"toto", EitherOrBoth::Right(NoRecurse("e"))),
        ]
    );
}

#[test]
fn test_diff_by_path() {
    use itertools::Itertools;

    let diffed = diff_by_path(
        [
            WithPath::new(*b"foo", NoRecurse(1)),
            WithPath::new(*b"hoge", NoRecurse(2)),
            WithPath::new(*b"qux", NoRecurse(3)),
        ],
        [
            WithPath::new(*b"bar", NoRecurse(0)),
            WithPath::new(*b"foo", NoRecurse(1)),
            WithPath::new(*b"fuga", NoRecurse(2)),
            WithPath::new(*b"hoge", NoRecurse(3)),
            WithPath::new(*b"toto", NoRecurse(4)),
        ],
    )
    .collect_vec();
    assert_eq!(
        &diffed,
        &[
            WithPath::new(*b"bar", EitherOrBoth::Right(NoRecurse(0))),
            WithPath::new(*b"fuga", EitherOrBoth::Right(NoRecurse(2))),
            WithPath::new(*b"hoge", EitherOrBoth::Both(NoRecurse(2), NoRecurse(3))),
            WithPath::new(*b"qux", EitherOrBoth::Left(NoRecurse(3))),
            WithPath::new(*b"toto", EitherOrBoth::Right(NoRecurse(4)))
        ]
    );
}
