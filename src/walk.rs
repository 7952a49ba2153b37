/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Revision-walk and tree-diff adapters.
//!
//! Thin wrappers letting callers iterate commits and tree diffs through a
//! controlled interface, without reaching into the object store themselves.

use bstr::{BStr, BString, ByteSlice};
use itertools::EitherOrBoth::{Both, Left, Right};

use crate::git::{
    CommitId, FileMode, GitObjectId, GitOid, RawCommit, RawTree, TreeId, TreeIsh,
};
use crate::odb::{Odb, ObjectKind};
use crate::tree_util::{diff_by_path, ParseTree};
use crate::util::{die, ImmutBString};

/// How a commit came out of a revision walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaybeBoundary {
    /// An interior commit of the walked range.
    Commit,
    /// A commit on the explicit boundary of the walked range.
    Boundary,
    /// A parentless commit whose parents were elided by a shallow graft.
    Shallow,
}

/// Walks commits reachable from `heads` but not from `excludes`,
/// children before parents.
///
/// With `boundary`, the excluded frontier (excluded commits that are direct
/// parents of emitted commits) is emitted after the interior commits, and
/// parentless interior commits carrying a shallow-graft record come out
/// marked as such.
pub fn rev_list(
    odb: &Odb,
    heads: &[CommitId],
    excludes: &[CommitId],
    boundary: bool,
) -> impl Iterator<Item = (CommitId, MaybeBoundary)> {
    let parents = |cid: CommitId| -> Vec<CommitId> {
        let commit = RawCommit::read(odb, odb.lookup_replace(cid))
            .unwrap_or_else(|| die!("Missing commit: {}", cid));
        commit.parse().unwrap().parents().to_vec()
    };

    let mut excluded = Vec::new();
    let mut excluded_set = std::collections::HashSet::new();
    for &e in excludes {
        if excluded_set.insert(e) {
            excluded.push(e);
        }
    }
    while let Some(cid) = excluded.pop() {
        for p in parents(cid) {
            if excluded_set.insert(p) {
                excluded.push(p);
            }
        }
    }

    // Post-order over the interior set, reversed, gives a topological
    // order with children before parents.
    let mut post_order = Vec::new();
    let mut visited = std::collections::HashSet::new();
    let mut boundary_frontier = Vec::new();
    let mut frontier_seen = std::collections::HashSet::new();
    let mut stack = heads
        .iter()
        .rev()
        .filter(|c| !excluded_set.contains(*c))
        .map(|&c| (c, false))
        .collect::<Vec<_>>();
    while let Some((cid, children_done)) = stack.pop() {
        if children_done {
            post_order.push(cid);
            continue;
        }
        if !visited.insert(cid) {
            continue;
        }
        stack.push((cid, true));
        for p in parents(cid) {
            if excluded_set.contains(&p) {
                if frontier_seen.insert(p) {
                    boundary_frontier.push(p);
                }
            } else if !visited.contains(&p) {
                stack.push((p, false));
            }
        }
    }

    let mut result = Vec::new();
    for cid in post_order.into_iter().rev() {
        let shallow = boundary && parents(cid).is_empty() && odb.is_shallow(cid);
        result.push((
            cid,
            if shallow {
                MaybeBoundary::Shallow
            } else {
                MaybeBoundary::Commit
            },
        ));
    }
    if boundary {
        result.extend(
            boundary_frontier
                .into_iter()
                .map(|cid| (cid, MaybeBoundary::Boundary)),
        );
    }
    result.into_iter()
}

/// One file-level difference between two commits.
#[derive(Debug, PartialEq, Eq)]
pub enum DiffTreeItem {
    Added {
        path: ImmutBString,
        mode: FileMode,
        oid: GitOid,
    },
    Deleted {
        path: ImmutBString,
        mode: FileMode,
        oid: GitOid,
    },
    Modified {
        path: ImmutBString,
        from_mode: FileMode,
        from_oid: GitOid,
        to_mode: FileMode,
        to_oid: GitOid,
    },
}

fn read_tree(odb: &Odb, tree_id: Option<TreeId>) -> RawTree {
    tree_id.map_or_else(RawTree::empty, |tid| {
        RawTree::read(odb, tid).unwrap_or_else(|| die!("Missing tree: {}", tid))
    })
}

fn diff_recurse_into(
    odb: &Odb,
    a: Option<TreeId>,
    b: Option<TreeId>,
    prefix: &mut BString,
    path: &[u8],
    result: &mut Vec<DiffTreeItem>,
) {
    let len = prefix.len();
    prefix.extend_from_slice(path);
    prefix.push(b'/');
    diff_tree_recurse(odb, a, b, prefix, result);
    prefix.truncate(len);
}

fn diff_tree_recurse(
    odb: &Odb,
    a: Option<TreeId>,
    b: Option<TreeId>,
    prefix: &mut BString,
    result: &mut Vec<DiffTreeItem>,
) {
    let tree_a = read_tree(odb, a);
    let tree_b = read_tree(odb, b);
    for entry in diff_by_path(tree_a.into_iter(), tree_b.into_iter()) {
        let (path, inner) = entry.unzip();
        let full_path: ImmutBString = {
            let mut full = prefix.clone();
            full.extend_from_slice(&path);
            Vec::from(full).into()
        };
        match inner {
            Left(e) => match e.oid {
                GitOid::Tree(t) => diff_recurse_into(odb, Some(t), None, prefix, &path, result),
                oid => result.push(DiffTreeItem::Deleted {
                    path: full_path,
                    mode: e.mode,
                    oid,
                }),
            },
            Right(e) => match e.oid {
                GitOid::Tree(t) => diff_recurse_into(odb, None, Some(t), prefix, &path, result),
                oid => result.push(DiffTreeItem::Added {
                    path: full_path,
                    mode: e.mode,
                    oid,
                }),
            },
            Both(ea, eb) => match (ea.oid, eb.oid) {
                (GitOid::Tree(ta), GitOid::Tree(tb)) => {
                    diff_recurse_into(odb, Some(ta), Some(tb), prefix, &path, result);
                }
                (GitOid::Tree(ta), oid) => {
                    diff_recurse_into(odb, Some(ta), None, prefix, &path, result);
                    result.push(DiffTreeItem::Added {
                        path: full_path,
                        mode: eb.mode,
                        oid,
                    });
                }
                (oid, GitOid::Tree(tb)) => {
                    result.push(DiffTreeItem::Deleted {
                        path: full_path,
                        mode: ea.mode,
                        oid,
                    });
                    diff_recurse_into(odb, None, Some(tb), prefix, &path, result);
                }
                (from_oid, to_oid) => result.push(DiffTreeItem::Modified {
                    path: full_path,
                    from_mode: ea.mode,
                    from_oid,
                    to_mode: eb.mode,
                    to_oid,
                }),
            },
        }
    }
}

/// Diffs the trees of two commits, recursively, delivering file-level
/// differences in path order.
pub fn diff_tree(odb: &Odb, a: CommitId, b: CommitId) -> impl Iterator<Item = DiffTreeItem> {
    let a = odb.lookup_replace(a).get_tree_id(odb);
    let b = odb.lookup_replace(b).get_tree_id(odb);
    let mut result = Vec::new();
    let mut prefix = BString::from(Vec::new());
    diff_tree_recurse(odb, Some(a), Some(b), &mut prefix, &mut result);
    result.into_iter()
}

/// Depth-first iteration over a tree, invoking the callback for every
/// entry, directories included. `oid` may name a tree or a commit.
///
/// Returns false when `oid` cannot be resolved to a tree.
pub fn iter_tree<F: FnMut(&BStr, &BStr, GitOid, FileMode)>(
    odb: &Odb,
    oid: GitObjectId,
    mut cb: F,
    recursive: bool,
) -> bool {
    let tree_id = match odb.object_kind(oid) {
        Some(ObjectKind::Tree) => TreeId::from_unchecked(oid),
        Some(ObjectKind::Commit) => CommitId::from_unchecked(oid).get_tree_id(odb),
        _ => return false,
    };
    let mut base = BString::from(Vec::new());
    do_iter_tree(odb, tree_id, &mut cb, recursive, &mut base);
    true
}

fn do_iter_tree<F: FnMut(&BStr, &BStr, GitOid, FileMode)>(
    odb: &Odb,
    tree_id: TreeId,
    cb: &mut F,
    recursive: bool,
    base: &mut BString,
) {
    // The tree buffer only lives for the duration of the visit.
    let tree = RawTree::read(odb, tree_id).unwrap_or_else(|| die!("Missing tree: {}", tree_id));
    for entry in tree.iter() {
        let (path, entry) = entry.unzip();
        cb(base.as_bstr(), path.as_bstr(), entry.oid, entry.mode);
        if recursive {
            if let GitOid::Tree(subtree) = entry.oid {
                let len = base.len();
                base.extend_from_slice(&path);
                base.push(b'/');
                do_iter_tree(odb, subtree, cb, recursive, base);
                base.truncate(len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use bstr::ByteSlice;
    use itertools::Itertools;

    use super::*;
    use crate::oid::ObjectId;

    fn commit(odb: &Odb, tree: TreeId, parents: &[CommitId], msg: &str) -> CommitId {
        let mut buf = Vec::new();
        writeln!(buf, "tree {}", tree).unwrap();
        for p in parents {
            writeln!(buf, "parent {}", p).unwrap();
        }
        buf.extend_from_slice(b"author  <cinnabar@git> 0 +0000\n");
        buf.extend_from_slice(b"committer  <cinnabar@git> 0 +0000\n\n");
        buf.extend_from_slice(msg.as_bytes());
        odb.write_commit(&buf)
    }

    fn blob_tree(odb: &Odb, entries: &[(&[u8], &[u8])]) -> TreeId {
        let mut buf = Vec::new();
        for (name, content) in entries {
            let blob = odb.write_blob(content);
            write!(buf, "{:o} ", u16::from(FileMode::REGULAR | FileMode::RW)).unwrap();
            buf.extend_from_slice(name);
            buf.push(b'\0');
            buf.extend_from_slice(GitObjectId::from(blob).as_raw_bytes());
        }
        odb.write_tree(&buf, None)
    }

    #[test]
    fn test_rev_list() {
        let odb = Odb::new();
        let tree = odb.write_tree(&[], None);
        let a = commit(&odb, tree, &[], "a");
        let b = commit(&odb, tree, &[a], "b");
        let c = commit(&odb, tree, &[b], "c");
        let d = commit(&odb, tree, &[a], "d");
        let e = commit(&odb, tree, &[c, d], "e");

        let all = rev_list(&odb, &[e], &[], false).collect_vec();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0], (e, MaybeBoundary::Commit));
        assert_eq!(all.last(), Some(&(a, MaybeBoundary::Commit)));
        // Children always come out before their parents.
        let pos = |cid| all.iter().position(|(c, _)| *c == cid).unwrap();
        assert!(pos(e) < pos(c));
        assert!(pos(e) < pos(d));
        assert!(pos(c) < pos(b));
        assert!(pos(b) < pos(a));

        let partial = rev_list(&odb, &[c], &[b], true).collect_vec();
        assert_eq!(
            partial,
            vec![(c, MaybeBoundary::Commit), (b, MaybeBoundary::Boundary)]
        );

        // A parentless commit with a shallow graft record walks out as a
        // synthesized shallow boundary.
        odb.register_shallow(a);
        let shallow = rev_list(&odb, &[b], &[], true).collect_vec();
        assert_eq!(
            shallow,
            vec![(b, MaybeBoundary::Commit), (a, MaybeBoundary::Shallow)]
        );
        // Without boundary processing, it is a plain commit.
        let plain = rev_list(&odb, &[b], &[], false).collect_vec();
        assert_eq!(
            plain,
            vec![(b, MaybeBoundary::Commit), (a, MaybeBoundary::Commit)]
        );
    }

    #[test]
    fn test_diff_tree() {
        let odb = Odb::new();
        let sub_a = blob_tree(&odb, &[(b"baz", b"baz\n"), (b"qux", b"qux\n")]);
        let sub_b = blob_tree(&odb, &[(b"baz", b"baz\n"), (b"qux", b"QUX\n")]);
        let mut buf_a = Vec::new();
        let mut buf_b = Vec::new();
        for (buf, sub, blob) in [
            (&mut buf_a, sub_a, &b"foo\n"[..]),
            (&mut buf_b, sub_b, &b"FOO\n"[..]),
        ] {
            let blob = odb.write_blob(blob);
            write!(buf, "{:o} ", u16::from(FileMode::DIRECTORY)).unwrap();
            buf.extend_from_slice(b"dir\0");
            buf.extend_from_slice(GitObjectId::from(sub).as_raw_bytes());
            write!(buf, "{:o} ", u16::from(FileMode::REGULAR | FileMode::RW)).unwrap();
            buf.extend_from_slice(b"foo\0");
            buf.extend_from_slice(GitObjectId::from(blob).as_raw_bytes());
        }
        let tree_a = odb.write_tree(&buf_a, None);
        let tree_b = odb.write_tree(&buf_b, None);
        let a = commit(&odb, tree_a, &[], "a");
        let b = commit(&odb, tree_b, &[a], "b");

        let diff = diff_tree(&odb, a, b).collect_vec();
        assert_eq!(diff.len(), 2);
        match &diff[0] {
            DiffTreeItem::Modified { path, .. } => assert_eq!(path.as_bstr(), b"dir/qux".as_bstr()),
            other => panic!("unexpected {:?}", other),
        }
        match &diff[1] {
            DiffTreeItem::Modified { path, .. } => assert_eq!(path.as_bstr(), b"foo".as_bstr()),
            other => panic!("unexpected {:?}", other),
        }

        // Unchanged trees produce no differences.
        assert_eq!(diff_tree(&odb, a, a).count(), 0);
    }

    #[test]
    fn test_iter_tree() {
        let odb = Odb::new();
        let sub = blob_tree(&odb, &[(b"baz", b"baz\n")]);
        let mut buf = Vec::new();
        write!(buf, "{:o} ", u16::from(FileMode::DIRECTORY)).unwrap();
        buf.extend_from_slice(b"dir\0");
        buf.extend_from_slice(GitObjectId::from(sub).as_raw_bytes());
        let tree = odb.write_tree(&buf, None);
        let c = commit(&odb, tree, &[], "c");

        let mut seen = Vec::new();
        assert!(iter_tree(
            &odb,
            c.into(),
            |base, name, _, mode| {
                let mut full = base.to_vec();
                full.extend_from_slice(name);
                seen.push((full, mode.typ() == FileMode::DIRECTORY));
            },
            true,
        ));
        assert_eq!(
            seen,
            vec![
                (b"dir".to_vec(), true),
                (b"dir/baz".to_vec(), false),
            ]
        );

        let mut seen = Vec::new();
        assert!(iter_tree(
            &odb,
            tree.into(),
            |_, name, _, _| seen.push(name.to_vec()),
            false,
        ));
        assert_eq!(seen, vec![b"dir".to_vec()]);

        assert!(!iter_tree(&odb, GitObjectId::NULL, |_, _, _, _| (), false));
    }
}
