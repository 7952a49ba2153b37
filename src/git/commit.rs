/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use bstr::ByteSlice;
use getset::CopyGetters;

use super::{raw_object, GitObjectId, TreeId, TreeIsh};
use crate::git_oid_type;
use crate::odb::Odb;
use crate::util::{FromBytes, SliceExt};

git_oid_type!(CommitId(GitObjectId));

impl TreeIsh for CommitId {
    type TreeId = TreeId;

    fn get_tree_id(self, odb: &Odb) -> TreeId {
        let commit = RawCommit::read(odb, self).unwrap();
        let commit = commit.parse().unwrap();
        commit.tree()
    }
}

raw_object!(Commit | CommitId => RawCommit);

impl RawCommit {
    pub fn parse(&self) -> Option<Commit<'_>> {
        let [header, body] = self.as_bytes().splitn_exact(&b"\n\n"[..])?;
        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        for line in header.lines() {
            if line.is_empty() {
                break;
            }
            match line.splitn_exact(b' ')? {
                [b"tree", t] => tree = Some(TreeId::from_bytes(t).ok()?),
                [b"parent", p] => parents.push(CommitId::from_bytes(p).ok()?),
                [b"author", a] => author = Some(a),
                [b"committer", a] => committer = Some(a),
                _ => {}
            }
        }
        Some(Commit {
            tree: tree?,
            parents,
            author: author?,
            committer: committer?,
            body,
        })
    }
}

#[derive(CopyGetters)]
pub struct Commit<'a> {
    #[getset(get_copy = "pub")]
    tree: TreeId,
    parents: Vec<CommitId>,
    #[getset(get_copy = "pub")]
    author: &'a [u8],
    #[getset(get_copy = "pub")]
    committer: &'a [u8],
    #[getset(get_copy = "pub")]
    body: &'a [u8],
}

impl Commit<'_> {
    pub fn parents(&self) -> &[CommitId] {
        &self.parents[..]
    }
}

#[test]
fn test_parse_commit() {
    let buf = b"tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
                parent 8b835050c84ca7a29c0c81b830e77e4a6e1b0b9b\n\
                author Foo Bar <foo@bar> 0 +0000\n\
                committer Foo Bar <foo@bar> 0 +0000\n\
                \n\
                some commit message";
    let raw = RawCommit(buf.to_vec().into());
    let commit = raw.parse().unwrap();
    assert_eq!(commit.tree(), super::RawTree::EMPTY_OID);
    assert_eq!(commit.parents().len(), 1);
    assert_eq!(commit.author(), b"Foo Bar <foo@bar> 0 +0000");
    assert_eq!(commit.body(), b"some commit message");

    let raw = RawCommit(b"not a commit"[..].into());
    assert!(raw.parse().is_none());
}
