/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The git representation of Mercurial manifests.
//!
//! Mercurial manifests are flat lists of `path\0node[flag]\n` lines. They
//! are stored as a hierarchy of git trees with not-entirely valid file
//! modes:
//! - each path component is prefixed with `_`, which keeps names free of
//!   `\0` and distinct from the real git tree of the same changeset;
//! - file entries are gitlinks whose target is the Mercurial file node
//!   (not a valid git id), with the Mercurial attribute stored in the
//!   permission bits: `0160644` for regular files, `0160755` for
//!   executables, `0160000` for symlinks.

use std::io::{self, Write};
use std::rc::Rc;

use either::Either;

use crate::git::{CommitId, FileMode, GitObjectId, RawTree, TreeId, TreeIsh};
use crate::git_oid_type;
use crate::hg::{HgFileAttr, HgFileId, ManifestEntry};
use crate::odb::Odb;
use crate::oid::ObjectId;
use crate::tree_util::{MayRecurse, ParseTree, TreeIter, WithPath};
use crate::util::{FromBytes, SliceExt};

git_oid_type!(GitManifestId(CommitId));
git_oid_type!(GitManifestTreeId(TreeId));

impl TreeIsh for GitManifestId {
    type TreeId = GitManifestTreeId;

    fn get_tree_id(self, odb: &Odb) -> GitManifestTreeId {
        GitManifestTreeId::from_unchecked(CommitId::from(self).get_tree_id(odb))
    }
}

/// A manifest tree, as stored in git.
#[derive(Clone)]
pub struct GitManifestTree(Rc<[u8]>);

impl GitManifestTree {
    pub fn read(odb: &Odb, oid: GitManifestTreeId) -> Option<GitManifestTree> {
        RawTree::read(odb, oid.into()).map(|tree| GitManifestTree(tree.0))
    }

    pub fn read_treeish(odb: &Odb, oid: GitManifestId) -> Option<GitManifestTree> {
        GitManifestTree::read(odb, oid.get_tree_id(odb))
    }

    pub(crate) fn with_buf(buf: Rc<[u8]>) -> GitManifestTree {
        GitManifestTree(buf)
    }

    pub fn empty() -> GitManifestTree {
        GitManifestTree(Rc::from(&[][..]))
    }
}

impl AsRef<[u8]> for GitManifestTree {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// An entry in a manifest tree: either a subtree or a file.
pub type GitManifestTreeEntry = Either<GitManifestTreeId, ManifestEntry>;

impl MayRecurse for GitManifestTreeEntry {
    fn may_recurse(&self) -> bool {
        self.is_left()
    }
}

fn gitlink_mode(attr: HgFileAttr) -> FileMode {
    match attr {
        HgFileAttr::Regular => FileMode::GITLINK | FileMode::RW,
        HgFileAttr::Executable => FileMode::GITLINK | FileMode::RWX,
        HgFileAttr::Symlink => FileMode::GITLINK,
    }
}

/// The encoded manifest tree violates its structural invariants.
#[derive(Debug)]
pub struct MalformedMetadata;

impl ParseTree for GitManifestTree {
    type Inner = GitManifestTreeEntry;
    type Error = MalformedMetadata;

    fn parse_one_entry(buf: &mut &[u8]) -> Result<WithPath<Self::Inner>, Self::Error> {
        (|| {
            let [mode, remainder] = buf.splitn_exact(b' ')?;
            let mode = FileMode::from_bytes(mode).ok()?;
            let [name, remainder] = remainder.splitn_exact(b'\0')?;
            // Every name in a manifest tree starts with an underscore.
            let path = name.strip_prefix(b"_".as_slice())?;
            if remainder.len() < 20 {
                return None;
            }
            let (oid, remainder) = remainder.split_at(20);
            let oid = GitObjectId::from_raw_bytes(oid).unwrap();
            let inner = match mode.typ() {
                FileMode::DIRECTORY => Either::Left(GitManifestTreeId::from_unchecked(
                    TreeId::from_unchecked(oid),
                )),
                FileMode::GITLINK => {
                    let attr = match mode.perms() {
                        FileMode::RW => HgFileAttr::Regular,
                        FileMode::RWX => HgFileAttr::Executable,
                        FileMode::NONE => HgFileAttr::Symlink,
                        _ => return None,
                    };
                    Either::Right(ManifestEntry {
                        fid: HgFileId::from_raw_bytes(oid.as_raw_bytes()).unwrap(),
                        attr,
                    })
                }
                _ => return None,
            };
            *buf = remainder;
            Some(WithPath::new(path, inner))
        })()
        .ok_or(MalformedMetadata)
    }

    fn write_one_entry<W: Write>(entry: &WithPath<Self::Inner>, mut w: W) -> io::Result<()> {
        let (mode, oid) = match entry.inner() {
            Either::Left(tree_id) => (FileMode::DIRECTORY, GitObjectId::from(*tree_id)),
            Either::Right(e) => (
                gitlink_mode(e.attr),
                GitObjectId::from_raw_bytes(e.fid.as_raw_bytes()).unwrap(),
            ),
        };
        write!(w, "{:o} _", u16::from(mode))?;
        w.write_all(entry.path())?;
        w.write_all(b"\0")?;
        w.write_all(oid.as_raw_bytes())?;
        Ok(())
    }
}

impl IntoIterator for GitManifestTree {
    type Item = WithPath<GitManifestTreeEntry>;
    type IntoIter = TreeIter<GitManifestTree>;

    fn into_iter(self) -> TreeIter<GitManifestTree> {
        TreeIter::new(self)
    }
}

#[test]
fn test_parse_manifest_tree() {
    use std::str::FromStr;

    use bstr::ByteSlice;
    use itertools::Itertools;

    let fid = HgFileId::from_str("994c36ffd5f3bf79b81ba8f13fd0cdd1fdb6ca6b").unwrap();
    let tid = GitManifestTreeId::from_str("4b825dc642cb6eb9a060e54bf8d69288fbee4904").unwrap();
    let entries = [
        WithPath::new(
            *b"bar",
            Either::Right(ManifestEntry {
                fid,
                attr: HgFileAttr::Executable,
            }),
        ),
        WithPath::new(*b"foo", Either::Left(tid)),
    ];
    let mut buf = Vec::new();
    for entry in &entries {
        GitManifestTree::write_one_entry(entry, &mut buf).unwrap();
    }
    // Names carry the underscore prefix on disk.
    assert!(buf.as_bstr().starts_with(b"160755 _bar\0"));

    let tree = GitManifestTree(buf.into());
    let parsed = tree.iter().collect_vec();
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0].path(), b"bar".as_bstr());
    assert_eq!(
        parsed[0].inner(),
        &Either::Right(ManifestEntry {
            fid,
            attr: HgFileAttr::Executable,
        })
    );
    assert_eq!(parsed[1].inner(), &Either::Left(tid));
    assert!(parsed[1].inner().may_recurse());
}

#[test]
#[should_panic]
fn test_missing_underscore_is_corrupt() {
    use crate::git::RawBlob;

    let mut buf = Vec::new();
    buf.extend_from_slice(b"160644 no-underscore\0");
    buf.extend_from_slice(RawBlob::EMPTY_OID.as_raw_bytes());
    let tree = GitManifestTree(buf.into());
    tree.iter().for_each(drop);
}

#[test]
fn test_invalid_gitlink_mode_is_corrupt() {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"160600 _foo\0");
    buf.extend_from_slice(&[0x42; 20]);
    let mut parse = &buf[..];
    assert!(GitManifestTree::parse_one_entry(&mut parse).is_err());
}
