/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::io::{self, Write};
use std::rc::Rc;

use hex_literal::hex;

use super::{raw_object, FileMode, GitObjectId, GitOid};
use crate::git_oid_type;
use crate::oid::ObjectId;
use crate::tree_util::{MayRecurse, ParseTree, TreeIter, WithPath};
use crate::util::{FromBytes, SliceExt};

git_oid_type!(TreeId(GitObjectId));

raw_object!(Tree | TreeId => RawTree);

impl RawTree {
    pub const EMPTY_OID: TreeId =
        TreeId::from_raw_bytes_array(hex!("4b825dc642cb6eb9a060e54bf8d69288fbee4904"));

    pub fn empty() -> RawTree {
        RawTree(Rc::from(&[][..]))
    }
}

/// An entry in a raw git tree: an object id qualified by the entry mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub oid: GitOid,
    pub mode: FileMode,
}

impl MayRecurse for TreeEntry {
    fn may_recurse(&self) -> bool {
        self.oid.is_tree()
    }
}

impl AsRef<[u8]> for RawTree {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// An error occurred while parsing the tree.
#[derive(Debug)]
pub struct MalformedTree;

impl ParseTree for RawTree {
    type Inner = TreeEntry;
    type Error = MalformedTree;

    fn parse_one_entry(buf: &mut &[u8]) -> Result<WithPath<TreeEntry>, MalformedTree> {
        (|| {
            let [mode, remainder] = buf.splitn_exact(b' ')?;
            let mode = FileMode::from_bytes(mode).ok()?;
            let [path, remainder] = remainder.splitn_exact(b'\0')?;
            if path.is_empty() || remainder.len() < 20 {
                return None;
            }
            let (oid, remainder) = remainder.split_at(20);
            *buf = remainder;
            Some(WithPath::new(
                path,
                TreeEntry {
                    oid: (GitObjectId::from_raw_bytes(oid).unwrap(), mode).into(),
                    mode,
                },
            ))
        })()
        .ok_or(MalformedTree)
    }

    fn write_one_entry<W: Write>(entry: &WithPath<TreeEntry>, mut w: W) -> io::Result<()> {
        write!(w, "{:o} ", u16::from(entry.inner().mode))?;
        w.write_all(entry.path())?;
        w.write_all(b"\0")?;
        w.write_all(GitObjectId::from(entry.inner().oid).as_raw_bytes())?;
        Ok(())
    }
}

impl IntoIterator for RawTree {
    type Item = WithPath<TreeEntry>;
    type IntoIter = TreeIter<RawTree>;

    fn into_iter(self) -> TreeIter<RawTree> {
        TreeIter::new(self)
    }
}

#[test]
fn test_parse_tree() {
    use bstr::ByteSlice;
    use itertools::Itertools;

    let mut buf = Vec::new();
    for (mode, name, oid) in [
        (
            FileMode::REGULAR | FileMode::RW,
            &b"bar"[..],
            GitObjectId::from_raw_bytes_array([1; 20]),
        ),
        (
            FileMode::DIRECTORY,
            b"foo",
            GitObjectId::from_raw_bytes_array([2; 20]),
        ),
        (
            FileMode::GITLINK,
            b"sub",
            GitObjectId::from_raw_bytes_array([3; 20]),
        ),
    ] {
        write!(buf, "{:o} ", u16::from(mode)).unwrap();
        buf.extend_from_slice(name);
        buf.push(b'\0');
        buf.extend_from_slice(oid.as_raw_bytes());
    }
    let tree = RawTree(buf.into());
    let entries = tree.iter().collect_vec();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].path(), b"bar".as_bstr());
    assert!(matches!(entries[0].inner().oid, GitOid::Blob(_)));
    assert!(matches!(entries[1].inner().oid, GitOid::Tree(_)));
    assert!(entries[1].inner().may_recurse());
    assert!(matches!(entries[2].inner().oid, GitOid::Commit(_)));
    assert!(!entries[2].inner().may_recurse());

    assert!(RawTree::empty().iter().next().is_none());
}
