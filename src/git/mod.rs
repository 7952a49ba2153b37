/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use crate::odb::Odb;
use crate::oid_type;

mod blob;
pub use blob::*;
mod commit;
pub use commit::*;
mod tree;
pub use tree::*;

oid_type!(GitObjectId);

#[macro_export]
macro_rules! git_oid_type {
    ($name:ident($base_type:ident)) => {
        $crate::oid_type!($name($base_type));

        $crate::git_oid_type!(@ $name($base_type));
    };
    (@ $name:ident(GitObjectId)) => {};
    (@ $name:ident($base_type:ident)) => {
        $crate::oid_impl!($name($crate::git::GitObjectId));
    };
}

macro_rules! raw_object {
    ($kind:ident | $oid_type:ident => $name:ident) => {
        #[derive(Clone)]
        pub struct $name(pub(crate) ::std::rc::Rc<[u8]>);

        impl $name {
            pub fn read(odb: &$crate::odb::Odb, oid: $oid_type) -> Option<Self> {
                match odb.read_object(oid.into())? {
                    ($crate::odb::ObjectKind::$kind, buf) => Some($name(buf)),
                    _ => None,
                }
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }
        }
    };
}
pub(crate) use raw_object;

/// Something that has a tree: a tree itself, or a commit.
pub trait TreeIsh: Copy {
    type TreeId;

    fn get_tree_id(self, odb: &Odb) -> Self::TreeId;
}

/// A git tree entry file mode.
///
/// The type bits discriminate blobs, trees, symlinks and gitlinks; the
/// permission bits only ever matter for regular files (and, in the encoded
/// manifest representation, for gitlinks).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileMode(u16);

impl FileMode {
    pub const NONE: FileMode = FileMode(0);
    pub const RW: FileMode = FileMode(0o644);
    pub const RWX: FileMode = FileMode(0o755);
    pub const DIRECTORY: FileMode = FileMode(0o040000);
    pub const REGULAR: FileMode = FileMode(0o100000);
    pub const SYMLINK: FileMode = FileMode(0o120000);
    pub const GITLINK: FileMode = FileMode(0o160000);

    pub fn typ(self) -> FileMode {
        FileMode(self.0 & 0o170000)
    }

    pub fn perms(self) -> FileMode {
        FileMode(self.0 & 0o7777)
    }

    /// Git's mode canonicalization: regular files are either 0644 or 0755
    /// depending on the owner executable bit, everything else reduces to its
    /// bare type.
    pub fn canon(self) -> FileMode {
        match self.typ() {
            FileMode::REGULAR if self.0 & 0o100 != 0 => FileMode::REGULAR | FileMode::RWX,
            FileMode::REGULAR => FileMode::REGULAR | FileMode::RW,
            typ => typ,
        }
    }
}

impl BitOr for FileMode {
    type Output = FileMode;

    fn bitor(self, other: FileMode) -> FileMode {
        FileMode(self.0 | other.0)
    }
}

impl From<FileMode> for u16 {
    fn from(mode: FileMode) -> u16 {
        mode.0
    }
}

impl fmt::Debug for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:06o}", self.0)
    }
}

impl FromStr for FileMode {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u16::from_str_radix(s, 8).map(FileMode)
    }
}

/// A git object id together with what kind of object it points to, as
/// indicated by the tree entry mode it was found under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GitOid {
    Blob(BlobId),
    Tree(TreeId),
    Commit(CommitId),
}

impl GitOid {
    pub fn is_tree(&self) -> bool {
        matches!(self, GitOid::Tree(_))
    }
}

impl From<(GitObjectId, FileMode)> for GitOid {
    fn from((oid, mode): (GitObjectId, FileMode)) -> GitOid {
        match mode.typ() {
            FileMode::DIRECTORY => GitOid::Tree(TreeId::from_unchecked(oid)),
            FileMode::GITLINK => GitOid::Commit(CommitId::from_unchecked(oid)),
            _ => GitOid::Blob(BlobId::from_unchecked(oid)),
        }
    }
}

impl From<GitOid> for GitObjectId {
    fn from(oid: GitOid) -> GitObjectId {
        match oid {
            GitOid::Blob(b) => b.into(),
            GitOid::Tree(t) => t.into(),
            GitOid::Commit(c) => c.into(),
        }
    }
}

impl fmt::Display for GitOid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&GitObjectId::from(*self), f)
    }
}

#[test]
fn test_canon_mode() {
    assert_eq!(
        (FileMode::REGULAR | FileMode::RW).canon(),
        FileMode::REGULAR | FileMode::RW
    );
    assert_eq!(
        FileMode(0o100664).canon(),
        FileMode::REGULAR | FileMode::RW
    );
    assert_eq!(
        FileMode(0o100775).canon(),
        FileMode::REGULAR | FileMode::RWX
    );
    assert_eq!(FileMode(0o120644).canon(), FileMode::SYMLINK);
    assert_eq!(FileMode::DIRECTORY.canon(), FileMode::DIRECTORY);
}
