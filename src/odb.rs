/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Facade over the git-compatible backing store.
//!
//! The metadata core only ever talks to the object database through this
//! narrow interface: read an object by id, write blobs/trees/commits, and
//! read/update refs. Writes are content-addressed and idempotent, so
//! repeated writes of the same payload produce the same id and store
//! nothing new.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use sha1::{Digest, Sha1};

use crate::git::{BlobId, CommitId, GitObjectId, RawBlob, TreeId};
use crate::oid::ObjectId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }
}

/// An in-memory, content-addressed git object store, with a ref table, a
/// replace map, and shallow-graft records.
#[derive(Default)]
pub struct Odb {
    objects: RefCell<HashMap<GitObjectId, (ObjectKind, Rc<[u8]>)>>,
    refs: RefCell<BTreeMap<String, CommitId>>,
    replace_map: RefCell<BTreeMap<GitObjectId, GitObjectId>>,
    shallow: RefCell<HashSet<CommitId>>,
}

impl Odb {
    pub fn new() -> Odb {
        Odb::default()
    }

    fn hash_object(kind: ObjectKind, buf: &[u8]) -> GitObjectId {
        let mut hash = Sha1::new();
        hash.update(format!("{} {}\0", kind.as_str(), buf.len()));
        hash.update(buf);
        let digest: [u8; 20] = hash.finalize().into();
        GitObjectId::from_raw_bytes(&digest).unwrap()
    }

    fn write_object(&self, kind: ObjectKind, buf: &[u8]) -> GitObjectId {
        let oid = Self::hash_object(kind, buf);
        self.objects
            .borrow_mut()
            .entry(oid)
            .or_insert_with(|| (kind, Rc::from(buf)));
        oid
    }

    pub fn read_object(&self, oid: GitObjectId) -> Option<(ObjectKind, Rc<[u8]>)> {
        self.objects.borrow().get(&oid).cloned()
    }

    pub fn object_kind(&self, oid: GitObjectId) -> Option<ObjectKind> {
        self.objects.borrow().get(&oid).map(|(kind, _)| *kind)
    }

    pub fn write_blob(&self, buf: &[u8]) -> BlobId {
        BlobId::from_unchecked(self.write_object(ObjectKind::Blob, buf))
    }

    /// Store a raw tree. The reference tree is a hint allowing a backing
    /// store to share structural prefixes with an existing tree; it never
    /// affects the produced id.
    pub fn write_tree(&self, buf: &[u8], _reference: Option<TreeId>) -> TreeId {
        TreeId::from_unchecked(self.write_object(ObjectKind::Tree, buf))
    }

    pub fn write_commit(&self, buf: &[u8]) -> CommitId {
        CommitId::from_unchecked(self.write_object(ObjectKind::Commit, buf))
    }

    /// The empty blob is created on demand; its id is a well-known
    /// sentinel.
    pub fn ensure_empty_blob(&self) -> BlobId {
        let empty_blob_id = self.write_blob(&[]);
        assert_eq!(empty_blob_id, RawBlob::EMPTY_OID);
        empty_blob_id
    }

    pub fn resolve_ref(&self, name: &str) -> Option<CommitId> {
        self.refs.borrow().get(name).copied()
    }

    pub fn for_each_ref_in<E, F: FnMut(&str, CommitId) -> Result<(), E>>(
        &self,
        prefix: &str,
        mut cb: F,
    ) -> Result<(), E> {
        let matching = self
            .refs
            .borrow()
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, cid)| (name.clone(), *cid))
            .collect::<Vec<_>>();
        for (name, cid) in matching {
            cb(&name[prefix.len()..], cid)?;
        }
        Ok(())
    }

    pub fn reset_replace_map(&self) {
        self.replace_map.borrow_mut().clear();
    }

    pub fn set_replace(&self, original: CommitId, replace_with: CommitId) {
        self.replace_map
            .borrow_mut()
            .insert(original.into(), replace_with.into());
    }

    pub fn lookup_replace(&self, oid: CommitId) -> CommitId {
        self.replace_map
            .borrow()
            .get(&oid.into())
            .map_or(oid, |r| CommitId::from_unchecked(*r))
    }

    pub fn replace_map_len(&self) -> usize {
        self.replace_map.borrow().len()
    }

    pub fn for_each_replace<F: FnMut(CommitId, CommitId)>(&self, mut cb: F) {
        for (original, replace_with) in self.replace_map.borrow().iter() {
            cb(
                CommitId::from_unchecked(*original),
                CommitId::from_unchecked(*replace_with),
            );
        }
    }

    /// Record that the given commit had its parents elided by a graft, the
    /// way a shallow clone does.
    pub fn register_shallow(&self, cid: CommitId) {
        self.shallow.borrow_mut().insert(cid);
    }

    pub fn is_shallow(&self, cid: CommitId) -> bool {
        self.shallow.borrow().contains(&cid)
    }
}

/// A batch of ref updates, applied atomically on commit.
///
/// Updates verify the expected old value at application time; a mismatch
/// fails the whole transaction without applying anything.
pub struct RefTransaction<'a> {
    odb: &'a Odb,
    updates: Vec<(String, Option<CommitId>, Option<CommitId>)>,
}

impl<'a> RefTransaction<'a> {
    pub fn new(odb: &'a Odb) -> RefTransaction<'a> {
        RefTransaction {
            odb,
            updates: Vec::new(),
        }
    }

    pub fn update(
        &mut self,
        name: impl AsRef<str>,
        new: CommitId,
        old: Option<CommitId>,
        msg: &str,
    ) -> Result<(), ()> {
        debug!(target: "refs", "update {} -> {} ({})", name.as_ref(), new, msg);
        self.updates
            .push((name.as_ref().to_string(), old, Some(new)));
        Ok(())
    }

    pub fn delete(
        &mut self,
        name: impl AsRef<str>,
        old: Option<CommitId>,
        msg: &str,
    ) -> Result<(), ()> {
        debug!(target: "refs", "delete {} ({})", name.as_ref(), msg);
        self.updates.push((name.as_ref().to_string(), old, None));
        Ok(())
    }

    pub fn commit(self) -> Result<(), ()> {
        let mut refs = self.odb.refs.borrow_mut();
        for (name, old, _) in &self.updates {
            if let Some(old) = old {
                if refs.get(name) != Some(old) {
                    return Err(());
                }
            }
        }
        for (name, _, new) in self.updates {
            match new {
                Some(new) => {
                    refs.insert(name, new);
                }
                None => {
                    refs.remove(&name);
                }
            }
        }
        Ok(())
    }
}

#[test]
fn test_hash_object() {
    use std::str::FromStr;

    let odb = Odb::new();
    assert_eq!(odb.ensure_empty_blob(), RawBlob::EMPTY_OID);
    assert_eq!(
        odb.write_blob(b"foo\n"),
        BlobId::from_str("257cc5642cb1a054f08cc83f2d943e56fd3ebe99").unwrap()
    );
    assert_eq!(odb.write_tree(&[], None), crate::git::RawTree::EMPTY_OID);

    // Writes are deduplicating and idempotent.
    let before = odb.objects.borrow().len();
    odb.write_blob(b"foo\n");
    assert_eq!(odb.objects.borrow().len(), before);

    let (kind, buf) = odb.read_object(RawBlob::EMPTY_OID.into()).unwrap();
    assert_eq!(kind, ObjectKind::Blob);
    assert!(buf.is_empty());
}

#[test]
fn test_ref_transaction() {
    use std::str::FromStr;

    let odb = Odb::new();
    let cid = CommitId::from_str("0123456789abcdef0123456789abcdef01234567").unwrap();
    let cid2 = CommitId::from_str("fedcba9876543210fedcba9876543210fedcba98").unwrap();

    let mut transaction = RefTransaction::new(&odb);
    transaction
        .update("refs/cinnabar/metadata", cid, None, "test")
        .unwrap();
    transaction.commit().unwrap();
    assert_eq!(odb.resolve_ref("refs/cinnabar/metadata"), Some(cid));

    // An expected-old mismatch fails the transaction wholesale.
    let mut transaction = RefTransaction::new(&odb);
    transaction
        .update("refs/cinnabar/metadata", cid2, Some(cid2), "test")
        .unwrap();
    assert!(transaction.commit().is_err());
    assert_eq!(odb.resolve_ref("refs/cinnabar/metadata"), Some(cid));

    let mut transaction = RefTransaction::new(&odb);
    transaction
        .delete("refs/cinnabar/metadata", Some(cid), "test")
        .unwrap();
    transaction.commit().unwrap();
    assert_eq!(odb.resolve_ref("refs/cinnabar/metadata"), None);

    let mut count = 0;
    odb.for_each_ref_in("refs/cinnabar/", |_, _| -> Result<(), ()> {
        count += 1;
        Ok(())
    })
    .unwrap();
    assert_eq!(count, 0);
}
