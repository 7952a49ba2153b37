/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Notes trees: git-native key-value maps stored as trees of entries keyed
//! by object id fan-out.
//!
//! The metadata store keeps three of them: `hg2git` (Mercurial node → git
//! id), `git2hg` (git commit → changeset metadata blob) and `files_meta`
//! (Mercurial file node → file metadata blob). The key namespace differs
//! between them, which the type parameter pins down.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::Write;

use itertools::Itertools;

use crate::git::{CommitId, FileMode, GitObjectId, GitOid, RawTree, TreeId, TreeIsh};
use crate::odb::Odb;
use crate::oid::{Abbrev, ObjectId};
use crate::tree_util::ParseTree;

pub struct NotesTree<K> {
    entries: BTreeMap<K, GitObjectId>,
    dirty: bool,
}

impl<K: ObjectId + Ord + Display> NotesTree<K> {
    pub fn new() -> Self {
        NotesTree {
            entries: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Initializes a notes tree from the commit at its root. A null id
    /// initializes an empty tree.
    pub fn new_with(odb: &Odb, c: CommitId) -> Self {
        let mut result = NotesTree::new();
        if c.is_null() {
            return result;
        }
        let tree_id = c.get_tree_id(odb);
        let mut prefix = Vec::new();
        result.load_tree(odb, tree_id, &mut prefix);
        result
    }

    fn load_tree(&mut self, odb: &Odb, tree_id: TreeId, prefix: &mut Vec<u8>) {
        let tree = RawTree::read(odb, tree_id).unwrap_or_else(RawTree::empty);
        for entry in tree.iter() {
            let (path, entry) = entry.unzip();
            match entry.oid {
                GitOid::Tree(subtree) => {
                    let len = prefix.len();
                    prefix.extend_from_slice(&path);
                    self.load_tree(odb, subtree, prefix);
                    prefix.truncate(len);
                }
                oid => {
                    let mut full = prefix.clone();
                    full.extend_from_slice(&path);
                    // Entries whose fanned-out name doesn't assemble into a
                    // full hex id are not notes; leave them alone.
                    let mut raw = [0u8; 20];
                    if full.len() == 40 && hex::decode_to_slice(&full, &mut raw).is_ok() {
                        if let Some(key) = K::from_raw_bytes(&raw) {
                            self.entries.insert(key, oid.into());
                        }
                    }
                }
            }
        }
    }

    pub fn get_note(&self, oid: K) -> Option<GitObjectId> {
        self.entries.get(&oid).copied()
    }

    /// Looks up a note by abbreviated key prefix. The first match in key
    /// order wins.
    pub fn get_note_abbrev(&self, oid: Abbrev<K>) -> Option<GitObjectId> {
        if oid.len() == 40 {
            return self.get_note(oid.as_padded_oid());
        }
        let min = oid.as_padded_oid();
        let mut max = min;
        {
            let raw = max.as_raw_bytes_mut();
            for b in raw.iter_mut().skip(oid.len().div_ceil(2)) {
                *b = 0xff;
            }
            if oid.len() % 2 == 1 {
                raw[oid.len() / 2] |= 0x0f;
            }
        }
        self.entries.range(min..=max).next().map(|(_, v)| *v)
    }

    /// Adds a note. If a note already exists for the key, the existing one
    /// is kept.
    pub fn add_note(&mut self, oid: K, note_oid: GitObjectId) {
        if let std::collections::btree_map::Entry::Vacant(e) = self.entries.entry(oid) {
            e.insert(note_oid);
            self.dirty = true;
        }
    }

    pub fn remove_note(&mut self, oid: K) {
        if self.entries.remove(&oid).is_some() {
            self.dirty = true;
        }
    }

    pub fn for_each<F: FnMut(K, GitObjectId)>(&self, mut f: F) {
        for (k, v) in self.entries.iter() {
            f(*k, *v);
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Writes the notes back as a commit, with the given file mode on leaf
    /// entries. An unmodified tree hands back the reference commit.
    pub fn store(&mut self, odb: &Odb, reference: CommitId, mode: FileMode) -> CommitId {
        if !self.dirty && !reference.is_null() {
            return reference;
        }
        let tree_id = self.write_tree(odb, mode);
        let mut buf = Vec::new();
        writeln!(buf, "tree {}", tree_id).ok();
        buf.extend_from_slice(
            b"author  <cinnabar@git> 0 +0000\ncommitter  <cinnabar@git> 0 +0000\n\n",
        );
        let result = odb.write_commit(&buf);
        self.dirty = false;
        result
    }

    fn write_tree(&self, odb: &Odb, mode: FileMode) -> TreeId {
        let mut top = Vec::new();
        for (_, group) in &self
            .entries
            .iter()
            .chunk_by(|(k, _)| k.as_raw_bytes()[0])
        {
            let mut fanout = None;
            let mut sub = Vec::new();
            for (k, v) in group {
                let hex = k.to_string();
                fanout.get_or_insert_with(|| hex[..2].to_string());
                write!(sub, "{:o} {}\0", u16::from(mode), &hex[2..]).ok();
                sub.extend_from_slice(v.as_raw_bytes());
            }
            let sub_id = odb.write_tree(&sub, None);
            write!(top, "{:o} {}\0", u16::from(FileMode::DIRECTORY), fanout.unwrap()).ok();
            top.extend_from_slice(GitObjectId::from(sub_id).as_raw_bytes());
        }
        odb.write_tree(&top, None)
    }
}

#[test]
fn test_notes_roundtrip() {
    use std::str::FromStr;

    use crate::hg::HgObjectId;

    let odb = Odb::new();
    let mut notes = NotesTree::<HgObjectId>::new();
    assert!(!notes.is_dirty());

    let k1 = HgObjectId::from_str("994c36ffd5f3bf79b81ba8f13fd0cdd1fdb6ca6b").unwrap();
    let k2 = HgObjectId::from_str("9934d48b0c37c192cb8f6b61f304f0d387b863ff").unwrap();
    let v1 = GitObjectId::from_str("e69de29bb2d1d6434b8b29ae775ad8c2e48c5391").unwrap();
    let v2 = GitObjectId::from_str("257cc5642cb1a054f08cc83f2d943e56fd3ebe99").unwrap();

    notes.add_note(k1, v1);
    notes.add_note(k2, v2);
    assert!(notes.is_dirty());
    assert_eq!(notes.get_note(k1), Some(v1));

    // Conflicting insert keeps the existing note.
    notes.add_note(k1, v2);
    assert_eq!(notes.get_note(k1), Some(v1));

    let stored = notes.store(&odb, CommitId::NULL, FileMode::GITLINK);
    assert!(!notes.is_dirty());
    // Storing again without modification returns the same commit.
    assert_eq!(notes.store(&odb, stored, FileMode::GITLINK), stored);

    let reloaded = NotesTree::<HgObjectId>::new_with(&odb, stored);
    assert_eq!(reloaded.get_note(k1), Some(v1));
    assert_eq!(reloaded.get_note(k2), Some(v2));

    let mut count = 0;
    reloaded.for_each(|_, _| count += 1);
    assert_eq!(count, 2);
}

#[test]
fn test_notes_abbrev() {
    use std::str::FromStr;

    use crate::hg::HgObjectId;

    let mut notes = NotesTree::<HgObjectId>::new();
    let k1 = HgObjectId::from_str("994c36ffd5f3bf79b81ba8f13fd0cdd1fdb6ca6b").unwrap();
    let k2 = HgObjectId::from_str("9934d48b0c37c192cb8f6b61f304f0d387b863ff").unwrap();
    let v1 = GitObjectId::from_str("e69de29bb2d1d6434b8b29ae775ad8c2e48c5391").unwrap();
    let v2 = GitObjectId::from_str("257cc5642cb1a054f08cc83f2d943e56fd3ebe99").unwrap();
    notes.add_note(k1, v1);
    notes.add_note(k2, v2);

    for (prefix, expected) in [
        ("994c", Some(v1)),
        ("994", Some(v1)),
        ("9934", Some(v2)),
        ("99345", None),
        ("a", None),
        ("994c36ffd5f3bf79b81ba8f13fd0cdd1fdb6ca6b", Some(v1)),
    ] {
        assert_eq!(
            notes.get_note_abbrev(Abbrev::from_str(prefix).unwrap()),
            expected,
            "looking up {}",
            prefix
        );
    }

    // An ambiguous abbreviation resolves to the first match in key order.
    assert_eq!(
        notes.get_note_abbrev(Abbrev::from_str("99").unwrap()),
        Some(v2)
    );
}

#[test]
fn test_notes_empty_store() {
    use crate::git::RawCommit;

    let odb = Odb::new();
    let mut notes = NotesTree::<GitObjectId>::new();
    let stored = notes.store(&odb, CommitId::NULL, FileMode::REGULAR | FileMode::RW);
    let commit = RawCommit::read(&odb, stored).unwrap();
    assert_eq!(commit.parse().unwrap().tree(), RawTree::EMPTY_OID);
}
