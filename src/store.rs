/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The metadata store proper.
//!
//! Everything the C implementation kept in process-wide globals lives in a
//! single [`Store`] context: the six metadata sub-roots, the three notes
//! trees, the manifest generation cache, the git tree cache and the head
//! sets. All public operations thread the store through explicitly, which
//! makes multi-store use safe.

use std::cell::{OnceCell, Ref, RefCell, RefMut};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::Write;
use std::rc::Rc;

use bitflags::bitflags;
use bstr::{BStr, BString, ByteSlice};
use derive_more::Deref;
use either::Either;
use hex_literal::hex;
use indexmap::IndexMap;
use itertools::EitherOrBoth;
use itertools::Itertools;

use crate::cinnabar::{
    GitChangesetId, GitFileId, GitFileMetadataId, GitManifestId, GitManifestTree,
    GitManifestTreeId,
};
use crate::git::{
    BlobId, Commit, CommitId, FileMode, GitObjectId, GitOid, RawBlob, RawCommit, RawTree, TreeId,
    TreeIsh,
};
use crate::hg::{HgChangesetId, HgFileAttr, HgFileId, HgManifestId, HgObjectId, ManifestEntry};
use crate::hg_data::{find_file_parents, hash_data};
use crate::notes::NotesTree;
use crate::odb::{Odb, ObjectKind};
use crate::oid::ObjectId;
use crate::tree_util::{merge_join_by_path, ParseTree, WithPath};
use crate::util::{die, FromBytes, SliceExt};

pub const REFS_PREFIX: &str = "refs/cinnabar/";
pub const REPLACE_REFS_PREFIX: &str = "refs/cinnabar/replace/";
pub const METADATA_REF: &str = "refs/cinnabar/metadata";
pub const CHECKED_REF: &str = "refs/cinnabar/checked";
pub const BROKEN_REF: &str = "refs/cinnabar/broken";
pub const NOTES_REF: &str = "refs/notes/cinnabar";

const BRANCHES_REFS_PREFIX: &str = "refs/cinnabar/branches/";

bitflags! {
    #[derive(Debug, Copy, Clone)]
    pub struct MetadataFlags: i32 {
        const FILES_META = 0x1;
        const UNIFIED_MANIFESTS_V2 = 0x2;
    }
}

struct GeneratedManifest {
    tree_id: GitManifestTreeId,
    content: Rc<[u8]>,
}

pub struct Store {
    odb: Odb,
    pub metadata_cid: CommitId,
    pub changesets_cid: CommitId,
    pub manifests_cid: CommitId,
    pub hg2git_cid: CommitId,
    pub git2hg_cid: CommitId,
    pub files_meta_cid: CommitId,
    hg2git_: OnceCell<RefCell<NotesTree<HgObjectId>>>,
    git2hg_: OnceCell<RefCell<NotesTree<GitObjectId>>>,
    files_meta_: OnceCell<RefCell<NotesTree<HgObjectId>>>,
    pub flags: MetadataFlags,
    changeset_heads_: OnceCell<RefCell<ChangesetHeads>>,
    manifest_heads_: OnceCell<RefCell<ManifestHeads>>,
    tree_cache_: RefCell<BTreeMap<GitManifestTreeId, TreeId>>,
    generated_manifest_: RefCell<Option<GeneratedManifest>>,
    // Parsed manifest tree buffers are expensive to hold but expensive to
    // re-parse. The table is swept after each generation to the trees that
    // generation touched, which bounds it to the previous-generation set.
    manifest_tree_bufs_: RefCell<HashMap<GitManifestTreeId, Rc<[u8]>>>,
    hg2git_seen_: RefCell<HashSet<HgObjectId>>,
}

impl Store {
    fn with_odb(odb: Odb) -> Store {
        Store {
            odb,
            metadata_cid: CommitId::NULL,
            changesets_cid: CommitId::NULL,
            manifests_cid: CommitId::NULL,
            hg2git_cid: CommitId::NULL,
            git2hg_cid: CommitId::NULL,
            files_meta_cid: CommitId::NULL,
            hg2git_: OnceCell::new(),
            git2hg_: OnceCell::new(),
            files_meta_: OnceCell::new(),
            flags: MetadataFlags::empty(),
            changeset_heads_: OnceCell::new(),
            manifest_heads_: OnceCell::new(),
            tree_cache_: RefCell::new(BTreeMap::new()),
            generated_manifest_: RefCell::new(None),
            manifest_tree_bufs_: RefCell::new(HashMap::new()),
            hg2git_seen_: RefCell::new(HashSet::new()),
        }
    }

    pub fn odb(&self) -> &Odb {
        &self.odb
    }

    pub fn hg2git(&self) -> Ref<NotesTree<HgObjectId>> {
        self.hg2git_
            .get_or_init(|| RefCell::new(NotesTree::new_with(&self.odb, self.hg2git_cid)))
            .borrow()
    }

    pub fn hg2git_mut(&self) -> RefMut<NotesTree<HgObjectId>> {
        self.hg2git();
        self.hg2git_.get().unwrap().borrow_mut()
    }

    pub fn git2hg(&self) -> Ref<NotesTree<GitObjectId>> {
        self.git2hg_
            .get_or_init(|| RefCell::new(NotesTree::new_with(&self.odb, self.git2hg_cid)))
            .borrow()
    }

    pub fn git2hg_mut(&self) -> RefMut<NotesTree<GitObjectId>> {
        self.git2hg();
        self.git2hg_.get().unwrap().borrow_mut()
    }

    pub fn files_meta(&self) -> Ref<NotesTree<HgObjectId>> {
        self.files_meta_
            .get_or_init(|| {
                let cid = if self.flags.contains(MetadataFlags::FILES_META) {
                    self.files_meta_cid
                } else {
                    CommitId::NULL
                };
                RefCell::new(NotesTree::new_with(&self.odb, cid))
            })
            .borrow()
    }

    pub fn files_meta_mut(&self) -> RefMut<NotesTree<HgObjectId>> {
        self.files_meta();
        self.files_meta_.get().unwrap().borrow_mut()
    }

    pub fn changeset_heads(&self) -> Ref<ChangesetHeads> {
        self.changeset_heads_
            .get_or_init(|| {
                RefCell::new(if self.changesets_cid.is_null() {
                    ChangesetHeads::new()
                } else {
                    ChangesetHeads::from_metadata(&self.odb, self.changesets_cid)
                })
            })
            .borrow()
    }

    pub fn changeset_heads_mut(&self) -> RefMut<ChangesetHeads> {
        self.changeset_heads();
        self.changeset_heads_.get().unwrap().borrow_mut()
    }

    pub fn manifest_heads(&self) -> Ref<ManifestHeads> {
        self.manifest_heads_
            .get_or_init(|| {
                RefCell::new(if self.manifests_cid.is_null() {
                    ManifestHeads::new()
                } else {
                    ManifestHeads::from_metadata(&self.odb, self.manifests_cid)
                })
            })
            .borrow()
    }

    pub fn manifest_heads_mut(&self) -> RefMut<ManifestHeads> {
        self.manifest_heads();
        self.manifest_heads_.get().unwrap().borrow_mut()
    }
}

pub fn has_metadata(store: &Store) -> bool {
    !store.flags.is_empty()
}

macro_rules! hg2git {
    ($h:ident => $g:ident) => {
        impl $h {
            pub fn to_git(self, store: &Store) -> Option<$g> {
                store
                    .hg2git()
                    .get_note(self.into())
                    .map(|o| $g::from_raw_bytes(o.as_raw_bytes()).unwrap())
            }
        }

        impl crate::oid::Abbrev<$h> {
            pub fn to_git(self, store: &Store) -> Option<$g> {
                store
                    .hg2git()
                    .get_note_abbrev(HgObjectId::from(self.as_padded_oid()).abbrev(self.len()))
                    .map(|o| $g::from_raw_bytes(o.as_raw_bytes()).unwrap())
            }
        }
    };
}

hg2git!(HgChangesetId => GitChangesetId);
hg2git!(HgManifestId => GitManifestId);
hg2git!(HgFileId => GitFileId);

/// Resolves a Mercurial node, possibly abbreviated, through `hg2git`.
pub fn resolve_hg(store: &Store, node: crate::oid::Abbrev<HgObjectId>) -> Option<GitObjectId> {
    store.hg2git().get_note_abbrev(node)
}

/// A generated flat Mercurial manifest.
///
/// The bytes are shared with the store's generation cache; cloning is
/// cheap and never copies the content.
#[derive(Clone, Deref)]
#[deref(forward)]
pub struct RawHgManifest(Rc<[u8]>);

impl RawHgManifest {
    pub fn empty() -> RawHgManifest {
        RawHgManifest(Rc::from(&[][..]))
    }

    pub fn read(store: &Store, oid: GitManifestId) -> Option<Self> {
        Some(store.generate_manifest(oid.get_tree_id(store.odb())))
    }
}

impl From<Vec<u8>> for RawHgManifest {
    fn from(v: Vec<u8>) -> RawHgManifest {
        RawHgManifest(v.into())
    }
}

/// Returns whether `rest` begins with the manifest line for `base ‖ path`
/// (either a file at exactly that path, or anything under it).
fn path_match(base: &[u8], path: &[u8], rest: &[u8]) -> bool {
    rest.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix(path))
        .and_then(|rest| rest.first())
        .is_some_and(|&c| c == b'\0' || c == b'/')
}

fn skip_line(buf: &[u8]) -> &[u8] {
    buf.find_byte(b'\n').map_or(&[], |pos| &buf[pos + 1..])
}

impl Store {
    fn manifest_tree(
        &self,
        oid: GitManifestTreeId,
        seen: &mut HashSet<GitManifestTreeId>,
    ) -> GitManifestTree {
        seen.insert(oid);
        if let Some(buf) = self.manifest_tree_bufs_.borrow().get(&oid) {
            return GitManifestTree::with_buf(buf.clone());
        }
        let tree =
            GitManifestTree::read(&self.odb, oid).unwrap_or_else(|| corrupted_metadata());
        self.manifest_tree_bufs_
            .borrow_mut()
            .insert(oid, Rc::from(tree.as_ref()));
        tree
    }

    /// Rebuilds the flat manifest for `tree_id`, splicing unchanged runs
    /// out of `ref_manifest`, the flat manifest of `ref_tree_id`.
    ///
    /// Entries only present in the reference are skipped; entries only in
    /// the new tree are serialized afresh; entries identical on both sides
    /// are copied from the reference bytes without re-serialization.
    fn recurse_manifest(
        &self,
        ref_tree_id: Option<GitManifestTreeId>,
        mut ref_manifest: &[u8],
        tree_id: GitManifestTreeId,
        manifest: &mut Vec<u8>,
        base: &[u8],
        seen: &mut HashSet<GitManifestTreeId>,
    ) {
        let ref_tree = ref_tree_id
            .map_or_else(GitManifestTree::empty, |tid| self.manifest_tree(tid, seen));
        let tree = self.manifest_tree(tree_id, seen);
        for entry in merge_join_by_path(ref_tree.iter(), tree.iter()) {
            let (path, inner) = entry.unzip();
            let (a, b) = match inner {
                EitherOrBoth::Left(a) => (Some(a), None),
                EitherOrBoth::Right(b) => (None, Some(b)),
                EitherOrBoth::Both(a, b) => (Some(a), Some(b)),
            };
            let cursor = ref_manifest;
            if let Some(a) = &a {
                // The run covered by this entry in the reference manifest:
                // one line for a file, every line under the path for a
                // subtree.
                ref_manifest = skip_line(ref_manifest);
                if a.is_left() {
                    while path_match(base, &path, ref_manifest) {
                        ref_manifest = skip_line(ref_manifest);
                    }
                }
            }
            // Removed entry, nothing to emit.
            let Some(b) = b else { continue };
            if a.as_ref() == Some(&b) {
                // Unchanged, copy from the reference manifest.
                if let Either::Left(subtree) = b {
                    seen.insert(subtree);
                }
                manifest.extend_from_slice(&cursor[..cursor.len() - ref_manifest.len()]);
                continue;
            }
            match b {
                Either::Right(file) => {
                    let mut full_path = base.to_vec();
                    full_path.extend_from_slice(&path);
                    RawHgManifest::write_one_entry(
                        &WithPath::new(full_path, file),
                        &mut *manifest,
                    )
                    .unwrap();
                }
                Either::Left(subtree) => {
                    let mut dir = base.to_vec();
                    dir.extend_from_slice(&path);
                    dir.push(b'/');
                    match a.and_then(Either::left) {
                        Some(ref_subtree) => self.recurse_manifest(
                            Some(ref_subtree),
                            cursor,
                            subtree,
                            manifest,
                            &dir,
                            seen,
                        ),
                        None => self.recurse_manifest(None, b"", subtree, manifest, &dir, seen),
                    }
                }
            }
        }
    }

    /// Returns the flat Mercurial manifest for the given encoded manifest
    /// tree.
    ///
    /// For repositories with a lot of files, generating a manifest from
    /// scratch is slow, and there are usually way fewer changes between
    /// consecutive manifests than there are files in the repository. The
    /// store keeps the last generated manifest and produces the next one
    /// by splicing unchanged runs out of it.
    pub fn generate_manifest(&self, tree_id: GitManifestTreeId) -> RawHgManifest {
        let previous = self.generated_manifest_.borrow_mut().take();
        if let Some(previous) = previous {
            if previous.tree_id == tree_id {
                let content = previous.content.clone();
                *self.generated_manifest_.borrow_mut() = Some(previous);
                return RawHgManifest(content);
            }
            let mut content = Vec::with_capacity(previous.content.len());
            let mut seen = HashSet::new();
            self.recurse_manifest(
                Some(previous.tree_id),
                &previous.content,
                tree_id,
                &mut content,
                b"",
                &mut seen,
            );
            self.finish_generation(tree_id, content, &seen)
        } else {
            let mut content = Vec::new();
            let mut seen = HashSet::new();
            self.recurse_manifest(None, b"", tree_id, &mut content, b"", &mut seen);
            self.finish_generation(tree_id, content, &seen)
        }
    }

    fn finish_generation(
        &self,
        tree_id: GitManifestTreeId,
        content: Vec<u8>,
        seen: &HashSet<GitManifestTreeId>,
    ) -> RawHgManifest {
        // Trees not reused by this generation lose their buffer.
        self.manifest_tree_bufs_
            .borrow_mut()
            .retain(|tid, _| seen.contains(tid));
        let content: Rc<[u8]> = content.into();
        *self.generated_manifest_.borrow_mut() = Some(GeneratedManifest {
            tree_id,
            content: content.clone(),
        });
        RawHgManifest(content)
    }

    /// Seeds the generation cache with a manifest whose content is already
    /// known, typically because it was just stored.
    fn prime_manifest_cache(&self, tree_id: GitManifestTreeId, content: Rc<[u8]>) {
        *self.generated_manifest_.borrow_mut() = Some(GeneratedManifest { tree_id, content });
    }
}

#[derive(Clone, Deref)]
#[deref(forward)]
pub struct RawHgFile(Rc<[u8]>);

impl RawHgFile {
    pub const EMPTY_OID: HgFileId =
        HgFileId::from_raw_bytes_array(hex!("b80de5d138758541c5f05265ad144ab9fa86d1db"));

    pub fn read(
        store: &Store,
        oid: GitFileId,
        metadata: Option<GitFileMetadataId>,
    ) -> Option<Self> {
        let mut result = Vec::new();
        if let Some(metadata) = metadata {
            result.extend_from_slice(b"\x01\n");
            result.extend_from_slice(RawBlob::read(store.odb(), metadata.into())?.as_bytes());
            result.extend_from_slice(b"\x01\n");
        }
        result.extend_from_slice(RawBlob::read(store.odb(), oid.into())?.as_bytes());
        Some(Self(result.into()))
    }

    pub fn read_hg(store: &Store, oid: HgFileId) -> Option<Self> {
        if oid == Self::EMPTY_OID {
            Some(Self(Rc::from(&[][..])))
        } else {
            let metadata = store
                .files_meta()
                .get_note(oid.into())
                .map(BlobId::from_unchecked)
                .map(GitFileMetadataId::from_unchecked);
            Self::read(store, oid.to_git(store)?, metadata)
        }
    }
}

/// Per-branch Mercurial changeset heads.
#[derive(Debug)]
pub struct ChangesetHeads {
    heads: IndexMap<HgChangesetId, BString>,
    has_children: HashSet<HgChangesetId>,
}

impl ChangesetHeads {
    pub fn new() -> Self {
        ChangesetHeads {
            heads: IndexMap::new(),
            has_children: HashSet::new(),
        }
    }

    pub fn from_metadata(odb: &Odb, cid: CommitId) -> Self {
        let mut result = ChangesetHeads::new();

        let commit = RawCommit::read(odb, cid).unwrap();
        let commit = commit.parse().unwrap();
        for l in ByteSlice::lines(commit.body()) {
            let [h, b] = l.splitn_exact(b' ').unwrap();
            let cs = HgChangesetId::from_bytes(h).unwrap();
            result.add(cs, &[], b.as_bstr());
        }
        result
    }

    pub fn add(&mut self, cs: HgChangesetId, parents: &[HgChangesetId], branch: &BStr) {
        self.heads.insert(cs, BString::from(branch));
        for parent in parents {
            self.has_children.insert(*parent);
            if self.heads.get(parent).map(|b| b.as_bstr()) == Some(branch) {
                self.heads.shift_remove(parent);
            }
        }
    }

    pub fn branch_heads(&self) -> impl Iterator<Item = (&HgChangesetId, &BStr)> {
        self.heads.iter().map(|(cs, branch)| (cs, branch.as_bstr()))
    }

    pub fn heads(&self) -> impl Iterator<Item = &HgChangesetId> {
        // Branch heads can have children in other branches, in which case
        // they are not heads.
        self.heads
            .keys()
            .filter(|cs| !self.has_children.contains(*cs))
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }
}

#[derive(Debug)]
pub struct ManifestHeads {
    heads: BTreeSet<GitManifestId>,
}

impl ManifestHeads {
    pub fn new() -> Self {
        ManifestHeads {
            heads: BTreeSet::new(),
        }
    }

    pub fn from_metadata(odb: &Odb, cid: CommitId) -> Self {
        let mut result = ManifestHeads::new();

        let commit = RawCommit::read(odb, cid).unwrap();
        let commit = commit.parse().unwrap();
        for p in commit.parents() {
            result.heads.insert(GitManifestId::from_unchecked(*p));
        }
        result
    }

    pub fn add(&mut self, odb: &Odb, head: GitManifestId) {
        let commit = RawCommit::read(odb, head.into()).unwrap();
        let commit = commit.parse().unwrap();
        for p in commit.parents() {
            self.heads.remove(&GitManifestId::from_unchecked(*p));
        }
        self.heads.insert(head);
    }

    pub fn heads(&self) -> impl Iterator<Item = &GitManifestId> {
        self.heads.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }
}

pub fn clear_manifest_heads(store: &Store) {
    let mut heads = store.manifest_heads_mut();
    *heads = ManifestHeads::new();
}

pub fn reset_manifest_heads(store: &Store) {
    clear_manifest_heads(store);
}

pub fn set_changeset_heads(store: &Store, new_heads: ChangesetHeads) {
    let mut heads = store.changeset_heads_mut();
    *heads = new_heads;
}

pub enum SetWhat {
    Changeset,
    ChangesetMeta,
    Manifest,
    File,
    FileMeta,
}

impl Store {
    pub fn set(&self, what: SetWhat, hg_id: HgObjectId, git_id: GitObjectId) {
        fn set(
            store: &Store,
            mut notes: RefMut<NotesTree<HgObjectId>>,
            expected: ObjectKind,
            hg_id: HgObjectId,
            git_id: GitObjectId,
        ) {
            if git_id.is_null() {
                notes.remove_note(hg_id);
            } else if store.odb.object_kind(git_id) != Some(expected) {
                die!("Invalid object");
            } else {
                notes.add_note(hg_id, git_id);
            }
        }
        match what {
            SetWhat::Changeset => {
                set(self, self.hg2git_mut(), ObjectKind::Commit, hg_id, git_id);
            }
            SetWhat::ChangesetMeta => {
                let csid = HgChangesetId::from_unchecked(hg_id);
                if let Some(cid) = csid.to_git(self) {
                    if git_id.is_null() {
                        self.git2hg_mut().remove_note(cid.into());
                    } else if self.odb.object_kind(git_id) != Some(ObjectKind::Blob) {
                        die!("Invalid object");
                    } else {
                        self.git2hg_mut().add_note(cid.into(), git_id);
                    }
                } else if !git_id.is_null() {
                    die!("Invalid sha1");
                }
            }
            SetWhat::Manifest => {
                if !git_id.is_null() {
                    self.manifest_heads_mut().add(
                        &self.odb,
                        GitManifestId::from_unchecked(CommitId::from_unchecked(git_id)),
                    );
                }
                set(self, self.hg2git_mut(), ObjectKind::Commit, hg_id, git_id);
            }
            SetWhat::File => {
                set(self, self.hg2git_mut(), ObjectKind::Blob, hg_id, git_id);
            }
            SetWhat::FileMeta => {
                set(self, self.files_meta_mut(), ObjectKind::Blob, hg_id, git_id);
            }
        }
    }
}

fn corrupted_metadata() -> ! {
    die!("Corrupt mercurial metadata");
}

/// Builds the encoded manifest tree for the manifest lines in
/// `entries[..]`, whose paths all share `offset` bytes of prefix.
fn store_manifest_tree(
    store: &Store,
    entries: &[(Box<[u8]>, ManifestEntry)],
    offset: usize,
) -> GitManifestTreeId {
    let mut tree_buf = Vec::new();
    let mut i = 0;
    while i < entries.len() {
        let path = &entries[i].0[offset..];
        match path.find_byte(b'/') {
            None => {
                GitManifestTree::write_one_entry(
                    &WithPath::new(path, Either::Right(entries[i].1)),
                    &mut tree_buf,
                )
                .unwrap();
                i += 1;
            }
            Some(pos) => {
                let component = &path[..pos];
                let run = entries[i..]
                    .iter()
                    .take_while(|(p, _)| {
                        p.len() > offset + pos
                            && p[offset..].starts_with(component)
                            && p[offset + pos] == b'/'
                    })
                    .count();
                let subtree =
                    store_manifest_tree(store, &entries[i..i + run], offset + pos + 1);
                GitManifestTree::write_one_entry(
                    &WithPath::new(component, Either::Left(subtree)),
                    &mut tree_buf,
                )
                .unwrap();
                i += run;
            }
        }
    }
    GitManifestTreeId::from_unchecked(store.odb().write_tree(&tree_buf, None))
}

/// Stores a flat Mercurial manifest as an encoded manifest tree and its
/// manifest commit, and records the `hg2git` mapping and manifest head.
///
/// The commit message body carries the Mercurial manifest node; the commit
/// parents are the manifest commits of the Mercurial parents.
pub fn store_manifest(
    store: &Store,
    mid: HgManifestId,
    parents: [HgManifestId; 2],
    raw_manifest: &[u8],
) -> GitManifestId {
    if store.hg2git_seen_.borrow().contains(&mid.into()) || mid.to_git(store).is_some() {
        return mid.to_git(store).unwrap();
    }
    let entries = RawHgManifest::from(raw_manifest.to_vec())
        .into_iter()
        .map(WithPath::unzip)
        .collect_vec();
    let tree_id = store_manifest_tree(store, &entries, 0);

    let mut commit = Vec::new();
    writeln!(commit, "tree {}", TreeId::from(tree_id)).ok();
    for p in parents.into_iter().filter(|p| !p.is_null()) {
        let parent_cid = p
            .to_git(store)
            .unwrap_or_else(|| die!("Missing manifest parent {}", p));
        writeln!(commit, "parent {}", CommitId::from(parent_cid)).ok();
    }
    commit.extend_from_slice(b"author  <cinnabar@git> 0 +0000\n");
    commit.extend_from_slice(b"committer  <cinnabar@git> 0 +0000\n\n");
    write!(commit, "{}", mid).ok();
    let commit_id = store.odb().write_commit(&commit);

    store.set(SetWhat::Manifest, mid.into(), commit_id.into());
    store.hg2git_seen_.borrow_mut().insert(mid.into());
    store.prime_manifest_cache(tree_id, Rc::from(raw_manifest));
    GitManifestId::from_unchecked(commit_id)
}

/// Stores a Mercurial file revision payload: the optional `\x01\n` metadata
/// envelope goes to a `files_meta` blob, the contents to a plain blob.
pub fn store_file(store: &Store, node: HgFileId, raw_file: &[u8]) -> BlobId {
    if node == RawHgFile::EMPTY_OID {
        // The empty blob is created when translating the git tree of the
        // corresponding changeset; there is nothing to associate it with.
        return store.odb().ensure_empty_blob();
    }
    if let Some(existing) = node.to_git(store) {
        return existing.into();
    }
    let mut content = raw_file;
    if content.starts_with(b"\x01\n") {
        let [file_metadata, file_content] = content[2..]
            .splitn_exact(&b"\x01\n"[..])
            .unwrap_or_else(|| die!("Malformed file metadata for {}", node));
        let metadata_oid = store.odb().write_blob(file_metadata);
        store
            .files_meta_mut()
            .add_note(node.into(), metadata_oid.into());
        content = file_content;
    }
    let file_oid = store.odb().write_blob(content);
    store.set(SetWhat::File, node.into(), file_oid.into());
    store.hg2git_seen_.borrow_mut().insert(node.into());
    file_oid
}

fn manifest_trailer_oid(commit: &Commit) -> Option<HgManifestId> {
    let body = commit.body().trim_end_with(|c| c.is_ascii_whitespace());
    (body.len() >= 40)
        .then(|| HgManifestId::from_bytes(&body[body.len() - 40..]).ok())
        .flatten()
}

/// Recomputes the Mercurial node of the manifest stored in the given
/// manifest commit and compares it with the recorded one.
pub fn check_manifest(store: &Store, oid: GitManifestId) -> bool {
    let manifest_commit = RawCommit::read(store.odb(), oid.into()).unwrap();
    let manifest_commit = manifest_commit.parse().unwrap();
    let Some(manifest_id) = manifest_trailer_oid(&manifest_commit) else {
        return false;
    };

    let parents = manifest_commit
        .parents()
        .iter()
        .map(|p| {
            let manifest_commit = RawCommit::read(store.odb(), *p).unwrap();
            let manifest_commit = manifest_commit.parse().unwrap();
            manifest_trailer_oid(&manifest_commit).unwrap_or_else(|| corrupted_metadata())
        })
        .collect_vec();
    let manifest = RawHgManifest::read(store, oid).unwrap();

    let computed = hash_data(
        parents.first().copied().map(Into::into),
        parents.get(1).copied().map(Into::into),
        manifest.as_ref(),
    );

    computed == manifest_id
}

/// Checks that a file node is consistent with its contents and parents,
/// absorbing known Mercurial parent-recording quirks.
pub fn check_file(store: &Store, node: HgFileId, p1: HgFileId, p2: HgFileId) -> bool {
    let data = RawHgFile::read_hg(store, node).unwrap();
    find_file_parents(node, Some(p1), Some(p2), &data).is_some()
}

// The git storage for a mercurial manifest used to be a commit with two
// directories at its root:
// - a git directory, matching the git tree in the git commit corresponding to
//   the mercurial changeset using the manifest.
// - a hg directory, containing the same file paths, but where all pointed
//   objects are commits (mode 160000 in the git tree) whose sha1 is actually
//   the mercurial sha1 for the corresponding mercurial file.
// Reconstructing the mercurial manifest required file paths, mercurial sha1
// for each file, and the corresponding attribute ("l" for symlinks, "x" for
// executables). The hg directory alone was not enough for that, because it
// lacked the attribute information.
fn do_create_git_tree(
    store: &Store,
    manifest_tree_id: GitManifestTreeId,
    ref_tree_id: Option<TreeId>,
    merge_tree_id: Option<GitManifestTreeId>,
) -> TreeId {
    let cached = merge_tree_id
        .is_none()
        .then(|| store.tree_cache_.borrow().get(&manifest_tree_id).copied())
        .flatten();
    if let Some(cached) = cached {
        return cached;
    }
    let manifest_tree =
        GitManifestTree::read(store.odb(), manifest_tree_id).unwrap_or_else(|| corrupted_metadata());
    let merge_tree = merge_tree_id.map_or_else(GitManifestTree::empty, |tid| {
        GitManifestTree::read(store.odb(), tid).unwrap_or_else(|| corrupted_metadata())
    });
    let mut tree_buf = Vec::with_capacity(manifest_tree.as_ref().len());
    let mut ref_tree = None;
    for (path, entries) in
        merge_join_by_path(manifest_tree.iter(), merge_tree.iter()).map(WithPath::unzip)
    {
        let entry = entries
            .as_ref()
            .left()
            .or_else(|| entries.as_ref().right())
            .unwrap();
        // In some edge cases, presumably all related to the use of
        // `hg convert` before Mercurial 2.0.1, manifest trees have
        // double slashes, which end up as "_" directories in the
        // corresponding git cinnabar metadata.
        // With further changes in the subsequent Mercurial manifests,
        // those entries with double slashes are superseded with entries
        // with single slash, while still being there. So to create
        // the corresponding git commit, we need to merge both in some
        // manner.
        // Mercurial doesn't actually guarantee which of the paths would
        // actually be checked out when checking out such manifests,
        // but we always choose the single slash path. Most of the time,
        // though, both will have the same contents. At least for files.
        // Sub-directories may differ in what paths they contain, but
        // again, the files they contain are usually identical.
        if path.is_empty() {
            if entry.is_right() {
                corrupted_metadata();
            }
            if merge_tree_id.is_some() {
                continue;
            }
            let result =
                do_create_git_tree(store, manifest_tree_id, ref_tree_id, entry.clone().left());
            store
                .tree_cache_
                .borrow_mut()
                .insert(manifest_tree_id, result);
            return result;
        }
        let (oid, mode): (GitObjectId, _) = match entry {
            Either::Left(subtree_id) => {
                let ref_entry_oid = ref_tree_id
                    .and_then(|tid| {
                        ref_tree
                            .get_or_insert_with(|| {
                                RawTree::read(store.odb(), tid).unwrap().into_iter()
                            })
                            .find(|e| e.path() == path.as_bstr())
                    })
                    .and_then(|e| match e.into_inner().oid {
                        GitOid::Tree(tree_id) => Some(tree_id),
                        _ => None,
                    });
                (
                    do_create_git_tree(
                        store,
                        *subtree_id,
                        ref_entry_oid,
                        entries.right().and_then(Either::left),
                    )
                    .into(),
                    FileMode::DIRECTORY,
                )
            }
            Either::Right(entry) => {
                let oid = if entry.fid == RawHgFile::EMPTY_OID {
                    store.odb().ensure_empty_blob()
                } else if let Some(bid) = entry.fid.to_git(store) {
                    BlobId::from(bid)
                } else {
                    corrupted_metadata();
                };
                (
                    oid.into(),
                    match entry.attr {
                        HgFileAttr::Regular => FileMode::REGULAR | FileMode::RW,
                        HgFileAttr::Executable => FileMode::REGULAR | FileMode::RWX,
                        HgFileAttr::Symlink => FileMode::SYMLINK,
                    },
                )
            }
        };
        write!(tree_buf, "{:o} ", u16::from(mode.canon())).ok();
        tree_buf.extend_from_slice(&path);
        tree_buf.extend_from_slice(b"\0");
        tree_buf.extend_from_slice(oid.as_raw_bytes());
    }
    let result = store.odb().write_tree(&tree_buf, ref_tree_id);
    if merge_tree_id.is_none() {
        store
            .tree_cache_
            .borrow_mut()
            .insert(manifest_tree_id, result);
    }
    result
}

/// Produces a real, checkoutable git tree from an encoded manifest tree.
///
/// The reference tree, when given, is the real git tree of a related
/// changeset; it only serves as a sharing hint for the backing store and
/// never changes the produced id.
pub fn create_git_tree(
    store: &Store,
    manifest_tree_id: GitManifestTreeId,
    ref_tree_id: Option<TreeId>,
) -> TreeId {
    do_create_git_tree(store, manifest_tree_id, ref_tree_id, None)
}

fn old_metadata() -> ! {
    die!(
        "Metadata from git-cinnabar versions older than 0.5.0 is not supported.\n\
          Please run `git cinnabar upgrade` with version 0.5.x first."
    );
}

fn new_metadata() -> ! {
    die!(
        "It looks like this repository was used with a newer version of git-cinnabar. \
          Cannot use this version."
    );
}

impl Store {
    /// Opens the store over the given object database, loading metadata
    /// from `refs/cinnabar/metadata` if present.
    pub fn open(odb: Odb) -> Store {
        let cid = odb.resolve_ref(METADATA_REF);
        Store::new(odb, cid)
    }

    pub fn new(odb: Odb, c: Option<CommitId>) -> Store {
        let mut result = Store::with_odb(odb);
        let cid = if let Some(c) = c {
            c
        } else {
            result.odb.reset_replace_map();
            return result;
        };
        let c = RawCommit::read(&result.odb, cid).unwrap();
        let c = c.parse().unwrap();
        if !(5..=6).contains(&c.parents().len()) {
            die!("Invalid metadata?");
        }
        for (cid, field) in Some(cid).iter().chain(c.parents()[..5].iter()).zip([
            &mut result.metadata_cid,
            &mut result.changesets_cid,
            &mut result.manifests_cid,
            &mut result.hg2git_cid,
            &mut result.git2hg_cid,
            &mut result.files_meta_cid,
        ]) {
            *field = *cid;
        }
        for flag in c.body().split(|&b| b == b' ') {
            match flag {
                b"" => {}
                b"files-meta" => {
                    result.flags.insert(MetadataFlags::FILES_META);
                }
                b"unified-manifests" => old_metadata(),
                b"unified-manifests-v2" => {
                    result.flags.insert(MetadataFlags::UNIFIED_MANIFESTS_V2);
                }
                _ => new_metadata(),
            }
        }
        if result.flags.is_empty() {
            old_metadata();
        }
        let mut count = 0;
        result
            .odb
            .for_each_ref_in(BRANCHES_REFS_PREFIX, |_, _| -> Result<(), ()> {
                count += 1;
                Ok(())
            })
            .ok();
        if count > 0 {
            old_metadata();
        }

        result.odb.reset_replace_map();

        let tree = RawTree::read(&result.odb, c.tree()).unwrap();
        let mut replaces = BTreeMap::new();
        for (path, entry) in tree.into_iter().map(WithPath::unzip) {
            match entry.oid {
                GitOid::Commit(replace_with) => {
                    if let Ok(original) = CommitId::from_bytes(&path) {
                        if original == replace_with {
                            warn!("self-referencing graft: {}", original);
                        } else {
                            replaces
                                .entry(original)
                                .and_modify(|_| die!("duplicate replace: {}", original))
                                .or_insert_with(|| replace_with);
                        }
                    } else {
                        warn!("bad replace name: {}", path.as_bstr());
                    }
                }
                _ => die!("Invalid metadata"),
            }
        }
        for (original, replace_with) in replaces.into_iter() {
            result.odb.set_replace(original, replace_with);
        }
        if result.odb.replace_map_len() == 0 {
            let mut count = 0;
            result
                .odb
                .for_each_ref_in(REPLACE_REFS_PREFIX, |_, _| -> Result<(), ()> {
                    count += 1;
                    Ok(())
                })
                .ok();
            if count > 0 {
                old_metadata();
            }
        }
        result
    }

    /// Discards all in-memory notes and caches, reloads the metadata root
    /// and rebuilds the replace map.
    pub fn reload(&mut self) {
        let odb = std::mem::take(&mut self.odb);
        let cid = odb.resolve_ref(METADATA_REF);
        *self = Store::new(odb, cid);
    }
}

fn store_changesets_metadata(store: &Store) -> CommitId {
    let mut commit = Vec::new();
    writeln!(commit, "tree {}", RawTree::EMPTY_OID).ok();
    let heads = store.changeset_heads();
    for (head, _) in heads.branch_heads() {
        writeln!(commit, "parent {}", head.to_git(store).unwrap()).ok();
    }
    commit.extend_from_slice(b"author  <cinnabar@git> 0 +0000\n");
    commit.extend_from_slice(b"committer  <cinnabar@git> 0 +0000\n\n");
    for (n, (head, branch)) in heads.branch_heads().enumerate() {
        if n > 0 {
            commit.push(b'\n');
        }
        write!(commit, "{} {}", head, branch).ok();
    }
    store.odb().write_commit(&commit)
}

fn store_manifests_metadata(store: &Store) -> CommitId {
    let mut commit = Vec::new();
    writeln!(commit, "tree {}", RawTree::EMPTY_OID).ok();
    let heads = store.manifest_heads();
    for head in heads.heads() {
        writeln!(commit, "parent {}", CommitId::from(*head)).ok();
    }
    commit.extend_from_slice(b"author  <cinnabar@git> 0 +0000\n");
    commit.extend_from_slice(b"committer  <cinnabar@git> 0 +0000\n\n");
    store.odb().write_commit(&commit)
}

fn store_replace_map(store: &Store) -> TreeId {
    let mut tree = Vec::new();
    store.odb().for_each_replace(|original, replace_with| {
        write!(tree, "{:o} {}\0", u16::from(FileMode::GITLINK), original).ok();
        tree.extend_from_slice(GitObjectId::from(replace_with).as_raw_bytes());
    });
    store.odb().write_tree(&tree, None)
}

/// Writes back the metadata root: the six sub-roots as parents, the
/// replace map as the tree, and the feature flags in the body.
///
/// Returns the previous root unchanged when nothing moved.
pub fn do_store_metadata(store: &Store) -> CommitId {
    let hg2git_cid = store.hg2git_cid;
    let hg2git = store
        .hg2git_mut()
        .store(store.odb(), hg2git_cid, FileMode::GITLINK);
    let git2hg_cid = store.git2hg_cid;
    let git2hg = store
        .git2hg_mut()
        .store(store.odb(), git2hg_cid, FileMode::REGULAR | FileMode::RW);
    let files_meta_cid = store.files_meta_cid;
    let files_meta =
        store
            .files_meta_mut()
            .store(store.odb(), files_meta_cid, FileMode::REGULAR | FileMode::RW);
    let manifests = store_manifests_metadata(store);
    let changesets = store_changesets_metadata(store);
    let previous = (!store.metadata_cid.is_null()).then_some(store.metadata_cid);
    let tree = store_replace_map(store);

    let new_metadata = [changesets, manifests, hg2git, git2hg, files_meta];
    if let Some(previous) = previous {
        let c = RawCommit::read(store.odb(), previous).unwrap();
        let c = c.parse().unwrap();
        if !(5..=6).contains(&c.parents().len()) {
            die!("Invalid metadata?");
        }
        if c.parents()[..5] == new_metadata {
            return previous;
        }
    }
    let mut buf = Vec::new();
    writeln!(buf, "tree {}", tree).ok();
    for p in new_metadata.into_iter().chain(previous) {
        writeln!(buf, "parent {}", p).ok();
    }
    buf.extend_from_slice(
        b"author  <cinnabar@git> 0 +0000\n\
          committer  <cinnabar@git> 0 +0000\n\
          \n\
          files-meta unified-manifests-v2",
    );
    store.odb().write_commit(&buf)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::odb::RefTransaction;

    fn hg_file(content: &[u8]) -> HgFileId {
        HgFileId::from_unchecked(hash_data(None, None, content))
    }

    fn manifest_line(path: &str, fid: HgFileId, flag: &str) -> String {
        format!("{}\0{}{}\n", path, fid, flag)
    }

    fn manifest_id(parents: [HgManifestId; 2], raw: &[u8]) -> HgManifestId {
        let p = |p: HgManifestId| (!p.is_null()).then(|| HgObjectId::from(p));
        HgManifestId::from_unchecked(hash_data(p(parents[0]), p(parents[1]), raw))
    }

    fn store_test_manifest(
        store: &Store,
        parents: [HgManifestId; 2],
        raw: &[u8],
    ) -> (HgManifestId, GitManifestId) {
        let mid = manifest_id(parents, raw);
        let git_mid = store_manifest(store, mid, parents, raw);
        (mid, git_mid)
    }

    fn subtree_id(store: &Store, tree_id: GitManifestTreeId, name: &[u8]) -> GitManifestTreeId {
        GitManifestTree::read(store.odb(), tree_id)
            .unwrap()
            .into_iter()
            .find_map(|entry| {
                (entry.path() == name.as_bstr())
                    .then(|| entry.inner().clone().left())
                    .flatten()
            })
            .unwrap()
    }

    #[test]
    fn test_empty_store() {
        let store = Store::open(Odb::new());
        assert!(store.metadata_cid.is_null());
        assert!(store.changesets_cid.is_null());
        assert!(store.manifests_cid.is_null());
        assert!(store.hg2git_cid.is_null());
        assert!(store.git2hg_cid.is_null());
        assert!(store.files_meta_cid.is_null());
        assert!(store.flags.is_empty());
        assert!(!has_metadata(&store));
        assert!(store.manifest_heads().is_empty());
        assert!(store.changeset_heads().is_empty());
    }

    #[test]
    fn test_single_file_manifest() {
        let store = Store::open(Odb::new());
        let fid = hg_file(b"a content\n");
        store_file(&store, fid, b"a content\n");
        let raw = manifest_line("a", fid, "");
        let (mid, git_mid) = store_test_manifest(&store, [HgManifestId::NULL; 2], raw.as_bytes());

        // The encoded tree has a single entry `_a` with mode 0160644
        // carrying the file node as a gitlink.
        let tree_id = git_mid.get_tree_id(store.odb());
        let raw_tree = RawTree::read(store.odb(), tree_id.into()).unwrap();
        let entries = raw_tree.iter().collect_vec();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path(), b"_a".as_bstr());
        assert_eq!(u16::from(entries[0].inner().mode), 0o160644);
        assert_eq!(
            GitObjectId::from(entries[0].inner().oid).as_raw_bytes(),
            fid.as_raw_bytes()
        );

        // Generating from scratch round-trips to the original bytes.
        *store.generated_manifest_.borrow_mut() = None;
        assert_eq!(&*store.generate_manifest(tree_id), raw.as_bytes());
        // So does the cached path.
        assert_eq!(&*store.generate_manifest(tree_id), raw.as_bytes());

        assert!(check_manifest(&store, git_mid));
        assert_eq!(mid.to_git(&store), Some(git_mid));

        // resolve_hg works on full and abbreviated nodes.
        let abbrev = crate::oid::Abbrev::from_str(&mid.to_string()[..12]).unwrap();
        assert_eq!(
            resolve_hg(&store, abbrev),
            Some(GitObjectId::from(CommitId::from(git_mid)))
        );
    }

    #[test]
    fn test_corrupt_manifest_trailer() {
        let store = Store::open(Odb::new());
        let fid = hg_file(b"something\n");
        store_file(&store, fid, b"something\n");
        let raw = manifest_line("a", fid, "");
        let (mid, git_mid) = store_test_manifest(&store, [HgManifestId::NULL; 2], raw.as_bytes());

        // Write a manifest commit whose trailer node is off by one bit.
        let mut wrong = mid.to_string().into_bytes();
        wrong[0] = if wrong[0] == b'0' { b'1' } else { b'0' };
        let tree_id = git_mid.get_tree_id(store.odb());
        let mut commit = Vec::new();
        writeln!(commit, "tree {}", TreeId::from(tree_id)).unwrap();
        commit.extend_from_slice(b"author  <cinnabar@git> 0 +0000\n");
        commit.extend_from_slice(b"committer  <cinnabar@git> 0 +0000\n\n");
        commit.extend_from_slice(&wrong);
        let bad_mid = GitManifestId::from_unchecked(store.odb().write_commit(&commit));

        assert!(!check_manifest(&store, bad_mid));
        // The generated bytes are still well-formed.
        *store.generated_manifest_.borrow_mut() = None;
        assert_eq!(&*store.generate_manifest(tree_id), raw.as_bytes());
    }

    #[test]
    fn test_rename_to_subdir() {
        let store = Store::open(Odb::new());
        let fid = hg_file(b"moved\n");
        store_file(&store, fid, b"moved\n");
        let raw1 = manifest_line("a", fid, "");
        let (mid1, git_mid1) = store_test_manifest(&store, [HgManifestId::NULL; 2], raw1.as_bytes());

        let raw2 = manifest_line("b/a", fid, "");
        let (_, git_mid2) =
            store_test_manifest(&store, [mid1, HgManifestId::NULL], raw2.as_bytes());

        *store.generated_manifest_.borrow_mut() = None;
        let t1 = git_mid1.get_tree_id(store.odb());
        let t2 = git_mid2.get_tree_id(store.odb());
        assert_eq!(&*store.generate_manifest(t1), raw1.as_bytes());
        assert_eq!(&*store.generate_manifest(t2), raw2.as_bytes());
        assert!(check_manifest(&store, git_mid1));
        assert!(check_manifest(&store, git_mid2));
    }

    #[test]
    fn test_incremental_generation() {
        let store = Store::open(Odb::new());
        let mut fids = std::collections::HashMap::new();
        for content in [
            &b"a\n"[..],
            &b"b/c\n"[..],
            &b"b/d\n"[..],
            &b"b/d v2\n"[..],
            &b"c/x\n"[..],
            &b"e\n"[..],
        ] {
            let fid = hg_file(content);
            store_file(&store, fid, content);
            fids.insert(content, fid);
        }
        let raw1 = [
            manifest_line("a", fids[&b"a\n"[..]], ""),
            manifest_line("b/c", fids[&b"b/c\n"[..]], ""),
            manifest_line("b/d", fids[&b"b/d\n"[..]], ""),
            manifest_line("c/x", fids[&b"c/x\n"[..]], ""),
            manifest_line("e", fids[&b"e\n"[..]], ""),
        ]
        .concat();
        let (mid1, git_mid1) = store_test_manifest(&store, [HgManifestId::NULL; 2], raw1.as_bytes());

        let raw2 = [
            manifest_line("a", fids[&b"a\n"[..]], ""),
            manifest_line("b/c", fids[&b"b/c\n"[..]], ""),
            manifest_line("b/d", fids[&b"b/d v2\n"[..]], ""),
            manifest_line("c/x", fids[&b"c/x\n"[..]], ""),
            manifest_line("e", fids[&b"e\n"[..]], ""),
        ]
        .concat();
        let (mid2, git_mid2) =
            store_test_manifest(&store, [mid1, HgManifestId::NULL], raw2.as_bytes());

        let t1 = git_mid1.get_tree_id(store.odb());
        let t2 = git_mid2.get_tree_id(store.odb());
        let c1 = subtree_id(&store, t1, b"c");
        let b1 = subtree_id(&store, t1, b"b");
        let b2 = subtree_id(&store, t2, b"b");
        // The unchanged subtree is shared between both encoded trees.
        assert_eq!(c1, subtree_id(&store, t2, b"c"));
        assert_ne!(b1, b2);

        // Generate from scratch, then incrementally.
        *store.generated_manifest_.borrow_mut() = None;
        assert_eq!(&*store.generate_manifest(t1), raw1.as_bytes());
        assert_eq!(&*store.generate_manifest(t2), raw2.as_bytes());

        // The unchanged tree objects remain resident, the changed pair was
        // (re)read, and nothing else is retained.
        {
            let bufs = store.manifest_tree_bufs_.borrow();
            assert!(bufs.contains_key(&c1));
            assert!(bufs.contains_key(&b1));
            assert!(bufs.contains_key(&b2));
        }

        // Incremental equivalence: pre-warming with an arbitrary prior tree
        // gives the same bytes as generating from scratch.
        assert_eq!(&*store.generate_manifest(t1), raw1.as_bytes());

        // Dropping the c/ subtree releases its buffer on the next
        // generation.
        let raw3 = [
            manifest_line("a", fids[&b"a\n"[..]], ""),
            manifest_line("b/c", fids[&b"b/c\n"[..]], ""),
            manifest_line("b/d", fids[&b"b/d v2\n"[..]], ""),
            manifest_line("e", fids[&b"e\n"[..]], ""),
        ]
        .concat();
        let (_, git_mid3) =
            store_test_manifest(&store, [mid2, HgManifestId::NULL], raw3.as_bytes());
        let t3 = git_mid3.get_tree_id(store.odb());
        // Regenerate t2 so the incremental walk for t3 starts from it.
        assert_eq!(&*store.generate_manifest(t2), raw2.as_bytes());
        assert_eq!(&*store.generate_manifest(t3), raw3.as_bytes());
        {
            let bufs = store.manifest_tree_bufs_.borrow();
            assert!(!bufs.contains_key(&c1));
            assert!(bufs.contains_key(&b2));
        }

        for git_mid in [git_mid1, git_mid2, git_mid3] {
            assert!(check_manifest(&store, git_mid));
        }
    }

    #[test]
    fn test_create_git_tree() {
        let store = Store::open(Odb::new());
        let fid_a = hg_file(b"a content\n");
        let fid_c = hg_file(b"#!/bin/sh\n");
        let fid_d = hg_file(b"a");
        store_file(&store, fid_a, b"a content\n");
        store_file(&store, fid_c, b"#!/bin/sh\n");
        store_file(&store, fid_d, b"a");
        let raw = [
            manifest_line("a", fid_a, ""),
            manifest_line("b/c", fid_c, "x"),
            manifest_line("d", fid_d, "l"),
            manifest_line("e", RawHgFile::EMPTY_OID, ""),
        ]
        .concat();
        let (_, git_mid) = store_test_manifest(&store, [HgManifestId::NULL; 2], raw.as_bytes());
        let tree_id = git_mid.get_tree_id(store.odb());

        let git_tree = create_git_tree(&store, tree_id, None);
        let entries = RawTree::read(store.odb(), git_tree).unwrap().iter().collect_vec();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].path(), b"a".as_bstr());
        assert_eq!(u16::from(entries[0].inner().mode), 0o100644);
        assert_eq!(entries[1].path(), b"b".as_bstr());
        assert_eq!(u16::from(entries[1].inner().mode), 0o40000);
        assert_eq!(entries[2].path(), b"d".as_bstr());
        assert_eq!(u16::from(entries[2].inner().mode), 0o120000);
        assert_eq!(entries[3].path(), b"e".as_bstr());
        // The empty file node resolves to the empty blob sentinel without
        // consulting hg2git.
        assert_eq!(entries[3].inner().oid, GitOid::Blob(RawBlob::EMPTY_OID));

        let GitOid::Tree(subdir) = entries[1].inner().oid else {
            panic!("expected a tree");
        };
        let sub_entries = RawTree::read(store.odb(), subdir).unwrap().iter().collect_vec();
        assert_eq!(sub_entries.len(), 1);
        assert_eq!(sub_entries[0].path(), b"c".as_bstr());
        assert_eq!(u16::from(sub_entries[0].inner().mode), 0o100755);

        // The tree id does not depend on the reference hint.
        store.tree_cache_.borrow_mut().clear();
        assert_eq!(create_git_tree(&store, tree_id, Some(git_tree)), git_tree);
        // And the cache short-circuits repeated translation.
        assert_eq!(create_git_tree(&store, tree_id, None), git_tree);
    }

    #[test]
    fn test_double_slash_quirk() {
        let store = Store::open(Odb::new());
        let fid1 = hg_file(b"old\n");
        let fid2 = hg_file(b"new\n");
        store_file(&store, fid1, b"old\n");
        store_file(&store, fid2, b"new\n");
        // A pathological manifest with a double-slash path superseded by
        // the single-slash variant.
        let raw = [
            manifest_line("a//b", fid1, ""),
            manifest_line("a/b", fid2, ""),
        ]
        .concat();
        let (_, git_mid) = store_test_manifest(&store, [HgManifestId::NULL; 2], raw.as_bytes());
        let tree_id = git_mid.get_tree_id(store.odb());

        // The encoded subtree for a/ has an empty-name `_` directory next
        // to the plain `_b` entry.
        let sub = subtree_id(&store, tree_id, b"a");
        let names = GitManifestTree::read(store.odb(), sub)
            .unwrap()
            .into_iter()
            .map(|e| e.path().to_vec())
            .collect_vec();
        assert_eq!(names, vec![b"".to_vec(), b"b".to_vec()]);

        // The flat manifest round-trips, double slash included.
        *store.generated_manifest_.borrow_mut() = None;
        assert_eq!(&*store.generate_manifest(tree_id), raw.as_bytes());

        // The real git tree contains the file once, from the single-slash
        // entry.
        let git_tree = create_git_tree(&store, tree_id, None);
        let entries = RawTree::read(store.odb(), git_tree).unwrap().iter().collect_vec();
        assert_eq!(entries.len(), 1);
        let GitOid::Tree(subdir) = entries[0].inner().oid else {
            panic!("expected a tree");
        };
        let sub_entries = RawTree::read(store.odb(), subdir).unwrap().iter().collect_vec();
        assert_eq!(sub_entries.len(), 1);
        assert_eq!(sub_entries[0].path(), b"b".as_bstr());
        assert_eq!(
            sub_entries[0].inner().oid,
            GitOid::Blob(store.odb().write_blob(b"new\n"))
        );
    }

    #[test]
    fn test_store_file_metadata() {
        let store = Store::open(Odb::new());
        let raw = b"\x01\ncopy: foo\ncopyrev: 994c36ffd5f3bf79b81ba8f13fd0cdd1fdb6ca6b\n\x01\nreal content\n";
        let node = hg_file(raw);
        let blob = store_file(&store, node, raw);
        // Only the real content ends up in the file blob; the metadata
        // lives in its own blob referenced from files_meta.
        assert_eq!(
            RawBlob::read(store.odb(), blob).unwrap().as_bytes(),
            b"real content\n"
        );
        assert!(store.files_meta().get_note(node.into()).is_some());

        // Reconstruction puts the envelope back, so the node checks out.
        assert_eq!(&*RawHgFile::read_hg(&store, node).unwrap(), &raw[..]);
        assert!(check_file(&store, node, HgFileId::NULL, HgFileId::NULL));

        // A file without extra metadata has no files_meta note.
        let plain = hg_file(b"plain\n");
        store_file(&store, plain, b"plain\n");
        assert!(store.files_meta().get_note(plain.into()).is_none());
        assert!(check_file(&store, plain, HgFileId::NULL, HgFileId::NULL));

        // The empty file node reconstructs as empty without any mapping.
        assert!(store.hg2git().get_note(RawHgFile::EMPTY_OID.into()).is_none());
        assert!(check_file(
            &store,
            RawHgFile::EMPTY_OID,
            HgFileId::NULL,
            HgFileId::NULL
        ));
    }

    #[test]
    fn test_check_file_parent_quirks() {
        let store = Store::open(Odb::new());
        let p1 = hg_file(b"p1\n");
        let p2 = hg_file(b"p2\n");
        store_file(&store, p1, b"p1\n");
        store_file(&store, p2, b"p2\n");
        let content = b"merged\n";
        for parents in [
            [Some(p1), Some(p2)],
            [Some(p1), None],
            [Some(p2), None],
            [Some(p1), Some(p1)],
            [None, None],
        ] {
            let node = HgFileId::from_unchecked(hash_data(
                parents[0].map(Into::into),
                parents[1].map(Into::into),
                content,
            ));
            store_file(&store, node, content);
            assert!(check_file(&store, node, p1, p2));
        }
        let bogus = HgFileId::from_unchecked(hash_data(Some(p2.into()), Some(p2.into()), content));
        store_file(&store, bogus, content);
        assert!(!check_file(&store, bogus, p1, p2));
    }

    #[test]
    fn test_metadata_roundtrip_and_reload() {
        let mut store = Store::open(Odb::new());
        let fid = hg_file(b"tracked\n");
        store_file(&store, fid, b"tracked\n");
        let raw = manifest_line("a", fid, "");
        let (mid, git_mid) = store_test_manifest(&store, [HgManifestId::NULL; 2], raw.as_bytes());

        // A changeset companion commit, mapped through hg2git, with a
        // branch head.
        let git_tree = create_git_tree(&store, git_mid.get_tree_id(store.odb()), None);
        let mut commit = Vec::new();
        writeln!(commit, "tree {}", git_tree).unwrap();
        commit.extend_from_slice(b"author Foo Bar <foo@bar> 0 +0000\n");
        commit.extend_from_slice(b"committer Foo Bar <foo@bar> 0 +0000\n\n");
        commit.extend_from_slice(b"message");
        let cs_commit = store.odb().write_commit(&commit);
        let csid = HgChangesetId::from_unchecked(hash_data(None, None, b"changeset"));
        store.set(SetWhat::Changeset, csid.into(), cs_commit.into());
        let meta_blob = store.odb().write_blob(b"changeset metadata");
        store.set(SetWhat::ChangesetMeta, csid.into(), meta_blob.into());
        store
            .changeset_heads_mut()
            .add(csid, &[], b"default".as_bstr());

        // A replace record survives the roundtrip through the metadata
        // tree.
        let mut c = Vec::new();
        writeln!(c, "tree {}", RawTree::EMPTY_OID).unwrap();
        c.extend_from_slice(b"author  <cinnabar@git> 0 +0000\n");
        c.extend_from_slice(b"committer  <cinnabar@git> 0 +0000\n\nreplaced");
        let replaced = store.odb().write_commit(&c);
        store.odb().set_replace(replaced, cs_commit);

        let metadata_cid = do_store_metadata(&store);
        let mut transaction = RefTransaction::new(store.odb());
        transaction
            .update(METADATA_REF, metadata_cid, None, "store")
            .unwrap();
        transaction.commit().unwrap();

        store.reload();
        assert_eq!(store.metadata_cid, metadata_cid);
        assert!(has_metadata(&store));
        assert!(store
            .flags
            .contains(MetadataFlags::FILES_META | MetadataFlags::UNIFIED_MANIFESTS_V2));
        assert!(!store.changesets_cid.is_null());
        assert!(!store.manifests_cid.is_null());
        assert!(!store.hg2git_cid.is_null());
        assert!(!store.git2hg_cid.is_null());
        assert!(!store.files_meta_cid.is_null());

        // Mappings and heads come back from the stored notes trees.
        assert_eq!(mid.to_git(&store), Some(git_mid));
        assert_eq!(csid.to_git(&store), Some(GitChangesetId::from_unchecked(cs_commit)));
        assert_eq!(store.manifest_heads().heads().copied().collect_vec(), vec![git_mid]);
        assert_eq!(
            store
                .changeset_heads()
                .branch_heads()
                .map(|(cs, b)| (*cs, b.to_vec()))
                .collect_vec(),
            vec![(csid, b"default".to_vec())]
        );
        assert_eq!(store.odb().replace_map_len(), 1);
        assert_eq!(store.odb().lookup_replace(replaced), cs_commit);

        // Reload is idempotent.
        store.reload();
        assert_eq!(store.metadata_cid, metadata_cid);
        assert_eq!(mid.to_git(&store), Some(git_mid));
        assert_eq!(store.odb().replace_map_len(), 1);

        // Storing again without changes reuses the previous root.
        assert_eq!(do_store_metadata(&store), metadata_cid);
    }

    fn minimal_metadata_commit(odb: &Odb, tree: TreeId, body: &[u8]) -> CommitId {
        let mut c = Vec::new();
        writeln!(c, "tree {}", RawTree::EMPTY_OID).unwrap();
        c.extend_from_slice(b"author  <cinnabar@git> 0 +0000\n");
        c.extend_from_slice(b"committer  <cinnabar@git> 0 +0000\n\n");
        let parent = odb.write_commit(&c);
        let mut buf = Vec::new();
        writeln!(buf, "tree {}", tree).unwrap();
        for _ in 0..5 {
            writeln!(buf, "parent {}", parent).unwrap();
        }
        buf.extend_from_slice(b"author  <cinnabar@git> 0 +0000\n");
        buf.extend_from_slice(b"committer  <cinnabar@git> 0 +0000\n\n");
        buf.extend_from_slice(body);
        odb.write_commit(&buf)
    }

    #[test]
    #[should_panic(expected = "older than 0.5.0")]
    fn test_old_metadata_flag() {
        let odb = Odb::new();
        let empty_tree = odb.write_tree(&[], None);
        let cid = minimal_metadata_commit(&odb, empty_tree, b"unified-manifests");
        Store::new(odb, Some(cid));
    }

    #[test]
    #[should_panic(expected = "newer version")]
    fn test_new_metadata_flag() {
        let odb = Odb::new();
        let empty_tree = odb.write_tree(&[], None);
        let cid = minimal_metadata_commit(&odb, empty_tree, b"files-meta frobnicate");
        Store::new(odb, Some(cid));
    }

    #[test]
    #[should_panic(expected = "older than 0.5.0")]
    fn test_old_branches_refs() {
        let odb = Odb::new();
        let empty_tree = odb.write_tree(&[], None);
        let cid =
            minimal_metadata_commit(&odb, empty_tree, b"files-meta unified-manifests-v2");
        let mut transaction = RefTransaction::new(&odb);
        transaction
            .update("refs/cinnabar/branches/default/tip", cid, None, "legacy")
            .unwrap();
        transaction.commit().unwrap();
        Store::new(odb, Some(cid));
    }

    #[test]
    #[should_panic(expected = "Invalid metadata")]
    fn test_wrong_parent_count() {
        let odb = Odb::new();
        let mut buf = Vec::new();
        writeln!(buf, "tree {}", RawTree::EMPTY_OID).unwrap();
        buf.extend_from_slice(b"author  <cinnabar@git> 0 +0000\n");
        buf.extend_from_slice(b"committer  <cinnabar@git> 0 +0000\n\n");
        buf.extend_from_slice(b"files-meta unified-manifests-v2");
        let cid = odb.write_commit(&buf);
        Store::new(odb, Some(cid));
    }

    #[test]
    fn test_replace_map_skips() {
        let odb = Odb::new();
        let mut c = Vec::new();
        writeln!(c, "tree {}", RawTree::EMPTY_OID).unwrap();
        c.extend_from_slice(b"author  <cinnabar@git> 0 +0000\n");
        c.extend_from_slice(b"committer  <cinnabar@git> 0 +0000\n\n");
        let target = odb.write_commit(&c);
        // A self-referencing entry and a bad name, both skipped with a
        // warning.
        let mut tree = Vec::new();
        write!(tree, "{:o} {}\0", u16::from(FileMode::GITLINK), target).unwrap();
        tree.extend_from_slice(GitObjectId::from(target).as_raw_bytes());
        write!(tree, "{:o} not-a-sha1\0", u16::from(FileMode::GITLINK)).unwrap();
        tree.extend_from_slice(GitObjectId::from(target).as_raw_bytes());
        let tree = odb.write_tree(&tree, None);
        let cid = minimal_metadata_commit(&odb, tree, b"files-meta unified-manifests-v2");
        let store = Store::new(odb, Some(cid));
        assert_eq!(store.odb().replace_map_len(), 0);
    }

    #[test]
    fn test_heads_maintenance() {
        let store = Store::open(Odb::new());
        let fid = hg_file(b"f\n");
        store_file(&store, fid, b"f\n");
        let raw1 = manifest_line("f", fid, "");
        let (mid1, git_mid1) = store_test_manifest(&store, [HgManifestId::NULL; 2], raw1.as_bytes());
        assert_eq!(
            store.manifest_heads().heads().copied().collect_vec(),
            vec![git_mid1]
        );
        let raw2 = [raw1.clone(), manifest_line("g", fid, "")].concat();
        let (_, git_mid2) =
            store_test_manifest(&store, [mid1, HgManifestId::NULL], raw2.as_bytes());

        // Storing a child manifest retires its parent from the head set.
        assert_eq!(
            store.manifest_heads().heads().copied().collect_vec(),
            vec![git_mid2]
        );

        clear_manifest_heads(&store);
        assert!(store.manifest_heads().is_empty());

        let cs1 = HgChangesetId::from_unchecked(hash_data(None, None, b"cs1"));
        let cs2 = HgChangesetId::from_unchecked(hash_data(None, None, b"cs2"));
        let cs3 = HgChangesetId::from_unchecked(hash_data(None, None, b"cs3"));
        let mut heads = ChangesetHeads::new();
        heads.add(cs1, &[], b"default".as_bstr());
        heads.add(cs2, &[cs1], b"default".as_bstr());
        assert_eq!(heads.branch_heads().map(|(c, _)| *c).collect_vec(), vec![cs2]);
        heads.add(cs3, &[cs2], b"other".as_bstr());
        // cs2 stays a branch head for `default`, but is not a repository
        // head anymore.
        assert_eq!(
            heads.branch_heads().map(|(c, _)| *c).collect_vec(),
            vec![cs2, cs3]
        );
        assert_eq!(heads.heads().copied().collect_vec(), vec![cs3]);
    }

    #[test]
    fn test_set_removes_notes() {
        let store = Store::open(Odb::new());
        let fid = hg_file(b"transient\n");
        store_file(&store, fid, b"transient\n");
        assert!(fid.to_git(&store).is_some());
        store.set(SetWhat::File, fid.into(), GitObjectId::NULL);
        assert!(fid.to_git(&store).is_none());
    }
}
