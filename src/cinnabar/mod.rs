/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Typed object ids for the metadata store.
//!
//! Each id type pins down both the namespace (git) and what the object is
//! used for, so that e.g. the commit backing a changeset and the commit
//! backing a manifest cannot be mixed up.

use crate::git::{BlobId, CommitId};
use crate::git_oid_type;

mod manifest;
pub use manifest::*;

git_oid_type!(GitChangesetId(CommitId));
git_oid_type!(GitChangesetMetadataId(BlobId));
git_oid_type!(GitFileId(BlobId));
git_oid_type!(GitFileMetadataId(BlobId));
