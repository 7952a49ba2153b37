/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::hg::{HgFileId, HgObjectId};
use crate::oid::ObjectId;

/// Computes the Mercurial node hash for the given data and parents.
///
/// The hash covers both parents, ordered lexicographically, with missing
/// parents substituted by the null id, followed by the data itself.
pub fn hash_data(
    parent1: Option<HgObjectId>,
    parent2: Option<HgObjectId>,
    data: &[u8],
) -> HgObjectId {
    let parent1 = parent1.unwrap_or(HgObjectId::NULL);
    let parent2 = parent2.unwrap_or(HgObjectId::NULL);
    let mut hash = HgObjectId::create();
    let (first, second) = if parent1 < parent2 {
        (parent1, parent2)
    } else {
        (parent2, parent1)
    };
    hash.update(first.as_raw_bytes());
    hash.update(second.as_raw_bytes());
    hash.update(data);
    hash.finalize()
}

/// Finds which of the known combinations of the given parents produces the
/// given file node for the given file contents.
///
/// Mercurial has historically stored some file revisions with altered
/// parents: a null second parent, dropped first parent, or a copy of the
/// first parent in both slots. The candidate tuples are tried in the same
/// order the original implementation does.
pub fn find_file_parents(
    node: HgFileId,
    parent1: Option<HgFileId>,
    parent2: Option<HgFileId>,
    data: &[u8],
) -> Option<[HgFileId; 2]> {
    let p1 = parent1.unwrap_or(HgFileId::NULL);
    let p2 = parent2.unwrap_or(HgFileId::NULL);
    let candidates = [
        [p1, p2],
        [p1, HgFileId::NULL],
        [p2, HgFileId::NULL],
        [p1, p1],
        [HgFileId::NULL, HgFileId::NULL],
    ];
    candidates.into_iter().find(|[a, b]| {
        hash_data(Some((*a).into()), Some((*b).into()), data)
            == HgObjectId::from(node)
    })
}

#[test]
fn test_hash_data() {
    use std::str::FromStr;

    // The well-known node of an empty file with no parents.
    assert_eq!(
        hash_data(None, None, b""),
        HgObjectId::from_str("b80de5d138758541c5f05265ad144ab9fa86d1db").unwrap()
    );

    // Parents are hashed in lexicographic order regardless of their
    // argument order.
    let p1 = HgObjectId::from_str("994c36ffd5f3bf79b81ba8f13fd0cdd1fdb6ca6b").unwrap();
    let p2 = HgObjectId::from_str("1234567890123456789012345678901234567890").unwrap();
    assert_eq!(
        hash_data(Some(p1), Some(p2), b"data"),
        hash_data(Some(p2), Some(p1), b"data")
    );
    assert_ne!(hash_data(Some(p1), None, b"data"), hash_data(None, None, b"data"));
}

#[test]
fn test_find_file_parents() {
    let data = b"some file content\n";
    let p1 = HgFileId::from_unchecked(hash_data(None, None, b"parent1"));
    let p2 = HgFileId::from_unchecked(hash_data(None, None, b"parent2"));

    for parents in [
        [Some(p1), Some(p2)],
        [Some(p1), None],
        [Some(p2), None],
        [None, None],
    ] {
        let node = HgFileId::from_unchecked(hash_data(
            parents[0].map(Into::into),
            parents[1].map(Into::into),
            data,
        ));
        assert!(find_file_parents(node, Some(p1), Some(p2), data).is_some());
    }

    // The (p1, p1) quirk.
    let node = HgFileId::from_unchecked(hash_data(Some(p1.into()), Some(p1.into()), data));
    assert_eq!(
        find_file_parents(node, Some(p1), Some(p2), data),
        Some([p1, p1])
    );

    // A node that doesn't correspond to any candidate tuple.
    let node = HgFileId::from_unchecked(hash_data(Some(p2.into()), Some(p2.into()), data));
    assert_eq!(find_file_parents(node, Some(p1), Some(p2), data), None);
}
