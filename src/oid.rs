/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::borrow::Cow;
use std::str::{self, FromStr};

use sha1::{Digest, Sha1};

/// A 20-byte content hash.
///
/// Git object ids and Mercurial node ids live in disjoint namespaces. Both
/// are SHA-1 output, but they are never interchangeable; each namespace gets
/// its own type through [`oid_type!`].
pub trait ObjectId: Sized + Copy {
    const NULL: Self;
    /// Hex length of a full id.
    const HEX_LEN: usize = 40;

    fn as_raw_bytes(&self) -> &[u8];
    fn as_raw_bytes_mut(&mut self) -> &mut [u8];
    fn is_null(&self) -> bool {
        self.as_raw_bytes().iter().all(|&b| b == 0)
    }
    fn create() -> OidCreator<Self> {
        OidCreator(Sha1::new(), std::marker::PhantomData)
    }
    fn from_raw_bytes(b: &[u8]) -> Option<Self> {
        (b.len() == 20).then(|| {
            let mut result = Self::NULL;
            result.as_raw_bytes_mut().clone_from_slice(b);
            result
        })
    }
    fn abbrev(self, len: usize) -> Abbrev<Self> {
        assert!(len <= Self::HEX_LEN);
        Abbrev { oid: self, len }
    }
}

#[macro_export]
macro_rules! oid_impl {
    ($name:ident($base_type:path)) => {
        impl From<$name> for $base_type {
            fn from(o: $name) -> $base_type {
                let mut result = <$base_type as $crate::oid::ObjectId>::NULL;
                $crate::oid::ObjectId::as_raw_bytes_mut(&mut result)
                    .clone_from_slice($crate::oid::ObjectId::as_raw_bytes(&o));
                result
            }
        }

        impl PartialEq<$base_type> for $name {
            fn eq(&self, other: &$base_type) -> bool {
                $crate::oid::ObjectId::as_raw_bytes(self)
                    == $crate::oid::ObjectId::as_raw_bytes(other)
            }
        }

        impl PartialEq<$name> for $base_type {
            fn eq(&self, other: &$name) -> bool {
                $crate::oid::ObjectId::as_raw_bytes(self)
                    == $crate::oid::ObjectId::as_raw_bytes(other)
            }
        }
    };
}

#[macro_export]
macro_rules! oid_type {
    ($name:ident($base_type:ident)) => {
        $crate::oid_type!($name);

        impl $name {
            pub fn from_unchecked(o: $base_type) -> Self {
                <Self as $crate::oid::ObjectId>::from_raw_bytes(
                    $crate::oid::ObjectId::as_raw_bytes(&o),
                )
                .unwrap()
            }
        }

        $crate::oid_impl!($name($base_type));
    };
    ($name:ident) => {
        #[repr(C)]
        #[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $name([u8; 20]);

        impl $name {
            pub const fn from_raw_bytes_array(b: [u8; 20]) -> Self {
                Self(b)
            }
        }

        impl $crate::oid::ObjectId for $name {
            const NULL: Self = Self([0; 20]);

            fn as_raw_bytes(&self) -> &[u8] {
                &self.0
            }

            fn as_raw_bytes_mut(&mut self) -> &mut [u8] {
                &mut self.0
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                let mut hex = [0u8; 40];
                hex::encode_to_slice(
                    $crate::oid::ObjectId::as_raw_bytes(self),
                    &mut hex,
                )
                .unwrap();
                f.write_str(::std::str::from_utf8(&hex).unwrap())
            }
        }

        $crate::util::derive_debug_display!($name);
        $crate::util::derive_debug_display!($crate::oid::Abbrev<$name>);

        impl ::std::str::FromStr for $name {
            type Err = hex::FromHexError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut result = Self([0; 20]);
                hex::decode_to_slice(s, &mut result.0)?;
                Ok(result)
            }
        }
    };
}

pub struct OidCreator<O: ObjectId>(Sha1, std::marker::PhantomData<O>);

impl<O: ObjectId> OidCreator<O> {
    pub fn update<B: AsRef<[u8]>>(&mut self, data: B) {
        self.0.update(data);
    }

    pub fn finalize(self) -> O {
        let digest: [u8; 20] = self.0.finalize().into();
        O::from_raw_bytes(&digest).unwrap()
    }
}

/// An abbreviated object id: the first `len` hex digits of a full id.
#[derive(Clone, Copy)]
pub struct Abbrev<O: ObjectId> {
    oid: O,
    len: usize,
}

impl<O: ObjectId> Abbrev<O> {
    /// The backing id, zero-padded past the abbreviated length.
    pub fn as_padded_oid(&self) -> O {
        self.oid
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<O: ObjectId> PartialEq for Abbrev<O> {
    fn eq(&self, other: &Self) -> bool {
        let self_oid = self.oid.as_raw_bytes();
        let other_oid = other.oid.as_raw_bytes();
        self.len == other.len
            && self_oid[..self.len / 2] == other_oid[..self.len / 2]
            && (self.len % 2 == 0
                || self_oid[self.len / 2] & 0xf0 == other_oid[self.len / 2] & 0xf0)
    }
}

impl<O: ObjectId> std::fmt::Display for Abbrev<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut hex = [0u8; 40];
        let len = self.len.div_ceil(2);
        hex::encode_to_slice(&self.oid.as_raw_bytes()[..len], &mut hex[..len * 2]).unwrap();
        f.write_str(str::from_utf8(&hex[..self.len]).unwrap())
    }
}

impl<O: ObjectId> FromStr for Abbrev<O> {
    type Err = hex::FromHexError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > O::HEX_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut result = Abbrev {
            oid: O::NULL,
            len: s.len(),
        };
        let s = if s.len() % 2 == 0 {
            Cow::Borrowed(s)
        } else {
            Cow::Owned(s.to_string() + "0")
        };
        hex::decode_to_slice(
            s.as_bytes(),
            &mut result.oid.as_raw_bytes_mut()[..s.len() / 2],
        )?;
        Ok(result)
    }
}
