//! Opaque entity identifiers
//!
//! Ids are allocated from one monotonically increasing sequence and never
//! reused, so a stale id reliably fails lookup instead of aliasing a new
//! entity.

use serde::Serialize;
use std::fmt;

macro_rules! entity_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn raw(&self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

entity_id!(NamespaceId, "ns");
entity_id!(InterfaceId, "if");
entity_id!(LinkId, "link");
entity_id!(BridgeId, "br");
