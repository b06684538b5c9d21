//! Strongly typed identifiers used throughout the engine.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Wraps a raw numeric value.
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw numeric value.
            #[must_use]
            pub const fn value(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

define_id!(StreamId, "Identifier of an append-only logical stream.");
define_id!(
    ObjectId,
    "Identifier of a stream-set object assigned at the `prepare` stage of an upload."
);

/// Sentinel meaning "every open stream", accepted by
/// `uploadDeltaWAL`/`forceUpload`/`archiveCurrentBlockIfContains`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamScope {
    /// Only the named stream.
    One(StreamId),
    /// Every stream currently buffered in the active block.
    All,
}

impl From<StreamId> for StreamScope {
    fn from(id: StreamId) -> Self {
        Self::One(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_roundtrips_through_u64() {
        let id = StreamId::new(7);
        assert_eq!(id.value(), 7);
        assert_eq!(u64::from(id), 7);
        assert_eq!(StreamId::from(7u64), id);
    }

    #[test]
    fn stream_scope_from_id() {
        let scope: StreamScope = StreamId::new(3).into();
        assert_eq!(scope, StreamScope::One(StreamId::new(3)));
    }
}
