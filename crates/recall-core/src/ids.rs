use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! numeric_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> u64 {
                self.0
            }

            /// The id that follows this one.
            pub const fn next(self) -> Self {
                Self(self.0 + 1)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s
                    .strip_prefix(concat!($prefix, "_"))
                    .unwrap_or(s);
                raw.parse().map(Self)
            }
        }
    };
}

numeric_id!(SessionId, "sess");
numeric_id!(SequenceId, "msg");

impl SequenceId {
    /// Sequence id carried by messages that are synthesized for a request
    /// and never stored in a session.
    pub const UNASSIGNED: SequenceId = SequenceId(0);
}

/// Identity of one in-flight turn: the session plus the sequence id of the
/// assistant reply being streamed.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TurnKey {
    pub session_id: SessionId,
    pub sequence_id: SequenceId,
}

impl TurnKey {
    pub const fn new(session_id: SessionId, sequence_id: SequenceId) -> Self {
        Self {
            session_id,
            sequence_id,
        }
    }
}

impl fmt::Display for TurnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.sequence_id)
    }
}
