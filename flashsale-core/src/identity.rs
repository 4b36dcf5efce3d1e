//! Identity types for flash-sale entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Error when parsing an identifier from its string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdParseError {
    pub kind: &'static str,
    pub input: String,
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {:?}", self.kind, self.input)
    }
}

impl std::error::Error for IdParseError {}

macro_rules! define_numeric_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw numeric id.
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Get the raw numeric id.
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Zero is never assigned; it marks an absent id in wire data.
            pub const fn is_zero(self) -> bool {
                self.0 == 0
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse::<u64>().map(Self).map_err(|_| IdParseError {
                    kind: $kind,
                    input: s.to_string(),
                })
            }
        }
    };
}

define_numeric_id!(
    /// Identifier of a user placing orders. Resolved by the (external) session layer.
    UserId,
    "user id"
);

define_numeric_id!(
    /// Identifier of a limited-stock seckill voucher.
    VoucherId,
    "voucher id"
);

define_numeric_id!(
    /// Cluster-unique order identifier produced by the id generator.
    OrderId,
    "order id"
);
