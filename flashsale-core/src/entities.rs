//! Entity types: vouchers, orders, queue entries and admission outcomes.

use crate::{OrderId, Timestamp, UserId, ValidationError, VoucherId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// VOUCHER STOCK
// ============================================================================

/// A limited-stock voucher and its sale window.
///
/// Durable stock never goes below zero: it is only decremented through a
/// conditional `stock = stock - 1 WHERE stock > 0` update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeckillVoucher {
    pub voucher_id: VoucherId,
    pub stock: u32,
    pub begin_time: Timestamp,
    pub end_time: Timestamp,
}

impl SeckillVoucher {
    /// Check that `now` falls inside the sale window.
    pub fn check_sale_window(&self, now: Timestamp) -> Result<(), ValidationError> {
        if now < self.begin_time {
            return Err(ValidationError::SaleNotStarted {
                voucher_id: self.voucher_id,
            });
        }
        if now > self.end_time {
            return Err(ValidationError::SaleEnded {
                voucher_id: self.voucher_id,
            });
        }
        Ok(())
    }
}

// ============================================================================
// ORDERS
// ============================================================================

/// Queue field names. These are the wire shape of an admitted order.
pub const FIELD_ORDER_ID: &str = "id";
pub const FIELD_USER_ID: &str = "userId";
pub const FIELD_VOUCHER_ID: &str = "voucherId";

/// A persisted voucher order. At most one exists per (user, voucher).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherOrder {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub voucher_id: VoucherId,
    pub created_at: Timestamp,
}

impl VoucherOrder {
    /// Encode as queue entry fields: `{id, userId, voucherId}`.
    pub fn to_queue_fields(&self) -> QueueFields {
        let mut fields = QueueFields::new();
        fields.insert(FIELD_ORDER_ID.to_string(), self.order_id.to_string());
        fields.insert(FIELD_USER_ID.to_string(), self.user_id.to_string());
        fields.insert(FIELD_VOUCHER_ID.to_string(), self.voucher_id.to_string());
        fields
    }

    /// Decode an admitted order from queue entry fields.
    ///
    /// `created_at` is the decode time; the queue carries no timestamp.
    pub fn from_queue_entry(entry: &QueueEntry, now: Timestamp) -> Result<Self, ValidationError> {
        let order_id: OrderId = required_field(entry, FIELD_ORDER_ID)?;
        let user_id: UserId = required_field(entry, FIELD_USER_ID)?;
        let voucher_id: VoucherId = required_field(entry, FIELD_VOUCHER_ID)?;
        if order_id.is_zero() || user_id.is_zero() || voucher_id.is_zero() {
            return Err(ValidationError::MalformedEntry {
                entry_id: entry.id.to_string(),
                reason: "ids must be non-zero".to_string(),
            });
        }
        Ok(Self {
            order_id,
            user_id,
            voucher_id,
            created_at: now,
        })
    }
}

fn required_field<T: FromStr>(entry: &QueueEntry, name: &str) -> Result<T, ValidationError> {
    let raw = entry
        .fields
        .get(name)
        .ok_or_else(|| ValidationError::MalformedEntry {
            entry_id: entry.id.to_string(),
            reason: format!("missing field {}", name),
        })?;
    raw.parse().map_err(|_| ValidationError::MalformedEntry {
        entry_id: entry.id.to_string(),
        reason: format!("field {} is not numeric: {:?}", name, raw),
    })
}

// ============================================================================
// QUEUE ENTRIES
// ============================================================================

/// Field map carried by a queue entry.
pub type QueueFields = BTreeMap<String, String>;

/// Store-assigned, monotonic entry id in `<millis>-<seq>` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub millis: u64,
    pub seq: u64,
}

impl EntryId {
    /// The smallest id; reading "from 0" starts before it.
    pub const ZERO: EntryId = EntryId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Next id strictly after `self` given the current wall-clock millis.
    pub fn next_after(self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidValue {
            field: "entryId".to_string(),
            reason: format!("expected <millis>-<seq>, got {:?}", s),
        };
        let (millis, seq) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// An entry delivered from the durable order queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub stream_key: String,
    pub id: EntryId,
    pub fields: QueueFields,
    /// How many times the entry has been delivered, including this one.
    pub delivery_count: u32,
}

/// Where a consumer-group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOffset {
    /// Entries never delivered to this group (`>`). Blocks up to the timeout.
    NextUndelivered,
    /// This consumer's delivered-but-unacknowledged entries, from the start
    /// of its pending list (`0`). Never blocks.
    Pending,
}

// ============================================================================
// ADMISSION
// ============================================================================

/// Why an admission was refused. Expected outcome, not a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rejection {
    SoldOut,
    Duplicate,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::SoldOut => write!(f, "SOLD_OUT"),
            Rejection::Duplicate => write!(f, "DUPLICATE"),
        }
    }
}

/// Result of submitting an order request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Admission {
    /// Accepted, pending fulfillment.
    Admitted { order_id: OrderId },
    Rejected(Rejection),
}

impl Admission {
    /// Map the admission script's closed return-code set `{0, 1, 2}`.
    pub fn from_script_code(code: i64, order_id: OrderId) -> Option<Self> {
        match code {
            0 => Some(Admission::Admitted { order_id }),
            1 => Some(Admission::Rejected(Rejection::SoldOut)),
            2 => Some(Admission::Rejected(Rejection::Duplicate)),
            _ => None,
        }
    }

    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            Admission::Admitted { order_id } => Some(*order_id),
            Admission::Rejected(_) => None,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}
