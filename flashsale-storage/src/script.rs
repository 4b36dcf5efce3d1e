//! Atomic admission script.
//!
//! The script is the only place that reads or mutates the fast-store stock
//! counter and per-voucher dedup set. The store runs it with no interleaving
//! from concurrent callers, which is what makes admission linearizable.

use async_trait::async_trait;
use flashsale_core::constants::{SECKILL_ORDER_KEY, SECKILL_STOCK_KEY};
use flashsale_core::{OrderId, StoreResult, UserId, VoucherId};

/// Lua source of the admission script, evaluated by `RedisStore`.
/// `MemoryStore` implements the same steps natively.
///
/// `KEYS = [stock_key, order_set_key, stream_key]`,
/// `ARGV = [voucher_id, user_id, order_id]`.
pub const SECKILL_SCRIPT: &str = r#"
local stockKey = KEYS[1]
local orderKey = KEYS[2]
local streamKey = KEYS[3]
local voucherId = ARGV[1]
local userId = ARGV[2]
local orderId = ARGV[3]

local stock = tonumber(redis.call('get', stockKey))
if (stock == nil or stock <= 0) then
    return 1
end
if (redis.call('sismember', orderKey, userId) == 1) then
    return 2
end
redis.call('incrby', stockKey, -1)
redis.call('sadd', orderKey, userId)
redis.call('xadd', streamKey, '*', 'userId', userId, 'voucherId', voucherId, 'id', orderId)
return 0
"#;

/// Script return code: admitted.
pub const CODE_ADMITTED: i64 = 0;
/// Script return code: stock missing or exhausted.
pub const CODE_SOLD_OUT: i64 = 1;
/// Script return code: user already admitted for this voucher.
pub const CODE_DUPLICATE: i64 = 2;

/// Keys touched by one admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionKeys {
    pub stock_key: String,
    pub order_set_key: String,
    pub stream_key: String,
}

impl AdmissionKeys {
    /// Standard key layout for a voucher.
    pub fn for_voucher(voucher_id: VoucherId, stream_key: &str) -> Self {
        Self {
            stock_key: format!("{}{}", SECKILL_STOCK_KEY, voucher_id),
            order_set_key: format!("{}{}", SECKILL_ORDER_KEY, voucher_id),
            stream_key: stream_key.to_string(),
        }
    }
}

/// Arguments of one admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionArgs {
    pub voucher_id: VoucherId,
    pub user_id: UserId,
    pub order_id: OrderId,
}

/// A store able to run the admission script atomically.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Run the admission script and return its raw code.
    ///
    /// Callers map the code through `Admission::from_script_code`; anything
    /// outside `{0, 1, 2}` is a protocol error.
    async fn eval_admission(&self, keys: &AdmissionKeys, args: &AdmissionArgs)
        -> StoreResult<i64>;
}
