use anyhow::Result;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use shared::{idempotency_key, rate_key, stock_key, IDEMPOTENCY_TTL_SECS, RATE_BUCKET_TTL_SECS};

/// Test-and-decrement executed server-side so concurrent contenders are
/// serialized at the store. Returns 1 when a unit was reserved, 0 when the
/// product is out of stock or was never initialized.
const RESERVE_LUA: &str = r#"
local stock = tonumber(redis.call('GET', KEYS[1]))
if stock and stock >= 1 then
    redis.call('DECRBY', KEYS[1], 1)
    return 1
end
return 0
"#;

/// Client for the counter store: live stock, admission tallies, idempotency
/// markers. All hot-path mutations happen inside the store itself; this type
/// holds nothing but a pooled connection.
#[derive(Clone)]
pub struct CounterStore {
    conn: ConnectionManager,
}

impl CounterStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Overwrite the live stock for a product. Idempotent; used by `/init`.
    pub async fn set_stock(&self, product_id: &str, quantity: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(stock_key(product_id), quantity).await?;
        Ok(())
    }

    /// Count this request against the given second's admission bucket.
    /// Returns `false` once the bucket exceeds `cap`. The first increment
    /// attaches the bucket expiry so abandoned buckets clean themselves up.
    pub async fn admit(&self, unix_second: i64, cap: u32) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = rate_key(unix_second);
        let count: i64 = conn.incr(&key, 1).await?;
        if count == 1 {
            let _: () = conn.expire(&key, RATE_BUCKET_TTL_SECS).await?;
        }
        Ok(count <= i64::from(cap))
    }

    pub async fn idempotency_seen(&self, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let seen: bool = conn.exists(idempotency_key(token)).await?;
        Ok(seen)
    }

    /// Atomically take one unit of stock. `Ok(false)` means sold out.
    pub async fn try_reserve(&self, product_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(RESERVE_LUA);
        let reserved: i64 = script
            .key(stock_key(product_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(reserved == 1)
    }

    pub async fn mark_idempotency(&self, token: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(idempotency_key(token), 1, IDEMPOTENCY_TTL_SECS)
            .await?;
        Ok(())
    }
}
