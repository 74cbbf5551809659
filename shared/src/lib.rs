use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topic carrying reservation events from ingestion to fulfillment.
pub const ORDERS_TOPIC: &str = "orders";

/// Consumer group the fulfillment workers join.
pub const CONSUMER_GROUP: &str = "inventory-group";

/// How long an idempotency marker suppresses duplicate orders.
pub const IDEMPOTENCY_TTL_SECS: u64 = 60;

/// Expiry attached to a rate bucket on its first increment. Two bucket
/// widths, so a bucket never outlives the window it guards.
pub const RATE_BUCKET_TTL_SECS: i64 = 2;

pub const MAX_ID_LEN: usize = 64;
pub const MAX_TOKEN_LEN: usize = 128;

/// A successful atomic reservation, as handed off on the durable log.
///
/// The `order_id` is server-minted and becomes the primary key of the
/// persisted order row, which is what lets the worker absorb redeliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationEvent {
    pub order_id: Uuid,
    pub product_id: String,
    pub user_id: String,
    /// Milliseconds since epoch at reservation time.
    pub timestamp: i64,
}

impl ReservationEvent {
    pub fn new(product_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            order_id: Uuid::new_v4(),
            product_id: product_id.into(),
            user_id: user_id.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Counter-store key holding the live stock for a product.
pub fn stock_key(product_id: &str) -> String {
    format!("product:{product_id}:stock")
}

/// Counter-store key for the admission tally of one wall-clock second.
pub fn rate_key(unix_second: i64) -> String {
    format!("rate:{unix_second}")
}

/// Counter-store key marking an idempotency token as consumed.
pub fn idempotency_key(token: &str) -> String {
    format!("idempotency:{token}")
}

/// Product and purchaser ids: non-empty, bounded, URL- and key-safe.
pub fn valid_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_ID_LEN
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
}

/// Idempotency tokens are opaque but must be printable and bounded.
pub fn valid_token(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_TOKEN_LEN && s.bytes().all(|b| b.is_ascii_graphic())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_wire_field_names() {
        let event = ReservationEvent::new("iphone-15", "user-1");
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("orderId").is_some());
        assert_eq!(json["productId"], "iphone-15");
        assert_eq!(json["userId"], "user-1");
        assert!(json["timestamp"].is_i64());
    }

    #[test]
    fn envelope_parses_from_wire_json() {
        let raw = r#"{"orderId":"550e8400-e29b-41d4-a716-446655440000","productId":"p","userId":"u","timestamp":1722556800000}"#;
        let event: ReservationEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.product_id, "p");
        assert_eq!(event.timestamp, 1722556800000);
    }

    #[test]
    fn key_formats() {
        assert_eq!(stock_key("iphone-15"), "product:iphone-15:stock");
        assert_eq!(rate_key(1722556800), "rate:1722556800");
        assert_eq!(idempotency_key("tok"), "idempotency:tok");
    }

    #[test]
    fn id_bounds() {
        assert!(valid_id("iphone-15"));
        assert!(valid_id("a.b:c_d-e"));
        assert!(!valid_id(""));
        assert!(!valid_id(&"x".repeat(MAX_ID_LEN + 1)));
        assert!(!valid_id("has space"));
        assert!(!valid_id("emoji🔥"));
    }

    #[test]
    fn token_bounds() {
        assert!(valid_token("550e8400-e29b-41d4-a716-446655440000"));
        assert!(!valid_token(""));
        assert!(!valid_token(&"t".repeat(MAX_TOKEN_LEN + 1)));
        assert!(!valid_token("has space"));
    }
}
