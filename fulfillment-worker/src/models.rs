use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::products)]
pub struct Product {
    pub id: String,
    pub stock: i32,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct Order {
    pub id: String,
    pub product_id: String,
    pub user_id: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Insert-only view of an order row. The id is the reservation id from the
/// log envelope; the primary key is what absorbs redelivered messages.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub id: String,
    pub product_id: String,
    pub user_id: String,
}
