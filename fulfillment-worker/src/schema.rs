diesel::table! {
    products (id) {
        id -> Text,
        stock -> Int4,
    }
}

diesel::table! {
    orders (id) {
        id -> Text,
        product_id -> Text,
        user_id -> Text,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(products, orders);
