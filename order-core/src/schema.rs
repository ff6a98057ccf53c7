diesel::table! {
    orders (id) {
        id -> Uuid,
        customer_id -> Uuid,
        order_type -> Varchar,
        currency -> Varchar,
        total_amount -> Numeric,
        current_status -> Varchar,
        version -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    order_items (id) {
        id -> Uuid,
        order_id -> Uuid,
        product_id -> Uuid,
        sku -> Varchar,
        quantity -> Int4,
        unit_price -> Numeric,
        discount -> Numeric,
        total_price -> Numeric,
    }
}

diesel::table! {
    order_status_history (id) {
        id -> Uuid,
        order_id -> Uuid,
        old_status -> Nullable<Varchar>,
        new_status -> Varchar,
        changed_by -> Varchar,
        metadata -> Nullable<Jsonb>,
        changed_at -> Timestamptz,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_type -> Varchar,
        aggregate_id -> Varchar,
        event_type -> Varchar,
        payload -> Jsonb,
        processed -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    processed_events (event_id) {
        event_id -> Uuid,
        processed_at -> Timestamptz,
    }
}

diesel::joinable!(order_items -> orders (order_id));
diesel::joinable!(order_status_history -> orders (order_id));

diesel::allow_tables_to_appear_in_same_query!(
    orders,
    order_items,
    order_status_history,
    outbox_events,
    processed_events,
);
