diesel::table! {
    stock_levels (sku) {
        sku -> Varchar,
        available -> Int4,
        reserved -> Int4,
        version -> Int4,
        updated_at -> Timestamptz,
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

diesel::allow_tables_to_appear_in_same_query!(stock_levels, outbox_events, processed_events,);
