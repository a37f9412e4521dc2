diesel::table! {
    archived_cart_items (id) {
        id -> Uuid,
        archived_cart_id -> Uuid,
        position -> Int4,
        product_id -> Uuid,
        quantity -> Int4,
        colour -> Varchar,
        unit_price -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    archived_carts (id) {
        id -> Uuid,
        original_cart_id -> Uuid,
        user_id -> Nullable<Uuid>,
        session_id -> Nullable<Varchar>,
        total_amount -> Int8,
        created_at -> Timestamptz,
        archived_at -> Timestamptz,
    }
}

diesel::table! {
    cart_items (id) {
        id -> Uuid,
        cart_id -> Uuid,
        position -> Int4,
        product_id -> Uuid,
        quantity -> Int4,
        colour -> Varchar,
        unit_price -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    carts (id) {
        id -> Uuid,
        user_id -> Nullable<Uuid>,
        session_id -> Nullable<Varchar>,
        total_amount -> Int8,
        status -> Varchar,
        payment_intent_id -> Nullable<Varchar>,
        is_archived -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    incidents (id) {
        id -> Uuid,
        cart_id -> Uuid,
        payment_reference -> Nullable<Varchar>,
        reason -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    order_items (id) {
        id -> Uuid,
        order_id -> Uuid,
        position -> Int4,
        product_id -> Uuid,
        quantity -> Int4,
        colour -> Varchar,
        price_in_pence -> Int8,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        cart_id -> Uuid,
        user_id -> Uuid,
        customer_name -> Nullable<Varchar>,
        ship_line1 -> Nullable<Varchar>,
        ship_city -> Nullable<Varchar>,
        ship_postal_code -> Nullable<Varchar>,
        ship_country -> Nullable<Varchar>,
        status -> Varchar,
        amount_paid -> Int8,
        payment_reference -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_id -> Uuid,
        event_type -> Varchar,
        event_data -> Jsonb,
        processed -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    products (id) {
        id -> Uuid,
        name -> Varchar,
        description -> Text,
        image_url -> Nullable<Varchar>,
        price_in_pence -> Int8,
        available_quantity -> Int4,
        is_available -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    users (id) {
        id -> Uuid,
        email -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(archived_cart_items -> archived_carts (archived_cart_id));
diesel::joinable!(cart_items -> carts (cart_id));
diesel::joinable!(order_items -> orders (order_id));
diesel::joinable!(orders -> users (user_id));

diesel::allow_tables_to_appear_in_same_query!(
    archived_cart_items,
    archived_carts,
    cart_items,
    carts,
    incidents,
    order_items,
    orders,
    outbox_events,
    products,
    users,
);
