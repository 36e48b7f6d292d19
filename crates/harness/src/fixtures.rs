use serde_json::{Value, json};

use ordersync_core::{field_value::FieldType, schema::RelationSchema};

/// orders → order_lines → line_discounts, shaped like the upstream order API.
pub fn order_relations() -> Vec<RelationSchema> {
    vec![
        RelationSchema::new("orders")
            .key(&["order_id"])
            .field("order_id", FieldType::Text)
            .field("status", FieldType::Text)
            .field_from("total", "priceInfo.total", FieldType::Decimal { scale: 2 })
            .field_from("ordered_on", "submittedDate", FieldType::Date)
            .field_from("ship_city", "shippingAddress.city", FieldType::Text),
        RelationSchema::new("order_lines")
            .child_of("orders", "lines")
            .key(&["line_id"])
            .field("line_id", FieldType::Integer)
            .field("qty", FieldType::Integer)
            .field("gift", FieldType::Boolean)
            .track_cleared(),
        RelationSchema::new("line_discounts")
            .child_of("order_lines", "discounts")
            .key(&["code"])
            .field("code", FieldType::Text)
            .field("amount", FieldType::Decimal { scale: 2 }),
    ]
}

/// An order record with `(line_id, qty)` lines.
pub fn order(id: &str, status: &str, lines: &[(i64, i64)]) -> Value {
    json!({
        "order_id": id,
        "status": status,
        "lines": lines
            .iter()
            .map(|(line_id, qty)| json!({"line_id": line_id, "qty": qty}))
            .collect::<Vec<_>>(),
    })
}
