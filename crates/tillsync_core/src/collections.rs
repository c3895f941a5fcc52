//! The product's fixed collection set.

use crate::migration::MigrationStrategy;
use crate::schema::{CollectionSchema, FieldType};
use serde_json::{json, Value};

/// Users known to this device.
pub const USERS: &str = "users";
/// Product catalogue.
pub const PRODUCTS: &str = "products";
/// Customers.
pub const CUSTOMERS: &str = "customers";
/// Completed sales.
pub const SALES: &str = "sales";
/// The local session record. Never replicated.
pub const SESSIONS: &str = "sessions";
/// Replication checkpoints. Never replicated.
pub const REPLICATION_CHECKPOINTS: &str = "replication_checkpoints";

/// Returns every collection the application opens.
pub fn app_collections() -> Vec<CollectionSchema> {
    vec![
        users(),
        products(),
        customers(),
        sales(),
        sessions(),
        replication_checkpoints(),
    ]
}

/// Names of the replicated collections.
pub fn synced_collection_names() -> Vec<String> {
    app_collections()
        .into_iter()
        .filter(|c| c.synced)
        .map(|c| c.name)
        .collect()
}

fn users() -> CollectionSchema {
    CollectionSchema::new(USERS, 0)
        .field("name", FieldType::String)
        .field("role", FieldType::String)
        .field("email", FieldType::String)
        .field("businessId", FieldType::String)
        .required(["name"])
        .index("role")
        .additional_properties(true)
        .synced()
}

// v1 added `stock`; v2 replaced integer cents with a decimal price.
fn products() -> CollectionSchema {
    let migrations = MigrationStrategy::new()
        .register(1, |mut doc| {
            doc.entry("stock").or_insert(json!(0));
            Ok(doc)
        })
        .register(2, |mut doc| {
            match doc.remove("priceCents") {
                Some(Value::Number(cents)) => {
                    let cents = cents
                        .as_f64()
                        .ok_or_else(|| "priceCents is not a number".to_string())?;
                    doc.insert("price".into(), json!(cents / 100.0));
                }
                Some(other) => return Err(format!("priceCents has unexpected value {other}")),
                None => {}
            }
            Ok(doc)
        });

    CollectionSchema::new(PRODUCTS, 2)
        .field("name", FieldType::String)
        .field("sku", FieldType::String)
        .field("price", FieldType::Number)
        .field("stock", FieldType::Integer)
        .field("category", FieldType::String)
        .required(["name"])
        .index("sku")
        .index("category")
        .additional_properties(true)
        .synced()
        .migrations(migrations)
}

fn customers() -> CollectionSchema {
    CollectionSchema::new(CUSTOMERS, 0)
        .field("name", FieldType::String)
        .field("phone", FieldType::String)
        .field("email", FieldType::String)
        .required(["name"])
        .index("phone")
        .additional_properties(true)
        .synced()
}

fn sales() -> CollectionSchema {
    CollectionSchema::new(SALES, 0)
        .field("customerId", FieldType::String)
        .field("items", FieldType::Array)
        .field("total", FieldType::Number)
        .field("status", FieldType::String)
        .required(["items", "total"])
        .index("customerId")
        .index("status")
        .additional_properties(true)
        .synced()
}

fn sessions() -> CollectionSchema {
    CollectionSchema::new(SESSIONS, 0)
        .field("uid", FieldType::String)
        .field("issuedAt", FieldType::String)
        .field("deviceId", FieldType::String)
        .field("mode", FieldType::String)
        .field("integrityHash", FieldType::String)
        .field("updatedAt", FieldType::String)
        .required(["uid"])
}

fn replication_checkpoints() -> CollectionSchema {
    CollectionSchema::new(REPLICATION_CHECKPOINTS, 0)
        .field("updatedAt", FieldType::String)
        .required(["updatedAt"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synced_set() {
        let names = synced_collection_names();
        assert_eq!(names, vec!["users", "products", "customers", "sales"]);
    }

    #[test]
    fn names_are_unique() {
        let mut names: Vec<_> = app_collections().into_iter().map(|c| c.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 6);
    }

    #[test]
    fn product_migration_converts_cents() {
        let schema = products();
        let doc = json!({"id": "p1", "name": "Tea", "priceCents": 199})
            .as_object()
            .cloned()
            .unwrap();
        let migrated = schema.migrations.migrate(PRODUCTS, doc, 0, 2).unwrap();
        assert_eq!(migrated["price"], json!(1.99));
        assert_eq!(migrated["stock"], json!(0));
        schema.validate(&migrated).unwrap();
    }
}
