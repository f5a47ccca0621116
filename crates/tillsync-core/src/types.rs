//! Core types for tillsync

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::error::{TillError, TillResult};

/// Current wall-clock time as unix milliseconds.
///
/// All `updated_at` / `created_at` fields in this crate use this scale;
/// 0 means "never updated" (the epoch sentinel for conflict resolution).
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The fixed set of collections held by the local store.
///
/// Mirrors the object stores of the point-of-sale schema: orders and
/// products are synchronized with the remote authority, print jobs are
/// device-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Orders,
    Products,
    PrintJobs,
}

impl Collection {
    /// All collections, in schema order.
    pub const ALL: [Collection; 3] = [
        Collection::Orders,
        Collection::Products,
        Collection::PrintJobs,
    ];

    /// Collections that participate in remote synchronization.
    pub const SYNCED: [Collection; 2] = [Collection::Orders, Collection::Products];

    /// Stable name, also used as the storage table name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Orders => "orders",
            Collection::Products => "products",
            Collection::PrintJobs => "print_jobs",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = TillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orders" => Ok(Collection::Orders),
            "products" => Ok(Collection::Products),
            "print_jobs" => Ok(Collection::PrintJobs),
            other => Err(TillError::UnknownCollection(other.to_string())),
        }
    }
}

/// A keyed document in the local store.
///
/// Every domain entity (order, product, print job) is stored as one of
/// these: a stable `id`, an `updated_at` timestamp that advances on every
/// mutation, and free-form payload fields. A record arriving without
/// `updated_at` is treated as never updated (timestamp 0), so any real
/// update wins against it during reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable unique identifier, assigned by the writer
    pub id: String,
    /// Unix milliseconds of the last mutation; 0 = never updated
    #[serde(default)]
    pub updated_at: i64,
    /// Free-form payload fields
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl Record {
    /// Create an empty record with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            updated_at: 0,
            fields: serde_json::Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Advance `updated_at` to now.
    pub fn touch(&mut self) {
        self.updated_at = now_millis();
    }

    /// Look up a payload field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Build a record from any serializable entity.
    ///
    /// The entity must serialize to a JSON object carrying an `id` string;
    /// a missing `updated_at` defaults to 0.
    pub fn from_serialize<T: Serialize>(entity: &T) -> TillResult<Self> {
        let value =
            serde_json::to_value(entity).map_err(|e| TillError::Serialization(e.to_string()))?;
        serde_json::from_value(value).map_err(|e| TillError::Serialization(e.to_string()))
    }

    /// The record as a plain JSON value (id and timestamp included).
    pub fn to_value(&self) -> TillResult<Value> {
        serde_json::to_value(self).map_err(|e| TillError::Serialization(e.to_string()))
    }

    /// Deserialize the record back into a typed entity.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> TillResult<T> {
        let value = self.to_value()?;
        serde_json::from_value(value).map_err(|e| TillError::Serialization(e.to_string()))
    }
}

/// An undelivered local mutation awaiting remote confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteEntry {
    /// Target collection
    pub collection: Collection,
    /// Snapshot of the record at queue time
    pub record: Record,
    /// Failed delivery attempts so far
    pub try_count: u32,
    /// Durable enqueue order (storage sequence number)
    #[serde(default)]
    pub seq: u64,
}

/// A catalog product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub updated_at: i64,
}

impl Product {
    pub fn new(id: impl Into<String>, name: impl Into<String>, price: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            price,
            category: None,
            updated_at: now_millis(),
        }
    }

    pub fn to_record(&self) -> TillResult<Record> {
        Record::from_serialize(self)
    }
}

/// Order lifecycle status: pending -> preparing -> ready -> completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Pending,
    Preparing,
    Ready,
    Completed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = TillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "preparing" => Ok(OrderStatus::Preparing),
            "ready" => Ok(OrderStatus::Ready),
            "completed" => Ok(OrderStatus::Completed),
            other => Err(TillError::UnknownStatus(other.to_string())),
        }
    }
}

/// A line item on an order.
///
/// Carries the fields the print templates consume: quantity, price,
/// optional category (bar slips filter on it), customization, and
/// special request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: String,
    pub name: String,
    pub price: f64,
    #[serde(default = "default_qty")]
    pub qty: u32,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub customization: Option<Value>,
    #[serde(default)]
    pub special_request: Option<String>,
}

fn default_qty() -> u32 {
    1
}

impl OrderItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>, price: f64, qty: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            price,
            qty,
            category: None,
            customization: None,
            special_request: None,
        }
    }
}

/// A customer order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub status: OrderStatus,
    #[serde(default)]
    pub updated_at: i64,
}

impl Order {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            items: Vec::new(),
            total: 0.0,
            status: OrderStatus::Pending,
            updated_at: 0,
        }
    }

    pub fn with_item(mut self, item: OrderItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn to_record(&self) -> TillResult<Record> {
        Record::from_serialize(self)
    }
}

/// Unique identifier for a print job
///
/// Uses ULID for time-ordered unique identifiers that sort lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new JobId with current timestamp
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Convert to string representation (used as the storage key)
    pub fn to_string_repr(&self) -> String {
        self.0.to_string()
    }

    /// Parse from string representation
    pub fn from_string(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job_{}", self.0)
    }
}

/// The fixed set of print destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Receipt,
    Kitchen,
    Bar,
}

impl Destination {
    pub const ALL: [Destination; 3] = [Destination::Receipt, Destination::Kitchen, Destination::Bar];

    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Receipt => "receipt",
            Destination::Kitchen => "kitchen",
            Destination::Bar => "bar",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Destination {
    type Err = TillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "receipt" => Ok(Destination::Receipt),
            "kitchen" => Ok(Destination::Kitchen),
            "bar" => Ok(Destination::Bar),
            other => Err(TillError::InvalidDestination(other.to_string())),
        }
    }
}

/// Print job lifecycle status.
///
/// `Done` is terminal. A job left in `Failed` after retry exhaustion stays
/// persisted for audit but is never retried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrintStatus {
    Queued,
    Failed,
    Done,
}

/// A request to render a payload through a destination template and
/// deliver it to that destination's sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: JobId,
    pub destination: Destination,
    /// Id of the order the payload was taken from (empty if none)
    pub order_id: String,
    pub payload: Value,
    pub status: PrintStatus,
    /// Higher value = served first
    pub priority: u8,
    /// Failed delivery attempts so far
    pub tries: u32,
    /// Unix milliseconds of job creation
    pub created_at: i64,
}

impl PrintJob {
    pub fn new(destination: Destination, payload: Value, priority: u8) -> Self {
        let order_id = payload
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self {
            id: JobId::new(),
            destination,
            order_id,
            payload,
            status: PrintStatus::Queued,
            priority,
            tries: 0,
            created_at: now_millis(),
        }
    }

    pub fn to_record(&self) -> TillResult<Record> {
        Record::from_serialize(self)
    }

    pub fn from_record(record: &Record) -> TillResult<Self> {
        record.deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collection_roundtrip() {
        for collection in Collection::ALL {
            let parsed: Collection = collection.as_str().parse().unwrap();
            assert_eq!(parsed, collection);
        }
    }

    #[test]
    fn test_collection_rejects_unknown() {
        let err = "invoices".parse::<Collection>().unwrap_err();
        assert!(matches!(err, TillError::UnknownCollection(_)));
    }

    #[test]
    fn test_destination_roundtrip() {
        for destination in Destination::ALL {
            let parsed: Destination = destination.as_str().parse().unwrap();
            assert_eq!(parsed, destination);
        }
    }

    #[test]
    fn test_destination_rejects_unknown() {
        let err = "fax".parse::<Destination>().unwrap_err();
        assert!(matches!(err, TillError::InvalidDestination(_)));
    }

    #[test]
    fn test_record_missing_updated_at_is_epoch() {
        let record: Record =
            serde_json::from_value(json!({ "id": "p1", "name": "Burger" })).unwrap();
        assert_eq!(record.updated_at, 0);
        assert_eq!(record.field("name"), Some(&json!("Burger")));
    }

    #[test]
    fn test_record_flatten_roundtrip() {
        let record = Record::new("o1")
            .with_field("total", json!(10.5))
            .with_field("note", json!("no onions"));
        let value = record.to_value().unwrap();
        assert_eq!(value["id"], json!("o1"));
        assert_eq!(value["total"], json!(10.5));

        let back: Record = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_record_from_order() {
        let mut order = Order::new("o1").with_item(OrderItem::new("p1", "Burger", 5.99, 2));
        order.total = 11.98;
        order.updated_at = 42;

        let record = order.to_record().unwrap();
        assert_eq!(record.id, "o1");
        assert_eq!(record.updated_at, 42);

        let back: Order = record.deserialize().unwrap();
        assert_eq!(back, order);
    }

    #[test]
    fn test_print_job_record_roundtrip() {
        let job = PrintJob::new(Destination::Kitchen, json!({ "id": "o7", "total": 3.0 }), 4);
        assert_eq!(job.order_id, "o7");
        assert_eq!(job.status, PrintStatus::Queued);

        let record = job.to_record().unwrap();
        assert_eq!(record.id, job.id.to_string_repr());

        let back = PrintJob::from_record(&record).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_print_job_without_order_id() {
        let job = PrintJob::new(Destination::Bar, json!({ "text": "test page" }), 1);
        assert_eq!(job.order_id, "");
    }

    #[test]
    fn test_job_id_display() {
        let id = JobId::new();
        assert!(format!("{}", id).starts_with("job_"));
    }

    #[test]
    fn test_job_id_string_roundtrip() {
        let id = JobId::new();
        let parsed = JobId::from_string(&id.to_string_repr()).unwrap();
        assert_eq!(parsed, id);
    }
}
