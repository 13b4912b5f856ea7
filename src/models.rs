//! Catalog records, remote wire shapes and payload builders.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::pending::PendingOps;

// ---------------------------------------------------------------------------
// Entity kinds and remote resources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Product,
    Category,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Category => "category",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "product" => Some(EntityKind::Product),
            "category" => Some(EntityKind::Category),
            _ => None,
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Product => "products",
            EntityKind::Category => "categories",
        }
    }

    pub fn resource(self) -> Resource {
        match self {
            EntityKind::Product => Resource::InventoryItem,
            EntityKind::Category => Resource::Category,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote API controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    InventoryItem,
    Category,
}

impl Resource {
    pub fn path(self) -> &'static str {
        match self {
            Resource::InventoryItem => "inventoryitem",
            Resource::Category => "category",
        }
    }
}

// ---------------------------------------------------------------------------
// Local records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Product {
    pub id: i64,
    pub remote_id: Option<String>,
    pub description: String,
    pub barcodes: [String; 5],
    pub product_code: String,
    pub external_product_code: String,
    pub supplier_name: String,
    pub vat_percentage: f64,
    pub pickup_price: f64,
    pub price: f64,
    pub category_id: Option<i64>,
    pub category_name: String,
    pub extra_category_ids: Vec<i64>,
    pub visible: bool,
    pub sort_weight: i64,
    pub stock_quantity: i64,
    pub pending: PendingOps,
    pub quantity_delta: i64,
    pub modified_at: Option<DateTime<Utc>>,
}

impl Product {
    /// Work that must be flushed outward before remote data may overwrite
    /// this product.
    pub fn has_pending_work(&self) -> bool {
        !self.pending.is_empty() || self.quantity_delta != 0
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Category {
    pub id: i64,
    pub remote_id: Option<String>,
    pub name: String,
    pub parent_id: Option<i64>,
    pub account_number: String,
    pub only_allow_categories: bool,
    pub default_vat_percentage: f64,
    pub pending: PendingOps,
    pub modified_at: Option<DateTime<Utc>>,
}

impl Category {
    pub fn has_pending_work(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// A remote delete that failed and must be resent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeletedItem {
    pub kind: EntityKind,
    pub remote_id: String,
}

// ---------------------------------------------------------------------------
// Remote wire shapes
// ---------------------------------------------------------------------------

/// An inventory item as listed by the remote API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RemoteProduct {
    #[serde(deserialize_with = "lenient_id")]
    pub id: Option<String>,
    #[serde(deserialize_with = "lenient_id")]
    pub category_id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub category_name: String,
    #[serde(deserialize_with = "lenient_string")]
    pub description: String,
    #[serde(rename = "BarCode", deserialize_with = "lenient_string")]
    pub bar_code: String,
    #[serde(rename = "BarCode2", deserialize_with = "lenient_string")]
    pub bar_code2: String,
    #[serde(rename = "BarCode3", deserialize_with = "lenient_string")]
    pub bar_code3: String,
    #[serde(rename = "BarCode4", deserialize_with = "lenient_string")]
    pub bar_code4: String,
    #[serde(rename = "BarCode5", deserialize_with = "lenient_string")]
    pub bar_code5: String,
    #[serde(deserialize_with = "lenient_string")]
    pub product_code: String,
    #[serde(deserialize_with = "lenient_string")]
    pub external_product_code: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub price_including_vat: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    pub pickup_price_including_vat: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    pub vat_percentage: Option<f64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub quantity_in_stock_current: Option<i64>,
    #[serde(deserialize_with = "lenient_ids")]
    pub extra_category_ids: Vec<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub supplier_name: String,
    #[serde(deserialize_with = "lenient_i64")]
    pub sorting_weight: Option<i64>,
    pub created_date_time: Option<String>,
    pub last_modified_date_time: Option<String>,
    pub visible_on_sales_menu: Option<bool>,
}

impl RemoteProduct {
    pub fn barcodes(&self) -> [String; 5] {
        [
            self.bar_code.clone(),
            self.bar_code2.clone(),
            self.bar_code3.clone(),
            self.bar_code4.clone(),
            self.bar_code5.clone(),
        ]
    }

    /// The product code, falling back to the external code when empty.
    pub fn effective_product_code(&self) -> String {
        if self.product_code.trim().is_empty() && !self.external_product_code.trim().is_empty() {
            self.external_product_code.clone()
        } else {
            self.product_code.clone()
        }
    }
}

/// A category as listed by the remote API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RemoteCategory {
    #[serde(deserialize_with = "lenient_id")]
    pub id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(deserialize_with = "lenient_id")]
    pub parent_category_id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub account_number: String,
    pub only_allow_categories: Option<bool>,
    #[serde(deserialize_with = "lenient_f64")]
    pub default_vat_percentage: Option<f64>,
    pub last_modified_date_time: Option<String>,
}

pub(crate) fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty() && s != "0"),
        Value::Number(n) => Some(n.to_string()).filter(|s| s != "0"),
        _ => None,
    }
}

fn lenient_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(value_to_id(&value))
}

fn lenient_ids<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(match value {
        Value::Array(items) => items.iter().filter_map(value_to_id).collect(),
        other => value_to_id(&other).into_iter().collect(),
    })
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    })
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse::<f64>().ok(),
        _ => None,
    })
}

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.round() as i64),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Parse a remote `LastModifiedDateTime`. Values without an offset are read
/// as-is (wall clock); the clock correction is applied by the caller.
pub fn parse_remote_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Apply a remote change only when its timestamp is not older than the local
/// record's modification time shifted by the fixed clock correction.
///
/// A local record that was never modified always accepts remote data, and so
/// does a remote record that carries no usable timestamp.
pub fn remote_is_not_older(
    remote_modified: Option<&str>,
    local_modified: Option<DateTime<Utc>>,
    clock_offset_secs: i64,
) -> bool {
    let Some(local) = local_modified else {
        return true;
    };
    let Some(remote) = remote_modified.and_then(parse_remote_timestamp) else {
        return true;
    };
    remote >= local + ChronoDuration::seconds(clock_offset_secs)
}

/// Convert a remote wall-clock timestamp into the UTC instant stored locally.
pub fn remote_to_local_time(remote: Option<&str>, clock_offset_secs: i64) -> DateTime<Utc> {
    remote
        .and_then(parse_remote_timestamp)
        .map(|ts| ts - ChronoDuration::seconds(clock_offset_secs))
        .unwrap_or_else(Utc::now)
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_local_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().and_then(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|n| n.and_utc())
            })
    })
}

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

/// Build the `{"Item": {...}}` body for a product create/update.
///
/// `category_remote_id` is the remote id of the product's main category;
/// `extra_remote_ids` are the remote ids of any further categories.
pub fn product_payload(
    product: &Product,
    category_remote_id: &str,
    extra_remote_ids: &[String],
    updating: bool,
) -> Value {
    let mut item = serde_json::Map::new();
    let [b1, b2, b3, b4, b5] = &product.barcodes;
    item.insert("BarCode".into(), Value::from(b1.as_str()));
    item.insert("BarCode2".into(), Value::from(b2.as_str()));
    item.insert("BarCode3".into(), Value::from(b3.as_str()));
    item.insert("BarCode4".into(), Value::from(b4.as_str()));
    item.insert("BarCode5".into(), Value::from(b5.as_str()));
    item.insert("ProductCode".into(), Value::from(product.product_code.as_str()));
    item.insert("Description".into(), Value::from(product.description.as_str()));
    item.insert("PriceIncludingVat".into(), Value::from(product.price));
    item.insert(
        "ExternalProductCode".into(),
        Value::from(product.external_product_code.as_str()),
    );
    item.insert(
        "PickupPriceIncludingVat".into(),
        Value::from(product.pickup_price),
    );
    item.insert("VatPercentage".into(), Value::from(product.vat_percentage));
    item.insert("SupplierName".into(), Value::from(product.supplier_name.as_str()));
    item.insert("VisibleOnSalesMenu".into(), Value::from(product.visible));
    item.insert("CategoryId".into(), Value::from(category_remote_id));
    if !extra_remote_ids.is_empty() {
        item.insert("ExtraCategoryIds".into(), Value::from(extra_remote_ids.to_vec()));
    }
    if updating {
        if let Some(remote_id) = &product.remote_id {
            item.insert("Id".into(), Value::from(remote_id.as_str()));
        }
    } else {
        item.insert(
            "QuantityInStockCurrent".into(),
            Value::from(product.stock_quantity),
        );
    }
    serde_json::json!({ "Item": Value::Object(item) })
}

/// Build the `{"Item": {...}}` body for a category create/update.
pub fn category_payload(
    category: &Category,
    parent_remote_id: Option<&str>,
    updating: bool,
) -> Value {
    let mut item = serde_json::Map::new();
    item.insert("Name".into(), Value::from(category.name.as_str()));
    item.insert(
        "AccountNumber".into(),
        Value::from(category.account_number.as_str()),
    );
    item.insert(
        "OnlyAllowCategories".into(),
        Value::from(category.only_allow_categories),
    );
    item.insert(
        "DefaultVatPercentage".into(),
        Value::from(category.default_vat_percentage),
    );
    if updating {
        if let Some(remote_id) = &category.remote_id {
            item.insert("Id".into(), Value::from(remote_id.as_str()));
        }
    }
    if let Some(parent) = parent_remote_id {
        item.insert("ParentCategoryId".into(), Value::from(parent));
    }
    serde_json::json!({ "Item": Value::Object(item) })
}

/// Form body of a stock quantity adjustment.
///
/// `change` is the number of units removed from stock since the remote
/// figure was last confirmed; `new_quantity` is the local stock now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantityChange {
    pub change: i64,
    pub current_quantity: i64,
    pub new_quantity: i64,
}

impl QuantityChange {
    pub fn from_stock(change: i64, stock_now: i64) -> Self {
        Self {
            change,
            current_quantity: stock_now + change,
            new_quantity: stock_now,
        }
    }

    pub fn to_form(&self) -> String {
        format!(
            "quantityChange={}&currentQuantity={}&newQuantity={}",
            self.change, self.current_quantity, self.new_quantity
        )
    }
}
