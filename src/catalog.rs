//! Local catalog store: products, categories and deleted-item records.
//!
//! All functions take a borrowed connection; callers lock [`DbState`] once,
//! do their synchronous work and drop the guard before awaiting.
//!
//! [`DbState`]: crate::db::DbState

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Result, SyncError};
use crate::models::{
    format_timestamp, parse_local_timestamp, Category, DeletedItem, EntityKind, Product,
};
use crate::pending::PendingOps;

const PRODUCT_COLUMNS: &str = "id, remote_id, description, barcode, barcode2, barcode3, \
     barcode4, barcode5, product_code, external_product_code, supplier_name, vat_percentage, \
     pickup_price, price, category_id, category_name, extra_category_ids, visible, sort_weight, \
     stock_quantity, pending, quantity_delta, modified_at";

const CATEGORY_COLUMNS: &str = "id, remote_id, name, parent_id, account_number, \
     only_allow_categories, default_vat_percentage, pending, modified_at";

/// Columns reachable through [`get_attribute`] / [`set_attribute`].
const PRODUCT_ATTRIBUTES: &[&str] = &[
    "description",
    "barcode",
    "barcode2",
    "barcode3",
    "barcode4",
    "barcode5",
    "product_code",
    "external_product_code",
    "supplier_name",
    "vat_percentage",
    "pickup_price",
    "price",
    "category_id",
    "category_name",
    "visible",
    "sort_weight",
    "stock_quantity",
];

const CATEGORY_ATTRIBUTES: &[&str] = &[
    "name",
    "parent_id",
    "account_number",
    "only_allow_categories",
    "default_vat_percentage",
];

fn row_to_product(row: &Row<'_>) -> rusqlite::Result<Product> {
    let extra: String = row.get(16)?;
    Ok(Product {
        id: row.get(0)?,
        remote_id: row.get(1)?,
        description: row.get(2)?,
        barcodes: [
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
        ],
        product_code: row.get(8)?,
        external_product_code: row.get(9)?,
        supplier_name: row.get(10)?,
        vat_percentage: row.get(11)?,
        pickup_price: row.get(12)?,
        price: row.get(13)?,
        category_id: row.get(14)?,
        category_name: row.get(15)?,
        extra_category_ids: serde_json::from_str(&extra).unwrap_or_default(),
        visible: row.get::<_, i64>(17)? != 0,
        sort_weight: row.get(18)?,
        stock_quantity: row.get(19)?,
        pending: PendingOps::from_bits(row.get(20)?),
        quantity_delta: row.get(21)?,
        modified_at: parse_local_timestamp(row.get(22)?),
    })
}

fn row_to_category(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        remote_id: row.get(1)?,
        name: row.get(2)?,
        parent_id: row.get(3)?,
        account_number: row.get(4)?,
        only_allow_categories: row.get::<_, i64>(5)? != 0,
        default_vat_percentage: row.get(6)?,
        pending: PendingOps::from_bits(row.get(7)?),
        modified_at: parse_local_timestamp(row.get(8)?),
    })
}

fn ts(value: Option<DateTime<Utc>>) -> Option<String> {
    value.as_ref().map(format_timestamp)
}

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

pub fn get_product(conn: &Connection, id: i64) -> Result<Option<Product>> {
    let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], row_to_product).optional()?)
}

/// Like [`get_product`], but a missing product is an error.
pub fn require_product(conn: &Connection, id: i64) -> Result<Product> {
    get_product(conn, id)?.ok_or(SyncError::NotFound {
        kind: "product",
        id,
    })
}

pub fn get_product_by_remote_id(conn: &Connection, remote_id: &str) -> Result<Option<Product>> {
    let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE remote_id = ?1");
    Ok(conn
        .query_row(&sql, params![remote_id], row_to_product)
        .optional()?)
}

pub fn list_products(conn: &Connection) -> Result<Vec<Product>> {
    let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_product)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Products with no remote id, a pending flag or an unsent quantity delta.
pub fn list_products_with_backlog(conn: &Connection) -> Result<Vec<Product>> {
    let sql = format!(
        "SELECT {PRODUCT_COLUMNS} FROM products
         WHERE remote_id IS NULL OR pending != 0 OR quantity_delta != 0
         ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_product)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn insert_product(conn: &Connection, product: &Product) -> Result<i64> {
    let [b1, b2, b3, b4, b5] = &product.barcodes;
    conn.execute(
        "INSERT INTO products (remote_id, description, barcode, barcode2, barcode3, barcode4,
            barcode5, product_code, external_product_code, supplier_name, vat_percentage,
            pickup_price, price, category_id, category_name, extra_category_ids, visible,
            sort_weight, stock_quantity, pending, quantity_delta, modified_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
            ?18, ?19, ?20, ?21, ?22)",
        params![
            product.remote_id,
            product.description,
            b1,
            b2,
            b3,
            b4,
            b5,
            product.product_code,
            product.external_product_code,
            product.supplier_name,
            product.vat_percentage,
            product.pickup_price,
            product.price,
            product.category_id,
            product.category_name,
            serde_json::to_string(&product.extra_category_ids)?,
            product.visible as i64,
            product.sort_weight,
            product.stock_quantity,
            product.pending.bits(),
            product.quantity_delta,
            ts(product.modified_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Overwrite a product's attributes and stock.
///
/// Pending flags and the quantity delta are not touched; they are owned by
/// [`crate::pending`] and the quantity producers.
pub fn update_product(conn: &Connection, product: &Product) -> Result<()> {
    let [b1, b2, b3, b4, b5] = &product.barcodes;
    let changed = conn.execute(
        "UPDATE products SET remote_id = ?1, description = ?2, barcode = ?3, barcode2 = ?4,
            barcode3 = ?5, barcode4 = ?6, barcode5 = ?7, product_code = ?8,
            external_product_code = ?9, supplier_name = ?10, vat_percentage = ?11,
            pickup_price = ?12, price = ?13, category_id = ?14, category_name = ?15,
            extra_category_ids = ?16, visible = ?17, sort_weight = ?18, stock_quantity = ?19,
            modified_at = ?20
         WHERE id = ?21",
        params![
            product.remote_id,
            product.description,
            b1,
            b2,
            b3,
            b4,
            b5,
            product.product_code,
            product.external_product_code,
            product.supplier_name,
            product.vat_percentage,
            product.pickup_price,
            product.price,
            product.category_id,
            product.category_name,
            serde_json::to_string(&product.extra_category_ids)?,
            product.visible as i64,
            product.sort_weight,
            product.stock_quantity,
            ts(product.modified_at),
            product.id,
        ],
    )?;
    if changed == 0 {
        return Err(SyncError::NotFound {
            kind: "product",
            id: product.id,
        });
    }
    Ok(())
}

pub fn delete_product(conn: &Connection, id: i64) -> Result<bool> {
    Ok(conn.execute("DELETE FROM products WHERE id = ?1", params![id])? > 0)
}

pub fn set_quantity_delta(conn: &Connection, id: i64, delta: i64) -> Result<()> {
    conn.execute(
        "UPDATE products SET quantity_delta = ?1 WHERE id = ?2",
        params![delta, id],
    )?;
    Ok(())
}

pub fn set_stock_quantity(conn: &Connection, id: i64, stock: i64) -> Result<()> {
    conn.execute(
        "UPDATE products SET stock_quantity = ?1 WHERE id = ?2",
        params![stock, id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

pub fn get_category(conn: &Connection, id: i64) -> Result<Option<Category>> {
    let sql = format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], row_to_category).optional()?)
}

pub fn require_category(conn: &Connection, id: i64) -> Result<Category> {
    get_category(conn, id)?.ok_or(SyncError::NotFound {
        kind: "category",
        id,
    })
}

pub fn get_category_by_name(conn: &Connection, name: &str) -> Result<Option<Category>> {
    let sql = format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE name = ?1");
    Ok(conn
        .query_row(&sql, params![name], row_to_category)
        .optional()?)
}

pub fn get_category_by_remote_id(conn: &Connection, remote_id: &str) -> Result<Option<Category>> {
    let sql = format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE remote_id = ?1");
    Ok(conn
        .query_row(&sql, params![remote_id], row_to_category)
        .optional()?)
}

pub fn list_categories(conn: &Connection) -> Result<Vec<Category>> {
    let sql = format!("SELECT {CATEGORY_COLUMNS} FROM categories ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_category)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn list_categories_with_backlog(conn: &Connection) -> Result<Vec<Category>> {
    let sql = format!(
        "SELECT {CATEGORY_COLUMNS} FROM categories
         WHERE remote_id IS NULL OR pending != 0
         ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_category)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn insert_category(conn: &Connection, category: &Category) -> Result<i64> {
    conn.execute(
        "INSERT INTO categories (remote_id, name, parent_id, account_number,
            only_allow_categories, default_vat_percentage, pending, modified_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            category.remote_id,
            category.name,
            category.parent_id,
            category.account_number,
            category.only_allow_categories as i64,
            category.default_vat_percentage,
            category.pending.bits(),
            ts(category.modified_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Overwrite a category's attributes. Pending flags are not touched.
pub fn update_category(conn: &Connection, category: &Category) -> Result<()> {
    let changed = conn.execute(
        "UPDATE categories SET remote_id = ?1, name = ?2, parent_id = ?3, account_number = ?4,
            only_allow_categories = ?5, default_vat_percentage = ?6, modified_at = ?7
         WHERE id = ?8",
        params![
            category.remote_id,
            category.name,
            category.parent_id,
            category.account_number,
            category.only_allow_categories as i64,
            category.default_vat_percentage,
            ts(category.modified_at),
            category.id,
        ],
    )?;
    if changed == 0 {
        return Err(SyncError::NotFound {
            kind: "category",
            id: category.id,
        });
    }
    Ok(())
}

/// Delete a category. Products and child categories that referenced it are
/// detached by the foreign keys.
pub fn delete_category(conn: &Connection, id: i64) -> Result<bool> {
    Ok(conn.execute("DELETE FROM categories WHERE id = ?1", params![id])? > 0)
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

pub fn set_remote_id(conn: &Connection, kind: EntityKind, id: i64, remote_id: &str) -> Result<()> {
    let sql = format!("UPDATE {} SET remote_id = ?1 WHERE id = ?2", kind.table());
    conn.execute(&sql, params![remote_id, id])?;
    Ok(())
}

pub fn touch_modified(conn: &Connection, kind: EntityKind, id: i64, at: DateTime<Utc>) -> Result<()> {
    let sql = format!("UPDATE {} SET modified_at = ?1 WHERE id = ?2", kind.table());
    conn.execute(&sql, params![format_timestamp(&at), id])?;
    Ok(())
}

fn check_attribute(kind: EntityKind, attribute: &str) -> Result<()> {
    let allowed = match kind {
        EntityKind::Product => PRODUCT_ATTRIBUTES,
        EntityKind::Category => CATEGORY_ATTRIBUTES,
    };
    if allowed.contains(&attribute) {
        Ok(())
    } else {
        Err(SyncError::Inconsistent(format!(
            "unknown {kind} attribute '{attribute}'"
        )))
    }
}

/// Read one attribute of an entity by column name.
pub fn get_attribute(
    conn: &Connection,
    kind: EntityKind,
    id: i64,
    attribute: &str,
) -> Result<Option<SqlValue>> {
    check_attribute(kind, attribute)?;
    let sql = format!("SELECT {attribute} FROM {} WHERE id = ?1", kind.table());
    Ok(conn.query_row(&sql, params![id], |row| row.get(0)).optional()?)
}

/// Write one attribute of an entity by column name.
pub fn set_attribute(
    conn: &Connection,
    kind: EntityKind,
    id: i64,
    attribute: &str,
    value: SqlValue,
) -> Result<()> {
    check_attribute(kind, attribute)?;
    let sql = format!("UPDATE {} SET {attribute} = ?1 WHERE id = ?2", kind.table());
    let changed = conn.execute(&sql, params![value, id])?;
    if changed == 0 {
        return Err(SyncError::NotFound {
            kind: kind.as_str(),
            id,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Deleted items
// ---------------------------------------------------------------------------

/// Record a failed remote delete. Inserting an existing record is a no-op.
pub fn insert_deleted_item(conn: &Connection, item: &DeletedItem) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO deleted_items (entity_type, remote_id) VALUES (?1, ?2)",
        params![item.kind.as_str(), item.remote_id],
    )?;
    Ok(())
}

pub fn remove_deleted_item(conn: &Connection, item: &DeletedItem) -> Result<()> {
    conn.execute(
        "DELETE FROM deleted_items WHERE entity_type = ?1 AND remote_id = ?2",
        params![item.kind.as_str(), item.remote_id],
    )?;
    Ok(())
}

pub fn list_deleted_items(conn: &Connection) -> Result<Vec<DeletedItem>> {
    let mut stmt =
        conn.prepare("SELECT entity_type, remote_id FROM deleted_items ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut items = Vec::new();
    for row in rows {
        let (kind, remote_id) = row?;
        if let Some(kind) = EntityKind::parse(&kind) {
            items.push(DeletedItem { kind, remote_id });
        }
    }
    Ok(items)
}
