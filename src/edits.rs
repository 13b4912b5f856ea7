//! Outbound paths for local catalog edits.
//!
//! Every path raises the entity's pending flag before dispatching, so a
//! request that never produces a response still leaves work for the next
//! reconciliation pass. The reconciler's resend step reuses the same paths.

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::catalog;
use crate::dispatch::{Dispatcher, RequestSpec};
use crate::error::{Result, SyncError};
use crate::models::{
    category_payload, product_payload, DeletedItem, EntityKind, Product, QuantityChange,
};
use crate::pending::{self, PendingOps};
use crate::quantity::QuantityGuard;

/// One line of a placed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderLine {
    pub product_id: i64,
    pub quantity: i64,
}

fn category_remote_id(conn: &Connection, category_id: i64) -> Result<String> {
    let category = catalog::require_category(conn, category_id)?;
    category.remote_id.ok_or(SyncError::MissingRemoteId {
        kind: "category",
        id: category_id,
    })
}

fn build_product_request(conn: &Connection, product: &Product) -> Result<RequestSpec> {
    let category_id = product.category_id.ok_or_else(|| {
        SyncError::Inconsistent(format!("product {} has no category", product.id))
    })?;
    let category = category_remote_id(conn, category_id)?;
    let mut extras = Vec::with_capacity(product.extra_category_ids.len());
    for extra in &product.extra_category_ids {
        match category_remote_id(conn, *extra) {
            Ok(id) => extras.push(id),
            Err(e) => warn!(product_id = product.id, extra, error = %e, "extra category skipped"),
        }
    }

    Ok(match &product.remote_id {
        None => RequestSpec::create(
            EntityKind::Product,
            product.id,
            product_payload(product, &category, &extras, false),
        ),
        Some(remote_id) => RequestSpec::update(
            EntityKind::Product,
            product.id,
            remote_id.clone(),
            product_payload(product, &category, &extras, true),
        ),
    })
}

/// Raise the product's create or update flag and build the request that
/// carries its current state. A product without a remote id is hidden until
/// its create succeeds.
fn prepare_product(conn: &Connection, product_id: i64) -> Result<RequestSpec> {
    let mut product = catalog::require_product(conn, product_id)?;
    let flag = if product.remote_id.is_none() {
        PendingOps::CREATE
    } else {
        PendingOps::UPDATE
    };
    pending::set(conn, EntityKind::Product, product_id, flag)?;

    let spec = build_product_request(conn, &product)?;
    if product.remote_id.is_none() && product.visible {
        product.visible = false;
        catalog::update_product(conn, &product)?;
    }
    Ok(spec)
}

/// Send a product's current state to the remote catalog.
///
/// A product without a remote id is created; otherwise it is updated.
pub fn send_product(dispatcher: &Dispatcher, product_id: i64) -> Result<bool> {
    let spec = {
        let conn = dispatcher.db().lock()?;
        prepare_product(&conn, product_id)?
    };
    Ok(dispatcher.dispatch(spec))
}

/// A product was saved by a local editor.
pub fn product_saved(dispatcher: &Dispatcher, product_id: i64) -> Result<bool> {
    {
        let conn = dispatcher.db().lock()?;
        catalog::touch_modified(&conn, EntityKind::Product, product_id, Utc::now())?;
    }
    send_product(dispatcher, product_id)
}

fn prepare_category(conn: &Connection, category_id: i64) -> Result<RequestSpec> {
    let category = catalog::require_category(conn, category_id)?;
    let flag = if category.remote_id.is_none() {
        PendingOps::CREATE
    } else {
        PendingOps::UPDATE
    };
    pending::set(conn, EntityKind::Category, category_id, flag)?;

    let parent = category
        .parent_id
        .map(|parent| category_remote_id(conn, parent))
        .transpose()?;
    Ok(match &category.remote_id {
        None => RequestSpec::create(
            EntityKind::Category,
            category_id,
            category_payload(&category, parent.as_deref(), false),
        ),
        Some(remote_id) => RequestSpec::update(
            EntityKind::Category,
            category_id,
            remote_id.clone(),
            category_payload(&category, parent.as_deref(), true),
        ),
    })
}

/// Flag and build the create or update for an entity's current local state.
pub(crate) fn prepare_write(conn: &Connection, kind: EntityKind, id: i64) -> Result<RequestSpec> {
    match kind {
        EntityKind::Product => prepare_product(conn, id),
        EntityKind::Category => prepare_category(conn, id),
    }
}

/// Send a category's current state to the remote catalog. The parent must
/// already exist remotely.
pub fn send_category(dispatcher: &Dispatcher, category_id: i64) -> Result<bool> {
    let spec = {
        let conn = dispatcher.db().lock()?;
        prepare_category(&conn, category_id)?
    };
    Ok(dispatcher.dispatch(spec))
}

/// A category was saved by a local editor.
pub fn category_saved(dispatcher: &Dispatcher, category_id: i64) -> Result<bool> {
    {
        let conn = dispatcher.db().lock()?;
        catalog::touch_modified(&conn, EntityKind::Category, category_id, Utc::now())?;
    }
    send_category(dispatcher, category_id)
}

/// Remove `units` from a product's stock and accumulate them in its unsent
/// delta. Sends immediately when nothing was pending before.
fn remove_stock(
    dispatcher: &Dispatcher,
    guard: &QuantityGuard<'_>,
    product_id: i64,
    units: i64,
) -> Result<bool> {
    let (remote_id, stock, previous, delta) = {
        let conn = dispatcher.db().lock()?;
        let product = catalog::require_product(&conn, product_id)?;
        let stock = product.stock_quantity - units;
        catalog::set_stock_quantity(&conn, product_id, stock)?;
        let Some(remote_id) = product.remote_id else {
            // The create request carries the stock figure.
            return Ok(false);
        };
        let previous = product.quantity_delta;
        let delta = previous + units;
        catalog::set_quantity_delta(&conn, product_id, delta)?;
        (remote_id, stock, previous, delta)
    };

    if previous != 0 || delta == 0 {
        debug!(product_id, delta, "quantity change accumulated");
        return Ok(false);
    }
    let Some(ticket) = guard.hold(product_id) else {
        debug!(product_id, delta, "quantity request outstanding, accumulating");
        return Ok(false);
    };
    let change = QuantityChange::from_stock(delta, stock);
    Ok(dispatcher.dispatch(RequestSpec::quantity(product_id, remote_id, change, ticket)))
}

/// An order was placed: decrement local stock and propagate the change.
pub async fn order_placed(dispatcher: &Dispatcher, lines: &[OrderLine]) -> Result<()> {
    let lock = dispatcher.quantity_lock().clone();
    let guard = lock.acquire().await;
    for line in lines {
        if line.quantity == 0 {
            continue;
        }
        if let Err(e) = remove_stock(dispatcher, &guard, line.product_id, line.quantity) {
            warn!(product_id = line.product_id, error = %e, "order line not propagated");
        }
    }
    Ok(())
}

/// Stock was set by hand to `new_quantity`.
pub async fn stock_edited(dispatcher: &Dispatcher, product_id: i64, new_quantity: i64) -> Result<bool> {
    let lock = dispatcher.quantity_lock().clone();
    let guard = lock.acquire().await;
    let current = {
        let conn = dispatcher.db().lock()?;
        catalog::require_product(&conn, product_id)?.stock_quantity
    };
    let removed = current - new_quantity;
    if removed == 0 {
        return Ok(false);
    }
    remove_stock(dispatcher, &guard, product_id, removed)
}

/// Resend a product's unsent quantity delta, computed against the current
/// local stock. Does nothing while a request is outstanding.
pub async fn resend_quantity(dispatcher: &Dispatcher, product_id: i64) -> Result<bool> {
    let lock = dispatcher.quantity_lock().clone();
    let guard = lock.acquire().await;
    if guard.is_outstanding(product_id) {
        return Ok(false);
    }
    let product = {
        let conn = dispatcher.db().lock()?;
        let product = catalog::require_product(&conn, product_id)?;
        if product.quantity_delta == 0 {
            pending::clear(&conn, EntityKind::Product, product_id, PendingOps::QUANTITY)?;
            return Ok(false);
        }
        product
    };
    let Some(remote_id) = product.remote_id else {
        return Ok(false);
    };
    let Some(ticket) = guard.hold(product_id) else {
        return Ok(false);
    };
    let change = QuantityChange::from_stock(product.quantity_delta, product.stock_quantity);
    info!(product_id, delta = product.quantity_delta, "resending quantity change");
    Ok(dispatcher.dispatch(RequestSpec::quantity(product_id, remote_id, change, ticket)))
}

/// A product was deleted locally.
pub fn product_deleted(dispatcher: &Dispatcher, product_id: i64) -> Result<bool> {
    let remote_id = {
        let conn = dispatcher.db().lock()?;
        let product = catalog::require_product(&conn, product_id)?;
        catalog::delete_product(&conn, product_id)?;
        product.remote_id
    };
    Ok(match remote_id {
        Some(remote_id) => {
            dispatcher.dispatch(RequestSpec::delete(EntityKind::Product, remote_id))
        }
        None => false,
    })
}

/// A category was deleted locally. Its products and children are detached.
pub fn category_deleted(dispatcher: &Dispatcher, category_id: i64) -> Result<bool> {
    let remote_id = {
        let conn = dispatcher.db().lock()?;
        let category = catalog::require_category(&conn, category_id)?;
        catalog::delete_category(&conn, category_id)?;
        category.remote_id
    };
    Ok(match remote_id {
        Some(remote_id) => {
            dispatcher.dispatch(RequestSpec::delete(EntityKind::Category, remote_id))
        }
        None => false,
    })
}

/// Resend a delete that failed earlier.
pub fn resend_delete(dispatcher: &Dispatcher, item: &DeletedItem) -> bool {
    dispatcher.dispatch(RequestSpec::delete(item.kind, item.remote_id.clone()))
}
