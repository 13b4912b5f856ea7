//! One full reconciliation pass between the local and remote catalogs.
//!
//! A pass:
//! 1. force-releases stale quantity tickets and flags those products,
//! 2. indexes local products and categories by remote id,
//! 3. fetches all remote categories and resolves them into the local tree,
//! 4. fetches all remote products and imports or overwrites each one that has
//!    no local work pending,
//! 5. deletes local entities no longer listed remotely (complete fetches only),
//! 6. resends every pending create, update, quantity change and delete.
//!
//! Per-entity failures are logged and counted; they never abort the pass.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use rusqlite::Connection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog;
use crate::config::SyncConfig;
use crate::dispatch::Dispatcher;
use crate::edits;
use crate::error::Result;
use crate::fetcher::{fetch_all, Fetched};
use crate::hierarchy::CategoryResolver;
use crate::models::{
    remote_is_not_older, remote_to_local_time, Category, EntityKind, Product, RemoteCategory,
    RemoteProduct, Resource,
};
use crate::pending::{self, PendingOps};

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub categories_created: usize,
    pub categories_updated: usize,
    pub categories_deleted: usize,
    pub products_created: usize,
    pub products_updated: usize,
    pub products_deleted: usize,
    pub skipped: usize,
    pub resent: usize,
    pub errors: usize,
    pub categories_complete: bool,
    pub products_complete: bool,
}

pub struct Reconciler {
    dispatcher: Dispatcher,
    config: SyncConfig,
}

impl Reconciler {
    pub fn new(dispatcher: Dispatcher, config: SyncConfig) -> Self {
        Self { dispatcher, config }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn run_pass(&self) -> Result<PassReport> {
        let pass_id = Uuid::new_v4();
        let started = Instant::now();
        let mut report = PassReport::default();
        info!(%pass_id, "reconciliation pass started");

        // Responses still in flight must land before the diff; otherwise a
        // product created a moment ago is seen as unknown remotely.
        if tokio::time::timeout(self.config.quantity_hold_timeout, self.dispatcher.wait_idle())
            .await
            .is_err()
        {
            warn!(%pass_id, "in-flight requests did not finish before the pass");
        }
        self.release_stale_quantity().await?;

        let (mut product_index, mut category_index) = {
            let conn = self.dispatcher.db().lock()?;
            build_indexes(&conn)?
        };

        let remote = self.dispatcher.remote().clone();
        let categories: Fetched<RemoteCategory> =
            fetch_all(remote.as_ref(), Resource::Category, self.config.category_page_size).await;
        report.categories_complete = categories.complete;

        let mut resolver = CategoryResolver::new(
            categories.items,
            self.config.remote_clock_offset_secs,
            self.dispatcher.events().clone(),
        );
        {
            let conn = self.dispatcher.db().lock()?;
            for remote_id in resolver.remote_ids() {
                if let Err(e) = resolver.resolve(&conn, Some(&remote_id)) {
                    warn!(%pass_id, remote_id = %remote_id, error = %e, "category not resolved");
                    report.errors += 1;
                }
            }
        }
        let claimed = resolver.claimed_local_ids();
        category_index.retain(|remote_id, &mut id| {
            !claimed.contains(&id) && resolver.remote_category(remote_id).is_none()
        });
        let stats = resolver.stats();
        report.categories_created = stats.created;
        report.categories_updated = stats.updated + stats.renamed + stats.reparented;

        let products: Fetched<RemoteProduct> =
            fetch_all(remote.as_ref(), Resource::InventoryItem, self.config.product_page_size)
                .await;
        report.products_complete = products.complete;
        {
            let conn = self.dispatcher.db().lock()?;
            for item in &products.items {
                let Some(remote_id) = item.id.as_deref() else {
                    continue;
                };
                product_index.remove(remote_id);
                if let Err(e) = self.merge_product(&conn, &mut resolver, item, &mut report) {
                    warn!(%pass_id, remote_id, error = %e, "product skipped");
                    report.errors += 1;
                    report.skipped += 1;
                }
            }

            if products.complete {
                for (remote_id, local_id) in &product_index {
                    if catalog::delete_product(&conn, *local_id)? {
                        debug!(local_id, remote_id = %remote_id, "product removed remotely");
                        self.dispatcher.events().remote_change(
                            EntityKind::Product,
                            *local_id,
                            remote_id,
                            "deleted",
                        );
                        report.products_deleted += 1;
                    }
                }
            }
            if categories.complete {
                for (remote_id, local_id) in &category_index {
                    if catalog::delete_category(&conn, *local_id)? {
                        debug!(local_id, remote_id = %remote_id, "category removed remotely");
                        self.dispatcher.events().remote_change(
                            EntityKind::Category,
                            *local_id,
                            remote_id,
                            "deleted",
                        );
                        report.categories_deleted += 1;
                    }
                }
            }
        }

        self.resend(&mut report).await?;

        info!(
            %pass_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            categories_created = report.categories_created,
            categories_updated = report.categories_updated,
            categories_deleted = report.categories_deleted,
            products_created = report.products_created,
            products_updated = report.products_updated,
            products_deleted = report.products_deleted,
            skipped = report.skipped,
            resent = report.resent,
            errors = report.errors,
            "reconciliation pass finished"
        );
        Ok(report)
    }

    async fn release_stale_quantity(&self) -> Result<()> {
        let lock = self.dispatcher.quantity_lock().clone();
        let guard = lock.acquire().await;
        let released = guard.release_stale(self.config.quantity_hold_timeout);
        if released.is_empty() {
            return Ok(());
        }
        let conn = self.dispatcher.db().lock()?;
        for product_id in released {
            match pending::set(&conn, EntityKind::Product, product_id, PendingOps::QUANTITY) {
                Ok(()) => {}
                Err(crate::error::SyncError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn merge_product(
        &self,
        conn: &Connection,
        resolver: &mut CategoryResolver,
        item: &RemoteProduct,
        report: &mut PassReport,
    ) -> Result<()> {
        let Some(remote_id) = item.id.as_deref() else {
            return Ok(());
        };

        let mut category_id = resolver.resolve(conn, item.category_id.as_deref())?;
        if category_id.is_none() {
            category_id = resolver.resolve_by_name(conn, &item.category_name)?;
        }
        let category = match category_id {
            Some(id) => catalog::get_category(conn, id)?,
            None => None,
        };
        let mut extra_category_ids = Vec::new();
        for extra in &item.extra_category_ids {
            match resolver.resolve(conn, Some(extra.as_str())) {
                Ok(Some(id)) => extra_category_ids.push(id),
                Ok(None) => {}
                Err(e) => warn!(remote_id, extra = %extra, error = %e, "extra category not resolved"),
            }
        }

        let offset = self.config.remote_clock_offset_secs;
        let incoming = Product {
            remote_id: Some(remote_id.to_string()),
            description: item.description.clone(),
            barcodes: item.barcodes(),
            product_code: item.effective_product_code(),
            external_product_code: item.external_product_code.clone(),
            supplier_name: item.supplier_name.clone(),
            vat_percentage: item
                .vat_percentage
                .or(category.as_ref().map(|c| c.default_vat_percentage))
                .unwrap_or(0.0),
            pickup_price: item.pickup_price_including_vat.unwrap_or(0.0),
            price: item.price_including_vat.unwrap_or(0.0),
            category_id,
            category_name: if item.category_name.is_empty() {
                category.as_ref().map(|c| c.name.clone()).unwrap_or_default()
            } else {
                item.category_name.clone()
            },
            extra_category_ids,
            visible: item.visible_on_sales_menu.unwrap_or(true),
            sort_weight: item.sorting_weight.unwrap_or(0),
            stock_quantity: item.quantity_in_stock_current.unwrap_or(0),
            modified_at: Some(remote_to_local_time(
                item.last_modified_date_time.as_deref(),
                offset,
            )),
            ..Default::default()
        };

        let Some(local) = catalog::get_product_by_remote_id(conn, remote_id)? else {
            let id = catalog::insert_product(conn, &incoming)?;
            self.dispatcher
                .events()
                .remote_change(EntityKind::Product, id, remote_id, "created");
            report.products_created += 1;
            return Ok(());
        };

        if local.has_pending_work() {
            debug!(
                local_id = local.id,
                pending = %local.pending,
                delta = local.quantity_delta,
                "product has local work pending, not overwritten"
            );
            report.skipped += 1;
            return Ok(());
        }

        if !differs(&local, &incoming)
            || !remote_is_not_older(item.last_modified_date_time.as_deref(), local.modified_at, offset)
        {
            return Ok(());
        }

        catalog::update_product(
            conn,
            &Product {
                id: local.id,
                ..incoming
            },
        )?;
        pending::clear(
            conn,
            EntityKind::Product,
            local.id,
            PendingOps::CREATE.union(PendingOps::UPDATE),
        )?;
        self.dispatcher
            .events()
            .remote_change(EntityKind::Product, local.id, remote_id, "updated");
        report.products_updated += 1;
        Ok(())
    }

    async fn resend(&self, report: &mut PassReport) -> Result<()> {
        let levels = {
            let conn = self.dispatcher.db().lock()?;
            backlog_by_depth(&conn)?
        };
        // Children and products reference the remote ids assigned by the
        // previous level's responses.
        for (depth, categories) in levels {
            let mut sent = 0;
            for category in categories {
                match edits::send_category(&self.dispatcher, category.id) {
                    Ok(true) => sent += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(category_id = category.id, error = %e, "category not resent");
                        report.errors += 1;
                    }
                }
            }
            report.resent += sent;
            if sent > 0
                && tokio::time::timeout(self.config.request_timeout, self.dispatcher.wait_idle())
                    .await
                    .is_err()
            {
                warn!(depth, sent, "category requests still in flight, dependants may fail");
            }
        }

        let (products, deleted) = {
            let conn = self.dispatcher.db().lock()?;
            (
                catalog::list_products_with_backlog(&conn)?,
                catalog::list_deleted_items(&conn)?,
            )
        };
        for product in products {
            if product.remote_id.is_none() || product.pending.create || product.pending.update {
                match edits::send_product(&self.dispatcher, product.id) {
                    Ok(true) => report.resent += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(product_id = product.id, error = %e, "product not resent");
                        report.errors += 1;
                    }
                }
            }
            if product.remote_id.is_some() && (product.quantity_delta != 0 || product.pending.quantity) {
                match edits::resend_quantity(&self.dispatcher, product.id).await {
                    Ok(true) => report.resent += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(product_id = product.id, error = %e, "quantity not resent");
                        report.errors += 1;
                    }
                }
            }
        }
        for item in &deleted {
            if edits::resend_delete(&self.dispatcher, item) {
                report.resent += 1;
            }
        }
        Ok(())
    }
}

/// Categories with outstanding work, grouped by depth in the local tree.
fn backlog_by_depth(conn: &Connection) -> Result<BTreeMap<usize, Vec<Category>>> {
    let parents: HashMap<i64, Option<i64>> = catalog::list_categories(conn)?
        .into_iter()
        .map(|c| (c.id, c.parent_id))
        .collect();
    let mut levels: BTreeMap<usize, Vec<Category>> = BTreeMap::new();
    for category in catalog::list_categories_with_backlog(conn)? {
        let mut depth = 0;
        let mut parent = category.parent_id;
        // Bounded so a parent cycle cannot spin.
        while let Some(id) = parent.filter(|_| depth < parents.len()) {
            depth += 1;
            parent = parents.get(&id).copied().flatten();
        }
        levels.entry(depth).or_default().push(category);
    }
    Ok(levels)
}

fn build_indexes(conn: &Connection) -> Result<(HashMap<String, i64>, HashMap<String, i64>)> {
    let products = catalog::list_products(conn)?
        .into_iter()
        .filter_map(|p| p.remote_id.map(|r| (r, p.id)))
        .collect();
    let categories = catalog::list_categories(conn)?
        .into_iter()
        .filter_map(|c| c.remote_id.map(|r| (r, c.id)))
        .collect();
    Ok((products, categories))
}

/// Whether applying `incoming` would change anything tracked on `local`.
fn differs(local: &Product, incoming: &Product) -> bool {
    local.description != incoming.description
        || (local.price - incoming.price).abs() > f64::EPSILON
        || local.stock_quantity != incoming.stock_quantity
        || local.visible != incoming.visible
        || local.barcodes != incoming.barcodes
        || local.product_code != incoming.product_code
        || local.external_product_code != incoming.external_product_code
        || local.supplier_name != incoming.supplier_name
        || (local.vat_percentage - incoming.vat_percentage).abs() > f64::EPSILON
        || (local.pickup_price - incoming.pickup_price).abs() > f64::EPSILON
        || local.category_id != incoming.category_id
        || local.category_name != incoming.category_name
        || local.extra_category_ids != incoming.extra_category_ids
        || local.sort_weight != incoming.sort_weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::events::EventLog;
    use crate::quantity::QuantityLock;
    use crate::test_support::{Call, FakeRemote};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Reconciler, Arc<FakeRemote>) {
        let config = SyncConfig {
            quantity_hold_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            product_page_size: 2,
            category_page_size: 2,
            ..Default::default()
        };
        let db = Arc::new(db::open_in_memory().unwrap());
        let remote = Arc::new(FakeRemote::new());
        let dispatcher = Dispatcher::new(
            db,
            remote.clone(),
            Arc::new(QuantityLock::new()),
            EventLog::default(),
            config.quantity_hold_timeout,
        );
        (Reconciler::new(dispatcher, config), remote)
    }

    fn conn(r: &Reconciler) -> std::sync::MutexGuard<'_, Connection> {
        r.dispatcher().db().lock().unwrap()
    }

    #[tokio::test]
    async fn test_imports_category_then_product() {
        let (reconciler, remote) = setup();
        remote.seed_category("1", "C1", None);
        remote.seed_product("100", "P1", Some("1"), 5);

        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.categories_created, 1);
        assert_eq!(report.products_created, 1);
        assert!(report.categories_complete && report.products_complete);

        let conn = conn(&reconciler);
        let c1 = catalog::get_category_by_remote_id(&conn, "1").unwrap().unwrap();
        let p1 = catalog::get_product_by_remote_id(&conn, "100").unwrap().unwrap();
        assert_eq!(p1.category_id, Some(c1.id));
        assert_eq!(p1.stock_quantity, 5);
        assert!(p1.visible);
        assert!(c1.pending.is_empty());
        assert!(p1.pending.is_empty());
        assert!(c1.id > 0 && p1.id > 0);
        drop(conn);
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pending_quantity_is_not_overwritten_and_is_resent() {
        let (reconciler, remote) = setup();
        remote.seed_category("1", "C1", None);
        remote.seed_product("200", "P2", Some("1"), 15);
        reconciler.run_pass().await.unwrap();

        // Local sold 5 units but the quantity request failed.
        let id = {
            let conn = conn(&reconciler);
            let p2 = catalog::get_product_by_remote_id(&conn, "200").unwrap().unwrap();
            catalog::set_stock_quantity(&conn, p2.id, 10).unwrap();
            catalog::set_quantity_delta(&conn, p2.id, 5).unwrap();
            pending::set(&conn, EntityKind::Product, p2.id, PendingOps::QUANTITY).unwrap();
            p2.id
        };

        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.products_updated, 0);
        assert!(report.skipped >= 1);
        reconciler.dispatcher().wait_idle().await;

        let calls = remote.quantity_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].change, 5);
        assert_eq!(calls[0].new_quantity, 10);

        let conn = conn(&reconciler);
        let p2 = catalog::require_product(&conn, id).unwrap();
        assert_eq!(p2.stock_quantity, 10);
        assert_eq!(p2.quantity_delta, 0);
        assert!(p2.pending.is_empty());
        drop(conn);
        assert_eq!(remote.stock("200"), Some(10));
    }

    #[tokio::test]
    async fn test_category_missing_remotely_is_deleted() {
        let (reconciler, remote) = setup();
        remote.seed_category("1", "C1", None);
        {
            let conn = conn(&reconciler);
            catalog::insert_category(
                &conn,
                &Category {
                    name: "C2".into(),
                    remote_id: Some("2".into()),
                    account_number: "4000".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        }

        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.categories_deleted, 1);
        let conn = conn(&reconciler);
        assert!(catalog::get_category_by_remote_id(&conn, "2").unwrap().is_none());
        assert!(catalog::get_category_by_name(&conn, "C2").unwrap().is_none());
        assert!(catalog::get_category_by_remote_id(&conn, "1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_incomplete_fetch_deletes_nothing() {
        let (reconciler, remote) = setup();
        remote.seed_category("1", "C1", None);
        for i in 0..4 {
            remote.seed_product(&format!("{}", 300 + i), &format!("P{i}"), Some("1"), 1);
        }
        reconciler.run_pass().await.unwrap();

        remote.remove(Resource::InventoryItem, "300");
        remote.fail_list_at_offset(Resource::InventoryItem, 2);
        let report = reconciler.run_pass().await.unwrap();
        assert!(!report.products_complete);
        assert_eq!(report.products_deleted, 0);
        let conn = conn(&reconciler);
        assert_eq!(catalog::list_products(&conn).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_removed_product_is_deleted_locally_without_remote_delete() {
        let (reconciler, remote) = setup();
        remote.seed_category("1", "C1", None);
        remote.seed_product("400", "Gone", Some("1"), 1);
        remote.seed_product("401", "Kept", Some("1"), 1);
        reconciler.run_pass().await.unwrap();

        remote.remove(Resource::InventoryItem, "400");
        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.products_deleted, 1);
        assert!(remote.calls().is_empty());
        let conn = conn(&reconciler);
        assert!(catalog::get_product_by_remote_id(&conn, "400").unwrap().is_none());
        assert!(catalog::get_product_by_remote_id(&conn, "401").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pending_update_blocks_overwrite() {
        let (reconciler, remote) = setup();
        remote.seed_category("1", "C1", None);
        remote.seed_product("500", "Remote name", Some("1"), 3);
        reconciler.run_pass().await.unwrap();

        let id = {
            let conn = conn(&reconciler);
            let mut p = catalog::get_product_by_remote_id(&conn, "500").unwrap().unwrap();
            p.description = "Local name".into();
            catalog::update_product(&conn, &p).unwrap();
            pending::set(&conn, EntityKind::Product, p.id, PendingOps::UPDATE).unwrap();
            p.id
        };
        // The update is rejected, so the flag survives the resend.
        remote.set_write_status(Some(500));
        let report = reconciler.run_pass().await.unwrap();
        reconciler.dispatcher().wait_idle().await;
        assert_eq!(report.products_updated, 0);

        let conn = conn(&reconciler);
        let p = catalog::require_product(&conn, id).unwrap();
        assert_eq!(p.description, "Local name");
        assert!(p.pending.update);
    }

    #[tokio::test]
    async fn test_newer_remote_change_overwrites_idle_product() {
        let (reconciler, remote) = setup();
        remote.seed_category("1", "C1", None);
        remote.seed_product("600", "Bun", Some("1"), 3);
        reconciler.run_pass().await.unwrap();

        remote.set_field(Resource::InventoryItem, "600", "PriceIncludingVat", json!(12.5));
        remote.set_field(
            Resource::InventoryItem,
            "600",
            "LastModifiedDateTime",
            json!("2031-01-01T00:00:00"),
        );
        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.products_updated, 1);
        let conn = conn(&reconciler);
        let p = catalog::get_product_by_remote_id(&conn, "600").unwrap().unwrap();
        assert_eq!(p.price, 12.5);
    }

    #[tokio::test]
    async fn test_older_remote_change_is_ignored() {
        let (reconciler, remote) = setup();
        remote.seed_category("1", "C1", None);
        remote.seed_product("700", "Bun", Some("1"), 3);
        reconciler.run_pass().await.unwrap();
        {
            let conn = conn(&reconciler);
            let p = catalog::get_product_by_remote_id(&conn, "700").unwrap().unwrap();
            catalog::touch_modified(&conn, EntityKind::Product, p.id, chrono::Utc::now()).unwrap();
        }
        remote.set_field(Resource::InventoryItem, "700", "Description", json!("Old"));
        remote.set_field(
            Resource::InventoryItem,
            "700",
            "LastModifiedDateTime",
            json!("2001-01-01T00:00:00"),
        );
        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.products_updated, 0);
        let conn = conn(&reconciler);
        let p = catalog::get_product_by_remote_id(&conn, "700").unwrap().unwrap();
        assert_eq!(p.description, "Bun");
    }

    #[tokio::test]
    async fn test_vat_and_product_code_fallbacks() {
        let (reconciler, remote) = setup();
        remote.seed_category("1", "C1", None);
        remote.seed_product("800", "Bun", Some("1"), 3);
        remote.set_field(Resource::InventoryItem, "800", "VatPercentage", json!(null));
        remote.set_field(Resource::InventoryItem, "800", "ExternalProductCode", json!("EXT9"));
        reconciler.run_pass().await.unwrap();
        let conn = conn(&reconciler);
        let p = catalog::get_product_by_remote_id(&conn, "800").unwrap().unwrap();
        assert_eq!(p.vat_percentage, 25.0);
        assert_eq!(p.product_code, "EXT9");
    }

    #[tokio::test]
    async fn test_unsynced_local_entities_are_created_once() {
        let (reconciler, remote) = setup();
        remote.seed_category("1", "C1", None);
        reconciler.run_pass().await.unwrap();
        let (category, product) = {
            let conn = conn(&reconciler);
            let category = catalog::insert_category(
                &conn,
                &Category {
                    name: "New category".into(),
                    pending: PendingOps::CREATE,
                    ..Default::default()
                },
            )
            .unwrap();
            let product = catalog::insert_product(
                &conn,
                &Product {
                    description: "New product".into(),
                    category_id: Some(category),
                    visible: true,
                    pending: PendingOps::CREATE,
                    stock_quantity: 4,
                    ..Default::default()
                },
            )
            .unwrap();
            (category, product)
        };

        reconciler.run_pass().await.unwrap();
        reconciler.dispatcher().wait_idle().await;
        reconciler.run_pass().await.unwrap();
        reconciler.dispatcher().wait_idle().await;

        assert_eq!(remote.create_count(Resource::Category), 1);
        assert_eq!(remote.create_count(Resource::InventoryItem), 1);
        let conn = conn(&reconciler);
        let c = catalog::require_category(&conn, category).unwrap();
        let p = catalog::require_product(&conn, product).unwrap();
        assert!(c.remote_id.is_some() && c.pending.is_empty());
        assert!(p.remote_id.is_some() && p.pending.is_empty());
        assert!(p.visible);
        assert_eq!(catalog::list_products(&conn).unwrap().len(), 1);
        assert!(remote
            .calls()
            .iter()
            .all(|c| !matches!(c, Call::Delete { .. })));
    }

    #[tokio::test]
    async fn test_new_subtree_is_created_in_one_pass() {
        let (reconciler, remote) = setup();
        let (parent, child, grandchild) = {
            let conn = conn(&reconciler);
            let mut ids = Vec::new();
            let mut parent_id = None;
            // Each level needs the remote id of the level above.
            for name in ["Drinks", "Cold", "Juice"] {
                let id = catalog::insert_category(
                    &conn,
                    &Category {
                        name: name.into(),
                        parent_id,
                        pending: PendingOps::CREATE,
                        ..Default::default()
                    },
                )
                .unwrap();
                ids.push(id);
                parent_id = Some(id);
            }
            (ids[0], ids[1], ids[2])
        };

        let report = reconciler.run_pass().await.unwrap();
        reconciler.dispatcher().wait_idle().await;
        assert_eq!(report.errors, 0);
        assert_eq!(report.resent, 3);
        assert_eq!(remote.create_count(Resource::Category), 3);

        let conn = conn(&reconciler);
        let parent = catalog::require_category(&conn, parent).unwrap();
        let child = catalog::require_category(&conn, child).unwrap();
        let grandchild = catalog::require_category(&conn, grandchild).unwrap();
        for c in [&parent, &child, &grandchild] {
            assert!(c.remote_id.is_some() && c.pending.is_empty());
        }
        let created = remote
            .item(Resource::Category, grandchild.remote_id.as_deref().unwrap())
            .unwrap();
        assert_eq!(
            created["ParentCategoryId"].as_str(),
            child.remote_id.as_deref()
        );
    }

    #[tokio::test]
    async fn test_category_adopted_by_name_is_not_sent_again() {
        let (reconciler, remote) = setup();
        remote.seed_category("1", "Drinks", None);
        let id = {
            let conn = conn(&reconciler);
            catalog::insert_category(
                &conn,
                &Category {
                    name: "Drinks".into(),
                    pending: PendingOps::CREATE,
                    ..Default::default()
                },
            )
            .unwrap()
        };

        for _ in 0..3 {
            let report = reconciler.run_pass().await.unwrap();
            reconciler.dispatcher().wait_idle().await;
            assert_eq!(report.resent, 0);
        }
        assert!(remote.calls().is_empty());
        let conn = conn(&reconciler);
        let c = catalog::require_category(&conn, id).unwrap();
        assert_eq!(c.remote_id.as_deref(), Some("1"));
        assert!(c.pending.is_empty());
    }

    #[tokio::test]
    async fn test_save_during_in_flight_update_reaches_remote() {
        let (reconciler, remote) = setup();
        remote.seed_category("1", "C1", None);
        remote.seed_product("900", "Bun", Some("1"), 3);
        reconciler.run_pass().await.unwrap();
        let id = {
            let conn = conn(&reconciler);
            catalog::get_product_by_remote_id(&conn, "900").unwrap().unwrap().id
        };

        let dispatcher = reconciler.dispatcher();
        for (description, dispatched) in [("edit1", true), ("edit2", false)] {
            {
                let conn = conn(&reconciler);
                let mut p = catalog::require_product(&conn, id).unwrap();
                p.description = description.into();
                catalog::update_product(&conn, &p).unwrap();
            }
            assert_eq!(edits::product_saved(dispatcher, id).unwrap(), dispatched);
        }
        dispatcher.wait_idle().await;
        assert_eq!(
            remote.item(Resource::InventoryItem, "900").unwrap()["Description"],
            "edit2"
        );

        reconciler.run_pass().await.unwrap();
        dispatcher.wait_idle().await;
        let conn = conn(&reconciler);
        let p = catalog::require_product(&conn, id).unwrap();
        assert_eq!(p.description, "edit2");
        assert!(p.pending.is_empty());
        let updates = remote
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Update { .. }))
            .count();
        assert_eq!(updates, 2);
    }

    #[tokio::test]
    async fn test_failed_deletes_are_resent_each_pass() {
        let (reconciler, remote) = setup();
        {
            let conn = conn(&reconciler);
            catalog::insert_deleted_item(
                &conn,
                &crate::models::DeletedItem {
                    kind: EntityKind::Product,
                    remote_id: "999".into(),
                },
            )
            .unwrap();
        }
        let report = reconciler.run_pass().await.unwrap();
        reconciler.dispatcher().wait_idle().await;
        assert_eq!(report.resent, 1);
        let conn = conn(&reconciler);
        assert!(catalog::list_deleted_items(&conn).unwrap().is_empty());
    }
}
