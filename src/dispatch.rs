//! Asynchronous request dispatch and response handling.
//!
//! [`Dispatcher::dispatch`] returns as soon as the request is spawned. The
//! spawned task performs the HTTP call and hands exactly one [`Completion`]
//! to the response handler, which moves the entity's pending flags, remote
//! id and deleted-item records to their next state.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::api::{RemoteCatalog, RemoteResponse};
use crate::catalog;
use crate::db::DbState;
use crate::edits;
use crate::error::{Result, SyncError};
use crate::events::EventLog;
use crate::models::{DeletedItem, EntityKind, QuantityChange};
use crate::pending::{self, PendingOps};
use crate::quantity::{QuantityLock, QuantityTicket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ProductCreated,
    ProductUpdated,
    ProductDeleted,
    StockQuantityUpdated,
    CategoryCreated,
    CategoryUpdated,
    CategoryDeleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ProductCreated => "product-created",
            EventKind::ProductUpdated => "product-updated",
            EventKind::ProductDeleted => "product-deleted",
            EventKind::StockQuantityUpdated => "stock-quantity-updated",
            EventKind::CategoryCreated => "category-created",
            EventKind::CategoryUpdated => "category-updated",
            EventKind::CategoryDeleted => "category-deleted",
        }
    }

    /// Creates and updates carry an entity's full state.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            EventKind::ProductCreated
                | EventKind::ProductUpdated
                | EventKind::CategoryCreated
                | EventKind::CategoryUpdated
        )
    }

    pub fn entity(self) -> EntityKind {
        match self {
            EventKind::ProductCreated
            | EventKind::ProductUpdated
            | EventKind::ProductDeleted
            | EventKind::StockQuantityUpdated => EntityKind::Product,
            EventKind::CategoryCreated
            | EventKind::CategoryUpdated
            | EventKind::CategoryDeleted => EntityKind::Category,
        }
    }

    pub fn created(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Product => EventKind::ProductCreated,
            EntityKind::Category => EventKind::CategoryCreated,
        }
    }

    pub fn updated(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Product => EventKind::ProductUpdated,
            EntityKind::Category => EventKind::CategoryUpdated,
        }
    }

    pub fn deleted(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Product => EventKind::ProductDeleted,
            EntityKind::Category => EventKind::CategoryDeleted,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    Quantity(QuantityChange),
    Empty,
}

/// A remote write waiting to be sent.
#[derive(Debug)]
pub struct RequestSpec {
    pub event: EventKind,
    pub local_id: Option<i64>,
    pub remote_id: Option<String>,
    pub body: RequestBody,
    pub ticket: Option<QuantityTicket>,
}

impl RequestSpec {
    pub fn create(kind: EntityKind, local_id: i64, body: Value) -> Self {
        Self {
            event: EventKind::created(kind),
            local_id: Some(local_id),
            remote_id: None,
            body: RequestBody::Json(body),
            ticket: None,
        }
    }

    pub fn update(kind: EntityKind, local_id: i64, remote_id: String, body: Value) -> Self {
        Self {
            event: EventKind::updated(kind),
            local_id: Some(local_id),
            remote_id: Some(remote_id),
            body: RequestBody::Json(body),
            ticket: None,
        }
    }

    pub fn delete(kind: EntityKind, remote_id: String) -> Self {
        Self {
            event: EventKind::deleted(kind),
            local_id: None,
            remote_id: Some(remote_id),
            body: RequestBody::Empty,
            ticket: None,
        }
    }

    pub fn quantity(
        local_id: i64,
        remote_id: String,
        change: QuantityChange,
        ticket: QuantityTicket,
    ) -> Self {
        Self {
            event: EventKind::StockQuantityUpdated,
            local_id: Some(local_id),
            remote_id: Some(remote_id),
            body: RequestBody::Quantity(change),
            ticket: Some(ticket),
        }
    }

    /// In-flight slot. A create and a later update of the same entity share
    /// one slot.
    fn key(&self) -> (EventKind, String) {
        let id = match (self.local_id, &self.remote_id) {
            (Some(local), _) => format!("l{local}"),
            (None, Some(remote)) => format!("r{remote}"),
            (None, None) => String::new(),
        };
        let slot = if self.event.is_write() {
            EventKind::updated(self.event.entity())
        } else {
            self.event
        };
        (slot, id)
    }

    fn written_entity(&self) -> Option<(EntityKind, i64)> {
        self.local_id
            .filter(|_| self.event.is_write())
            .map(|id| (self.event.entity(), id))
    }
}

/// The outcome of one request, delivered once to the response handler.
#[derive(Debug)]
pub struct Completion {
    pub event: EventKind,
    pub status: u16,
    pub body: Value,
    pub local_id: Option<i64>,
    pub remote_id: Option<String>,
    pub sent: Option<QuantityChange>,
    pub ticket: Option<QuantityTicket>,
}

impl Completion {
    /// Status >= 400, or 0 for a transport failure or timeout, is a failure.
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

#[derive(Default)]
struct InFlight {
    requests: HashSet<(EventKind, String)>,
    /// Entities saved again while their write was in flight.
    stale: HashSet<(EntityKind, i64)>,
}

struct Inner {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteCatalog>,
    quantity: Arc<QuantityLock>,
    events: EventLog,
    hold_timeout: Duration,
    tracker: TaskTracker,
    in_flight: Mutex<InFlight>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<dyn RemoteCatalog>,
        quantity: Arc<QuantityLock>,
        events: EventLog,
        hold_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                remote,
                quantity,
                events,
                hold_timeout,
                tracker: TaskTracker::new(),
                in_flight: Mutex::new(InFlight::default()),
            }),
        }
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.inner.db
    }

    pub fn quantity_lock(&self) -> &Arc<QuantityLock> {
        &self.inner.quantity
    }

    pub fn events(&self) -> &EventLog {
        &self.inner.events
    }

    pub fn remote(&self) -> &Arc<dyn RemoteCatalog> {
        &self.inner.remote
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, InFlight> {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight().requests.len()
    }

    /// Send `spec` in the background. Returns `false` without sending when a
    /// request for the same slot is already in flight. A refused create or
    /// update is not lost: once the in-flight request completes, the entity's
    /// current local state is sent.
    pub fn dispatch(&self, spec: RequestSpec) -> bool {
        let key = spec.key();
        let written = spec.written_entity();
        {
            let mut in_flight = self.in_flight();
            if !in_flight.requests.insert(key.clone()) {
                if let Some(entity) = written {
                    in_flight.stale.insert(entity);
                }
                debug!(event = spec.event.as_str(), id = %key.1, "request already in flight");
                return false;
            }
        }

        let this = self.clone();
        self.inner.tracker.spawn(async move {
            let mut next = Some(spec);
            loop {
                while let Some(spec) = next.take() {
                    let completion = this.execute(spec).await;
                    match this.handle(completion).await {
                        Ok(follow_up) => next = follow_up,
                        Err(e) => warn!(error = %e, "response handler failed"),
                    }
                }
                let entity = {
                    let mut in_flight = this.in_flight();
                    match written {
                        Some(entity) if in_flight.stale.remove(&entity) => entity,
                        _ => {
                            in_flight.requests.remove(&key);
                            break;
                        }
                    }
                };
                next = this.rebuild(entity);
            }
        });
        true
    }

    /// The write for an entity saved while its previous write was in flight.
    /// On failure the entity's pending flag stays raised for the next pass.
    fn rebuild(&self, (kind, local_id): (EntityKind, i64)) -> Option<RequestSpec> {
        let conn = match self.inner.db.lock() {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%kind, local_id, error = %e, "newer local state not sent");
                return None;
            }
        };
        match edits::prepare_write(&conn, kind, local_id) {
            Ok(spec) => {
                debug!(%kind, local_id, "sending state saved while in flight");
                Some(spec)
            }
            Err(SyncError::NotFound { .. }) => None,
            Err(e) => {
                warn!(%kind, local_id, error = %e, "newer local state not sent");
                None
            }
        }
    }

    /// Wait until every dispatched request has been handled.
    pub async fn wait_idle(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    async fn execute(&self, spec: RequestSpec) -> Completion {
        let RequestSpec {
            event,
            local_id,
            remote_id,
            body,
            ticket,
        } = spec;
        let remote = &self.inner.remote;
        let resource = event.entity().resource();

        let body_text = match &body {
            RequestBody::Json(v) => v.to_string(),
            RequestBody::Quantity(q) => q.to_form(),
            RequestBody::Empty => String::new(),
        };
        self.inner
            .events
            .request(event.as_str(), local_id, remote_id.as_deref(), &body_text);

        let mut sent = None;
        let result = match (event, body) {
            (EventKind::ProductCreated | EventKind::CategoryCreated, RequestBody::Json(v)) => {
                remote.create(resource, v).await
            }
            (EventKind::ProductUpdated | EventKind::CategoryUpdated, RequestBody::Json(v)) => {
                remote.update(resource, v).await
            }
            (EventKind::ProductDeleted | EventKind::CategoryDeleted, _) => match &remote_id {
                Some(id) => remote.delete(resource, id).await,
                None => Ok(missing_remote_id()),
            },
            (EventKind::StockQuantityUpdated, RequestBody::Quantity(change)) => {
                sent = Some(change);
                match &remote_id {
                    Some(id) => {
                        match tokio::time::timeout(
                            self.inner.hold_timeout,
                            remote.adjust_quantity(id, change),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(crate::error::RemoteError::Timeout(format!(
                                "inventoryitem/{id}"
                            ))),
                        }
                    }
                    None => Ok(missing_remote_id()),
                }
            }
            (event, body) => {
                warn!(event = event.as_str(), ?body, "request body does not match event");
                Ok(RemoteResponse {
                    status: 400,
                    body: Value::Null,
                })
            }
        };

        let (status, body) = match result {
            Ok(response) => (response.status, response.body),
            Err(e) => {
                warn!(event = event.as_str(), ?local_id, error = %e, "request failed");
                (e.status(), Value::String(e.to_string()))
            }
        };
        self.inner
            .events
            .response(event.as_str(), local_id, status, &body.to_string());

        Completion {
            event,
            status,
            body,
            local_id,
            remote_id,
            sent,
            ticket,
        }
    }

    /// Apply a completion. Returns a follow-up request when a quantity
    /// remainder accumulated while the request was in flight.
    pub async fn handle(&self, completion: Completion) -> Result<Option<RequestSpec>> {
        match completion.event {
            EventKind::ProductCreated | EventKind::CategoryCreated => {
                self.handle_created(completion)?;
                Ok(None)
            }
            EventKind::ProductUpdated | EventKind::CategoryUpdated => {
                self.handle_updated(completion)?;
                Ok(None)
            }
            EventKind::ProductDeleted | EventKind::CategoryDeleted => {
                self.handle_deleted(completion)?;
                Ok(None)
            }
            EventKind::StockQuantityUpdated => self.handle_quantity(completion).await,
        }
    }

    fn handle_created(&self, completion: Completion) -> Result<()> {
        let kind = completion.event.entity();
        let Some(local_id) = completion.local_id else {
            return Ok(());
        };
        let conn = self.inner.db.lock()?;
        if !entity_exists(&conn, kind, local_id)? {
            debug!(%kind, local_id, "created entity no longer exists locally");
            return Ok(());
        }

        let item = &completion.body["Item"];
        let remote_id = crate::models::value_to_id(&item["Id"]);
        let remote_id = match (completion.is_success(), remote_id) {
            (true, Some(id)) => id,
            (success, _) => {
                if success {
                    warn!(%kind, local_id, "create response carried no Id");
                }
                pending::set(&conn, kind, local_id, PendingOps::CREATE)?;
                return Ok(());
            }
        };

        // A pass that listed the new remote entity before this response
        // arrived imported it as a separate local copy; drop that copy.
        if kind == EntityKind::Product {
            if let Some(copy) = catalog::get_product_by_remote_id(&conn, &remote_id)? {
                if copy.id != local_id {
                    warn!(local_id, copy = copy.id, remote_id = %remote_id, "dropping imported duplicate");
                    catalog::delete_product(&conn, copy.id)?;
                }
            }
        }

        catalog::set_remote_id(&conn, kind, local_id, &remote_id)?;
        if kind == EntityKind::Product {
            let mut product = catalog::require_product(&conn, local_id)?;
            if let Some(name) = item["CategoryName"].as_str() {
                product.category_name = name.to_string();
            }
            product.visible = true;
            catalog::update_product(&conn, &product)?;
        }
        pending::clear(&conn, kind, local_id, PendingOps::CREATE)?;
        info!(%kind, local_id, remote_id = %remote_id, "created remotely");
        Ok(())
    }

    fn handle_updated(&self, completion: Completion) -> Result<()> {
        let kind = completion.event.entity();
        let Some(local_id) = completion.local_id else {
            return Ok(());
        };
        let conn = self.inner.db.lock()?;
        if !entity_exists(&conn, kind, local_id)? {
            return Ok(());
        }
        if completion.is_success() {
            pending::clear(&conn, kind, local_id, PendingOps::UPDATE)
        } else {
            warn!(%kind, local_id, status = completion.status, "update rejected");
            pending::set(&conn, kind, local_id, PendingOps::UPDATE)
        }
    }

    fn handle_deleted(&self, completion: Completion) -> Result<()> {
        let Some(remote_id) = completion.remote_id.clone() else {
            return Ok(());
        };
        let item = DeletedItem {
            kind: completion.event.entity(),
            remote_id,
        };
        let conn = self.inner.db.lock()?;
        if completion.is_success() {
            catalog::remove_deleted_item(&conn, &item)
        } else {
            warn!(kind = %item.kind, remote_id = %item.remote_id, status = completion.status, "delete rejected");
            catalog::insert_deleted_item(&conn, &item)
        }
    }

    async fn handle_quantity(&self, completion: Completion) -> Result<Option<RequestSpec>> {
        let success = completion.is_success();
        let Completion {
            local_id,
            remote_id,
            sent,
            ticket,
            status,
            ..
        } = completion;
        let (Some(local_id), Some(sent)) = (local_id, sent) else {
            return Ok(None);
        };

        let _guard = self.inner.quantity.acquire().await;
        let conn = self.inner.db.lock()?;
        let Some(product) = catalog::get_product(&conn, local_id)? else {
            return Ok(None);
        };

        if !success {
            warn!(local_id, status, delta = product.quantity_delta, "quantity update failed");
            pending::set(&conn, EntityKind::Product, local_id, PendingOps::QUANTITY)?;
            return Ok(None);
        }

        let remainder = product.quantity_delta - sent.change;
        catalog::set_quantity_delta(&conn, local_id, remainder)?;

        let current = ticket.as_ref().is_some_and(QuantityTicket::is_current);
        if !current {
            // The ticket was force-released; the next pass owns this product.
            return Ok(None);
        }

        match (remainder, remote_id, ticket) {
            (0, _, _) => {
                pending::clear(&conn, EntityKind::Product, local_id, PendingOps::QUANTITY)?;
                Ok(None)
            }
            (remainder, Some(remote_id), Some(ticket)) => {
                debug!(local_id, remainder, "sending quantity remainder");
                ticket.renew();
                Ok(Some(RequestSpec::quantity(
                    local_id,
                    remote_id,
                    QuantityChange::from_stock(remainder, product.stock_quantity),
                    ticket,
                )))
            }
            _ => {
                pending::set(&conn, EntityKind::Product, local_id, PendingOps::QUANTITY)?;
                Ok(None)
            }
        }
    }
}

fn missing_remote_id() -> RemoteResponse {
    RemoteResponse {
        status: 400,
        body: Value::String("no remote id".into()),
    }
}

fn entity_exists(conn: &rusqlite::Connection, kind: EntityKind, id: i64) -> Result<bool> {
    match pending::get(conn, kind, id) {
        Ok(_) => Ok(true),
        Err(SyncError::NotFound { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}
