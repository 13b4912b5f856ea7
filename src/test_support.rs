//! In-memory [`RemoteCatalog`] used by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::api::{ListPage, RemoteCatalog, RemoteResponse};
use crate::error::RemoteError;
use crate::models::{QuantityChange, Resource};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Create { resource: Resource, body: Value },
    Update { resource: Resource, body: Value },
    Delete { resource: Resource, remote_id: String },
    Quantity { remote_id: String, change: QuantityChange },
}

#[derive(Default)]
struct State {
    products: Vec<Value>,
    categories: Vec<Value>,
    next_id: u64,
    calls: Vec<Call>,
    list_offsets: HashMap<Resource, Vec<usize>>,
    fail_list_at: HashMap<Resource, usize>,
    hide_totals: bool,
    write_status: Option<u16>,
    quantity_statuses: VecDeque<u16>,
}

impl State {
    fn items(&mut self, resource: Resource) -> &mut Vec<Value> {
        match resource {
            Resource::InventoryItem => &mut self.products,
            Resource::Category => &mut self.categories,
        }
    }
}

fn id_of(item: &Value) -> String {
    match &item["Id"] {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct FakeRemote {
    state: Mutex<State>,
    quantity_gate: Arc<Semaphore>,
    gated: Mutex<bool>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1000,
                ..Default::default()
            }),
            quantity_gate: Arc::new(Semaphore::new(0)),
            gated: Mutex::new(false),
        }
    }

    pub fn seed_category(&self, id: &str, name: &str, parent: Option<&str>) {
        let mut item = json!({
            "Id": id,
            "Name": name,
            "AccountNumber": "",
            "OnlyAllowCategories": false,
            "DefaultVatPercentage": 25.0,
            "LastModifiedDateTime": "2030-01-01T00:00:00"
        });
        if let Some(parent) = parent {
            item["ParentCategoryId"] = json!(parent);
        }
        self.state.lock().unwrap().categories.push(item);
    }

    pub fn seed_product(&self, id: &str, description: &str, category: Option<&str>, stock: i64) {
        let mut item = json!({
            "Id": id,
            "Description": description,
            "PriceIncludingVat": 10.0,
            "VatPercentage": 12.0,
            "QuantityInStockCurrent": stock,
            "VisibleOnSalesMenu": true,
            "LastModifiedDateTime": "2030-01-01T00:00:00"
        });
        if let Some(category) = category {
            item["CategoryId"] = json!(category);
        }
        self.state.lock().unwrap().products.push(item);
    }

    pub fn set_field(&self, resource: Resource, id: &str, field: &str, value: Value) {
        let mut state = self.state.lock().unwrap();
        if let Some(item) = state.items(resource).iter_mut().find(|i| id_of(i) == id) {
            item[field] = value;
        }
    }

    pub fn remove(&self, resource: Resource, id: &str) {
        self.state
            .lock()
            .unwrap()
            .items(resource)
            .retain(|i| id_of(i) != id);
    }

    pub fn item(&self, resource: Resource, id: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .items(resource)
            .iter()
            .find(|i| id_of(i) == id)
            .cloned()
    }

    /// Omit `ItemCountTotal` from list responses.
    pub fn set_report_totals(&self, report: bool) {
        self.state.lock().unwrap().hide_totals = !report;
    }

    pub fn fail_list_at_offset(&self, resource: Resource, offset: usize) {
        self.state.lock().unwrap().fail_list_at.insert(resource, offset);
    }

    /// Answer every write with this status (`None` restores normal behaviour).
    pub fn set_write_status(&self, status: Option<u16>) {
        self.state.lock().unwrap().write_status = status;
    }

    /// Script the statuses of the next quantity requests.
    pub fn queue_quantity_statuses(&self, statuses: &[u16]) {
        self.state
            .lock()
            .unwrap()
            .quantity_statuses
            .extend(statuses.iter().copied());
    }

    /// Make quantity requests wait until [`FakeRemote::release_quantity`].
    pub fn gate_quantity(&self) {
        *self.gated.lock().unwrap() = true;
    }

    pub fn release_quantity(&self, n: usize) {
        self.quantity_gate.add_permits(n);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn quantity_calls(&self) -> Vec<QuantityChange> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Quantity { change, .. } => Some(change),
                _ => None,
            })
            .collect()
    }

    pub fn create_count(&self, resource: Resource) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Create { resource: r, .. } if *r == resource))
            .count()
    }

    pub fn list_offsets(&self, resource: Resource) -> Vec<usize> {
        self.state
            .lock()
            .unwrap()
            .list_offsets
            .get(&resource)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stock(&self, id: &str) -> Option<i64> {
        self.item(Resource::InventoryItem, id)
            .and_then(|i| i["QuantityInStockCurrent"].as_i64())
    }
}

#[async_trait]
impl RemoteCatalog for FakeRemote {
    async fn list(
        &self,
        resource: Resource,
        page_size: usize,
        offset: usize,
    ) -> Result<ListPage, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.list_offsets.entry(resource).or_default().push(offset);
        if state.fail_list_at.get(&resource) == Some(&offset) {
            return Err(RemoteError::Timeout(format!("{}?offset={offset}", resource.path())));
        }
        let hide_totals = state.hide_totals;
        let all = state.items(resource);
        let items: Vec<Value> = all.iter().skip(offset).take(page_size).cloned().collect();
        Ok(ListPage {
            fetched: items.len(),
            total: (!hide_totals).then_some(all.len()),
            items,
        })
    }

    async fn create(&self, resource: Resource, body: Value) -> Result<RemoteResponse, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Create {
            resource,
            body: body.clone(),
        });
        if let Some(status) = state.write_status {
            return Ok(RemoteResponse {
                status,
                body: Value::Null,
            });
        }
        state.next_id += 1;
        let id = state.next_id.to_string();
        let mut item = body["Item"].clone();
        item["Id"] = json!(id);
        item["LastModifiedDateTime"] = json!("2030-01-01T00:00:00");
        if resource == Resource::InventoryItem {
            let category_name = item["CategoryId"]
                .as_str()
                .and_then(|cid| state.categories.iter().find(|c| id_of(c) == cid))
                .and_then(|c| c["Name"].as_str().map(str::to_string))
                .unwrap_or_default();
            item["CategoryName"] = json!(category_name);
        }
        state.items(resource).push(item.clone());
        Ok(RemoteResponse {
            status: 200,
            body: json!({ "Item": item }),
        })
    }

    async fn update(&self, resource: Resource, body: Value) -> Result<RemoteResponse, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Update {
            resource,
            body: body.clone(),
        });
        if let Some(status) = state.write_status {
            return Ok(RemoteResponse {
                status,
                body: Value::Null,
            });
        }
        let id = id_of(&body["Item"]);
        let Some(item) = state.items(resource).iter_mut().find(|i| id_of(i) == id) else {
            return Ok(RemoteResponse {
                status: 404,
                body: Value::Null,
            });
        };
        if let Value::Object(fields) = &body["Item"] {
            for (k, v) in fields {
                item[k] = v.clone();
            }
        }
        Ok(RemoteResponse {
            status: 200,
            body: json!({ "Item": item.clone() }),
        })
    }

    async fn delete(
        &self,
        resource: Resource,
        remote_id: &str,
    ) -> Result<RemoteResponse, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Delete {
            resource,
            remote_id: remote_id.to_string(),
        });
        if let Some(status) = state.write_status {
            return Ok(RemoteResponse {
                status,
                body: Value::Null,
            });
        }
        state.items(resource).retain(|i| id_of(i) != remote_id);
        Ok(RemoteResponse {
            status: 200,
            body: Value::Null,
        })
    }

    async fn adjust_quantity(
        &self,
        remote_id: &str,
        change: QuantityChange,
    ) -> Result<RemoteResponse, RemoteError> {
        self.state.lock().unwrap().calls.push(Call::Quantity {
            remote_id: remote_id.to_string(),
            change,
        });
        let gated = *self.gated.lock().unwrap();
        if gated {
            let permit = self.quantity_gate.acquire().await.unwrap();
            permit.forget();
        }
        let mut state = self.state.lock().unwrap();
        let status = state
            .quantity_statuses
            .pop_front()
            .or(state.write_status)
            .unwrap_or(200);
        if status < 400 {
            if let Some(item) = state
                .products
                .iter_mut()
                .find(|i| id_of(i) == remote_id)
            {
                let stock = item["QuantityInStockCurrent"].as_i64().unwrap_or(0);
                item["QuantityInStockCurrent"] = json!(stock - change.change);
            }
        }
        Ok(RemoteResponse {
            status,
            body: Value::Null,
        })
    }
}
