//! Paginated retrieval of the full remote catalog.

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::api::RemoteCatalog;
use crate::models::Resource;

/// Everything a paginated list produced.
///
/// `complete` is `false` when a page failed; callers must not infer remote
/// deletions from an incomplete fetch.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub items: Vec<T>,
    pub complete: bool,
}

/// Fetch every item of `resource`, page by page, until a page reports zero
/// items fetched or the running count reaches the server's total.
///
/// A failed or malformed page ends the sequence early. Items that do not
/// deserialize are skipped.
pub async fn fetch_all<T: DeserializeOwned>(
    remote: &dyn RemoteCatalog,
    resource: Resource,
    page_size: usize,
) -> Fetched<T> {
    let page_size = page_size.max(1);
    let mut items = Vec::new();
    let mut offset = 0usize;

    loop {
        let page = match remote.list(resource, page_size, offset).await {
            Ok(page) => page,
            Err(e) => {
                warn!(resource = resource.path(), offset, error = %e, "catalog fetch truncated");
                return Fetched {
                    items,
                    complete: false,
                };
            }
        };

        if page.fetched == 0 {
            break;
        }

        for raw in page.items {
            match serde_json::from_value::<T>(raw) {
                Ok(item) => items.push(item),
                Err(e) => warn!(resource = resource.path(), offset, error = %e, "skipping malformed item"),
            }
        }

        offset += page.fetched;
        debug!(resource = resource.path(), offset, total = ?page.total, "fetched page");

        if page.total.is_some_and(|total| offset >= total) {
            break;
        }
    }

    Fetched {
        items,
        complete: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RemoteProduct;
    use crate::test_support::FakeRemote;

    #[tokio::test]
    async fn test_fetch_all_follows_pages_until_total() {
        let remote = FakeRemote::new();
        for i in 1..=5 {
            remote.seed_product(&format!("{i}"), &format!("P{i}"), None, 1);
        }
        let fetched: Fetched<RemoteProduct> =
            fetch_all(&remote, Resource::InventoryItem, 2).await;
        assert!(fetched.complete);
        assert_eq!(fetched.items.len(), 5);
        // 0, 2, 4 then stop at total 5.
        assert_eq!(remote.list_offsets(Resource::InventoryItem), vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn test_fetch_all_stops_on_empty_page() {
        let remote = FakeRemote::new();
        remote.set_report_totals(false);
        remote.seed_product("1", "Only", None, 1);
        let fetched: Fetched<RemoteProduct> =
            fetch_all(&remote, Resource::InventoryItem, 10).await;
        assert!(fetched.complete);
        assert_eq!(fetched.items.len(), 1);
        assert_eq!(remote.list_offsets(Resource::InventoryItem), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_fetch_all_marks_truncation_incomplete() {
        let remote = FakeRemote::new();
        for i in 1..=4 {
            remote.seed_product(&format!("{i}"), &format!("P{i}"), None, 1);
        }
        remote.fail_list_at_offset(Resource::InventoryItem, 2);
        let fetched: Fetched<RemoteProduct> =
            fetch_all(&remote, Resource::InventoryItem, 2).await;
        assert!(!fetched.complete);
        assert_eq!(fetched.items.len(), 2);
    }
}
