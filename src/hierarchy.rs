//! Resolution of remote categories into the local category tree.
//!
//! A resolver lives for one reconciliation pass. It holds the remote
//! categories indexed by id and a memo of remote id to local id, so each
//! remote category is placed at most once per pass no matter how many
//! children or products reference it.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::debug;

use crate::catalog;
use crate::error::{Result, SyncError};
use crate::events::EventLog;
use crate::models::{remote_is_not_older, remote_to_local_time, Category, EntityKind, RemoteCategory};
use crate::pending::{self, PendingOps};

/// What a resolver changed locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveStats {
    pub created: usize,
    pub renamed: usize,
    pub reparented: usize,
    pub updated: usize,
}

pub struct CategoryResolver {
    remote: HashMap<String, RemoteCategory>,
    resolved: HashMap<String, i64>,
    in_progress: HashSet<String>,
    clock_offset_secs: i64,
    events: EventLog,
    stats: ResolveStats,
}

impl CategoryResolver {
    pub fn new(categories: Vec<RemoteCategory>, clock_offset_secs: i64, events: EventLog) -> Self {
        let remote = categories
            .into_iter()
            .filter_map(|c| c.id.clone().map(|id| (id, c)))
            .collect();
        Self {
            remote,
            resolved: HashMap::new(),
            in_progress: HashSet::new(),
            clock_offset_secs,
            events,
            stats: ResolveStats::default(),
        }
    }

    pub fn stats(&self) -> ResolveStats {
        self.stats
    }

    pub fn remote_ids(&self) -> Vec<String> {
        self.remote.keys().cloned().collect()
    }

    pub fn remote_category(&self, remote_id: &str) -> Option<&RemoteCategory> {
        self.remote.get(remote_id)
    }

    /// Local ids of every category resolved so far.
    pub fn claimed_local_ids(&self) -> HashSet<i64> {
        self.resolved.values().copied().collect()
    }

    /// Find a local category by name among those resolved this pass.
    pub fn resolve_by_name(&self, conn: &Connection, name: &str) -> Result<Option<i64>> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(None);
        }
        let Some(category) = catalog::get_category_by_name(conn, name)? else {
            return Ok(None);
        };
        Ok(self
            .claimed_local_ids()
            .contains(&category.id)
            .then_some(category.id))
    }

    /// Resolve a remote category id to a local category id, placing the
    /// category and its ancestors in the local tree first.
    ///
    /// An empty or absent id is the root and resolves to `None`.
    pub fn resolve(&mut self, conn: &Connection, remote_id: Option<&str>) -> Result<Option<i64>> {
        let Some(remote_id) = remote_id.map(str::trim).filter(|id| !id.is_empty()) else {
            return Ok(None);
        };
        if let Some(local) = self.resolved.get(remote_id) {
            return Ok(Some(*local));
        }
        if !self.in_progress.insert(remote_id.to_string()) {
            return Err(SyncError::Inconsistent(format!(
                "category {remote_id} is its own ancestor"
            )));
        }
        let result = self.place(conn, remote_id);
        self.in_progress.remove(remote_id);
        let local = result?;
        self.resolved.insert(remote_id.to_string(), local);
        Ok(Some(local))
    }

    fn place(&mut self, conn: &Connection, remote_id: &str) -> Result<i64> {
        let remote = self.remote.get(remote_id).cloned().ok_or_else(|| {
            SyncError::Inconsistent(format!("category {remote_id} is not listed remotely"))
        })?;
        let name = remote.name.trim();
        if name.is_empty() {
            return Err(SyncError::Inconsistent(format!(
                "category {remote_id} has no name"
            )));
        }

        let parent = self.resolve(conn, remote.parent_category_id.as_deref())?;
        let tracked = catalog::get_category_by_remote_id(conn, remote_id)?;

        let mut category = match catalog::get_category_by_name(conn, name)? {
            Some(mut existing) => {
                let mut changed = false;
                if existing.parent_id != parent {
                    debug!(category = name, ?parent, "reparenting category");
                    existing.parent_id = parent;
                    self.stats.reparented += 1;
                    self.events
                        .remote_change(EntityKind::Category, existing.id, remote_id, "moved");
                    changed = true;
                }
                let adopted = existing.remote_id.is_none() && tracked.is_none();
                if adopted {
                    existing.remote_id = Some(remote_id.to_string());
                    changed = true;
                }
                if changed {
                    catalog::update_category(conn, &existing)?;
                }
                if adopted {
                    // The remote already has it; a create would duplicate it.
                    pending::clear(conn, EntityKind::Category, existing.id, PendingOps::CREATE)?;
                    existing.pending = existing.pending.without(PendingOps::CREATE);
                }
                existing
            }
            None => match tracked {
                None => {
                    let mut created = Category {
                        remote_id: Some(remote_id.to_string()),
                        name: name.to_string(),
                        parent_id: parent,
                        pending: PendingOps::NONE,
                        ..Default::default()
                    };
                    apply_remote_fields(&mut created, &remote, self.clock_offset_secs);
                    created.id = catalog::insert_category(conn, &created)?;
                    self.stats.created += 1;
                    self.events
                        .remote_change(EntityKind::Category, created.id, remote_id, "created");
                    return Ok(created.id);
                }
                Some(mut renamed) => {
                    debug!(from = %renamed.name, to = name, "renaming category");
                    renamed.name = name.to_string();
                    renamed.parent_id = parent;
                    catalog::update_category(conn, &renamed)?;
                    self.stats.renamed += 1;
                    self.events
                        .remote_change(EntityKind::Category, renamed.id, remote_id, "renamed");
                    renamed
                }
            },
        };

        if !category.pending.update
            && fields_differ(&category, &remote)
            && remote_is_not_older(
                remote.last_modified_date_time.as_deref(),
                category.modified_at,
                self.clock_offset_secs,
            )
        {
            apply_remote_fields(&mut category, &remote, self.clock_offset_secs);
            catalog::update_category(conn, &category)?;
            self.stats.updated += 1;
            self.events
                .remote_change(EntityKind::Category, category.id, remote_id, "updated");
        }

        Ok(category.id)
    }
}

fn remote_vat(remote: &RemoteCategory) -> f64 {
    remote.default_vat_percentage.unwrap_or(0.0)
}

fn fields_differ(local: &Category, remote: &RemoteCategory) -> bool {
    local.account_number != remote.account_number
        || local.only_allow_categories != remote.only_allow_categories.unwrap_or(false)
        || (local.default_vat_percentage - remote_vat(remote)).abs() > f64::EPSILON
}

fn apply_remote_fields(local: &mut Category, remote: &RemoteCategory, clock_offset_secs: i64) {
    local.account_number = remote.account_number.clone();
    local.only_allow_categories = remote.only_allow_categories.unwrap_or(false);
    local.default_vat_percentage = remote_vat(remote);
    local.modified_at = Some(modified_from_remote(remote, clock_offset_secs));
}

fn modified_from_remote(remote: &RemoteCategory, clock_offset_secs: i64) -> DateTime<Utc> {
    remote_to_local_time(remote.last_modified_date_time.as_deref(), clock_offset_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn remote(id: &str, name: &str, parent: Option<&str>) -> RemoteCategory {
        RemoteCategory {
            id: Some(id.into()),
            name: name.into(),
            parent_category_id: parent.map(str::to_string),
            account_number: "3000".into(),
            default_vat_percentage: Some(12.0),
            last_modified_date_time: Some("2030-01-01T00:00:00".into()),
            ..Default::default()
        }
    }

    fn resolver(categories: Vec<RemoteCategory>) -> CategoryResolver {
        CategoryResolver::new(categories, 7200, EventLog::default())
    }

    #[test]
    fn test_root_and_empty_ids() {
        let db = db::open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        let mut r = resolver(vec![]);
        assert_eq!(r.resolve(&conn, None).unwrap(), None);
        assert_eq!(r.resolve(&conn, Some("  ")).unwrap(), None);
    }

    #[test]
    fn test_unknown_remote_id_is_inconsistent() {
        let db = db::open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        let mut r = resolver(vec![remote("1", "Orphan", Some("404"))]);
        assert!(matches!(
            r.resolve(&conn, Some("1")),
            Err(SyncError::Inconsistent(_))
        ));
        assert!(catalog::list_categories(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_cycle_is_detected() {
        let db = db::open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        let mut r = resolver(vec![remote("1", "A", Some("2")), remote("2", "B", Some("1"))]);
        assert!(matches!(
            r.resolve(&conn, Some("1")),
            Err(SyncError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_three_level_chain_reparents_middle_and_creates_rest() {
        let db = db::open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        // The middle category exists locally at the root, unlinked.
        let middle = catalog::insert_category(
            &conn,
            &Category {
                name: "Hot drinks".into(),
                ..Default::default()
            },
        )
        .unwrap();

        let mut r = resolver(vec![
            remote("30", "Coffee", Some("20")),
            remote("20", "Hot drinks", Some("10")),
            remote("10", "Drinks", None),
        ]);
        let leaf = r.resolve(&conn, Some("30")).unwrap().unwrap();

        let root = catalog::get_category_by_remote_id(&conn, "10").unwrap().unwrap();
        let mid = catalog::require_category(&conn, middle).unwrap();
        let leaf = catalog::require_category(&conn, leaf).unwrap();
        assert_eq!(root.parent_id, None);
        assert_eq!(mid.parent_id, Some(root.id));
        assert_eq!(mid.remote_id.as_deref(), Some("20"));
        assert_eq!(leaf.parent_id, Some(middle));
        // Root was created before the leaf.
        assert!(root.id < leaf.id);

        let stats = r.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.reparented, 1);
    }

    #[test]
    fn test_each_remote_id_placed_once() {
        let db = db::open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        let mut r = resolver(vec![
            remote("1", "Food", None),
            remote("2", "Buns", Some("1")),
            remote("3", "Bread", Some("1")),
        ]);
        for id in ["2", "3", "1", "2"] {
            r.resolve(&conn, Some(id)).unwrap();
        }
        assert_eq!(catalog::list_categories(&conn).unwrap().len(), 3);
        assert_eq!(r.stats().created, 3);
        assert_eq!(r.claimed_local_ids().len(), 3);
    }

    #[test]
    fn test_rename_in_place() {
        let db = db::open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        let id = catalog::insert_category(
            &conn,
            &Category {
                name: "Softdrinks".into(),
                remote_id: Some("5".into()),
                account_number: "3000".into(),
                default_vat_percentage: 12.0,
                ..Default::default()
            },
        )
        .unwrap();
        let mut r = resolver(vec![remote("5", "Soft drinks", None)]);
        assert_eq!(r.resolve(&conn, Some("5")).unwrap(), Some(id));
        assert_eq!(catalog::require_category(&conn, id).unwrap().name, "Soft drinks");
        assert_eq!(r.stats().renamed, 1);
        assert_eq!(r.resolve_by_name(&conn, "Soft drinks").unwrap(), Some(id));
    }

    #[test]
    fn test_adopting_by_name_clears_create_flag() {
        let db = db::open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        let id = catalog::insert_category(
            &conn,
            &Category {
                name: "Drinks".into(),
                pending: PendingOps::CREATE.union(PendingOps::UPDATE),
                ..Default::default()
            },
        )
        .unwrap();
        let mut r = resolver(vec![remote("1", "Drinks", None)]);
        assert_eq!(r.resolve(&conn, Some("1")).unwrap(), Some(id));

        let adopted = catalog::require_category(&conn, id).unwrap();
        assert_eq!(adopted.remote_id.as_deref(), Some("1"));
        assert_eq!(adopted.pending, PendingOps::UPDATE);
    }

    #[test]
    fn test_pending_update_blocks_field_overwrite() {
        let db = db::open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        let id = catalog::insert_category(
            &conn,
            &Category {
                name: "Drinks".into(),
                remote_id: Some("1".into()),
                account_number: "local".into(),
                pending: PendingOps::UPDATE,
                ..Default::default()
            },
        )
        .unwrap();
        let mut r = resolver(vec![remote("1", "Drinks", None)]);
        r.resolve(&conn, Some("1")).unwrap();
        assert_eq!(
            catalog::require_category(&conn, id).unwrap().account_number,
            "local"
        );
    }

    #[test]
    fn test_older_remote_change_is_ignored() {
        let db = db::open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        let id = catalog::insert_category(
            &conn,
            &Category {
                name: "Drinks".into(),
                remote_id: Some("1".into()),
                account_number: "local".into(),
                modified_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .unwrap();
        let mut stale = remote("1", "Drinks", None);
        stale.last_modified_date_time = Some("2001-01-01T00:00:00".into());
        let mut r = resolver(vec![stale]);
        r.resolve(&conn, Some("1")).unwrap();
        assert_eq!(
            catalog::require_category(&conn, id).unwrap().account_number,
            "local"
        );
    }
}
