//! In-memory versioned row store standing in for the host engine.
//!
//! Tables hold primary-key rows as version chains tagged with the writing
//! XID. Row visibility is resolved against the core's state table; versions
//! whose transaction has already been garbage collected fall back to the
//! engine's own committed flag. Conflicts surface exactly where the real
//! engine would raise them: duplicate key on insert, missing row on
//! update/delete.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use conclave_core::{Visibility, VisibilityService, Csn, Xid};

#[derive(Clone, Debug)]
pub struct RowVersion {
    pub xid: Xid,
    pub deleted: bool,
    pub value: Vec<u8>,
    /// Host-side commit flag consulted once the state table has forgotten
    /// the XID.
    pub committed: bool,
}

#[derive(Default)]
struct Table {
    local_only: bool,
    rows: HashMap<Vec<u8>, Vec<RowVersion>>,
}

#[derive(Default)]
struct EngineInner {
    tables: HashMap<String, Table>,
    /// Reverse index from XID to the rows it touched, for commit/rollback.
    writes_by_xid: HashMap<Xid, Vec<(String, Vec<u8>)>>,
}

#[derive(Default)]
pub struct MemoryEngine {
    inner: RwLock<EngineInner>,
}

impl MemoryEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create_table(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.tables.entry(name.to_string()).or_default();
    }

    pub fn make_local(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.tables.entry(name.to_string()).or_default().local_only = true;
    }

    pub fn is_local(&self, name: &str) -> bool {
        let inner = self.inner.read().unwrap();
        inner.tables.get(name).map(|t| t.local_only).unwrap_or(false)
    }

    pub fn table_names(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let mut names: Vec<String> = inner.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Insert a row version. A live head version (committed or still in
    /// flight) is a unique violation.
    pub fn insert(&self, table: &str, key: &[u8], value: &[u8], xid: Xid) -> anyhow::Result<()> {
        let mut inner = self.inner.write().unwrap();
        let t = inner
            .tables
            .entry(table.to_string())
            .or_default();
        let chain = t.rows.entry(key.to_vec()).or_default();
        if let Some(head) = chain.last() {
            if !head.deleted {
                anyhow::bail!(
                    "duplicate key value violates unique constraint on {table}"
                );
            }
        }
        chain.push(RowVersion {
            xid,
            deleted: false,
            value: value.to_vec(),
            committed: false,
        });
        inner
            .writes_by_xid
            .entry(xid)
            .or_default()
            .push((table.to_string(), key.to_vec()));
        Ok(())
    }

    /// Push a new version of an existing row.
    pub fn update(&self, table: &str, key: &[u8], value: &[u8], xid: Xid) -> anyhow::Result<()> {
        self.push_version(table, key, Some(value), xid)
    }

    /// Push a deletion marker for an existing row.
    pub fn delete(&self, table: &str, key: &[u8], xid: Xid) -> anyhow::Result<()> {
        self.push_version(table, key, None, xid)
    }

    fn push_version(
        &self,
        table: &str,
        key: &[u8],
        value: Option<&[u8]>,
        xid: Xid,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.write().unwrap();
        let t = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| anyhow::anyhow!("relation {table} does not exist"))?;
        let chain = t
            .rows
            .get_mut(key)
            .filter(|chain| chain.last().map(|v| !v.deleted).unwrap_or(false))
            .ok_or_else(|| anyhow::anyhow!("row not found in {table}"))?;
        chain.push(RowVersion {
            xid,
            deleted: value.is_none(),
            value: value.map(|v| v.to_vec()).unwrap_or_default(),
            committed: false,
        });
        inner
            .writes_by_xid
            .entry(xid)
            .or_default()
            .push((table.to_string(), key.to_vec()));
        Ok(())
    }

    /// Flip the committed flag on everything `xid` wrote.
    pub fn mark_committed(&self, xid: Xid) {
        let mut inner = self.inner.write().unwrap();
        let Some(rows) = inner.writes_by_xid.remove(&xid) else {
            return;
        };
        for (table, key) in rows {
            if let Some(chain) = inner
                .tables
                .get_mut(&table)
                .and_then(|t| t.rows.get_mut(&key))
            {
                for version in chain.iter_mut().filter(|v| v.xid == xid) {
                    version.committed = true;
                }
            }
        }
    }

    /// Remove everything `xid` wrote (abort path).
    pub fn rollback_xid(&self, xid: Xid) {
        let mut inner = self.inner.write().unwrap();
        let Some(rows) = inner.writes_by_xid.remove(&xid) else {
            return;
        };
        for (table, key) in rows {
            let Some(t) = inner.tables.get_mut(&table) else {
                continue;
            };
            if let Some(chain) = t.rows.get_mut(&key) {
                chain.retain(|v| v.xid != xid);
                if chain.is_empty() {
                    t.rows.remove(&key);
                }
            }
        }
    }

    /// Read the row visible under `snapshot`. `own_xids` are the reader's
    /// own transaction and committed sub-transactions, always visible to
    /// itself. In-doubt versions make this wait via the visibility service.
    pub async fn read(
        &self,
        table: &str,
        key: &[u8],
        snapshot: Csn,
        own_xids: &[Xid],
        visibility: &VisibilityService,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let chain: Vec<RowVersion> = {
            let inner = self.inner.read().unwrap();
            match inner.tables.get(table).and_then(|t| t.rows.get(key)) {
                Some(chain) => chain.clone(),
                None => return Ok(None),
            }
        };
        for version in chain.iter().rev() {
            if own_xids.contains(&version.xid) {
                return Ok((!version.deleted).then(|| version.value.clone()));
            }
            match visibility.xid_visible(version.xid, snapshot).await? {
                Visibility::Visible => {
                    return Ok((!version.deleted).then(|| version.value.clone()))
                }
                Visibility::Invisible => continue,
                Visibility::Unmapped => {
                    // The state table has forgotten this XID: trust the
                    // host-side commit flag.
                    if version.committed {
                        return Ok((!version.deleted).then(|| version.value.clone()));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Drop versions superseded by a committed version that is already past
    /// the visibility horizon (`horizon_passed` holds for its XID): no live
    /// snapshot can reach anything older.
    pub fn vacuum(&self, horizon_passed: impl Fn(Xid) -> bool) {
        let mut inner = self.inner.write().unwrap();
        for table in inner.tables.values_mut() {
            for chain in table.rows.values_mut() {
                if chain.len() <= 1 {
                    continue;
                }
                let cut = chain
                    .iter()
                    .rposition(|v| v.committed && horizon_passed(v.xid))
                    .unwrap_or(0);
                if cut > 0 {
                    chain.drain(..cut);
                }
            }
        }
    }
}
