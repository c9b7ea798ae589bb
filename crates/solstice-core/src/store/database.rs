//! In-process state store.
//!
//! One in-memory SQLite connection behind a mutex. Multi-record mutations
//! (diff application, component commit, snapshot load) each run in a single
//! transaction so a failure leaves the previous state intact.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::errors::SolsticeResult;
use crate::models::{Contract, DiffKind, FileDiff, ImportTarget, Source, SourceKey};
use crate::store::schema;
use crate::store::snapshot::Snapshot;
use crate::toolchain::solc::SourceAst;

const SOURCE_COLUMNS: &str = "dir, filename, mod_time, tainted, version, imports, ast, unit_id";
const CONTRACT_COLUMNS: &str =
    "dir, filename, name, abi, bin, bin_runtime, src_map, src_map_runtime";

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<Source> {
    let ast: Option<SourceAst> = match row.get::<_, Option<String>>(6)? {
        Some(_) => Some(json_column(row, 6)?),
        None => None,
    };
    Ok(Source {
        dir: row.get(0)?,
        filename: row.get(1)?,
        mod_time: row.get(2)?,
        tainted: row.get::<_, i64>(3)? != 0,
        version: json_column(row, 4)?,
        imports: json_column(row, 5)?,
        ast,
        unit: row.get(7)?,
    })
}

fn contract_from_row(row: &Row<'_>) -> rusqlite::Result<Contract> {
    Ok(Contract {
        dir: row.get(0)?,
        filename: row.get(1)?,
        name: row.get(2)?,
        abi: row.get(3)?,
        bin: row.get(4)?,
        bin_runtime: row.get(5)?,
        src_map: row.get(6)?,
        src_map_runtime: row.get(7)?,
    })
}

fn put_source(conn: &Connection, source: &Source) -> SolsticeResult<()> {
    let ast = source.ast.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        &format!(
            "INSERT INTO sources ({SOURCE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(dir, filename) DO UPDATE SET \
                 mod_time = excluded.mod_time, tainted = excluded.tainted, \
                 version = excluded.version, imports = excluded.imports, \
                 ast = excluded.ast, unit_id = excluded.unit_id;"
        ),
        params![
            source.dir,
            source.filename,
            source.mod_time,
            source.tainted as i64,
            serde_json::to_string(&source.version)?,
            serde_json::to_string(&source.imports)?,
            ast,
            source.unit,
        ],
    )?;
    Ok(())
}

fn put_contract(conn: &Connection, contract: &Contract) -> SolsticeResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO contracts ({CONTRACT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(dir, filename, name) DO UPDATE SET \
                 abi = excluded.abi, bin = excluded.bin, bin_runtime = excluded.bin_runtime, \
                 src_map = excluded.src_map, src_map_runtime = excluded.src_map_runtime;"
        ),
        params![
            contract.dir,
            contract.filename,
            contract.name,
            contract.abi,
            contract.bin,
            contract.bin_runtime,
            contract.src_map,
            contract.src_map_runtime,
        ],
    )?;
    Ok(())
}

/// Taint every clean source holding an import that resolves to `path`.
fn taint_importers(
    tx: &Transaction<'_>,
    path: &str,
    resolve: &dyn Fn(&ImportTarget) -> Option<String>,
) -> SolsticeResult<usize> {
    let importers: Vec<SourceKey> = {
        let mut stmt = tx.prepare(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE tainted = 0;"
        ))?;
        let clean = stmt
            .query_map([], source_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        clean
            .into_iter()
            .filter(|s| s.imports.iter().any(|i| resolve(i).as_deref() == Some(path)))
            .map(|s| s.key())
            .collect()
    };
    for key in &importers {
        tx.execute(
            "UPDATE sources SET tainted = 1 WHERE dir = ?1 AND filename = ?2;",
            params![key.dir, key.filename],
        )?;
    }
    Ok(importers.len())
}

// ---------------------------------------------------------------------------
// Commit input
// ---------------------------------------------------------------------------

/// Everything produced by one successful component compile.
pub struct ComponentCommit<'a> {
    pub unit_id: &'a str,
    /// Member records as read when the compile started.
    pub members: &'a [Source],
    /// Contracts belonging to members only.
    pub contracts: &'a [Contract],
    /// AST summaries keyed by member path.
    pub asts: &'a BTreeMap<String, SourceAst>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open_in_memory() -> SolsticeResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert_source(&self, source: &Source) -> SolsticeResult<()> {
        put_source(&self.conn.lock(), source)
    }

    pub fn upsert_contract(&self, contract: &Contract) -> SolsticeResult<()> {
        put_contract(&self.conn.lock(), contract)
    }

    pub fn get_source(&self, key: &SourceKey) -> SolsticeResult<Option<Source>> {
        let conn = self.conn.lock();
        let source = conn
            .query_row(
                &format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE dir = ?1 AND filename = ?2;"),
                params![key.dir, key.filename],
                source_from_row,
            )
            .optional()?;
        Ok(source)
    }

    /// Remove a source and the contracts it owns. Returns whether it existed.
    pub fn delete_source(&self, key: &SourceKey) -> SolsticeResult<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM sources WHERE dir = ?1 AND filename = ?2;",
            params![key.dir, key.filename],
        )?;
        Ok(removed > 0)
    }

    fn query_sources(&self, filter: &str) -> SolsticeResult<Vec<Source>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources {filter} ORDER BY dir, filename;"
        ))?;
        let rows = stmt
            .query_map([], source_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_sources(&self) -> SolsticeResult<Vec<Source>> {
        self.query_sources("")
    }

    pub fn list_tainted_sources(&self) -> SolsticeResult<Vec<Source>> {
        self.query_sources("WHERE tainted = 1")
    }

    pub fn list_contracts(&self) -> SolsticeResult<Vec<Contract>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONTRACT_COLUMNS} FROM contracts ORDER BY dir, filename, name;"
        ))?;
        let rows = stmt
            .query_map([], contract_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn contracts_for_source(&self, key: &SourceKey) -> SolsticeResult<Vec<Contract>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONTRACT_COLUMNS} FROM contracts WHERE dir = ?1 AND filename = ?2 ORDER BY name;"
        ))?;
        let rows = stmt
            .query_map(params![key.dir, key.filename], contract_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn find_contracts_by_name(&self, name: &str) -> SolsticeResult<Vec<Contract>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONTRACT_COLUMNS} FROM contracts WHERE name = ?1 ORDER BY dir, filename;"
        ))?;
        let rows = stmt
            .query_map(params![name], contract_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn counts(&self) -> SolsticeResult<(usize, usize)> {
        let conn = self.conn.lock();
        let sources: i64 = conn.query_row("SELECT COUNT(*) FROM sources;", [], |r| r.get(0))?;
        let contracts: i64 = conn.query_row("SELECT COUNT(*) FROM contracts;", [], |r| r.get(0))?;
        Ok((sources as usize, contracts as usize))
    }

    /// [`Store::apply_diffs_with`] where only local imports reach other
    /// sources.
    pub fn apply_diffs(&self, diffs: &[FileDiff]) -> SolsticeResult<()> {
        self.apply_diffs_with(diffs, |import| match import {
            ImportTarget::Local(path) => Some(path.clone()),
            ImportTarget::Named(_) => None,
        })
    }

    /// Apply a diff list in one transaction. Adds and modifications upsert
    /// the freshly parsed record; deletions drop the source with its
    /// contracts and taint every source with an import that `resolve` maps
    /// to the deleted path.
    pub fn apply_diffs_with(
        &self,
        diffs: &[FileDiff],
        resolve: impl Fn(&ImportTarget) -> Option<String>,
    ) -> SolsticeResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for diff in diffs {
            match (diff.kind, &diff.source) {
                (DiffKind::Add | DiffKind::Modify, Some(source)) => put_source(&tx, source)?,
                (DiffKind::Add | DiffKind::Modify, None) => {
                    debug!(path = %diff.path, "diff without parsed source skipped");
                }
                (DiffKind::Delete, _) => {
                    let key = SourceKey::from_path(&diff.path);
                    tx.execute(
                        "DELETE FROM sources WHERE dir = ?1 AND filename = ?2;",
                        params![key.dir, key.filename],
                    )?;
                    let tainted = taint_importers(&tx, &diff.path, &resolve)?;
                    if tainted > 0 {
                        debug!(path = %diff.path, tainted, "importers of deleted source tainted");
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Replace a component's contracts and clear its members' taint in one
    /// transaction. A member whose modification time moved since the
    /// compile started stays tainted. Returns the number of taints cleared.
    pub fn commit_component(&self, commit: &ComponentCommit<'_>) -> SolsticeResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for member in commit.members {
            tx.execute(
                "DELETE FROM contracts WHERE dir = ?1 AND filename = ?2;",
                params![member.dir, member.filename],
            )?;
        }
        for contract in commit.contracts {
            put_contract(&tx, contract)?;
        }
        let mut cleared = 0;
        for member in commit.members {
            let ast = commit
                .asts
                .get(&member.path())
                .map(serde_json::to_string)
                .transpose()?;
            cleared += tx.execute(
                "UPDATE sources SET tainted = 0, unit_id = ?1, ast = COALESCE(?2, ast) \
                 WHERE dir = ?3 AND filename = ?4 AND mod_time = ?5;",
                params![commit.unit_id, ast, member.dir, member.filename, member.mod_time],
            )?;
        }
        tx.commit()?;
        Ok(cleared)
    }

    /// Replace the whole store content with `snapshot`.
    pub fn load_snapshot(&self, snapshot: &Snapshot) -> SolsticeResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute_batch("DELETE FROM contracts; DELETE FROM sources;")?;
        for source in &snapshot.sources {
            put_source(&tx, source)?;
        }
        for contract in &snapshot.contracts {
            put_contract(&tx, contract)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn snapshot(&self) -> SolsticeResult<Snapshot> {
        Ok(Snapshot {
            sources: self.list_sources()?,
            contracts: self.list_contracts()?,
        })
    }

    pub fn clear(&self) -> SolsticeResult<()> {
        self.conn
            .lock()
            .execute_batch("DELETE FROM contracts; DELETE FROM sources;")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SolsticeError;
    use crate::toolchain::solc::{ContractDefinition, ContractKind};

    fn source(path: &str, mod_time: i64, imports: &[&str]) -> Source {
        let key = SourceKey::from_path(path);
        Source {
            dir: key.dir,
            filename: key.filename,
            mod_time,
            tainted: true,
            version: vec!["^0.8.0".into()],
            imports: imports
                .iter()
                .map(|i| ImportTarget::Local(i.to_string()))
                .collect(),
            ast: None,
            unit: None,
        }
    }

    fn contract(path: &str, name: &str) -> Contract {
        let key = SourceKey::from_path(path);
        Contract {
            dir: key.dir,
            filename: key.filename,
            name: name.into(),
            abi: "[]".into(),
            bin: format!("bin-{name}"),
            bin_runtime: String::new(),
            src_map: String::new(),
            src_map_runtime: String::new(),
        }
    }

    fn add(source: Source) -> FileDiff {
        FileDiff {
            path: source.path(),
            kind: DiffKind::Add,
            mod_time: Some(source.mod_time),
            source: Some(source),
        }
    }

    fn delete(path: &str) -> FileDiff {
        FileDiff {
            path: path.into(),
            kind: DiffKind::Delete,
            mod_time: None,
            source: None,
        }
    }

    #[test]
    fn upsert_replaces_existing_source() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_source(&source("contracts/a.sol", 1, &[])).unwrap();
        let mut updated = source("contracts/a.sol", 2, &["contracts/b.sol"]);
        updated.tainted = false;
        store.upsert_source(&updated).unwrap();

        let sources = store.list_sources().unwrap();
        assert_eq!(sources, vec![updated.clone()]);
        assert_eq!(store.get_source(&updated.key()).unwrap(), Some(updated));
        assert!(store.list_tainted_sources().unwrap().is_empty());
    }

    #[test]
    fn contract_requires_owning_source() {
        let store = Store::open_in_memory().unwrap();
        let err = store.upsert_contract(&contract("contracts/a.sol", "A")).unwrap_err();
        assert!(matches!(err, SolsticeError::Store(_)));
    }

    #[test]
    fn apply_diffs_deletes_and_taints_importers() {
        let store = Store::open_in_memory().unwrap();
        store
            .apply_diffs(&[
                add(source("contracts/a.sol", 1, &[])),
                add(source("contracts/b.sol", 1, &["contracts/a.sol"])),
            ])
            .unwrap();
        let members = store.list_sources().unwrap();
        let contracts = vec![contract("contracts/a.sol", "A"), contract("contracts/b.sol", "B")];
        let cleared = store
            .commit_component(&ComponentCommit {
                unit_id: "u1",
                members: &members,
                contracts: &contracts,
                asts: &BTreeMap::new(),
            })
            .unwrap();
        assert_eq!(cleared, 2);
        assert!(store.list_tainted_sources().unwrap().is_empty());

        store.apply_diffs(&[delete("contracts/a.sol")]).unwrap();
        let left = store.list_sources().unwrap();
        assert_eq!(left.len(), 1);
        assert!(left[0].tainted, "importer of deleted file must be tainted");
        let names: Vec<String> = store.list_contracts().unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["B"]);
    }

    #[test]
    fn deleting_taints_importers_reached_through_remappings() {
        let store = Store::open_in_memory().unwrap();
        let mut b = source("contracts/b.sol", 1, &[]);
        b.imports = vec![ImportTarget::Named("@app/a.sol".into())];
        b.tainted = false;
        let mut a = source("contracts/a.sol", 1, &[]);
        a.tainted = false;
        store.apply_diffs(&[add(a), add(b)]).unwrap();

        let resolve = |import: &ImportTarget| match import {
            ImportTarget::Named(name) => name.strip_prefix("@app/").map(|rest| format!("contracts/{rest}")),
            ImportTarget::Local(path) => Some(path.clone()),
        };
        store.apply_diffs_with(&[delete("contracts/a.sol")], resolve).unwrap();
        let tainted = store.list_tainted_sources().unwrap();
        assert_eq!(tainted.len(), 1);
        assert_eq!(tainted[0].filename, "b.sol");
    }

    #[test]
    fn commit_replaces_previous_contracts_and_stores_ast() {
        let store = Store::open_in_memory().unwrap();
        store.apply_diffs(&[add(source("contracts/a.sol", 1, &[]))]).unwrap();
        let members = store.list_sources().unwrap();
        let first = vec![contract("contracts/a.sol", "Old")];
        store
            .commit_component(&ComponentCommit {
                unit_id: "u1",
                members: &members,
                contracts: &first,
                asts: &BTreeMap::new(),
            })
            .unwrap();

        let mut asts = BTreeMap::new();
        asts.insert(
            "contracts/a.sol".to_string(),
            SourceAst {
                contracts: vec![ContractDefinition {
                    name: "New".into(),
                    kind: ContractKind::Contract,
                    bases: vec![],
                }],
            },
        );
        let second = vec![contract("contracts/a.sol", "New")];
        store
            .commit_component(&ComponentCommit {
                unit_id: "u2",
                members: &members,
                contracts: &second,
                asts: &asts,
            })
            .unwrap();

        let key = SourceKey::from_path("contracts/a.sol");
        let stored = store.contracts_for_source(&key).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "New");
        let source = store.get_source(&key).unwrap().unwrap();
        assert_eq!(source.unit.as_deref(), Some("u2"));
        assert_eq!(source.ast.unwrap().contracts[0].name, "New");
        assert_eq!(store.find_contracts_by_name("New").unwrap().len(), 1);
    }

    #[test]
    fn commit_keeps_taint_when_source_moved_on() {
        let store = Store::open_in_memory().unwrap();
        store.apply_diffs(&[add(source("contracts/a.sol", 1, &[]))]).unwrap();
        let members = store.list_sources().unwrap();
        // modified again while the compile ran
        store
            .apply_diffs(&[FileDiff {
                kind: DiffKind::Modify,
                ..add(source("contracts/a.sol", 2, &[]))
            }])
            .unwrap();
        let cleared = store
            .commit_component(&ComponentCommit {
                unit_id: "u1",
                members: &members,
                contracts: &[],
                asts: &BTreeMap::new(),
            })
            .unwrap();
        assert_eq!(cleared, 0);
        assert_eq!(store.list_tainted_sources().unwrap().len(), 1);
    }

    #[test]
    fn snapshot_round_trips_through_fresh_store() {
        let store = Store::open_in_memory().unwrap();
        store
            .apply_diffs(&[
                add(source("contracts/a.sol", 1, &[])),
                add(source("contracts/tokens/b.sol", 3, &["contracts/a.sol"])),
            ])
            .unwrap();
        store.upsert_contract(&contract("contracts/a.sol", "A")).unwrap();
        let before = store.snapshot().unwrap();

        let fresh = Store::open_in_memory().unwrap();
        fresh.load_snapshot(&before).unwrap();
        assert_eq!(fresh.snapshot().unwrap(), before);
        assert_eq!(fresh.counts().unwrap(), (2, 1));

        fresh.clear().unwrap();
        assert_eq!(fresh.counts().unwrap(), (0, 0));
    }

    #[test]
    fn delete_source_reports_existence() {
        let store = Store::open_in_memory().unwrap();
        let a = source("a.sol", 1, &[]);
        store.upsert_source(&a).unwrap();
        assert!(store.delete_source(&a.key()).unwrap());
        assert!(!store.delete_source(&a.key()).unwrap());
    }
}
