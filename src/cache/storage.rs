//! Cache storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::Mutex;

use super::traits::{RequestKey, ResponseSnapshot};
use crate::db::Database;
use crate::error::{AgentError, Result};

/// Trait for cache storage backends.
///
/// Partitions are created implicitly: writing into a name that does not
/// exist yet creates it.
pub trait CacheStorage: Send + Sync {
  /// Make sure a partition exists.
  fn open(&self, partition: &str) -> Result<()>;

  /// Store (or overwrite) a response snapshot.
  fn put(&self, partition: &str, key: &RequestKey, snapshot: &ResponseSnapshot) -> Result<()>;

  /// Exact-key lookup within one partition.
  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<ResponseSnapshot>>;

  /// Exact-key lookup across every partition, oldest partition first.
  fn match_any(&self, key: &RequestKey) -> Result<Option<ResponseSnapshot>>;

  /// Names of all existing partitions, in creation order.
  fn partitions(&self) -> Result<Vec<String>>;

  /// Delete a partition with everything in it. Returns whether it existed.
  fn delete(&self, partition: &str) -> Result<bool>;

  /// Read a single JSON value stored in a partition.
  fn get_value(&self, partition: &str, key: &str) -> Result<Option<String>>;

  /// Replace a single JSON value stored in a partition.
  fn put_value(&self, partition: &str, key: &str, value: &str) -> Result<()>;

  /// Delete every partition. Returns how many were removed.
  fn delete_all(&self) -> Result<usize> {
    let mut removed = 0;
    for name in self.partitions()? {
      if self.delete(&name)? {
        removed += 1;
      }
    }
    Ok(removed)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Mutex<Database>,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db: Mutex::new(db) }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Database>> {
    self
      .db
      .lock()
      .map_err(|e| AgentError::Storage(format!("Lock poisoned: {}", e)))
  }
}

fn ensure_partition(db: &Database, partition: &str) -> Result<()> {
  db.conn().execute(
    "INSERT OR IGNORE INTO partitions (name, created_at) VALUES (?, ?)",
    params![partition, Utc::now().to_rfc3339()],
  )?;
  Ok(())
}

fn row_to_snapshot(
  status: u16,
  headers: String,
  body: Vec<u8>,
  stored_at: String,
) -> Result<ResponseSnapshot> {
  Ok(ResponseSnapshot {
    status,
    headers: serde_json::from_str(&headers)?,
    body,
    stored_at: parse_datetime(&stored_at)?,
  })
}

type SnapshotRow = (u16, String, Vec<u8>, String);

impl CacheStorage for SqliteStorage {
  fn open(&self, partition: &str) -> Result<()> {
    let db = self.lock()?;
    ensure_partition(&db, partition)
  }

  fn put(&self, partition: &str, key: &RequestKey, snapshot: &ResponseSnapshot) -> Result<()> {
    let db = self.lock()?;
    ensure_partition(&db, partition)?;

    let headers = serde_json::to_string(&snapshot.headers)?;
    db.conn().execute(
      "INSERT OR REPLACE INTO cache_entries
         (partition, request_key, request_desc, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        partition,
        key.hash,
        key.desc,
        snapshot.status,
        headers,
        snapshot.body,
        snapshot.stored_at.to_rfc3339()
      ],
    )?;

    Ok(())
  }

  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<ResponseSnapshot>> {
    let db = self.lock()?;

    let row: Option<SnapshotRow> = db
      .conn()
      .query_row(
        "SELECT status, headers, body, stored_at FROM cache_entries
         WHERE partition = ? AND request_key = ?",
        params![partition, key.hash],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    row
      .map(|(status, headers, body, stored_at)| row_to_snapshot(status, headers, body, stored_at))
      .transpose()
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<ResponseSnapshot>> {
    let db = self.lock()?;

    let row: Option<SnapshotRow> = db
      .conn()
      .query_row(
        "SELECT ce.status, ce.headers, ce.body, ce.stored_at FROM cache_entries ce
         INNER JOIN partitions p ON p.name = ce.partition
         WHERE ce.request_key = ?
         ORDER BY p.rowid
         LIMIT 1",
        params![key.hash],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    row
      .map(|(status, headers, body, stored_at)| row_to_snapshot(status, headers, body, stored_at))
      .transpose()
  }

  fn partitions(&self) -> Result<Vec<String>> {
    let db = self.lock()?;
    let mut stmt = db
      .conn()
      .prepare("SELECT name FROM partitions ORDER BY rowid")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
  }

  fn delete(&self, partition: &str) -> Result<bool> {
    let mut db = self.lock()?;
    let tx = db_transaction(&mut db)?;

    tx.execute(
      "DELETE FROM cache_entries WHERE partition = ?",
      params![partition],
    )?;
    tx.execute(
      "DELETE FROM partition_values WHERE partition = ?",
      params![partition],
    )?;
    let removed = tx.execute("DELETE FROM partitions WHERE name = ?", params![partition])?;

    tx.commit()?;
    Ok(removed > 0)
  }

  fn get_value(&self, partition: &str, key: &str) -> Result<Option<String>> {
    let db = self.lock()?;
    let value = db
      .conn()
      .query_row(
        "SELECT data FROM partition_values WHERE partition = ? AND value_key = ?",
        params![partition, key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn put_value(&self, partition: &str, key: &str, value: &str) -> Result<()> {
    let db = self.lock()?;
    ensure_partition(&db, partition)?;
    db.conn().execute(
      "INSERT OR REPLACE INTO partition_values (partition, value_key, data, updated_at)
       VALUES (?, ?, ?, ?)",
      params![partition, key, value, Utc::now().to_rfc3339()],
    )?;
    Ok(())
  }
}

fn db_transaction(db: &mut Database) -> Result<rusqlite::Transaction<'_>> {
  Ok(db.conn_mut().transaction()?)
}

/// Storage kept entirely in process memory.
#[derive(Default)]
pub struct MemoryStorage {
  partitions: Mutex<Vec<MemoryPartition>>,
}

#[derive(Default)]
struct MemoryPartition {
  name: String,
  entries: Vec<(String, ResponseSnapshot)>,
  values: Vec<(String, String)>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_partitions<R>(&self, f: impl FnOnce(&mut Vec<MemoryPartition>) -> R) -> Result<R> {
    let mut guard = self
      .partitions
      .lock()
      .map_err(|e| AgentError::Storage(format!("Lock poisoned: {}", e)))?;
    Ok(f(&mut guard))
  }
}

fn partition_mut<'a>(all: &'a mut Vec<MemoryPartition>, name: &str) -> &'a mut MemoryPartition {
  if let Some(idx) = all.iter().position(|p| p.name == name) {
    &mut all[idx]
  } else {
    all.push(MemoryPartition {
      name: name.to_string(),
      ..Default::default()
    });
    let last = all.len() - 1;
    &mut all[last]
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, partition: &str) -> Result<()> {
    self.with_partitions(|all| {
      partition_mut(all, partition);
    })
  }

  fn put(&self, partition: &str, key: &RequestKey, snapshot: &ResponseSnapshot) -> Result<()> {
    self.with_partitions(|all| {
      let p = partition_mut(all, partition);
      match p.entries.iter_mut().find(|(k, _)| *k == key.hash) {
        Some((_, existing)) => *existing = snapshot.clone(),
        None => p.entries.push((key.hash.clone(), snapshot.clone())),
      }
    })
  }

  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<ResponseSnapshot>> {
    self.with_partitions(|all| {
      all
        .iter()
        .find(|p| p.name == partition)
        .and_then(|p| p.entries.iter().find(|(k, _)| *k == key.hash))
        .map(|(_, snap)| snap.clone())
    })
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<ResponseSnapshot>> {
    self.with_partitions(|all| {
      all
        .iter()
        .find_map(|p| p.entries.iter().find(|(k, _)| *k == key.hash))
        .map(|(_, snap)| snap.clone())
    })
  }

  fn partitions(&self) -> Result<Vec<String>> {
    self.with_partitions(|all| all.iter().map(|p| p.name.clone()).collect())
  }

  fn delete(&self, partition: &str) -> Result<bool> {
    self.with_partitions(|all| {
      let before = all.len();
      all.retain(|p| p.name != partition);
      all.len() != before
    })
  }

  fn get_value(&self, partition: &str, key: &str) -> Result<Option<String>> {
    self.with_partitions(|all| {
      all
        .iter()
        .find(|p| p.name == partition)
        .and_then(|p| p.values.iter().find(|(k, _)| k == key))
        .map(|(_, v)| v.clone())
    })
  }

  fn put_value(&self, partition: &str, key: &str, value: &str) -> Result<()> {
    self.with_partitions(|all| {
      let p = partition_mut(all, partition);
      match p.values.iter_mut().find(|(k, _)| k == key) {
        Some((_, existing)) => *existing = value.to_string(),
        None => p.values.push((key.to_string(), value.to_string())),
      }
    })
  }
}

/// Parse an RFC3339 timestamp written by this store.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| AgentError::Storage(format!("Failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
pub mod testing {
  use super::*;

  /// Store whose value writes always fail, as a full disk would.
  pub struct ReadOnlyValues(pub MemoryStorage);

  impl CacheStorage for ReadOnlyValues {
    fn open(&self, partition: &str) -> Result<()> {
      self.0.open(partition)
    }
    fn put(&self, partition: &str, key: &RequestKey, snapshot: &ResponseSnapshot) -> Result<()> {
      self.0.put(partition, key, snapshot)
    }
    fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<ResponseSnapshot>> {
      self.0.get(partition, key)
    }
    fn match_any(&self, key: &RequestKey) -> Result<Option<ResponseSnapshot>> {
      self.0.match_any(key)
    }
    fn partitions(&self) -> Result<Vec<String>> {
      self.0.partitions()
    }
    fn delete(&self, partition: &str) -> Result<bool> {
      self.0.delete(partition)
    }
    fn get_value(&self, partition: &str, key: &str) -> Result<Option<String>> {
      self.0.get_value(partition, key)
    }
    fn put_value(&self, _partition: &str, _key: &str, _value: &str) -> Result<()> {
      Err(AgentError::Storage("disk full".into()))
    }
  }
}
