/// Schema for the partitioned response cache.
pub const SCHEMA: &str = r#"
-- Known partitions (created implicitly on first open)
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Response snapshots keyed by hashed request key
CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    request_key TEXT NOT NULL,
    request_desc TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (partition, request_key),
    FOREIGN KEY (partition) REFERENCES partitions(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_key ON cache_entries(request_key);

-- Single JSON values stored inside a partition (the offline queue lives here)
CREATE TABLE IF NOT EXISTS partition_values (
    partition TEXT NOT NULL,
    value_key TEXT NOT NULL,
    data TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (partition, value_key),
    FOREIGN KEY (partition) REFERENCES partitions(name) ON DELETE CASCADE
);
"#;
