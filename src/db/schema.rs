/// Schema for all persisted client state.
pub const SCHEMA: &str = r#"
-- One row per (asset class, cache version) partition
CREATE TABLE IF NOT EXISTS cache_namespaces (
    name TEXT PRIMARY KEY,
    asset_class TEXT NOT NULL,
    version TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Cached responses for idempotent requests
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    strategy TEXT NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (namespace, request_key)
);

-- Router bookkeeping (active cache version)
CREATE TABLE IF NOT EXISTS cache_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Current token pair; at most one row
CREATE TABLE IF NOT EXISTS credentials (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    access_token TEXT NOT NULL,
    refresh_token TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Pending submissions, delivered in seq order
CREATE TABLE IF NOT EXISTS upload_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    payload BLOB NOT NULL,
    metadata TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
"#;
