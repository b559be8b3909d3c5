/// Schema for every durable key-space the agent owns.
///
/// `seq` columns are AUTOINCREMENT so they never reuse a value; insertion
/// order is recovered by ordering on them.
pub const SCHEMA: &str = r#"
-- Read-through cache stores (images-cache, api-cache, ...)
CREATE TABLE IF NOT EXISTS cache_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    store_name TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    UNIQUE (store_name, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_store
    ON cache_entries(store_name, seq);

-- Pending mutations, one store per domain (offline-queue, gamification-pending, ...)
CREATE TABLE IF NOT EXISTS queued_mutations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL,
    store_name TEXT NOT NULL,
    domain TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (store_name, id)
);

CREATE INDEX IF NOT EXISTS idx_queued_mutations_store
    ON queued_mutations(store_name, seq);

-- Durable JSON lists (failed-syncs)
CREATE TABLE IF NOT EXISTS list_items (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    list_key TEXT NOT NULL,
    payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_list_items_key ON list_items(list_key, seq);

-- Small settings such as the last successful sync time
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
