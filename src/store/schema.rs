// SPDX-License-Identifier: MPL-2.0

/// SQL schema for the local state database
pub const SCHEMA: &str = r#"
-- Database version for migrations
PRAGMA user_version = 1;

-- local_state: one serialized blob per profile key
CREATE TABLE IF NOT EXISTS local_state (
    key TEXT PRIMARY KEY,
    blob TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;
