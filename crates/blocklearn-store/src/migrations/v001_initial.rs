//! v001 -- Scoped state table.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS scoped_state (
    scope      TEXT NOT NULL,               -- usually a room key
    key        TEXT NOT NULL,               -- e.g. "negotiation", "chat"
    value      TEXT NOT NULL,               -- JSON document
    updated_at TEXT NOT NULL,               -- RFC-3339

    PRIMARY KEY (scope, key)
);

CREATE INDEX IF NOT EXISTS idx_scoped_state_updated
    ON scoped_state(updated_at);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
