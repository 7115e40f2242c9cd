use rusqlite::Connection;

pub(crate) fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- Flat key/value namespace shared by every execution context that opens
        -- the same database. Keys carry their namespace as a prefix
        -- (`cache:`, `manifest:`, `class:`).
        CREATE TABLE IF NOT EXISTS kv (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL,
          version INTEGER NOT NULL DEFAULT 1,
          updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )?;

    // Databases created before entries were versioned only carry key/value.
    ensure_kv_columns(conn)?;

    Ok(())
}

fn ensure_kv_columns(conn: &Connection) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(kv)")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut existing = std::collections::HashSet::new();
    for name in rows {
        existing.insert(name?);
    }

    if !existing.contains("version") {
        conn.execute(
            "ALTER TABLE kv ADD COLUMN version INTEGER NOT NULL DEFAULT 1",
            [],
        )?;
    }
    if !existing.contains("updated_at") {
        conn.execute("ALTER TABLE kv ADD COLUMN updated_at TIMESTAMP", [])?;
    }

    Ok(())
}
