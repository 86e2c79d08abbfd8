use rusqlite::Connection;

use fl_domain::Result;

use crate::storage;

// Schema version (increment when changing table definitions).
pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<()> {
    let current: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(storage)?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id               TEXT PRIMARY KEY,
            workspace_id     TEXT NOT NULL,
            origin           TEXT NOT NULL,
            user_id          TEXT,
            external_channel TEXT,
            external_thread  TEXT,
            title            TEXT NOT NULL,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_thread
            ON sessions(workspace_id, origin, external_channel, external_thread)
            WHERE external_channel IS NOT NULL AND external_thread IS NOT NULL;

        CREATE INDEX IF NOT EXISTS idx_sessions_workspace
            ON sessions(workspace_id, updated_at DESC);

        CREATE TABLE IF NOT EXISTS turns (
            id             TEXT PRIMARY KEY,
            session_id     TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            user_message   TEXT NOT NULL,
            final_response TEXT,
            status         TEXT NOT NULL,
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id, created_at);

        CREATE TABLE IF NOT EXISTS turn_steps (
            id          TEXT PRIMARY KEY,
            turn_id     TEXT NOT NULL REFERENCES turns(id) ON DELETE CASCADE,
            step_type   TEXT NOT NULL,
            tool_name   TEXT,
            content     TEXT,
            step_status TEXT NOT NULL,
            sequence    INTEGER NOT NULL,
            created_at  TEXT NOT NULL,
            UNIQUE (turn_id, sequence)
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id                TEXT PRIMARY KEY,
            workspace_id      TEXT NOT NULL,
            turn_id           TEXT NOT NULL UNIQUE REFERENCES turns(id) ON DELETE CASCADE,
            status            TEXT NOT NULL,
            retries           INTEGER NOT NULL DEFAULT 0,
            max_retries       INTEGER NOT NULL DEFAULT 3,
            backoff_until     TEXT,
            priority          INTEGER NOT NULL DEFAULT 0,
            requested_context TEXT NOT NULL,
            started_at        TEXT,
            finished_at       TEXT,
            error             TEXT,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, started_at);

        CREATE TABLE IF NOT EXISTS quota_counters (
            workspace_id TEXT NOT NULL,
            resource     TEXT NOT NULL,
            window_key   TEXT NOT NULL,
            count        INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (workspace_id, resource, window_key)
        );

        CREATE TABLE IF NOT EXISTS security_events (
            id             TEXT PRIMARY KEY,
            workspace_id   TEXT NOT NULL,
            classification TEXT NOT NULL,
            message_prefix TEXT NOT NULL,
            reason         TEXT,
            created_at     TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_security_workspace
            ON security_events(workspace_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS feedback (
            id         TEXT PRIMARY KEY,
            turn_id    TEXT NOT NULL REFERENCES turns(id) ON DELETE CASCADE,
            user_id    TEXT NOT NULL,
            score      INTEGER NOT NULL,
            comment    TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (turn_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS integrations (
            id               TEXT PRIMARY KEY,
            workspace_id     TEXT NOT NULL,
            provider         TEXT NOT NULL,
            capabilities     TEXT NOT NULL,
            credentials_json TEXT NOT NULL,
            healthy          INTEGER NOT NULL DEFAULT 1,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL,
            UNIQUE (workspace_id, provider)
        );

        CREATE TABLE IF NOT EXISTS llm_configs (
            workspace_id     TEXT PRIMARY KEY,
            provider         TEXT NOT NULL,
            model            TEXT NOT NULL,
            credentials_json TEXT,
            healthy          INTEGER NOT NULL DEFAULT 1,
            updated_at       TEXT NOT NULL
        );
        "#,
    )
    .map_err(storage)?;

    if current != SCHEMA_VERSION {
        conn.execute(&format!("PRAGMA user_version = {SCHEMA_VERSION}"), [])
            .map_err(storage)?;
    }

    Ok(())
}
