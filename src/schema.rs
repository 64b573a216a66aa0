pub const SCHEMA_VERSION: &str = "1";

pub const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '1');

-- Jobs table is the persisted maintenance work queue
CREATE TABLE IF NOT EXISTS jobs (
    job_id INTEGER PRIMARY KEY AUTOINCREMENT,
    status INTEGER NOT NULL,            -- 0 = Pending, 1 = Running, 2 = Completed, 3 = Failed
    scope_type TEXT NOT NULL,           -- e.g. 'project'
    scope_id TEXT NOT NULL,
    tasks TEXT NOT NULL,                -- JSON array of unique task identifiers
    created_at INTEGER NOT NULL,        -- Unix ms (UTC)
    started_at INTEGER DEFAULT NULL,    -- Unix ms, set by the pending -> running transition
    completed_at INTEGER DEFAULT NULL,  -- Unix ms, set by any terminal transition
    error TEXT DEFAULT NULL,            -- Failure or cancellation reason
    result TEXT DEFAULT NULL            -- Optional result reported on completion
);

CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs (status, created_at, job_id);
CREATE INDEX IF NOT EXISTS idx_jobs_scope_completed ON jobs (scope_type, scope_id, status, completed_at);

-- Append-only outcome log, chained per session through preceding_id
CREATE TABLE IF NOT EXISTS outcome_events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    outcome INTEGER NOT NULL,           -- 0 = Success, 1 = Failure, 2 = Partial
    input TEXT NOT NULL,                -- Redacted, truncated tool input
    message TEXT NOT NULL,              -- Redacted, truncated tool output or error
    preceding_id INTEGER DEFAULT NULL,  -- Most recent event in the session at insert time
    analyzed BOOLEAN NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL         -- Unix ms (UTC)
);

CREATE INDEX IF NOT EXISTS idx_outcome_events_session_recent
    ON outcome_events (session_id, created_at DESC, event_id DESC);

-- Per-session batch counters. last_analysis_count only advances by compare-and-swap
CREATE TABLE IF NOT EXISTS session_counters (
    session_id TEXT PRIMARY KEY,
    tool_count INTEGER NOT NULL DEFAULT 0,
    last_analysis_count INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL,
    CHECK (last_analysis_count <= tool_count)
);

COMMIT;
"#;
