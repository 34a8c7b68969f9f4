//! Declarative schema. Every table is natural-keyed; numeric ids exist only
//! so foreign keys stay cheap. Statements are idempotent so re-opening an
//! existing database is a no-op.

use sqlx::SqliteConnection;

use crate::Result;

const SCHEMA: &[&str] = &[
    // Feed identities, seeded from the source registry.
    "CREATE TABLE IF NOT EXISTS sources (
        id INTEGER PRIMARY KEY,
        code TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        scope TEXT,
        default_url TEXT,
        format TEXT,
        mode TEXT NOT NULL DEFAULT 'mandates',
        min_records INTEGER,
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    // Run lifecycle. A crash mid-ingest leaves a discoverable 'running' row.
    "CREATE TABLE IF NOT EXISTS ingestion_runs (
        id INTEGER PRIMARY KEY,
        source_id INTEGER NOT NULL REFERENCES sources(id),
        status TEXT NOT NULL,
        url TEXT,
        message TEXT,
        records_seen INTEGER NOT NULL DEFAULT 0,
        records_loaded INTEGER NOT NULL DEFAULT 0,
        started_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        finished_at TEXT,
        fetched_at TEXT,
        raw_path TEXT
    )",
    // Physical fetch provenance, 1:1 with the run and overwritable.
    "CREATE TABLE IF NOT EXISTS raw_fetches (
        run_id INTEGER NOT NULL UNIQUE REFERENCES ingestion_runs(id),
        url TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        content_type TEXT,
        bytes INTEGER NOT NULL DEFAULT 0,
        fetched_at TEXT,
        raw_path TEXT
    )",
    // Cross-run fetch log, deduplicated by exact content.
    "CREATE TABLE IF NOT EXISTS fetch_log (
        source_id INTEGER NOT NULL REFERENCES sources(id),
        content_hash TEXT NOT NULL,
        url TEXT NOT NULL,
        content_type TEXT,
        bytes INTEGER NOT NULL DEFAULT 0,
        first_seen_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (source_id, content_hash)
    )",
    // One raw unit fetched from a feed; payload and hash refresh on
    // re-ingestion of the same natural key, identity never changes.
    "CREATE TABLE IF NOT EXISTS source_records (
        id INTEGER PRIMARY KEY,
        source_id INTEGER NOT NULL REFERENCES sources(id),
        source_record_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        content_hash TEXT,
        snapshot_date TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (source_id, source_record_id)
    )",
    "CREATE TABLE IF NOT EXISTS admin_levels (
        id INTEGER PRIMARY KEY,
        key TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS roles (
        id INTEGER PRIMARY KEY,
        key TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS genders (
        id INTEGER PRIMARY KEY,
        key TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS parties (
        id INTEGER PRIMARY KEY,
        key TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS institutions (
        id INTEGER PRIMARY KEY,
        key TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS territories (
        id INTEGER PRIMARY KEY,
        key TEXT NOT NULL UNIQUE,
        code TEXT,
        name TEXT
    )",
    "CREATE TABLE IF NOT EXISTS persons (
        id INTEGER PRIMARY KEY,
        person_key TEXT NOT NULL UNIQUE,
        full_name TEXT NOT NULL,
        birth_date TEXT,
        territory_code TEXT,
        gender_id INTEGER REFERENCES genders(id),
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    // Links each source record to its resolved person identity.
    "CREATE TABLE IF NOT EXISTS person_identifiers (
        source_id INTEGER NOT NULL REFERENCES sources(id),
        source_record_id TEXT NOT NULL,
        person_id INTEGER NOT NULL REFERENCES persons(id),
        UNIQUE (source_id, source_record_id)
    )",
    "CREATE TABLE IF NOT EXISTS mandates (
        id INTEGER PRIMARY KEY,
        source_id INTEGER NOT NULL REFERENCES sources(id),
        source_record_id TEXT NOT NULL,
        person_id INTEGER NOT NULL REFERENCES persons(id),
        institution_id INTEGER NOT NULL REFERENCES institutions(id),
        role_id INTEGER REFERENCES roles(id),
        territory_id INTEGER REFERENCES territories(id),
        admin_level_id INTEGER REFERENCES admin_levels(id),
        party_id INTEGER REFERENCES parties(id),
        start_date TEXT,
        end_date TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        source_record_pk INTEGER NOT NULL REFERENCES source_records(id),
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (source_id, source_record_id)
    )",
    // Canonical domain events, produced only by the mapping engine.
    "CREATE TABLE IF NOT EXISTS policy_events (
        id INTEGER PRIMARY KEY,
        event_id TEXT NOT NULL UNIQUE,
        family TEXT NOT NULL,
        title TEXT NOT NULL,
        event_date TEXT,
        published_date TEXT,
        source_url TEXT NOT NULL,
        source_record_pk INTEGER NOT NULL REFERENCES source_records(id),
        source_snapshot_date TEXT,
        raw_payload TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS money_records (
        id INTEGER PRIMARY KEY,
        event_id TEXT NOT NULL UNIQUE,
        family TEXT NOT NULL,
        title TEXT NOT NULL,
        amount REAL,
        currency TEXT,
        event_date TEXT,
        published_date TEXT,
        source_url TEXT NOT NULL,
        source_record_pk INTEGER NOT NULL REFERENCES source_records(id),
        source_snapshot_date TEXT,
        raw_payload TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS indicator_series (
        id INTEGER PRIMARY KEY,
        series_key TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        unit TEXT
    )",
    "CREATE TABLE IF NOT EXISTS indicator_points (
        series_id INTEGER NOT NULL REFERENCES indicator_series(id),
        period TEXT NOT NULL,
        value REAL NOT NULL,
        source_url TEXT NOT NULL,
        source_record_pk INTEGER NOT NULL REFERENCES source_records(id),
        UNIQUE (series_id, period)
    )",
];

pub async fn ensure_schema(conn: &mut SqliteConnection) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut *conn).await?;
    }
    Ok(())
}
