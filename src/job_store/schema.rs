//! Database schema for jobs.db.

use anyhow::Result;
use rusqlite::Connection;

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 0
// =============================================================================

const JOBS_TABLE_V0: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("job_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("owner_id", &SqlType::Text, non_null = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!(
            "paused",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("last_updated_at", &SqlType::Integer, non_null = true),
        sqlite_column!("ended_at", &SqlType::Integer),
        sqlite_column!("progress", &SqlType::Text, non_null = true),
        sqlite_column!("message", &SqlType::Text),
        sqlite_column!("pause_reason", &SqlType::Text),
    ],
    indices: &[("idx_jobs_owner_kind", "owner_id, kind")],
    unique_constraints: &[],
};

/// One row per (owner, surface) naming the job currently in progress.
const ACTIVE_POINTERS_TABLE_V0: Table = Table {
    name: "active_pointers",
    columns: &[
        sqlite_column!("owner_id", &SqlType::Text, non_null = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("job_id", &SqlType::Text, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[&["owner_id", "kind"]],
};

// =============================================================================
// Version 1 - resume context
// =============================================================================

const JOBS_TABLE_V1: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("job_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("owner_id", &SqlType::Text, non_null = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!(
            "paused",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("last_updated_at", &SqlType::Integer, non_null = true),
        sqlite_column!("ended_at", &SqlType::Integer),
        sqlite_column!("progress", &SqlType::Text, non_null = true),
        sqlite_column!("message", &SqlType::Text),
        sqlite_column!("pause_reason", &SqlType::Text),
        sqlite_column!("resume_context", &SqlType::Text),
    ],
    indices: &[("idx_jobs_owner_kind", "owner_id, kind")],
    unique_constraints: &[],
};

fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
    conn.execute("ALTER TABLE jobs ADD COLUMN resume_context TEXT", [])?;
    Ok(())
}

pub const JOB_STORE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 0,
        tables: &[JOBS_TABLE_V0, ACTIVE_POINTERS_TABLE_V0],
        migration: None,
    },
    VersionedSchema {
        version: 1,
        tables: &[JOBS_TABLE_V1, ACTIVE_POINTERS_TABLE_V0],
        migration: Some(migrate_v0_to_v1),
    },
];
