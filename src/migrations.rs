//! Versioned migrations of the persisted key/value state.
//!
//! The stored version lives under [`LAST_MIGRATION_KEY`]. Each step is keyed
//! by the version it starts from, and the chain runs until no step matches
//! the stored version. A step and its version bump commit together, so a
//! failing step leaves the version at the last completed step.

use crate::db::{LAST_MIGRATION_KEY, REFRESH_SCHEDULE_KEY, get_value, remove_value, set_value};
use crate::error::SyncError;
use log::{error, info};
use rusqlite::Connection;

const LEGACY_REFRESH_SCHEDULE_KEY: &str = "refresh-interval-v2";

pub struct MigrationStep {
    pub from: u32,
    pub to: u32,
    pub name: &'static str,
    pub migrate: fn(&Connection) -> Result<(), SyncError>,
}

pub const MIGRATION_STEPS: &[MigrationStep] = &[MigrationStep {
    from: 0,
    to: 1,
    name: "rename refresh-interval-v2",
    migrate: rename_refresh_schedule_key,
}];

fn rename_refresh_schedule_key(conn: &Connection) -> Result<(), SyncError> {
    remove_value(conn, REFRESH_SCHEDULE_KEY)?;
    if let Some(v) = get_value(conn, LEGACY_REFRESH_SCHEDULE_KEY)? {
        set_value(conn, REFRESH_SCHEDULE_KEY, &v)?;
        remove_value(conn, LEGACY_REFRESH_SCHEDULE_KEY)?;
    }
    Ok(())
}

pub fn stored_version(conn: &Connection) -> Result<u32, SyncError> {
    let Some(raw) = get_value(conn, LAST_MIGRATION_KEY)? else {
        return Ok(0);
    };
    // Never treated as version 0: step 0 rewrites the schedule key.
    raw.trim().parse::<u32>().map_err(|_| SyncError::Migration {
        from: 0,
        to: 0,
        message: format!("unreadable {LAST_MIGRATION_KEY} value {raw:?}"),
    })
}

fn step_for(steps: &[MigrationStep], version: u32) -> Option<&MigrationStep> {
    steps.iter().find(|s| s.from == version)
}

pub fn is_migration_available(conn: &Connection) -> Result<bool, SyncError> {
    Ok(step_for(MIGRATION_STEPS, stored_version(conn)?).is_some())
}

/// Runs the built-in chain. Returns the version the store ends at.
pub fn run_migrations(conn: &mut Connection) -> Result<u32, SyncError> {
    run_steps(conn, MIGRATION_STEPS)
}

pub fn run_steps(conn: &mut Connection, steps: &[MigrationStep]) -> Result<u32, SyncError> {
    let mut version = stored_version(conn)?;
    while let Some(step) = step_for(steps, version) {
        if step.to <= step.from {
            return Err(SyncError::Migration {
                from: step.from,
                to: step.to,
                message: "step does not advance the version".to_string(),
            });
        }
        info!("Running migration {} -> {} ({})", step.from, step.to, step.name);

        let tx = conn.transaction()?;
        let applied = (step.migrate)(&tx)
            .and_then(|()| set_value(&tx, LAST_MIGRATION_KEY, &step.to.to_string()));
        if let Err(e) = applied {
            error!("Migration {} -> {} failed: {e}", step.from, step.to);
            // Dropping the transaction rolls the step back.
            drop(tx);
            return Err(SyncError::Migration {
                from: step.from,
                to: step.to,
                message: e.to_string(),
            });
        }
        tx.commit()?;
        version = step.to;
    }
    Ok(version)
}
