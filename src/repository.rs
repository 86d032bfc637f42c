//! Catalog and follow-registry seams.
//!
//! The program catalog and follow records belong to other services; the core
//! only reads them through these traits. `Database` implements both against
//! the local tables so a single SQLite file can host the whole system.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{from_millis, to_millis, Database};
use crate::error::Result;
use crate::models::{DeviceId, Program, ProgramId, Sensitivity, PROGRAM_TARGET};

/// Read access to the program catalog
pub trait ProgramCatalog: Send + Sync {
    /// Look up a program by id
    fn get_program(&self, id: ProgramId) -> Result<Option<Program>>;
}

/// Read access to follow records
pub trait FollowerRegistry: Send + Sync {
    /// Devices currently following the program
    fn list_follower_device_ids(&self, program_id: ProgramId) -> Result<Vec<DeviceId>>;
}

impl ProgramCatalog for Database {
    fn get_program(&self, id: ProgramId) -> Result<Option<Program>> {
        let conn = self.get_connection()?;
        Ok(conn
            .query_row(
                "SELECT id, channel_id, title, starts_at, ends_at FROM programs WHERE id = ?1",
                params![id],
                map_program,
            )
            .optional()?)
    }
}

impl FollowerRegistry for Database {
    fn list_follower_device_ids(&self, program_id: ProgramId) -> Result<Vec<DeviceId>> {
        let conn = self.get_connection()?;
        follower_device_ids(&conn, program_id)
    }
}

impl Database {
    /// Insert or replace a catalog entry
    pub fn upsert_program(&self, program: &Program) -> Result<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO programs (id, channel_id, title, starts_at, ends_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                channel_id = excluded.channel_id,
                title = excluded.title,
                starts_at = excluded.starts_at,
                ends_at = excluded.ends_at",
            params![
                program.id,
                program.channel_id,
                program.title,
                to_millis(program.starts_at),
                program.ends_at.map(to_millis),
            ],
        )?;
        Ok(())
    }

    /// Record that a device follows a program; returns false if it already did
    pub fn follow_program(&self, device_id: &str, program_id: ProgramId, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.get_connection()?;
        insert_follow(&conn, device_id, program_id, at)
    }

    /// Remove a follow record; returns false if none existed
    pub fn unfollow_program(&self, device_id: &str, program_id: ProgramId) -> Result<bool> {
        let conn = self.get_connection()?;
        let removed = conn.execute(
            "DELETE FROM followed_items WHERE device_id = ?1 AND target_type = ?2 AND target_id = ?3",
            params![device_id, PROGRAM_TARGET, program_id],
        )?;
        Ok(removed > 0)
    }

    /// Set a device's program-start notification tier
    pub fn set_notification_sensitivity(&self, device_id: &str, sensitivity: Sensitivity) -> Result<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO device_settings (device_id, notification_sensitivity) VALUES (?1, ?2)
             ON CONFLICT(device_id) DO UPDATE SET notification_sensitivity = excluded.notification_sensitivity",
            params![device_id, sensitivity],
        )?;
        Ok(())
    }

    /// A device's tier, `HIGH` when never configured
    pub fn notification_sensitivity(&self, device_id: &str) -> Result<Sensitivity> {
        let conn = self.get_connection()?;
        let stored: Option<Sensitivity> = conn
            .query_row(
                "SELECT notification_sensitivity FROM device_settings WHERE device_id = ?1",
                params![device_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stored.unwrap_or_default())
    }
}

/// Followers of a program on an existing connection or transaction
pub(crate) fn follower_device_ids(conn: &Connection, program_id: ProgramId) -> Result<Vec<DeviceId>> {
    let mut stmt = conn.prepare(
        "SELECT device_id FROM followed_items
         WHERE target_type = ?1 AND target_id = ?2
         ORDER BY device_id",
    )?;
    let ids = stmt
        .query_map(params![PROGRAM_TARGET, program_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<DeviceId>, _>>()?;
    Ok(ids)
}

/// Insert a follow record if absent
pub(crate) fn insert_follow(
    conn: &Connection,
    device_id: &str,
    program_id: ProgramId,
    at: DateTime<Utc>,
) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT INTO followed_items (device_id, target_type, target_id, created_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(device_id, target_type, target_id) DO NOTHING",
        params![device_id, PROGRAM_TARGET, program_id, to_millis(at)],
    )?;
    Ok(inserted > 0)
}

/// Map a `programs` row selected as (id, channel_id, title, starts_at, ends_at)
pub(crate) fn map_program(row: &Row<'_>) -> rusqlite::Result<Program> {
    Ok(Program {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        title: row.get(2)?,
        starts_at: from_millis(row.get(3)?),
        ends_at: row.get::<_, Option<i64>>(4)?.map(from_millis),
    })
}
