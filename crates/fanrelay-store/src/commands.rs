use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, instrument};

use fanrelay_core::{Command, CommandId, DeviceId, NewCommand};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// The store operations the delivery path depends on.
///
/// `CommandRepo` is the SQLite implementation; tests substitute their own.
pub trait CommandStore: Send + Sync {
    /// Persist a new, undelivered command and return the stored row.
    fn insert(&self, command: &NewCommand) -> Result<Command, StoreError>;

    /// Undelivered commands for one device, oldest first (`created_at`, then `id`).
    fn undelivered_for_device(&self, device_id: &DeviceId) -> Result<Vec<Command>, StoreError>;

    /// Flip `delivered` to true. Returns `false` if the command does not
    /// exist or was already delivered.
    fn mark_delivered(&self, id: CommandId) -> Result<bool, StoreError>;
}

const COLUMNS: &str = "id, device_id, command_type, payload, delivered, created_at";

/// Column values as read, before the payload JSON is parsed.
struct RawCommand {
    id: i64,
    device_id: String,
    command_type: String,
    payload: String,
    delivered: bool,
    created_at: String,
}

impl RawCommand {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            device_id: row.get(1)?,
            command_type: row.get(2)?,
            payload: row.get(3)?,
            delivered: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_command(self) -> Result<Command, StoreError> {
        Ok(Command {
            id: CommandId(self.id),
            device_id: DeviceId::from_raw(self.device_id),
            command_type: self.command_type,
            payload: row_helpers::parse_json(&self.payload, "commands", "payload")?,
            delivered: self.delivered,
            created_at: self.created_at,
        })
    }
}

pub struct CommandRepo {
    db: Database,
}

impl CommandRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get a command by ID.
    #[instrument(skip(self), fields(command_id = %id))]
    pub fn get(&self, id: CommandId) -> Result<Command, StoreError> {
        let raw = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM commands WHERE id = ?1"),
                    [id.0],
                    RawCommand::from_row,
                )
                .optional()?)
        })?;
        raw.ok_or_else(|| StoreError::NotFound(format!("command {id}")))?
            .into_command()
    }

    /// Most recent commands for a device regardless of delivery state, newest first.
    #[instrument(skip(self), fields(device_id = %device_id))]
    pub fn recent_for_device(
        &self,
        device_id: &DeviceId,
        limit: u32,
    ) -> Result<Vec<Command>, StoreError> {
        let limit = row_helpers::clamp_limit(limit, 500);
        let raws = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM commands WHERE device_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![device_id.as_str(), limit], RawCommand::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        raws.into_iter().map(RawCommand::into_command).collect()
    }
}

impl CommandStore for CommandRepo {
    #[instrument(skip(self, command), fields(device_id = %command.device_id, command_type = %command.command_type))]
    fn insert(&self, command: &NewCommand) -> Result<Command, StoreError> {
        let payload = serde_json::to_string(&command.payload)?;
        let now = row_helpers::timestamp_now();

        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO commands (device_id, command_type, payload, delivered, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4)",
                params![command.device_id.as_str(), command.command_type, payload, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        debug!(command_id = id, "command stored");

        Ok(Command {
            id: CommandId(id),
            device_id: command.device_id.clone(),
            command_type: command.command_type.clone(),
            payload: command.payload.clone(),
            delivered: false,
            created_at: now,
        })
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    fn undelivered_for_device(&self, device_id: &DeviceId) -> Result<Vec<Command>, StoreError> {
        let raws = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM commands WHERE device_id = ?1 AND delivered = 0
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt
                .query_map([device_id.as_str()], RawCommand::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        raws.into_iter().map(RawCommand::into_command).collect()
    }

    #[instrument(skip(self), fields(command_id = %id))]
    fn mark_delivered(&self, id: CommandId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE commands SET delivered = 1 WHERE id = ?1 AND delivered = 0",
                [id.0],
            )?;
            Ok(changed == 1)
        })
    }
}
