use rusqlite::{params, Row};
use tracing::instrument;

use fanrelay_core::{DeviceId, NewReading, TelemetryReading};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Upper bound for a single `recent` query.
pub const MAX_RECENT: u32 = 500;

const COLUMNS: &str = "id, device_id, temperature, humidity, fan_rpm, received_at";

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<TelemetryReading> {
    Ok(TelemetryReading {
        id: row.get(0)?,
        device_id: DeviceId::from_raw(row.get::<_, String>(1)?),
        temperature: row.get(2)?,
        humidity: row.get(3)?,
        fan_rpm: row.get(4)?,
        received_at: row.get(5)?,
    })
}

/// Append-only telemetry table.
pub struct ReadingRepo {
    db: Database,
}

impl ReadingRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a reading, stamping it with the server receive time.
    #[instrument(skip(self, reading), fields(device_id = %reading.device_id))]
    pub fn insert(&self, reading: &NewReading) -> Result<TelemetryReading, StoreError> {
        let now = row_helpers::timestamp_now();
        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO telemetry (device_id, temperature, humidity, fan_rpm, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    reading.device_id.as_str(),
                    reading.temperature,
                    reading.humidity,
                    reading.fan_rpm,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        Ok(TelemetryReading {
            id,
            device_id: reading.device_id.clone(),
            temperature: reading.temperature,
            humidity: reading.humidity,
            fan_rpm: reading.fan_rpm,
            received_at: now,
        })
    }

    /// Most recent readings, newest first. With `device_id = None` the
    /// query spans every device.
    #[instrument(skip(self))]
    pub fn recent(
        &self,
        device_id: Option<&DeviceId>,
        limit: u32,
    ) -> Result<Vec<TelemetryReading>, StoreError> {
        let limit = row_helpers::clamp_limit(limit, MAX_RECENT);
        self.db.with_conn(|conn| {
            let rows = match device_id {
                Some(device_id) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLUMNS} FROM telemetry WHERE device_id = ?1
                         ORDER BY received_at DESC, id DESC LIMIT ?2"
                    ))?;
                    let rows = stmt
                        .query_map(params![device_id.as_str(), limit], reading_from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLUMNS} FROM telemetry ORDER BY received_at DESC, id DESC LIMIT ?1"
                    ))?;
                    let rows = stmt
                        .query_map([limit], reading_from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
            };
            Ok(rows)
        })
    }
}
