//! City repository: the `cities` table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::cursor::{self, RefreshedPosition};
use super::{get_timestamp, get_timestamp_opt, Database, DatabaseError};
use crate::clock::format_timestamp;
use crate::models::{City, Page, RefreshStatus};
use crate::store::CityStore;

fn city_from_row(row: &Row<'_>) -> rusqlite::Result<City> {
    let status: String = row.get("last_status")?;
    let last_status = RefreshStatus::parse(&status).unwrap_or_else(|| {
        log::warn!("Unknown city status '{}', treating as pending", status);
        RefreshStatus::Pending
    });
    Ok(City {
        name: row.get("name")?,
        last_refreshed_at: get_timestamp_opt(row, "last_refreshed_at")?,
        last_status,
        last_error: row.get("last_error")?,
        created_at: get_timestamp(row, "created_at")?,
    })
}

/// Insert-or-ignore followed by a read, so the caller always sees the one
/// surviving row regardless of who created it.
fn upsert_one(conn: &Connection, name: &str, now: &str) -> Result<City, DatabaseError> {
    conn.execute(
        "INSERT INTO cities (name, last_status, created_at) VALUES (?1, 'pending', ?2)
         ON CONFLICT(name) DO NOTHING",
        params![name, now],
    )?;
    let city = conn.query_row(
        "SELECT * FROM cities WHERE name = ?1",
        params![name],
        city_from_row,
    )?;
    Ok(city)
}

impl CityStore for Database {
    fn upsert(&self, name: &str, now: DateTime<Utc>) -> Result<City, DatabaseError> {
        let now = format_timestamp(now);
        self.with_conn(|conn| upsert_one(conn, name, &now))
    }

    fn upsert_batch(
        &self,
        names: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<City>, DatabaseError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let now = format_timestamp(now);
        self.with_transaction(|tx| {
            names
                .iter()
                .map(|name| upsert_one(tx, name, &now))
                .collect()
        })
    }

    fn record_outcome(
        &self,
        name: &str,
        status: RefreshStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let at = format_timestamp(at);
        self.with_conn(|conn| {
            // Upsert so an outcome for a city created elsewhere never gets lost.
            conn.execute(
                "INSERT INTO cities (name, last_refreshed_at, last_status, last_error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?2)
                 ON CONFLICT(name) DO UPDATE SET
                     last_refreshed_at = excluded.last_refreshed_at,
                     last_status = excluded.last_status,
                     last_error = excluded.last_error",
                params![name, at, status.as_str(), error],
            )?;
            Ok(())
        })
    }

    fn find(&self, name: &str) -> Result<Option<City>, DatabaseError> {
        self.with_conn(|conn| {
            let city = conn
                .query_row(
                    "SELECT * FROM cities WHERE name = ?1",
                    params![name],
                    city_from_row,
                )
                .optional()?;
            Ok(city)
        })
    }

    fn count(&self) -> Result<u64, DatabaseError> {
        self.with_conn(|conn| {
            let count: u64 = conn.query_row("SELECT COUNT(*) FROM cities", [], |r| r.get(0))?;
            Ok(count)
        })
    }

    fn recently_refreshed(
        &self,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<City>, DatabaseError> {
        let position = cursor
            .map(cursor::decode::<RefreshedPosition>)
            .transpose()?;
        let (after_ts, after_name) = match &position {
            Some(p) => (Some(p.last_refreshed_at.as_str()), Some(p.name.as_str())),
            None => (None, None),
        };
        let limit = limit.max(1);

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM cities
                 WHERE last_refreshed_at IS NOT NULL
                   AND (?1 IS NULL
                        OR last_refreshed_at < ?1
                        OR (last_refreshed_at = ?1 AND name > ?2))
                 ORDER BY last_refreshed_at DESC, name ASC
                 LIMIT ?3",
            )?;
            let mut items: Vec<City> = stmt
                .query_map(
                    params![after_ts, after_name, i64::from(limit) + 1],
                    city_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;

            let next_cursor = if items.len() > limit as usize {
                items.truncate(limit as usize);
                match items.last() {
                    Some(City {
                        name,
                        last_refreshed_at: Some(at),
                        ..
                    }) => Some(cursor::encode(&RefreshedPosition {
                        last_refreshed_at: format_timestamp(*at),
                        name: name.clone(),
                    })?),
                    _ => None,
                }
            } else {
                None
            };

            Ok(Page { items, next_cursor })
        })
    }
}
