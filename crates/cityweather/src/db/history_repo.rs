//! Search history repository: the `search_history` table.

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{get_timestamp, Database, DatabaseError};
use crate::clock::format_timestamp;
use crate::store::{SearchHistoryStore, SearchRecord};

impl SearchHistoryStore for Database {
    fn append(&self, city: &str, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let at = format_timestamp(at);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO search_history (city_name, searched_at) VALUES (?1, ?2)",
                params![city, at],
            )?;
            Ok(())
        })
    }

    fn recent(&self, limit: u32) -> Result<Vec<SearchRecord>, DatabaseError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT city_name, searched_at FROM search_history
                 ORDER BY searched_at DESC, id DESC
                 LIMIT ?1",
            )?;
            let records = stmt
                .query_map(params![limit], |row| {
                    Ok(SearchRecord {
                        city_name: row.get("city_name")?,
                        searched_at: get_timestamp(row, "searched_at")?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }
}
