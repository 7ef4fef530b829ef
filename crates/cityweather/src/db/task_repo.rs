//! Task result repository: the `task_results` table.

use rusqlite::{params, OptionalExtension, Row};

use super::cursor::{self, TaskPosition};
use super::{get_timestamp_opt, Database, DatabaseError};
use crate::models::{Page, RefreshStatus, TaskResult};
use crate::store::TaskStore;

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskResult> {
    let status: String = row.get("status")?;
    let status = RefreshStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown task status '{}'", status).into(),
        )
    })?;
    Ok(TaskResult {
        job_id: row.get("job_id")?,
        city_name: row.get("city_name")?,
        status,
        last_refreshed_at: get_timestamp_opt(row, "last_refreshed_at")?,
        last_error: row.get("last_error")?,
        attempt_count: row.get("attempt_count")?,
    })
}

impl TaskStore for Database {
    fn insert_if_absent(
        &self,
        job_id: &str,
        names: &[String],
    ) -> Result<Vec<String>, DatabaseError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        self.with_transaction(|tx| {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO task_results (job_id, city_name, status)
                 VALUES (?1, ?2, 'pending')
                 ON CONFLICT(job_id, city_name) DO NOTHING",
            )?;
            let mut inserted = Vec::new();
            for name in names {
                if stmt.execute(params![job_id, name])? == 1 {
                    inserted.push(name.clone());
                }
            }
            Ok(inserted)
        })
    }

    fn record_attempt(&self, job_id: &str, city: &str) -> Result<Option<u32>, DatabaseError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE task_results SET attempt_count = attempt_count + 1
                 WHERE job_id = ?1 AND city_name = ?2 AND status = 'pending'",
                params![job_id, city],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let attempts: u32 = conn.query_row(
                "SELECT attempt_count FROM task_results WHERE job_id = ?1 AND city_name = ?2",
                params![job_id, city],
                |r| r.get(0),
            )?;
            Ok(Some(attempts))
        })
    }

    fn find(&self, job_id: &str, city: &str) -> Result<Option<TaskResult>, DatabaseError> {
        self.with_conn(|conn| {
            let task = conn
                .query_row(
                    "SELECT * FROM task_results WHERE job_id = ?1 AND city_name = ?2",
                    params![job_id, city],
                    task_from_row,
                )
                .optional()?;
            Ok(task)
        })
    }

    fn page(
        &self,
        job_id: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<TaskResult>, DatabaseError> {
        let after = cursor
            .map(cursor::decode::<TaskPosition>)
            .transpose()?
            .map(|p| p.city_name);
        let limit = limit.max(1);

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM task_results
                 WHERE job_id = ?1 AND (?2 IS NULL OR city_name > ?2)
                 ORDER BY city_name ASC
                 LIMIT ?3",
            )?;
            let mut items: Vec<TaskResult> = stmt
                .query_map(params![job_id, after, i64::from(limit) + 1], task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            let next_cursor = if items.len() > limit as usize {
                items.truncate(limit as usize);
                items
                    .last()
                    .map(|t| {
                        cursor::encode(&TaskPosition {
                            city_name: t.city_name.clone(),
                        })
                    })
                    .transpose()?
            } else {
                None
            };

            Ok(Page { items, next_cursor })
        })
    }

    fn pending_after(
        &self,
        job_id: &str,
        after: Option<&str>,
        limit: u32,
    ) -> Result<Vec<String>, DatabaseError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT city_name FROM task_results
                 WHERE job_id = ?1 AND status = 'pending' AND (?2 IS NULL OR city_name > ?2)
                 ORDER BY city_name ASC
                 LIMIT ?3",
            )?;
            let names = stmt
                .query_map(params![job_id, after, limit], |r| r.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CityStore, JobStore};
    use chrono::{DateTime, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|n| n.to_string()).collect()
    }

    fn setup(cities: &[&str]) -> Database {
        let db = Database::open_in_memory().expect("Failed to create test database");
        db.create("job-1", t0()).unwrap();
        db.upsert_batch(&names(cities), t0()).unwrap();
        db
    }

    fn finish(db: &Database, city: &str) {
        db.record_task_outcome("job-1", city, RefreshStatus::Success, None, t0())
            .unwrap();
    }

    fn find_task(db: &Database, city: &str) -> TaskResult {
        TaskStore::find(db, "job-1", city).unwrap().unwrap()
    }

    #[test]
    fn test_insert_if_absent_reports_new_rows_only() {
        let db = setup(&["paris", "rome", "oslo"]);
        let first = db
            .insert_if_absent("job-1", &names(&["paris", "rome", "paris"]))
            .unwrap();
        assert_eq!(first, names(&["paris", "rome"]));

        let second = db
            .insert_if_absent("job-1", &names(&["rome", "oslo"]))
            .unwrap();
        assert_eq!(second, names(&["oslo"]));

        let task = find_task(&db, "oslo");
        assert_eq!(task.status, RefreshStatus::Pending);
        assert_eq!(task.attempt_count, 0);
    }

    #[test]
    fn test_insert_requires_known_city() {
        let db = setup(&[]);
        assert!(db.insert_if_absent("job-1", &names(&["nowhere"])).is_err());
    }

    #[test]
    fn test_record_attempt_counts_until_terminal() {
        let db = setup(&["lima"]);
        db.insert_if_absent("job-1", &names(&["lima"])).unwrap();

        assert_eq!(db.record_attempt("job-1", "lima").unwrap(), Some(1));
        assert_eq!(db.record_attempt("job-1", "lima").unwrap(), Some(2));
        finish(&db, "lima");
        assert_eq!(db.record_attempt("job-1", "lima").unwrap(), None);
        assert_eq!(db.record_attempt("job-1", "missing").unwrap(), None);
        assert_eq!(find_task(&db, "lima").attempt_count, 2);
    }

    #[test]
    fn test_page_walks_all_results_in_name_order() {
        let cities = ["e", "a", "d", "b", "c"];
        let db = setup(&cities);
        db.insert_if_absent("job-1", &names(&cities)).unwrap();

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = db.page("job-1", 2, cursor.as_deref()).unwrap();
            seen.extend(page.items.into_iter().map(|t| t.city_name));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, names(&["a", "b", "c", "d", "e"]));
    }

    #[test]
    fn test_page_exact_fit_has_no_cursor() {
        let db = setup(&["a", "b"]);
        db.insert_if_absent("job-1", &names(&["a", "b"])).unwrap();
        let page = db.page("job-1", 2, None).unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_page_unknown_job_is_empty() {
        let db = setup(&[]);
        assert_eq!(db.page("nope", 10, None).unwrap(), Page::empty());
    }

    #[test]
    fn test_pending_after_skips_finished_tasks() {
        let cities = ["a", "b", "c", "d"];
        let db = setup(&cities);
        db.insert_if_absent("job-1", &names(&cities)).unwrap();
        finish(&db, "b");

        assert_eq!(
            db.pending_after("job-1", None, 2).unwrap(),
            names(&["a", "c"])
        );
        assert_eq!(
            db.pending_after("job-1", Some("c"), 10).unwrap(),
            names(&["d"])
        );
    }
}
