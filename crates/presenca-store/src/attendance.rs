use crate::{parse_timestamp, timestamp_text, Error, SqliteStore};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use presenca_core::{AttendanceEvent, AttendanceLog, StoreError};
use rusqlite::types::Value;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Report filter. Dates are whole UTC days, both ends inclusive.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AttendanceFilter {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub class_name: Option<String>,
    /// Substring of the student id or name.
    pub search: Option<String>,
    pub school_unit_id: Option<i64>,
}

/// One attendance joined with its student and school unit.
///
/// Student fields are `None` when the student has since been deleted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRow {
    pub id: i64,
    pub student_id: String,
    pub name: Option<String>,
    pub class_name: Option<String>,
    pub shift: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub client_ip: Option<String>,
    pub school_unit_name: Option<String>,
}

fn day_start(date: NaiveDate) -> String {
    timestamp_text(date.and_time(NaiveTime::MIN).and_utc())
}

impl AttendanceFilter {
    fn to_sql(&self) -> (String, Vec<Value>) {
        let mut sql = String::from(
            "SELECT a.id, a.student_id, s.name, s.class_name, s.shift, a.timestamp, a.client_ip, su.name
             FROM attendances AS a
             LEFT JOIN students AS s ON a.student_id = s.student_id
             LEFT JOIN school_units AS su ON s.school_unit_id = su.id
             WHERE 1 = 1",
        );
        let mut values = Vec::new();

        if let Some(start) = self.start_date {
            sql.push_str(" AND a.timestamp >= ?");
            values.push(Value::Text(day_start(start)));
        }
        if let Some(end) = self.end_date.and_then(|d| d.succ_opt()) {
            sql.push_str(" AND a.timestamp < ?");
            values.push(Value::Text(day_start(end)));
        }
        if let Some(class_name) = self.class_name.as_ref().filter(|c| !c.is_empty()) {
            sql.push_str(" AND s.class_name = ?");
            values.push(Value::Text(class_name.clone()));
        }
        if let Some(search) = self.search.as_ref().filter(|q| !q.is_empty()) {
            sql.push_str(" AND (a.student_id LIKE ? OR s.name LIKE ?)");
            let pattern = format!("%{search}%");
            values.push(Value::Text(pattern.clone()));
            values.push(Value::Text(pattern));
        }
        if let Some(unit) = self.school_unit_id {
            sql.push_str(" AND s.school_unit_id = ?");
            values.push(Value::Integer(unit));
        }

        sql.push_str(" ORDER BY a.timestamp DESC, a.id DESC");
        (sql, values)
    }
}

impl SqliteStore {
    /// Attendance report, newest first.
    pub async fn attendance_report(&self, filter: &AttendanceFilter) -> crate::Result<Vec<AttendanceRow>> {
        let (sql, values) = filter.to_sql();
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(values.iter()), |row| {
                        Ok(AttendanceRow {
                            id: row.get(0)?,
                            student_id: row.get(1)?,
                            name: row.get(2)?,
                            class_name: row.get(3)?,
                            shift: row.get(4)?,
                            timestamp: parse_timestamp(5, &row.get::<_, String>(5)?)?,
                            client_ip: row.get(6)?,
                            school_unit_name: row.get(7)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }
}

#[async_trait]
impl AttendanceLog for SqliteStore {
    async fn latest_since(
        &self,
        student_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<AttendanceEvent>, StoreError> {
        let id = student_id.to_string();
        let since = timestamp_text(since);
        let event = self
            .conn
            .call(move |c| {
                let event = c
                    .query_row(
                        "SELECT student_id, timestamp, client_ip FROM attendances
                         WHERE student_id = ?1 AND timestamp >= ?2
                         ORDER BY timestamp DESC LIMIT 1",
                        params![id, since],
                        |row| {
                            Ok(AttendanceEvent {
                                student_id: row.get(0)?,
                                timestamp: parse_timestamp(1, &row.get::<_, String>(1)?)?,
                                source_ip: row.get(2)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(event)
            })
            .await
            .map_err(Error::from)?;
        Ok(event)
    }

    async fn append_event(&self, event: &AttendanceEvent) -> Result<(), StoreError> {
        let e = event.clone();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO attendances (student_id, timestamp, client_ip) VALUES (?1, ?2, ?3)",
                    params![e.student_id, timestamp_text(e.timestamp), e.source_ip],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)?;
        Ok(())
    }
}
