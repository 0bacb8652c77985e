use crate::{violation, Error, Result, SqliteStore, Violation};
use rusqlite::params;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchoolUnit {
    pub id: i64,
    pub name: String,
    pub ip_range_start: Option<String>,
    pub ip_range_end: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSchoolUnit {
    pub name: String,
    pub ip_range_start: Option<String>,
    pub ip_range_end: Option<String>,
}

fn conflict_or(name: &str, e: tokio_rusqlite::Error) -> Error {
    if violation(&e) == Some(Violation::Unique) {
        Error::Conflict(format!("school unit {name:?}"))
    } else {
        Error::Sqlite(e)
    }
}

impl SqliteStore {
    /// Returns the new unit id.
    pub async fn add_school_unit(&self, unit: &NewSchoolUnit) -> Result<i64> {
        let u = unit.clone();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO school_units (name, ip_range_start, ip_range_end) VALUES (?1, ?2, ?3)",
                    params![u.name, u.ip_range_start, u.ip_range_end],
                )?;
                Ok(c.last_insert_rowid())
            })
            .await
            .map_err(|e| conflict_or(&unit.name, e))
    }

    pub async fn list_school_units(&self) -> Result<Vec<SchoolUnit>> {
        let units = self
            .conn
            .call(|c| {
                let mut stmt =
                    c.prepare("SELECT id, name, ip_range_start, ip_range_end FROM school_units ORDER BY name")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(SchoolUnit {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            ip_range_start: row.get(2)?,
                            ip_range_end: row.get(3)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(units)
    }

    /// Returns `false` if no such unit.
    pub async fn update_school_unit(&self, id: i64, unit: &NewSchoolUnit) -> Result<bool> {
        let u = unit.clone();
        self.conn
            .call(move |c| {
                let n = c.execute(
                    "UPDATE school_units SET name = ?1, ip_range_start = ?2, ip_range_end = ?3 WHERE id = ?4",
                    params![u.name, u.ip_range_start, u.ip_range_end, id],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(|e| conflict_or(&unit.name, e))
    }

    /// Returns `false` if no such unit. Students of the unit are kept, unassigned.
    pub async fn delete_school_unit(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .call(move |c| Ok(c.execute("DELETE FROM school_units WHERE id = ?1", [id])? > 0))
            .await?;
        Ok(deleted)
    }
}
