use crate::{student_write_error, Error, SqliteStore};
use async_trait::async_trait;
use presenca_core::{StoreError, Student, StudentProfile, StudentStore};
use rusqlite::{params, OptionalExtension, Row};
use std::path::{Path, PathBuf};

const STUDENT_COLUMNS: &str = "student_id, name, class_name, shift, age, image_path, school_unit_id";

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        student_id: row.get(0)?,
        profile: StudentProfile {
            name: row.get(1)?,
            class_name: row.get(2)?,
            shift: row.get(3)?,
            age: row.get(4)?,
            school_unit_id: row.get(6)?,
        },
        image_path: PathBuf::from(row.get::<_, String>(5)?),
    })
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl StudentStore for SqliteStore {
    async fn insert_student(&self, student: &Student) -> Result<(), StoreError> {
        let s = student.clone();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO students (student_id, name, class_name, shift, age, image_path, school_unit_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        s.student_id,
                        s.profile.name,
                        s.profile.class_name,
                        s.profile.shift,
                        s.profile.age,
                        path_text(&s.image_path),
                        s.profile.school_unit_id,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| student_write_error(&student.student_id, student.profile.school_unit_id, e).into())
    }

    async fn get_student(&self, student_id: &str) -> Result<Option<Student>, StoreError> {
        let id = student_id.to_string();
        let student = self
            .conn
            .call(move |c| {
                let sql = format!("SELECT {STUDENT_COLUMNS} FROM students WHERE student_id = ?1");
                Ok(c.query_row(&sql, [id], student_from_row).optional()?)
            })
            .await
            .map_err(Error::from)?;
        Ok(student)
    }

    async fn list_students(&self, school_unit_id: Option<i64>) -> Result<Vec<Student>, StoreError> {
        let students = self
            .conn
            .call(move |c| {
                let sql = format!(
                    "SELECT {STUDENT_COLUMNS} FROM students
                     WHERE ?1 IS NULL OR school_unit_id = ?1
                     ORDER BY name, student_id"
                );
                let mut stmt = c.prepare(&sql)?;
                let rows = stmt
                    .query_map([school_unit_id], student_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(Error::from)?;
        Ok(students)
    }

    async fn update_profile(&self, student_id: &str, profile: &StudentProfile) -> Result<bool, StoreError> {
        let id = student_id.to_string();
        let p = profile.clone();
        let changed = self
            .conn
            .call(move |c| {
                let n = c.execute(
                    "UPDATE students SET name = ?1, class_name = ?2, shift = ?3, age = ?4, school_unit_id = ?5
                     WHERE student_id = ?6",
                    params![p.name, p.class_name, p.shift, p.age, p.school_unit_id, id],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(|e| student_write_error(student_id, profile.school_unit_id, e))?;
        Ok(changed)
    }

    async fn set_image_path(&self, student_id: &str, image_path: &Path) -> Result<bool, StoreError> {
        let id = student_id.to_string();
        let path = path_text(image_path);
        let changed = self
            .conn
            .call(move |c| {
                let n = c.execute(
                    "UPDATE students SET image_path = ?1 WHERE student_id = ?2",
                    params![path, id],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(Error::from)?;
        Ok(changed)
    }

    async fn delete_student(&self, student_id: &str) -> Result<bool, StoreError> {
        let id = student_id.to_string();
        let deleted = self
            .conn
            .call(move |c| Ok(c.execute("DELETE FROM students WHERE student_id = ?1", [id])? > 0))
            .await
            .map_err(Error::from)?;
        Ok(deleted)
    }
}
