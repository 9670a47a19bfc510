use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::{FromRow, SqliteExecutor, SqlitePool};
use crate::admin::{load_options, with_blank, AdminModel, AdminQuery, AdminRow, Cell, FieldKind, FormData, FormField, SaveError};
use crate::auth::UserInfo;
use crate::datetime;
use crate::files::Upload;
use crate::schedules::{load_schedule, schedule_options, ScheduleId};
use crate::students::student_options;
use crate::teachers::TEACHER_NAME_SQL;
use crate::util::like_pattern;

pub type ClassSessionId = i64;

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct SessionRecord {
    pub id: ClassSessionId,
    pub schedule_id: ScheduleId,
    pub starts_at: NaiveDateTime,
    pub ends_at: NaiveDateTime,
    pub subject: String,
    pub room: String,
    pub teacher_name: String,
}
impl SessionRecord {
    pub fn label(&self) -> String {
        format!("{} - {}", self.subject, datetime::fdatetime(self.starts_at))
    }
}

pub fn session_select() -> String {
    format!("SELECT c.*, h.subject, h.room, {TEACHER_NAME_SQL} AS teacher_name
        FROM class_sessions AS c
        JOIN schedules AS h ON h.id=c.schedule_id
        JOIN teachers AS t ON t.id=h.teacher_id
        JOIN users AS u ON u.id=t.user_id")
}

pub async fn load_session(pool: &SqlitePool, session_id: ClassSessionId) -> Result<Option<SessionRecord>, sqlx::Error> {
    sqlx::query_as::<_, SessionRecord>(&format!("{} WHERE c.id=?", session_select()))
        .bind(session_id)
        .fetch_optional(pool)
        .await
}

/// Adds an absent attendance row for every actively enrolled student of the slot, existing rows are kept.
pub async fn provision_attendance<'c>(executor: impl SqliteExecutor<'c>, session_id: ClassSessionId, schedule_id: ScheduleId) -> Result<u64, sqlx::Error> {
    let res = sqlx::query("INSERT INTO attendance (session_id, student_id, present)
            SELECT ?, student_id, 0 FROM enrollments WHERE schedule_id=? AND status='activa'
            ON CONFLICT(session_id, student_id) DO NOTHING")
        .bind(session_id)
        .bind(schedule_id)
        .execute(executor)
        .await?;
    Ok(res.rows_affected())
}

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct AttendanceRecord {
    pub id: i64,
    pub session_id: ClassSessionId,
    pub student_id: i64,
    pub present: bool,
    pub student_name: String,
}

pub async fn session_attendance(pool: &SqlitePool, session_id: ClassSessionId) -> Result<Vec<AttendanceRecord>, sqlx::Error> {
    sqlx::query_as::<_, AttendanceRecord>("SELECT a.*, s.first_name || ' ' || s.last_name AS student_name
            FROM attendance AS a
            JOIN students AS s ON s.id=a.student_id
            WHERE a.session_id=?
            ORDER BY s.last_name, s.first_name")
        .bind(session_id)
        .fetch_all(pool)
        .await
}

pub struct SessionAdmin;

#[rocket::async_trait]
impl AdminModel for SessionAdmin {
    fn slug(&self) -> &'static str { "sesiones" }
    fn title(&self) -> &'static str { "Sesiones" }
    fn singular(&self) -> &'static str { "Sesión" }
    fn table(&self) -> &'static str { "class_sessions" }
    fn columns(&self) -> &'static [&'static str] {
        &["Horario", "Profesor", "Inicio", "Fin"]
    }
    async fn rows(&self, pool: &SqlitePool, q: Option<&str>) -> Result<Vec<AdminRow>, sqlx::Error> {
        let sessions = sqlx::query_as::<_, SessionRecord>(&format!("{}
                WHERE ?1 IS NULL OR LOWER(h.subject) LIKE ?1 OR LOWER(u.first_name) LIKE ?1 OR LOWER(u.last_name) LIKE ?1
                ORDER BY c.starts_at DESC", session_select()))
            .bind(like_pattern(q))
            .fetch_all(pool)
            .await?;
        Ok(sessions.into_iter().map(|c| AdminRow::new(c.id, vec![
            Cell::link(&c.subject, format!("/admin/sesiones/{}/change", c.id)),
            Cell::text(&c.teacher_name),
            Cell::text(datetime::fdatetime(c.starts_at)),
            Cell::text(datetime::fdatetime(c.ends_at)),
        ]).with_link("Asistencias", format!("/gestion/sesiones/{}/asistencias/", c.id))).collect())
    }
    async fn fields(&self, pool: &SqlitePool, id: Option<i64>, query: &AdminQuery) -> anyhow::Result<Option<Vec<FormField>>> {
        let mut fields = vec![
            FormField::select("schedule_id", "Horario", with_blank(schedule_options(pool, false).await?)).required(),
            FormField::new(FieldKind::Datetime, "starts_at", "Inicio").required(),
            FormField::new(FieldKind::Datetime, "ends_at", "Fin").required(),
        ];
        match id {
            Some(id) => {
                let Some(session) = load_session(pool, id).await? else {
                    return Ok(None);
                };
                fields[0].value = session.schedule_id.to_string();
                fields[1].value = datetime::input_datetime(session.starts_at);
                fields[2].value = datetime::input_datetime(session.ends_at);
                for attendance in session_attendance(pool, id).await? {
                    fields.push(FormField::checkbox(&format!("present_{}", attendance.id), &attendance.student_name, attendance.present)
                        .help("Presente"));
                }
            }
            None => {
                // an unknown slot leaves the form empty
                if let Some(schedule_id) = AdminQuery::id_param(&query.horario) {
                    if let Some(schedule) = load_schedule(pool, schedule_id).await? {
                        let today = datetime::today();
                        fields[0].value = schedule.id.to_string();
                        fields[1].value = datetime::input_datetime(today.and_time(schedule.start_time));
                        fields[2].value = datetime::input_datetime(today.and_time(schedule.end_time));
                    }
                }
            }
        }
        Ok(Some(fields))
    }
    async fn save(&self, pool: &SqlitePool, id: Option<i64>, form: &mut FormData<'_>, _upload: Option<Upload>, _user: &UserInfo) -> Result<i64, SaveError> {
        let schedule_id = form.required_int("schedule_id");
        let starts_at = form.required_datetime("starts_at");
        let ends_at = form.required_datetime("ends_at");
        form.check()?;
        if ends_at <= starts_at {
            return Err(SaveError::field("ends_at", "El fin debe ser posterior al inicio."));
        }
        let mut tx = pool.begin().await?;
        let id = match id {
            Some(id) => {
                sqlx::query("UPDATE class_sessions SET schedule_id=?, starts_at=?, ends_at=? WHERE id=?")
                    .bind(schedule_id).bind(starts_at).bind(ends_at).bind(id)
                    .execute(&mut *tx)
                    .await?;
                let attendance_ids: Vec<(i64, )> = sqlx::query_as("SELECT id FROM attendance WHERE session_id=?")
                    .bind(id)
                    .fetch_all(&mut *tx)
                    .await?;
                for (attendance_id, ) in attendance_ids {
                    sqlx::query("UPDATE attendance SET present=? WHERE id=?")
                        .bind(form.flag(&format!("present_{attendance_id}")))
                        .bind(attendance_id)
                        .execute(&mut *tx)
                        .await?;
                }
                id
            }
            None => {
                let id: (i64, ) = sqlx::query_as("INSERT INTO class_sessions (schedule_id, starts_at, ends_at) VALUES (?, ?, ?) RETURNING id")
                    .bind(schedule_id).bind(starts_at).bind(ends_at)
                    .fetch_one(&mut *tx)
                    .await?;
                let provisioned = provision_attendance(&mut *tx, id.0, schedule_id).await?;
                info!("Session id: {} created with {provisioned} attendance rows", id.0);
                id.0
            }
        };
        tx.commit().await?;
        Ok(id)
    }
}

async fn session_options(pool: &SqlitePool) -> Result<Vec<crate::admin::SelectOption>, sqlx::Error> {
    load_options(pool, "SELECT c.id, h.subject || ' - ' || strftime('%d/%m/%Y %H:%M', c.starts_at)
        FROM class_sessions AS c
        JOIN schedules AS h ON h.id=c.schedule_id
        ORDER BY c.starts_at DESC").await
}

#[derive(FromRow, Debug)]
struct AttendanceListRow {
    #[sqlx(flatten)]
    attendance: AttendanceRecord,
    subject: String,
    starts_at: NaiveDateTime,
}

pub struct AttendanceAdmin;

#[rocket::async_trait]
impl AdminModel for AttendanceAdmin {
    fn slug(&self) -> &'static str { "asistencias" }
    fn title(&self) -> &'static str { "Asistencias" }
    fn singular(&self) -> &'static str { "Asistencia" }
    fn table(&self) -> &'static str { "attendance" }
    fn columns(&self) -> &'static [&'static str] {
        &["Sesión", "Alumno", "Presente"]
    }
    async fn rows(&self, pool: &SqlitePool, q: Option<&str>) -> Result<Vec<AdminRow>, sqlx::Error> {
        let rows = sqlx::query_as::<_, AttendanceListRow>("SELECT a.*, s.first_name || ' ' || s.last_name AS student_name, h.subject, c.starts_at
                FROM attendance AS a
                JOIN students AS s ON s.id=a.student_id
                JOIN class_sessions AS c ON c.id=a.session_id
                JOIN schedules AS h ON h.id=c.schedule_id
                WHERE ?1 IS NULL OR LOWER(s.first_name) LIKE ?1 OR LOWER(s.last_name) LIKE ?1 OR LOWER(h.subject) LIKE ?1
                ORDER BY c.starts_at DESC, s.last_name, s.first_name")
            .bind(like_pattern(q))
            .fetch_all(pool)
            .await?;
        Ok(rows.into_iter().map(|r| AdminRow::new(r.attendance.id, vec![
            Cell::link(format!("{} - {}", r.subject, datetime::fdatetime(r.starts_at)), format!("/admin/asistencias/{}/change", r.attendance.id)),
            Cell::text(&r.attendance.student_name),
            Cell::flag(r.attendance.present),
        ])).collect())
    }
    async fn fields(&self, pool: &SqlitePool, id: Option<i64>, _query: &AdminQuery) -> anyhow::Result<Option<Vec<FormField>>> {
        let attendance = match id {
            Some(id) => match sqlx::query_as::<_, (i64, i64, bool)>("SELECT session_id, student_id, present FROM attendance WHERE id=?")
                .bind(id)
                .fetch_optional(pool)
                .await? {
                Some(attendance) => Some(attendance),
                None => return Ok(None),
            },
            None => None,
        };
        Ok(Some(vec![
            FormField::select("session_id", "Sesión", with_blank(session_options(pool).await?)).opt_value(attendance.map(|a| a.0)).required(),
            FormField::select("student_id", "Alumno", with_blank(student_options(pool).await?)).opt_value(attendance.map(|a| a.1)).required(),
            FormField::checkbox("present", "Presente", attendance.map(|a| a.2).unwrap_or(false)),
        ]))
    }
    async fn save(&self, pool: &SqlitePool, id: Option<i64>, form: &mut FormData<'_>, _upload: Option<Upload>, _user: &UserInfo) -> Result<i64, SaveError> {
        let session_id = form.required_int("session_id");
        let student_id = form.required_int("student_id");
        let present = form.flag("present");
        form.check()?;
        let id = match id {
            Some(id) => {
                sqlx::query("UPDATE attendance SET session_id=?, student_id=?, present=? WHERE id=?")
                    .bind(session_id).bind(student_id).bind(present).bind(id)
                    .execute(pool)
                    .await?;
                id
            }
            None => {
                let id: (i64, ) = sqlx::query_as("INSERT INTO attendance (session_id, student_id, present) VALUES (?, ?, ?) RETURNING id")
                    .bind(session_id).bind(student_id).bind(present)
                    .fetch_one(pool)
                    .await?;
                id.0
            }
        };
        Ok(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::{open_pool, MIGRATOR};

    #[rocket::async_test]
    async fn provisioning_adds_only_missing_active_enrollments() {
        let pool = open_pool("sqlite::memory:").await.unwrap();
        MIGRATOR.run(&pool).await.unwrap();
        for sql in [
            "INSERT INTO users (username, password_hash) VALUES ('mgarcia', '')",
            "INSERT INTO teachers (user_id, joined_on) VALUES (1, '2025-01-01')",
            "INSERT INTO schedules (teacher_id, subject, weekday, start_time, end_time)
                VALUES (1, 'Matematicas', 0, '17:00:00', '18:00:00')",
            "INSERT INTO students (first_name, last_name, enrolled_on)
                VALUES ('Ana', 'Lopez', '2025-01-01'), ('Luis', 'Ruiz', '2025-01-01'),
                    ('Eva', 'Gil', '2025-01-01'), ('Pablo', 'Sanz', '2025-01-01')",
            "INSERT INTO enrollments (student_id, schedule_id, enrolled_on, status)
                VALUES (1, 1, '2025-01-01', 'activa'), (2, 1, '2025-01-01', 'baja'),
                    (3, 1, '2025-01-01', 'pendiente'), (4, 1, '2025-01-01', 'activa')",
            "INSERT INTO class_sessions (schedule_id, starts_at, ends_at)
                VALUES (1, '2025-03-03 17:00:00', '2025-03-03 18:00:00')",
            "INSERT INTO attendance (session_id, student_id, present) VALUES (1, 1, 1)",
        ] {
            sqlx::query(sql).execute(&pool).await.unwrap();
        }

        assert_eq!(provision_attendance(&pool, 1, 1).await.unwrap(), 1);
        assert_eq!(provision_attendance(&pool, 1, 1).await.unwrap(), 0);
        let rows: Vec<(i64, bool)> = sqlx::query_as("SELECT student_id, present FROM attendance WHERE session_id=1 ORDER BY student_id")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(rows, vec![(1, true), (4, false)]);
    }
}
