use chrono::{NaiveDate, NaiveTime};
use rocket::http::Status;
use rocket::request::{self, FromRequest};
use rocket::response::status::Custom;
use rocket::serde::json::{json, Json, Value};
use rocket::{Build, Request, Rocket, State};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use crate::admin::{choice_label, choice_options, AdminModel, AdminQuery, AdminRow, Cell, FieldKind, FormData, FormField, SaveError, SelectOption};
use crate::auth::UserInfo;
use crate::datetime::{self, WEEKDAYS};
use crate::db::DbPool;
use crate::files::Upload;
use crate::students::student_options;
use crate::teachers::{teacher_options, TEACHER_NAME_SQL};
use crate::util::{like_pattern, status_sqlx_error};

pub type ScheduleId = i64;

pub const ENROLLMENT_STATUSES: [(&str, &str); 3] = [
    ("activa", "Activa"),
    ("baja", "Baja"),
    ("pendiente", "Pendiente"),
];

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct ScheduleRecord {
    pub id: ScheduleId,
    pub teacher_id: i64,
    pub subject: String,
    pub weekday: i64,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub room: String,
    pub capacity: i64,
    pub active: bool,
    pub starts_on: Option<NaiveDate>,
    pub ends_on: Option<NaiveDate>,
    pub teacher_name: String,
}
impl ScheduleRecord {
    pub fn weekday_name(&self) -> &'static str {
        datetime::weekday_name(self.weekday)
    }
    pub fn label(&self) -> String {
        schedule_label(&self.subject, self.weekday, self.start_time, self.end_time, &self.teacher_name)
    }
}

/// `Asignatura - Día HH:MM-HH:MM (Profesor)`, as shown in pickers and exports.
pub fn schedule_label(subject: &str, weekday: i64, start: NaiveTime, end: NaiveTime, teacher: &str) -> String {
    format!("{subject} - {} {}-{} ({teacher})",
            datetime::weekday_name(weekday),
            datetime::ftime(start),
            datetime::ftime(end),
    )
}

pub fn schedule_select() -> String {
    format!("SELECT h.*, {TEACHER_NAME_SQL} AS teacher_name
        FROM schedules AS h
        JOIN teachers AS t ON t.id=h.teacher_id
        JOIN users AS u ON u.id=t.user_id")
}

pub async fn load_schedule(pool: &SqlitePool, schedule_id: ScheduleId) -> Result<Option<ScheduleRecord>, sqlx::Error> {
    sqlx::query_as::<_, ScheduleRecord>(&format!("{} WHERE h.id=?", schedule_select()))
        .bind(schedule_id)
        .fetch_optional(pool)
        .await
}

pub async fn schedule_options(pool: &SqlitePool, only_active: bool) -> Result<Vec<SelectOption>, sqlx::Error> {
    let filter = if only_active { "WHERE h.active=1" } else { "" };
    let schedules = sqlx::query_as::<_, ScheduleRecord>(&format!("{} {filter} ORDER BY h.subject, h.weekday, h.start_time", schedule_select()))
        .fetch_all(pool)
        .await?;
    Ok(schedules.iter().map(|s| SelectOption::new(s.id, s.label())).collect())
}

pub fn weekday_options() -> Vec<SelectOption> {
    WEEKDAYS.iter().enumerate().map(|(ix, name)| SelectOption::new(ix, name)).collect()
}

#[derive(Serialize, FromRow, Debug)]
pub struct EnrolledStudent {
    pub id: i64,
    pub nombre: String,
    pub dni: Option<String>,
}

pub async fn actively_enrolled_students(pool: &SqlitePool, schedule_id: ScheduleId) -> Result<Vec<EnrolledStudent>, sqlx::Error> {
    sqlx::query_as::<_, EnrolledStudent>("SELECT s.id, s.first_name || ' ' || s.last_name AS nombre, s.dni
            FROM enrollments AS e
            JOIN students AS s ON s.id=e.student_id
            WHERE e.schedule_id=? AND e.status='activa'
            ORDER BY e.id")
        .bind(schedule_id)
        .fetch_all(pool)
        .await
}

pub struct ScheduleAdmin;

#[rocket::async_trait]
impl AdminModel for ScheduleAdmin {
    fn slug(&self) -> &'static str { "horarios" }
    fn title(&self) -> &'static str { "Horarios" }
    fn singular(&self) -> &'static str { "Horario" }
    fn table(&self) -> &'static str { "schedules" }
    fn columns(&self) -> &'static [&'static str] {
        &["Asignatura", "Profesor", "Día", "Hora inicio", "Hora fin", "Aula", "Capacidad", "Activo"]
    }
    fn accepts_redirect(&self) -> bool {
        true
    }
    async fn rows(&self, pool: &SqlitePool, q: Option<&str>) -> Result<Vec<AdminRow>, sqlx::Error> {
        let schedules = sqlx::query_as::<_, ScheduleRecord>(&format!("{}
                WHERE ?1 IS NULL OR LOWER(h.subject) LIKE ?1 OR LOWER(h.room) LIKE ?1
                    OR LOWER(u.first_name) LIKE ?1 OR LOWER(u.last_name) LIKE ?1
                ORDER BY h.weekday, h.start_time", schedule_select()))
            .bind(like_pattern(q))
            .fetch_all(pool)
            .await?;
        Ok(schedules.into_iter().map(|h| {
            let row = AdminRow::new(h.id, vec![
                Cell::link(&h.subject, format!("/admin/horarios/{}/change", h.id)),
                Cell::text(&h.teacher_name),
                Cell::text(h.weekday_name()),
                Cell::text(datetime::ftime(h.start_time)),
                Cell::text(datetime::ftime(h.end_time)),
                Cell::text(&h.room),
                Cell::text(h.capacity),
                Cell::flag(h.active),
            ]);
            let row = if h.active {
                row.with_link("Crear sesión", format!("/admin/sesiones/add?horario={}", h.id))
            } else {
                row
            };
            row.with_link("Detalle", format!("/gestion/horarios/{}/", h.id))
        }).collect())
    }
    async fn fields(&self, pool: &SqlitePool, id: Option<i64>, _query: &AdminQuery) -> anyhow::Result<Option<Vec<FormField>>> {
        let schedule = match id {
            Some(id) => match load_schedule(pool, id).await? {
                Some(schedule) => Some(schedule),
                None => return Ok(None),
            },
            None => None,
        };
        let h = schedule.as_ref();
        Ok(Some(vec![
            FormField::select("teacher_id", "Profesor", crate::admin::with_blank(teacher_options(pool, false).await?))
                .opt_value(h.map(|h| h.teacher_id))
                .required(),
            FormField::text("subject", "Asignatura").opt_value(h.map(|h| &h.subject)).required(),
            FormField::select("weekday", "Día de la semana", weekday_options()).opt_value(h.map(|h| h.weekday)).required(),
            FormField::new(FieldKind::Time, "start_time", "Hora inicio").time_value(h.map(|h| h.start_time)).required(),
            FormField::new(FieldKind::Time, "end_time", "Hora fin").time_value(h.map(|h| h.end_time)).required(),
            FormField::text("room", "Aula").opt_value(h.map(|h| &h.room)),
            FormField::new(FieldKind::Number, "capacity", "Capacidad").value(h.map(|h| h.capacity).unwrap_or(0)),
            FormField::checkbox("active", "Activo", h.map(|h| h.active).unwrap_or(true)),
            FormField::new(FieldKind::Date, "starts_on", "Fecha inicio").date_value(h.and_then(|h| h.starts_on)),
            FormField::new(FieldKind::Date, "ends_on", "Fecha fin").date_value(h.and_then(|h| h.ends_on)),
        ]))
    }
    async fn save(&self, pool: &SqlitePool, id: Option<i64>, form: &mut FormData<'_>, _upload: Option<Upload>, _user: &UserInfo) -> Result<i64, SaveError> {
        let teacher_id = form.required_int("teacher_id");
        let subject = form.required("subject");
        let weekday = form.required_int("weekday");
        if !(0..7).contains(&weekday) {
            form.add_error("weekday", "Escoge una opción válida.");
        }
        let start_time = form.required_time("start_time");
        let end_time = form.required_time("end_time");
        let room = form.text("room");
        let capacity = form.int("capacity").unwrap_or(0);
        if capacity < 0 {
            form.add_error("capacity", "La capacidad no puede ser negativa.");
        }
        let active = form.flag("active");
        let starts_on = form.date("starts_on");
        let ends_on = form.date("ends_on");
        form.check()?;
        if end_time <= start_time {
            return Err(SaveError::field("end_time", "La hora de fin debe ser posterior a la de inicio."));
        }
        let id = match id {
            Some(id) => {
                sqlx::query("UPDATE schedules SET teacher_id=?, subject=?, weekday=?, start_time=?, end_time=?, room=?, capacity=?,
                        active=?, starts_on=?, ends_on=? WHERE id=?")
                    .bind(teacher_id).bind(&subject).bind(weekday).bind(start_time).bind(end_time).bind(&room).bind(capacity)
                    .bind(active).bind(starts_on).bind(ends_on)
                    .bind(id)
                    .execute(pool)
                    .await?;
                id
            }
            None => {
                let id: (i64, ) = sqlx::query_as("INSERT INTO schedules (teacher_id, subject, weekday, start_time, end_time, room, capacity,
                        active, starts_on, ends_on) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id")
                    .bind(teacher_id).bind(&subject).bind(weekday).bind(start_time).bind(end_time).bind(&room).bind(capacity)
                    .bind(active).bind(starts_on).bind(ends_on)
                    .fetch_one(pool)
                    .await?;
                id.0
            }
        };
        Ok(id)
    }
}

#[derive(FromRow, Debug)]
struct EnrollmentRow {
    id: i64,
    student_id: i64,
    schedule_id: ScheduleId,
    enrolled_on: NaiveDate,
    status: String,
    notes: String,
    student_name: String,
    subject: String,
}

fn enrollment_select() -> &'static str {
    "SELECT e.*, s.first_name || ' ' || s.last_name AS student_name, h.subject
        FROM enrollments AS e
        JOIN students AS s ON s.id=e.student_id
        JOIN schedules AS h ON h.id=e.schedule_id"
}

pub struct EnrollmentAdmin;

#[rocket::async_trait]
impl AdminModel for EnrollmentAdmin {
    fn slug(&self) -> &'static str { "matriculas" }
    fn title(&self) -> &'static str { "Matrículas" }
    fn singular(&self) -> &'static str { "Matrícula" }
    fn table(&self) -> &'static str { "enrollments" }
    fn columns(&self) -> &'static [&'static str] {
        &["Alumno", "Horario", "Fecha matrícula", "Estado"]
    }
    async fn rows(&self, pool: &SqlitePool, q: Option<&str>) -> Result<Vec<AdminRow>, sqlx::Error> {
        let enrollments = sqlx::query_as::<_, EnrollmentRow>(&format!("{}
                WHERE ?1 IS NULL OR LOWER(s.first_name) LIKE ?1 OR LOWER(s.last_name) LIKE ?1 OR LOWER(h.subject) LIKE ?1
                ORDER BY e.enrolled_on DESC, e.id DESC", enrollment_select()))
            .bind(like_pattern(q))
            .fetch_all(pool)
            .await?;
        Ok(enrollments.into_iter().map(|e| AdminRow::new(e.id, vec![
            Cell::link(&e.student_name, format!("/admin/matriculas/{}/change", e.id)),
            Cell::link(&e.subject, format!("/gestion/horarios/{}/", e.schedule_id)),
            Cell::date(Some(e.enrolled_on)),
            Cell::text(choice_label(&ENROLLMENT_STATUSES, &e.status)),
        ])).collect())
    }
    async fn fields(&self, pool: &SqlitePool, id: Option<i64>, query: &AdminQuery) -> anyhow::Result<Option<Vec<FormField>>> {
        let enrollment = match id {
            Some(id) => match sqlx::query_as::<_, EnrollmentRow>(&format!("{} WHERE e.id=?", enrollment_select())).bind(id).fetch_optional(pool).await? {
                Some(enrollment) => Some(enrollment),
                None => return Ok(None),
            },
            None => None,
        };
        let e = enrollment.as_ref();
        let student_id = e.map(|e| e.student_id).or_else(|| AdminQuery::id_param(&query.alumno));
        let schedule_id = e.map(|e| e.schedule_id).or_else(|| AdminQuery::id_param(&query.horario));
        Ok(Some(vec![
            FormField::select("student_id", "Alumno", crate::admin::with_blank(student_options(pool).await?)).opt_value(student_id).required(),
            FormField::select("schedule_id", "Horario", crate::admin::with_blank(schedule_options(pool, false).await?)).opt_value(schedule_id).required(),
            FormField::select("status", "Estado", choice_options(&ENROLLMENT_STATUSES)).value(e.map(|e| e.status.as_str()).unwrap_or("activa")),
            FormField::new(FieldKind::Textarea, "notes", "Notas").opt_value(e.map(|e| &e.notes)),
        ]))
    }
    async fn save(&self, pool: &SqlitePool, id: Option<i64>, form: &mut FormData<'_>, _upload: Option<Upload>, _user: &UserInfo) -> Result<i64, SaveError> {
        let student_id = form.required_int("student_id");
        let schedule_id = form.required_int("schedule_id");
        let status = form.choice("status", &ENROLLMENT_STATUSES);
        let status = if status.is_empty() { "activa".to_string() } else { status };
        let notes = form.text("notes");
        form.check()?;
        let id = match id {
            Some(id) => {
                sqlx::query("UPDATE enrollments SET student_id=?, schedule_id=?, status=?, notes=? WHERE id=?")
                    .bind(student_id).bind(schedule_id).bind(&status).bind(&notes).bind(id)
                    .execute(pool)
                    .await?;
                id
            }
            None => {
                let id: (i64, ) = sqlx::query_as("INSERT INTO enrollments (student_id, schedule_id, status, notes, enrolled_on) VALUES (?, ?, ?, ?, ?) RETURNING id")
                    .bind(student_id).bind(schedule_id).bind(&status).bind(&notes).bind(datetime::today())
                    .fetch_one(pool)
                    .await?;
                id.0
            }
        };
        Ok(id)
    }
}

/// Set when the request carries `X-Requested-With: XMLHttpRequest`.
pub struct AjaxRequest(bool);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AjaxRequest {
    type Error = ();
    async fn from_request(request: &'r Request<'_>) -> request::Outcome<Self, ()> {
        let is_ajax = request.headers().get_one("X-Requested-With")
            .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"));
        request::Outcome::Success(AjaxRequest(is_ajax))
    }
}

#[get("/gestion/api/alumnos-por-horario?<horario_id>")]
async fn get_students_by_schedule(horario_id: Option<&str>, ajax: AjaxRequest, _user: UserInfo, db: &State<DbPool>) -> Result<Custom<Json<Value>>, Custom<String>> {
    if !ajax.0 {
        return Ok(Custom(Status::MethodNotAllowed, Json(json!({"error": "Método no permitido"}))));
    }
    let schedule_id = horario_id.and_then(|id| id.trim().parse::<ScheduleId>().ok());
    let schedule = match schedule_id {
        Some(id) => load_schedule(&db.0, id).await.map_err(status_sqlx_error)?,
        None => None,
    };
    let Some(schedule) = schedule else {
        return Ok(Custom(Status::NotFound, Json(json!({"error": "Horario no encontrado"}))));
    };
    let alumnos = actively_enrolled_students(&db.0, schedule.id).await.map_err(status_sqlx_error)?;
    Ok(Custom(Status::Ok, Json(json!({"alumnos": alumnos}))))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_students_by_schedule,
        ])
}
