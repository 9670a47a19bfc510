use chrono::{NaiveDate, NaiveDateTime};
use esquemas_proc_macros::ActiveFilters;
use rocket::response::{Flash, Redirect};
use rocket::response::status::Custom;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use crate::auth::UserInfo;
use crate::class_sessions::SessionRecord;
use crate::dashboard::sessions::{month_sessions, session_stats_select, SessionStats, SessionStatsRow};
use crate::dashboard::{flag_filter, id_filter, Month};
use crate::datetime;
use crate::db::DbPool;
use crate::schedules::{load_schedule, schedule_options, weekday_options, ScheduleId, ScheduleRecord};
use crate::teachers::teacher_options;
use crate::util::{like_pattern, non_blank, percentage, status_sqlx_error, Page};

#[derive(FromForm, Serialize, Default, Debug, ActiveFilters)]
pub struct ScheduleFilter {
    pub q: Option<String>,
    pub profesor: Option<String>,
    pub dia: Option<String>,
    pub activo: Option<String>,
    pub horario: Option<String>,
}

#[derive(Serialize, FromRow, Debug, PartialEq)]
pub struct ScheduleTotals {
    pub total_horarios: i64,
    pub horarios_activos: i64,
    pub sesiones_este_mes: i64,
}

#[derive(FromRow, Debug)]
struct ScheduleStatsRow {
    #[sqlx(flatten)]
    schedule: ScheduleRecord,
    alumnos_matriculados: i64,
    sesiones_este_mes: i64,
    asistencias_este_mes: i64,
    proxima_sesion: Option<NaiveDateTime>,
    ultima_sesion: Option<NaiveDateTime>,
}

#[derive(Serialize, Debug)]
pub struct ScheduleStats {
    pub horario: ScheduleRecord,
    pub dia: &'static str,
    pub alumnos_matriculados: i64,
    pub sesiones_este_mes: i64,
    pub asistencias_este_mes: i64,
    pub proxima_sesion: Option<NaiveDateTime>,
    pub ultima_sesion: Option<NaiveDateTime>,
    pub ocupacion: f64,
}
impl From<ScheduleStatsRow> for ScheduleStats {
    fn from(row: ScheduleStatsRow) -> Self {
        Self {
            dia: row.schedule.weekday_name(),
            ocupacion: percentage(row.alumnos_matriculados, row.schedule.capacity),
            horario: row.schedule,
            alumnos_matriculados: row.alumnos_matriculados,
            sesiones_este_mes: row.sesiones_este_mes,
            asistencias_este_mes: row.asistencias_este_mes,
            proxima_sesion: row.proxima_sesion,
            ultima_sesion: row.ultima_sesion,
        }
    }
}

const SCHEDULE_FILTER: &str = "(?1 IS NULL OR LOWER(h.subject) LIKE ?1 OR LOWER(h.room) LIKE ?1
        OR LOWER(u.first_name) LIKE ?1 OR LOWER(u.last_name) LIKE ?1)
    AND (?2 IS NULL OR h.teacher_id=?2)
    AND (?3 IS NULL OR h.weekday=?3)
    AND (?4 IS NULL OR h.id=?4)";

/// Totals honour every filter except `activo`.
pub async fn schedule_totals(pool: &SqlitePool, filter: &ScheduleFilter, month: &Month) -> Result<ScheduleTotals, sqlx::Error> {
    sqlx::query_as::<_, ScheduleTotals>(&format!("SELECT COUNT(*) AS total_horarios,
            COALESCE(SUM(h.active), 0) AS horarios_activos,
            (SELECT COUNT(*) FROM class_sessions AS c
                WHERE strftime('%Y-%m', c.starts_at)=?5 AND c.schedule_id IN (
                    SELECT h.id FROM schedules AS h
                    JOIN teachers AS t ON t.id=h.teacher_id
                    JOIN users AS u ON u.id=t.user_id
                    WHERE {SCHEDULE_FILTER})) AS sesiones_este_mes
            FROM schedules AS h
            JOIN teachers AS t ON t.id=h.teacher_id
            JOIN users AS u ON u.id=t.user_id
            WHERE {SCHEDULE_FILTER}"))
        .bind(like_pattern(non_blank(&filter.q)))
        .bind(id_filter(non_blank(&filter.profesor)))
        .bind(id_filter(non_blank(&filter.dia)))
        .bind(id_filter(non_blank(&filter.horario)))
        .bind(&month.key)
        .fetch_one(pool)
        .await
}

pub async fn schedule_stats(pool: &SqlitePool, filter: &ScheduleFilter, month: &Month, now: NaiveDateTime) -> Result<Vec<ScheduleStats>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ScheduleStatsRow>(&format!("SELECT h.*, {} AS teacher_name,
            (SELECT COUNT(*) FROM enrollments AS e WHERE e.schedule_id=h.id AND e.status='activa') AS alumnos_matriculados,
            (SELECT COUNT(*) FROM class_sessions AS c
                WHERE c.schedule_id=h.id AND strftime('%Y-%m', c.starts_at)=?5) AS sesiones_este_mes,
            (SELECT COUNT(*) FROM attendance AS a JOIN class_sessions AS c ON c.id=a.session_id
                WHERE c.schedule_id=h.id AND strftime('%Y-%m', c.starts_at)=?5 AND a.present=1) AS asistencias_este_mes,
            (SELECT MIN(c.starts_at) FROM class_sessions AS c WHERE c.schedule_id=h.id AND c.starts_at>=?6) AS proxima_sesion,
            (SELECT MAX(c.starts_at) FROM class_sessions AS c WHERE c.schedule_id=h.id AND c.starts_at<?6) AS ultima_sesion
            FROM schedules AS h
            JOIN teachers AS t ON t.id=h.teacher_id
            JOIN users AS u ON u.id=t.user_id
            WHERE {SCHEDULE_FILTER} AND (?7 IS NULL OR h.active=?7)
            ORDER BY h.weekday, h.start_time", crate::teachers::TEACHER_NAME_SQL))
        .bind(like_pattern(non_blank(&filter.q)))
        .bind(id_filter(non_blank(&filter.profesor)))
        .bind(id_filter(non_blank(&filter.dia)))
        .bind(id_filter(non_blank(&filter.horario)))
        .bind(&month.key)
        .bind(now)
        .bind(flag_filter(non_blank(&filter.activo), "activo"))
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(ScheduleStats::from).collect())
}

#[get("/gestion/horarios?<filter..>")]
async fn get_schedules(filter: ScheduleFilter, user: UserInfo, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let month = Month::current();
    let totals = schedule_totals(&db.0, &filter, &month).await.map_err(status_sqlx_error)?;
    let horarios = schedule_stats(&db.0, &filter, &month, datetime::now()).await.map_err(status_sqlx_error)?;
    let profesores = teacher_options(&db.0, true).await.map_err(status_sqlx_error)?;
    let todos_horarios = schedule_options(&db.0, true).await.map_err(status_sqlx_error)?;
    Ok(Template::render("gestion/horarios", context! {
        titulo: "Gestión de Horarios",
        user,
        horarios,
        totals,
        profesores,
        todos_horarios,
        dias: weekday_options(),
        month,
        has_filters: filter.has_active_filters(),
        filters: filter,
    }))
}

#[derive(Serialize, FromRow, Debug)]
pub struct EnrolledStudentStats {
    pub enrollment_id: i64,
    pub enrolled_on: NaiveDate,
    pub student_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub dni: Option<String>,
    pub phone: String,
    pub asistencias_este_mes: i64,
    pub total_sesiones_mes: i64,
    #[sqlx(skip)]
    pub porcentaje_asistencia: f64,
    pub ultima_asistencia: Option<NaiveDateTime>,
    pub ultima_asistencia_presente: Option<bool>,
}

async fn enrolled_student_stats(pool: &SqlitePool, schedule_id: ScheduleId, month: &Month) -> Result<Vec<EnrolledStudentStats>, sqlx::Error> {
    let mut students = sqlx::query_as::<_, EnrolledStudentStats>("SELECT e.id AS enrollment_id, e.enrolled_on,
            s.id AS student_id, s.first_name, s.last_name, s.dni, s.phone,
            (SELECT COUNT(*) FROM attendance AS a JOIN class_sessions AS c ON c.id=a.session_id
                WHERE a.student_id=s.id AND c.schedule_id=e.schedule_id
                    AND strftime('%Y-%m', c.starts_at)=?2 AND a.present=1) AS asistencias_este_mes,
            (SELECT COUNT(*) FROM attendance AS a JOIN class_sessions AS c ON c.id=a.session_id
                WHERE a.student_id=s.id AND c.schedule_id=e.schedule_id
                    AND strftime('%Y-%m', c.starts_at)=?2) AS total_sesiones_mes,
            (SELECT c.starts_at FROM attendance AS a JOIN class_sessions AS c ON c.id=a.session_id
                WHERE a.student_id=s.id AND c.schedule_id=e.schedule_id
                ORDER BY c.starts_at DESC LIMIT 1) AS ultima_asistencia,
            (SELECT a.present FROM attendance AS a JOIN class_sessions AS c ON c.id=a.session_id
                WHERE a.student_id=s.id AND c.schedule_id=e.schedule_id
                ORDER BY c.starts_at DESC LIMIT 1) AS ultima_asistencia_presente
            FROM enrollments AS e
            JOIN students AS s ON s.id=e.student_id
            WHERE e.schedule_id=?1 AND e.status='activa'
            ORDER BY s.last_name, s.first_name")
        .bind(schedule_id)
        .bind(&month.key)
        .fetch_all(pool)
        .await?;
    for student in &mut students {
        student.porcentaje_asistencia = percentage(student.asistencias_este_mes, student.total_sesiones_mes);
    }
    Ok(students)
}

#[get("/gestion/horarios/<schedule_id>")]
async fn get_schedule_detail(schedule_id: ScheduleId, user: UserInfo, db: &State<DbPool>) -> Result<Page, Custom<String>> {
    let pool = &db.0;
    let Some(horario) = load_schedule(pool, schedule_id).await.map_err(status_sqlx_error)? else {
        return Ok(Flash::error(Redirect::to("/gestion/horarios/"), "Horario no encontrado.").into());
    };
    let now = datetime::now();
    let month = Month::current();
    let alumnos_matriculados = enrolled_student_stats(pool, schedule_id, &month).await.map_err(status_sqlx_error)?;
    let total_alumnos = alumnos_matriculados.len() as i64;

    let sesiones_mes = month_sessions(pool, schedule_id, &month).await.map_err(status_sqlx_error)?;
    let asistencias_mes: i64 = sesiones_mes.iter().map(|s| s.asistencias_presentes).sum();
    let asistencias_posibles: i64 = sesiones_mes.iter().map(|s| s.total_asistencias).sum();

    let proximas_sesiones = sqlx::query_as::<_, SessionRecord>(&format!("{} WHERE c.schedule_id=? AND c.starts_at>=? ORDER BY c.starts_at LIMIT 5",
                                                                        crate::class_sessions::session_select()))
        .bind(schedule_id)
        .bind(now)
        .fetch_all(pool)
        .await
        .map_err(status_sqlx_error)?;
    let ultimas_sesiones = sqlx::query_as::<_, SessionStatsRow>(&format!("{} WHERE c.schedule_id=? AND c.starts_at<? ORDER BY c.starts_at DESC LIMIT 5",
                                                                         session_stats_select()))
        .bind(schedule_id)
        .bind(now)
        .fetch_all(pool)
        .await
        .map_err(status_sqlx_error)?
        .into_iter()
        .map(|row| SessionStats::new(row, now))
        .collect::<Vec<_>>();

    Ok(Template::render("gestion/detalle_horario", context! {
        titulo: format!("Detalle de {}", horario.subject),
        user,
        dia: horario.weekday_name(),
        ocupacion: percentage(total_alumnos, horario.capacity),
        horario,
        total_alumnos,
        total_sesiones_mes: sesiones_mes.len(),
        sesiones_mes,
        asistencias_mes,
        porcentaje_asistencia_general: percentage(asistencias_mes, asistencias_posibles),
        proximas_sesiones,
        ultimas_sesiones,
        alumnos_matriculados,
        month,
    }).into())
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_schedules,
            get_schedule_detail,
        ])
}
