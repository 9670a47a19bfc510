use chrono::NaiveDateTime;
use esquemas_proc_macros::ActiveFilters;
use rocket::response::{Flash, Redirect};
use rocket::response::status::Custom;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use crate::auth::UserInfo;
use crate::class_sessions::{load_session, ClassSessionId, SessionRecord};
use crate::dashboard::{id_filter, Month};
use crate::datetime;
use crate::db::DbPool;
use crate::schedules::{actively_enrolled_students, schedule_options};
use crate::teachers::teacher_options;
use crate::util::{like_pattern, non_blank, percentage, status_sqlx_error, Page};

#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pasada,
    Hoy,
    Futura,
}
impl SessionState {
    /// A session that already started is past even when it is today.
    pub fn of(starts_at: NaiveDateTime, now: NaiveDateTime) -> Self {
        if starts_at < now {
            SessionState::Pasada
        } else if starts_at.date() == now.date() {
            SessionState::Hoy
        } else {
            SessionState::Futura
        }
    }
    pub fn code(self) -> &'static str {
        match self {
            SessionState::Pasada => "pasada",
            SessionState::Hoy => "hoy",
            SessionState::Futura => "futura",
        }
    }
    fn parse(s: &str) -> Option<Self> {
        match s {
            "pasada" => Some(SessionState::Pasada),
            "hoy" => Some(SessionState::Hoy),
            "futura" => Some(SessionState::Futura),
            _ => None,
        }
    }
}

/// Attendance columns restricted to students actively enrolled in the session's slot.
pub(crate) const ENROLLED_ATTENDANCE_COLUMNS: &str = "
    (SELECT COUNT(*) FROM enrollments AS e WHERE e.schedule_id=c.schedule_id AND e.status='activa') AS alumnos_matriculados,
    (SELECT COUNT(*) FROM attendance AS a
        JOIN enrollments AS e ON e.student_id=a.student_id AND e.schedule_id=c.schedule_id AND e.status='activa'
        WHERE a.session_id=c.id) AS total_asistencias,
    (SELECT COUNT(*) FROM attendance AS a
        JOIN enrollments AS e ON e.student_id=a.student_id AND e.schedule_id=c.schedule_id AND e.status='activa'
        WHERE a.session_id=c.id AND a.present=1) AS asistencias_presentes";

#[derive(FromRow, Debug)]
pub(crate) struct SessionStatsRow {
    #[sqlx(flatten)]
    pub session: SessionRecord,
    pub alumnos_matriculados: i64,
    pub total_asistencias: i64,
    pub asistencias_presentes: i64,
}

#[derive(Serialize, Debug)]
pub struct SessionStats {
    pub sesion: SessionRecord,
    pub alumnos_matriculados: i64,
    pub total_asistencias: i64,
    pub asistencias_presentes: i64,
    pub asistencias_faltas: i64,
    pub porcentaje_asistencia: f64,
    pub estado_sesion: SessionState,
}
impl SessionStats {
    pub(crate) fn new(row: SessionStatsRow, now: NaiveDateTime) -> Self {
        Self {
            estado_sesion: SessionState::of(row.session.starts_at, now),
            sesion: row.session,
            alumnos_matriculados: row.alumnos_matriculados,
            total_asistencias: row.total_asistencias,
            asistencias_presentes: row.asistencias_presentes,
            asistencias_faltas: row.total_asistencias - row.asistencias_presentes,
            porcentaje_asistencia: percentage(row.asistencias_presentes, row.total_asistencias),
        }
    }
}

pub(crate) fn session_stats_select() -> String {
    format!("SELECT c.*, h.subject, h.room, {} AS teacher_name, {ENROLLED_ATTENDANCE_COLUMNS}
        FROM class_sessions AS c
        JOIN schedules AS h ON h.id=c.schedule_id
        JOIN teachers AS t ON t.id=h.teacher_id
        JOIN users AS u ON u.id=t.user_id", crate::teachers::TEACHER_NAME_SQL)
}

#[derive(FromForm, Serialize, Default, Debug, ActiveFilters)]
pub struct SessionFilter {
    pub q: Option<String>,
    pub horario: Option<String>,
    pub profesor: Option<String>,
    pub estado: Option<String>,
}

#[derive(Serialize, FromRow, Debug, PartialEq)]
pub struct SessionTotals {
    pub total_sesiones: i64,
    pub sesiones_pasadas: i64,
    pub sesiones_futuras: i64,
    pub sesiones_hoy: i64,
}

const SESSION_FILTER: &str = "(?1 IS NULL OR LOWER(h.subject) LIKE ?1 OR LOWER(h.room) LIKE ?1
        OR LOWER(u.first_name) LIKE ?1 OR LOWER(u.last_name) LIKE ?1)
    AND (?2 IS NULL OR c.schedule_id=?2)
    AND (?3 IS NULL OR h.teacher_id=?3)";

/// Totals honour every filter except the session state.
pub async fn session_totals(pool: &SqlitePool, filter: &SessionFilter, now: NaiveDateTime) -> Result<SessionTotals, sqlx::Error> {
    sqlx::query_as::<_, SessionTotals>(&format!("SELECT COUNT(*) AS total_sesiones,
            COALESCE(SUM(c.starts_at<?4), 0) AS sesiones_pasadas,
            COALESCE(SUM(c.starts_at>=?4), 0) AS sesiones_futuras,
            COALESCE(SUM(date(c.starts_at)=?5), 0) AS sesiones_hoy
            FROM class_sessions AS c
            JOIN schedules AS h ON h.id=c.schedule_id
            JOIN teachers AS t ON t.id=h.teacher_id
            JOIN users AS u ON u.id=t.user_id
            WHERE {SESSION_FILTER}"))
        .bind(like_pattern(non_blank(&filter.q)))
        .bind(id_filter(non_blank(&filter.horario)))
        .bind(id_filter(non_blank(&filter.profesor)))
        .bind(now)
        .bind(now.date())
        .fetch_one(pool)
        .await
}

pub async fn session_stats(pool: &SqlitePool, filter: &SessionFilter, now: NaiveDateTime) -> Result<Vec<SessionStats>, sqlx::Error> {
    let state = non_blank(&filter.estado).and_then(SessionState::parse);
    let rows = sqlx::query_as::<_, SessionStatsRow>(&format!("{}
            WHERE {SESSION_FILTER}
                AND (?6 IS NULL
                    OR (?6='pasada' AND c.starts_at<?4)
                    OR (?6='futura' AND c.starts_at>=?4)
                    OR (?6='hoy' AND date(c.starts_at)=?5))
            ORDER BY c.starts_at DESC, c.id DESC", session_stats_select()))
        .bind(like_pattern(non_blank(&filter.q)))
        .bind(id_filter(non_blank(&filter.horario)))
        .bind(id_filter(non_blank(&filter.profesor)))
        .bind(now)
        .bind(now.date())
        .bind(state.map(SessionState::code))
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|row| SessionStats::new(row, now)).collect())
}

#[get("/gestion/sesiones?<filter..>")]
async fn get_sessions(filter: SessionFilter, user: UserInfo, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let now = datetime::now();
    let totals = session_totals(&db.0, &filter, now).await.map_err(status_sqlx_error)?;
    let sesiones = session_stats(&db.0, &filter, now).await.map_err(status_sqlx_error)?;
    let horarios = schedule_options(&db.0, true).await.map_err(status_sqlx_error)?;
    let profesores = teacher_options(&db.0, true).await.map_err(status_sqlx_error)?;
    Ok(Template::render("gestion/sesiones", context! {
        titulo: "Gestión de Sesiones",
        user,
        sesiones,
        totals,
        horarios,
        profesores,
        month: Month::current(),
        has_filters: filter.has_active_filters(),
        filters: filter,
    }))
}

#[derive(Serialize, FromRow, Debug)]
pub struct SessionAttendanceRow {
    pub id: i64,
    pub student_id: i64,
    pub present: bool,
    pub student_name: String,
    pub dni: Option<String>,
    pub enrolled: bool,
}

pub async fn session_attendance_with_enrollment(pool: &SqlitePool, session: &SessionRecord) -> Result<Vec<SessionAttendanceRow>, sqlx::Error> {
    sqlx::query_as::<_, SessionAttendanceRow>("SELECT a.id, a.student_id, a.present,
            s.first_name || ' ' || s.last_name AS student_name, s.dni,
            EXISTS(SELECT 1 FROM enrollments AS e
                WHERE e.student_id=a.student_id AND e.schedule_id=? AND e.status='activa') AS enrolled
            FROM attendance AS a
            JOIN students AS s ON s.id=a.student_id
            WHERE a.session_id=?
            ORDER BY s.last_name, s.first_name")
        .bind(session.schedule_id)
        .bind(session.id)
        .fetch_all(pool)
        .await
}

#[get("/gestion/sesiones/<session_id>/asistencias")]
async fn get_session_attendance(session_id: ClassSessionId, user: UserInfo, db: &State<DbPool>) -> Result<Page, Custom<String>> {
    let pool = &db.0;
    let Some(sesion) = load_session(pool, session_id).await.map_err(status_sqlx_error)? else {
        return Ok(Flash::error(Redirect::to("/gestion/horarios/"), "Sesión no encontrada.").into());
    };
    let rows = session_attendance_with_enrollment(pool, &sesion).await.map_err(status_sqlx_error)?;
    let enrolled = actively_enrolled_students(pool, sesion.schedule_id).await.map_err(status_sqlx_error)?;
    let alumnos_sin_registro = enrolled.into_iter()
        .filter(|student| !rows.iter().any(|a| a.student_id == student.id))
        .collect::<Vec<_>>();
    let (matched, asistencias_otros): (Vec<_>, Vec<_>) = rows.into_iter().partition(|a| a.enrolled);
    let (asistencias_presentes, asistencias_faltas): (Vec<_>, Vec<_>) = matched.into_iter().partition(|a| a.present);
    let total_matriculados: (i64, ) = sqlx::query_as("SELECT COUNT(*) FROM enrollments WHERE schedule_id=? AND status='activa'")
        .bind(sesion.schedule_id)
        .fetch_one(pool)
        .await
        .map_err(status_sqlx_error)?;
    let total_matriculados = total_matriculados.0;
    let total_presentes = asistencias_presentes.len() as i64;
    Ok(Template::render("gestion/detalle_asistencias", context! {
        titulo: format!("Asistencias - {}", sesion.subject),
        user,
        total_faltas: asistencias_faltas.len(),
        total_otros: asistencias_otros.len(),
        porcentaje_asistencia: percentage(total_presentes, total_matriculados),
        total_presentes,
        total_matriculados,
        asistencias_presentes,
        asistencias_faltas,
        asistencias_otros,
        alumnos_sin_registro,
        sesion,
    }).into())
}

/// Sessions of a slot in the given month, newest first.
pub async fn month_sessions(pool: &SqlitePool, schedule_id: i64, month: &Month) -> Result<Vec<SessionStats>, sqlx::Error> {
    let now = datetime::now();
    let rows = sqlx::query_as::<_, SessionStatsRow>(&format!("{} WHERE c.schedule_id=? AND strftime('%Y-%m', c.starts_at)=? ORDER BY c.starts_at DESC",
                                                              session_stats_select()))
        .bind(schedule_id)
        .bind(&month.key)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|row| SessionStats::new(row, now)).collect())
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_sessions,
            get_session_attendance,
        ])
}

#[cfg(test)]
mod test {
    use super::*;

    fn dt(s: &str) -> NaiveDateTime {
        datetime::parse_datetime(s).unwrap()
    }

    #[test]
    fn session_state_relative_to_now() {
        let now = dt("2025-03-10 12:00");
        assert_eq!(SessionState::of(dt("2025-03-10 09:00"), now), SessionState::Pasada);
        assert_eq!(SessionState::of(dt("2025-03-10 17:00"), now), SessionState::Hoy);
        assert_eq!(SessionState::of(dt("2025-03-11 09:00"), now), SessionState::Futura);
        assert_eq!(SessionState::of(dt("2025-03-09 17:00"), now), SessionState::Pasada);
        assert_eq!(SessionState::parse("hoy"), Some(SessionState::Hoy));
        assert_eq!(SessionState::parse("mañana"), None);
        assert_eq!(SessionState::Futura.code(), "futura");
    }
}
