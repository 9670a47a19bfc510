use chrono::{Duration, NaiveDate, NaiveDateTime};
use esquemas_proc_macros::ActiveFilters;
use rocket::request::FlashMessage;
use rocket::response::{Flash, Redirect};
use rocket::response::status::Custom;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use crate::auth::UserInfo;
use crate::dashboard::{flag_filter, Month};
use crate::datetime;
use crate::db::DbPool;
use crate::money::Money;
use crate::payments::{payment_select, PaymentRecord};
use crate::students::{course_label, load_student, StudentId, StudentRecord, COURSES};
use crate::util::{like_pattern, non_blank, percentage, status_sqlx_error, FlashView, Page};

#[derive(FromForm, Serialize, Default, Debug, ActiveFilters)]
pub struct StudentFilter {
    pub q: Option<String>,
    pub estado: Option<String>,
    pub curso: Option<String>,
    pub compartido: Option<String>,
}

#[derive(Serialize, FromRow, Debug, PartialEq)]
pub struct StudentTotals {
    pub total_alumnos: i64,
    pub alumnos_activos: i64,
    pub alumnos_compartidos: i64,
}

#[derive(FromRow, Debug)]
struct StudentStatsRow {
    #[sqlx(flatten)]
    student: StudentRecord,
    horarios_matriculados: i64,
    asistencias_este_mes: i64,
    total_sesiones_mes: i64,
    pagos_este_mes: i64,
    ultimo_pago_numero: Option<String>,
    ultimo_pago_fecha: Option<NaiveDate>,
    ultimo_pago_importe: Option<i64>,
    proxima_sesion: Option<NaiveDateTime>,
    proxima_sesion_asignatura: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct LastPayment {
    pub numero: String,
    pub fecha: NaiveDate,
    pub importe: Money,
}

#[derive(Serialize, Debug)]
pub struct NextSession {
    pub inicio: NaiveDateTime,
    pub asignatura: String,
}

#[derive(Serialize, Debug)]
pub struct StudentStats {
    pub alumno: StudentRecord,
    pub curso: &'static str,
    pub horarios_matriculados: i64,
    pub asistencias_este_mes: i64,
    pub no_asistencias_este_mes: i64,
    pub total_sesiones_mes: i64,
    pub porcentaje_asistencia: f64,
    pub pagos_este_mes: Money,
    pub ultimo_pago: Option<LastPayment>,
    pub proxima_sesion: Option<NextSession>,
}

impl From<StudentStatsRow> for StudentStats {
    fn from(row: StudentStatsRow) -> Self {
        let ultimo_pago = match (row.ultimo_pago_numero, row.ultimo_pago_fecha, row.ultimo_pago_importe) {
            (Some(numero), Some(fecha), Some(importe)) => Some(LastPayment { numero, fecha, importe: Money::from_cents(importe) }),
            _ => None,
        };
        let proxima_sesion = row.proxima_sesion.map(|inicio| NextSession {
            inicio,
            asignatura: row.proxima_sesion_asignatura.unwrap_or_default(),
        });
        Self {
            curso: course_label(&row.student.course),
            alumno: row.student,
            horarios_matriculados: row.horarios_matriculados,
            asistencias_este_mes: row.asistencias_este_mes,
            no_asistencias_este_mes: row.total_sesiones_mes - row.asistencias_este_mes,
            total_sesiones_mes: row.total_sesiones_mes,
            porcentaje_asistencia: percentage(row.asistencias_este_mes, row.total_sesiones_mes),
            pagos_este_mes: Money::from_cents(row.pagos_este_mes),
            ultimo_pago,
            proxima_sesion,
        }
    }
}

const STUDENT_SEARCH: &str = "(?1 IS NULL OR LOWER(s.first_name) LIKE ?1 OR LOWER(s.last_name) LIKE ?1 OR LOWER(COALESCE(s.dni, '')) LIKE ?1)";

/// Totals honour only the search term.
pub async fn student_totals(pool: &SqlitePool, q: Option<&str>) -> Result<StudentTotals, sqlx::Error> {
    sqlx::query_as::<_, StudentTotals>(&format!("SELECT COUNT(*) AS total_alumnos,
            COALESCE(SUM(s.active), 0) AS alumnos_activos,
            COALESCE(SUM(s.active AND s.shared), 0) AS alumnos_compartidos
            FROM students AS s
            WHERE {STUDENT_SEARCH}"))
        .bind(like_pattern(q))
        .fetch_one(pool)
        .await
}

pub async fn student_stats(pool: &SqlitePool, filter: &StudentFilter, month: &Month, now: NaiveDateTime) -> Result<Vec<StudentStats>, sqlx::Error> {
    let rows = sqlx::query_as::<_, StudentStatsRow>(&format!("SELECT s.*,
            (SELECT COUNT(*) FROM enrollments AS e WHERE e.student_id=s.id AND e.status='activa') AS horarios_matriculados,
            (SELECT COUNT(*) FROM attendance AS a JOIN class_sessions AS c ON c.id=a.session_id
                WHERE a.student_id=s.id AND strftime('%Y-%m', c.starts_at)=?5 AND a.present=1) AS asistencias_este_mes,
            (SELECT COUNT(*) FROM attendance AS a JOIN class_sessions AS c ON c.id=a.session_id
                WHERE a.student_id=s.id AND strftime('%Y-%m', c.starts_at)=?5) AS total_sesiones_mes,
            (SELECT COALESCE(SUM(p.final_amount), 0) FROM payments AS p
                WHERE p.student_id=s.id AND strftime('%Y-%m', p.paid_on)=?5) AS pagos_este_mes,
            (SELECT p.number FROM payments AS p WHERE p.student_id=s.id ORDER BY p.paid_on DESC, p.id DESC LIMIT 1) AS ultimo_pago_numero,
            (SELECT p.paid_on FROM payments AS p WHERE p.student_id=s.id ORDER BY p.paid_on DESC, p.id DESC LIMIT 1) AS ultimo_pago_fecha,
            (SELECT p.final_amount FROM payments AS p WHERE p.student_id=s.id ORDER BY p.paid_on DESC, p.id DESC LIMIT 1) AS ultimo_pago_importe,
            (SELECT c.starts_at FROM class_sessions AS c JOIN enrollments AS e ON e.schedule_id=c.schedule_id
                WHERE e.student_id=s.id AND e.status='activa' AND c.starts_at>=?6
                ORDER BY c.starts_at LIMIT 1) AS proxima_sesion,
            (SELECT h.subject FROM class_sessions AS c JOIN enrollments AS e ON e.schedule_id=c.schedule_id
                JOIN schedules AS h ON h.id=c.schedule_id
                WHERE e.student_id=s.id AND e.status='activa' AND c.starts_at>=?6
                ORDER BY c.starts_at LIMIT 1) AS proxima_sesion_asignatura
            FROM students AS s
            WHERE {STUDENT_SEARCH}
                AND (?2 IS NULL OR s.active=?2)
                AND (?3 IS NULL OR s.course=?3)
                AND (?4 IS NULL OR s.shared=?4)
            ORDER BY s.last_name, s.first_name"))
        .bind(like_pattern(non_blank(&filter.q)))
        .bind(flag_filter(non_blank(&filter.estado), "activo"))
        .bind(non_blank(&filter.curso))
        .bind(flag_filter(non_blank(&filter.compartido), "compartido"))
        .bind(&month.key)
        .bind(now)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(StudentStats::from).collect())
}

#[get("/gestion/alumnos?<filter..>")]
async fn get_students(filter: StudentFilter, user: UserInfo, db: &State<DbPool>, flash: Option<FlashMessage<'_>>) -> Result<Template, Custom<String>> {
    let month = Month::current();
    let totals = student_totals(&db.0, non_blank(&filter.q)).await.map_err(status_sqlx_error)?;
    let alumnos = student_stats(&db.0, &filter, &month, datetime::now()).await.map_err(status_sqlx_error)?;
    let cursos = COURSES.iter().map(|(code, label)| context! { code, label }).collect::<Vec<_>>();
    Ok(Template::render("gestion/alumnos", context! {
        titulo: "Gestión de Alumnos",
        user,
        alumnos,
        totals,
        month,
        cursos,
        has_filters: filter.has_active_filters(),
        filters: filter,
        flash: FlashView::from_flash(flash),
    }))
}

#[derive(Serialize, FromRow, Debug)]
pub struct AttendanceHistoryRow {
    pub id: i64,
    pub present: bool,
    pub session_id: i64,
    pub subject: String,
    pub starts_at: NaiveDateTime,
    pub ends_at: NaiveDateTime,
}

async fn attendance_history(pool: &SqlitePool, student_id: StudentId, condition: &str, param: impl ToString) -> Result<Vec<AttendanceHistoryRow>, sqlx::Error> {
    sqlx::query_as::<_, AttendanceHistoryRow>(&format!("SELECT a.id, a.present, a.session_id, h.subject, c.starts_at, c.ends_at
            FROM attendance AS a
            JOIN class_sessions AS c ON c.id=a.session_id
            JOIN schedules AS h ON h.id=c.schedule_id
            WHERE a.student_id=? AND {condition}
            ORDER BY c.starts_at DESC"))
        .bind(student_id)
        .bind(param.to_string())
        .fetch_all(pool)
        .await
}

#[derive(Serialize, FromRow, Debug)]
pub struct UpcomingSession {
    pub session_id: i64,
    pub schedule_id: i64,
    pub subject: String,
    pub starts_at: NaiveDateTime,
    pub ends_at: NaiveDateTime,
    pub enrolled_on: NaiveDate,
}

/// Next session of every active enrollment, soonest first.
async fn upcoming_sessions(pool: &SqlitePool, student_id: StudentId, now: NaiveDateTime) -> Result<Vec<UpcomingSession>, sqlx::Error> {
    sqlx::query_as::<_, UpcomingSession>("SELECT c.id AS session_id, h.id AS schedule_id, h.subject, c.starts_at, c.ends_at, e.enrolled_on
            FROM enrollments AS e
            JOIN schedules AS h ON h.id=e.schedule_id
            JOIN class_sessions AS c ON c.id=(
                SELECT c2.id FROM class_sessions AS c2
                WHERE c2.schedule_id=e.schedule_id AND c2.starts_at>=?2
                ORDER BY c2.starts_at LIMIT 1)
            WHERE e.student_id=?1 AND e.status='activa'
            ORDER BY c.starts_at")
        .bind(student_id)
        .bind(now)
        .fetch_all(pool)
        .await
}

#[get("/gestion/alumnos/<student_id>")]
async fn get_student_detail(student_id: StudentId, user: UserInfo, db: &State<DbPool>) -> Result<Page, Custom<String>> {
    let pool = &db.0;
    let Some(alumno) = load_student(pool, student_id).await.map_err(status_sqlx_error)? else {
        return Ok(Flash::error(Redirect::to("/gestion/alumnos/"), "Alumno no encontrado.").into());
    };
    let now = datetime::now();
    let month = Month::current();
    let total_horarios: (i64, ) = sqlx::query_as("SELECT COUNT(*) FROM enrollments WHERE student_id=? AND status='activa'")
        .bind(student_id)
        .fetch_one(pool)
        .await
        .map_err(status_sqlx_error)?;
    let asistencias_mes = attendance_history(pool, student_id, "strftime('%Y-%m', c.starts_at)=?", &month.key)
        .await.map_err(status_sqlx_error)?;
    let asistencias_presente = asistencias_mes.iter().filter(|a| a.present).count() as i64;
    let total_sesiones_mes = asistencias_mes.len() as i64;

    let pagos_alumno = sqlx::query_as::<_, PaymentRecord>(&format!("{} WHERE p.student_id=? ORDER BY p.paid_on DESC, p.id DESC", payment_select()))
        .bind(student_id)
        .fetch_all(pool)
        .await
        .map_err(status_sqlx_error)?;
    let total_pagado: Money = pagos_alumno.iter().map(|p| p.final_amount).sum();
    let pagos_mes_actual: Money = pagos_alumno.iter()
        .filter(|p| datetime::month_key(p.paid_on) == month.key)
        .map(|p| p.final_amount)
        .sum();

    let faltas_recientes = attendance_history(pool, student_id, "a.present=0 AND c.starts_at>=?", now - Duration::days(90))
        .await.map_err(status_sqlx_error)?;
    let historial_asistencias = attendance_history(pool, student_id, "c.starts_at>=?", now - Duration::days(180))
        .await.map_err(status_sqlx_error)?;
    let proximas_sesiones = upcoming_sessions(pool, student_id, now).await.map_err(status_sqlx_error)?;

    Ok(Template::render("gestion/detalle_alumno", context! {
        titulo: format!("Detalle de {}", alumno.full_name()),
        user,
        curso: course_label(&alumno.course),
        alumno,
        total_horarios: total_horarios.0,
        asistencias_presente,
        asistencias_faltas: total_sesiones_mes - asistencias_presente,
        total_sesiones_mes,
        porcentaje_asistencia: percentage(asistencias_presente, total_sesiones_mes),
        asistencias_mes,
        pagos_alumno,
        total_pagado,
        pagos_mes_actual,
        faltas_recientes,
        proximas_sesiones,
        historial_asistencias,
        month,
    }).into())
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_students,
            get_student_detail,
        ])
}
