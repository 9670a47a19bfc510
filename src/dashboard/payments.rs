use chrono::NaiveDate;
use esquemas_proc_macros::ActiveFilters;
use rocket::request::FlashMessage;
use rocket::response::status::Custom;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use crate::auth::UserInfo;
use crate::dashboard::Month;
use crate::datetime;
use crate::db::DbPool;
use crate::money::Money;
use crate::payments::{payment_select, PaymentRecord};
use crate::students::StudentRecord;
use crate::util::{like_pattern, non_blank, status_sqlx_error, FlashView};

pub const AMOUNT_RANGE_WARNING: &str = "Rangos de importe inválidos. Se ignoraron los filtros de importe.";

#[derive(FromForm, Serialize, Default, Debug, ActiveFilters)]
pub struct PaymentFilter {
    pub q: Option<String>,
    pub desde: Option<String>,
    pub hasta: Option<String>,
    pub imp_min: Option<String>,
    pub imp_max: Option<String>,
}

#[derive(Debug, Default, PartialEq)]
pub struct AmountRange {
    pub min: Option<Money>,
    pub max: Option<Money>,
    pub warning: Option<&'static str>,
}

/// Amount bounds of the filter. A malformed bound is dropped with a warning; the other one still applies.
pub fn amount_range(imp_min: Option<&str>, imp_max: Option<&str>) -> AmountRange {
    let mut range = AmountRange::default();
    let mut bound = |value: Option<&str>| match value.map(Money::parse).transpose() {
        Ok(amount) => amount,
        Err(_) => {
            range.warning = Some(AMOUNT_RANGE_WARNING);
            None
        }
    };
    let min = bound(imp_min);
    let max = bound(imp_max);
    AmountRange { min, max, ..range }
}

#[derive(Debug, Default)]
pub struct PaymentQuery {
    pub q: Option<String>,
    pub desde: Option<NaiveDate>,
    pub hasta: Option<NaiveDate>,
    pub imp_min: Option<Money>,
    pub imp_max: Option<Money>,
}
impl PaymentQuery {
    /// Malformed dates are ignored; the warning is set when an amount bound is dropped.
    pub fn from_filter(filter: &PaymentFilter) -> (Self, Option<&'static str>) {
        let range = amount_range(non_blank(&filter.imp_min), non_blank(&filter.imp_max));
        let query = Self {
            q: like_pattern(non_blank(&filter.q)),
            desde: datetime::parse_date(non_blank(&filter.desde)),
            hasta: datetime::parse_date(non_blank(&filter.hasta)),
            imp_min: range.min,
            imp_max: range.max,
        };
        (query, range.warning)
    }
}

const PAYMENT_FILTER: &str = "(?1 IS NULL OR LOWER(p.number) LIKE ?1 OR LOWER(p.concept) LIKE ?1
        OR LOWER(s.first_name) LIKE ?1 OR LOWER(s.last_name) LIKE ?1
        OR LOWER(COALESCE(u.first_name, '')) LIKE ?1 OR LOWER(COALESCE(u.last_name, '')) LIKE ?1)
    AND (?2 IS NULL OR p.paid_on>=?2)
    AND (?3 IS NULL OR p.paid_on<=?3)
    AND (?4 IS NULL OR p.final_amount>=?4)
    AND (?5 IS NULL OR p.final_amount<=?5)";

pub async fn filtered_payments(pool: &SqlitePool, query: &PaymentQuery) -> Result<Vec<PaymentRecord>, sqlx::Error> {
    sqlx::query_as::<_, PaymentRecord>(&format!("{} WHERE {PAYMENT_FILTER} ORDER BY p.paid_on DESC, p.id DESC", payment_select()))
        .bind(&query.q)
        .bind(query.desde)
        .bind(query.hasta)
        .bind(query.imp_min.map(|m| m.cents()))
        .bind(query.imp_max.map(|m| m.cents()))
        .fetch_all(pool)
        .await
}

pub async fn payments_total(pool: &SqlitePool) -> Result<Money, sqlx::Error> {
    let sum: (i64, ) = sqlx::query_as("SELECT COALESCE(SUM(final_amount), 0) FROM payments")
        .fetch_one(pool)
        .await?;
    Ok(Money::from_cents(sum.0))
}

#[derive(FromRow, Debug)]
struct PendingStudentRow {
    #[sqlx(flatten)]
    student: StudentRecord,
    last_number: Option<String>,
    last_paid_on: Option<NaiveDate>,
    last_amount: Option<i64>,
}

#[derive(Serialize, Debug)]
pub struct PendingStudent {
    pub alumno: StudentRecord,
    pub ultimo_pago_numero: Option<String>,
    pub ultimo_pago_fecha: Option<NaiveDate>,
    pub ultimo_pago_importe: Option<Money>,
}

/// Active students without any payment in the month, with their last payment.
pub async fn pending_students(pool: &SqlitePool, month: &Month) -> Result<Vec<PendingStudent>, sqlx::Error> {
    let rows = sqlx::query_as::<_, PendingStudentRow>("SELECT s.*,
            (SELECT p.number FROM payments AS p WHERE p.student_id=s.id ORDER BY p.paid_on DESC, p.id DESC LIMIT 1) AS last_number,
            (SELECT p.paid_on FROM payments AS p WHERE p.student_id=s.id ORDER BY p.paid_on DESC, p.id DESC LIMIT 1) AS last_paid_on,
            (SELECT p.final_amount FROM payments AS p WHERE p.student_id=s.id ORDER BY p.paid_on DESC, p.id DESC LIMIT 1) AS last_amount
            FROM students AS s
            WHERE s.active=1 AND NOT EXISTS(
                SELECT 1 FROM payments AS p WHERE p.student_id=s.id AND strftime('%Y-%m', p.paid_on)=?)
            ORDER BY s.last_name, s.first_name")
        .bind(&month.key)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|row| PendingStudent {
        alumno: row.student,
        ultimo_pago_numero: row.last_number,
        ultimo_pago_fecha: row.last_paid_on,
        ultimo_pago_importe: row.last_amount.map(Money::from_cents),
    }).collect())
}

#[get("/gestion/pagos?<filter..>")]
async fn get_payments(filter: PaymentFilter, user: UserInfo, db: &State<DbPool>, flash: Option<FlashMessage<'_>>) -> Result<Template, Custom<String>> {
    let pool = &db.0;
    let month = Month::current();
    let hoy = datetime::today();
    let total_general_all = payments_total(pool).await.map_err(status_sqlx_error)?;
    let alumnos_pendientes = pending_students(pool, &month).await.map_err(status_sqlx_error)?;
    let (query, warning) = PaymentQuery::from_filter(&filter);
    let pagos = filtered_payments(pool, &query).await.map_err(status_sqlx_error)?;
    let total_filtrado: Money = pagos.iter().map(|p| p.final_amount).sum();
    let total_hoy: Money = pagos.iter().filter(|p| p.paid_on == hoy).map(|p| p.final_amount).sum();
    Ok(Template::render("gestion/pagos", context! {
        titulo: "Gestión de Pagos",
        user,
        pagos,
        alumnos_pendientes,
        total_hoy,
        total_filtrado,
        total_general_all,
        fecha_hoy: hoy,
        warning,
        month,
        has_filters: filter.has_active_filters(),
        filters: filter,
        flash: FlashView::from_flash(flash),
    }))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_payments,
        ])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn malformed_amount_keeps_the_other_bound() {
        assert_eq!(amount_range(Some("10"), Some("20.5")), AmountRange {
            min: Some(Money::from_cents(1000)),
            max: Some(Money::from_cents(2050)),
            warning: None,
        });
        assert_eq!(amount_range(None, Some("20")).max, Some(Money::from_cents(2000)));
        assert_eq!(amount_range(Some("10"), Some("mucho")), AmountRange {
            min: Some(Money::from_cents(1000)),
            max: None,
            warning: Some(AMOUNT_RANGE_WARNING),
        });
        assert_eq!(amount_range(Some("abc"), Some("xyz")), AmountRange {
            warning: Some(AMOUNT_RANGE_WARNING),
            ..Default::default()
        });

        let filter = PaymentFilter {
            desde: Some("2025-13-40".to_string()),
            hasta: Some("2025-02-28".to_string()),
            imp_min: Some("abc".to_string()),
            imp_max: Some("50".to_string()),
            ..Default::default()
        };
        let (query, warning) = PaymentQuery::from_filter(&filter);
        assert_eq!(warning, Some(AMOUNT_RANGE_WARNING));
        assert_eq!(query.desde, None);
        assert_eq!(query.hasta, NaiveDate::from_ymd_opt(2025, 2, 28));
        assert_eq!(query.imp_min, None);
        assert_eq!(query.imp_max, Some(Money::from_cents(5000)));
        assert!(filter.has_active_filters());
    }
}
