use chrono::{Datelike, NaiveDate};
use rocket::request::FlashMessage;
use rocket::response::{Flash, Redirect};
use rocket::response::status::Custom;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use crate::auth::UserInfo;
use crate::datetime;
use crate::db::DbPool;
use crate::expenses::seed_expenses;
use crate::money::Money;
use crate::rates::seed_rates;
use crate::util::{status_any_error, status_sqlx_error, FlashView};

pub mod students;
pub mod schedules;
pub mod sessions;
pub mod payments;
pub mod expenses;

/// Calendar month every "this month" figure refers to.
#[derive(Serialize, Clone, Debug)]
pub struct Month {
    /// `YYYY-MM`, compared against `strftime('%Y-%m', column)`
    pub key: String,
    pub month: u32,
    pub year: i32,
}
impl Month {
    pub fn of(date: NaiveDate) -> Self {
        Self { key: datetime::month_key(date), month: date.month(), year: date.year() }
    }
    pub fn current() -> Self {
        Self::of(datetime::today())
    }
}

/// `activo`/`compartido` like filters: the positive keyword means true, any other non-blank value false.
pub(crate) fn flag_filter(value: Option<&str>, positive: &str) -> Option<bool> {
    value.map(|v| v == positive)
}
/// Numeric id filter, malformed values are ignored.
pub(crate) fn id_filter(value: Option<&str>) -> Option<i64> {
    value?.parse().ok()
}

pub(crate) async fn sum_cents(pool: &SqlitePool, sql: &str, param: impl ToString) -> Result<Money, sqlx::Error> {
    let sum: (i64, ) = sqlx::query_as(sql)
        .bind(param.to_string())
        .fetch_one(pool)
        .await?;
    Ok(Money::from_cents(sum.0))
}

#[derive(Serialize, FromRow, Debug)]
struct HomeCounts {
    alumnos_count: i64,
    pagos_count: i64,
    horarios_count: i64,
    sesiones_count: i64,
    gastos_count: i64,
}

#[get("/gestion")]
async fn get_home(user: UserInfo, db: &State<DbPool>, flash: Option<FlashMessage<'_>>) -> Result<Template, Custom<String>> {
    let month = Month::current();
    let counts = sqlx::query_as::<_, HomeCounts>("SELECT
            (SELECT COUNT(*) FROM students WHERE active=1) AS alumnos_count,
            (SELECT COUNT(*) FROM payments) AS pagos_count,
            (SELECT COUNT(*) FROM schedules WHERE active=1) AS horarios_count,
            (SELECT COUNT(*) FROM class_sessions) AS sesiones_count,
            (SELECT COUNT(*) FROM expenses) AS gastos_count")
        .fetch_one(&db.0)
        .await
        .map_err(status_sqlx_error)?;
    let pagos_mes = sum_cents(&db.0, "SELECT COALESCE(SUM(final_amount), 0) FROM payments WHERE strftime('%Y-%m', paid_on)=?", &month.key)
        .await.map_err(status_sqlx_error)?;
    let gastos_mes = sum_cents(&db.0, "SELECT COALESCE(SUM(amount), 0) FROM expenses WHERE strftime('%Y-%m', spent_on)=?", &month.key)
        .await.map_err(status_sqlx_error)?;
    Ok(Template::render("gestion/inicio", context! {
        titulo: "Dashboard de Gestión",
        user,
        counts,
        pagos_mes,
        gastos_mes,
        balance_mes: pagos_mes - gastos_mes,
        month,
        flash: FlashView::from_flash(flash),
    }))
}

#[derive(Serialize, FromRow, Debug)]
pub struct ReportCounts {
    pub total_alumnos: i64,
    pub total_pagos: i64,
    pub total_asistencias: i64,
    pub total_gastos: i64,
}
pub async fn report_counts(pool: &SqlitePool) -> Result<ReportCounts, sqlx::Error> {
    sqlx::query_as::<_, ReportCounts>("SELECT
            (SELECT COUNT(*) FROM students) AS total_alumnos,
            (SELECT COUNT(*) FROM payments) AS total_pagos,
            (SELECT COUNT(*) FROM attendance) AS total_asistencias,
            (SELECT COUNT(*) FROM expenses) AS total_gastos")
        .fetch_one(pool)
        .await
}

#[get("/gestion/reportes")]
async fn get_reports(user: UserInfo, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let counts = report_counts(&db.0).await.map_err(status_sqlx_error)?;
    Ok(Template::render("gestion/reportes", context! {
        titulo: "Reportes",
        user,
        counts,
    }))
}

#[post("/gestion/setup/tarifas")]
async fn post_setup_rates(user: UserInfo, db: &State<DbPool>) -> Result<Flash<Redirect>, Custom<String>> {
    let summary = seed_rates(&db.0).await.map_err(status_any_error)?;
    info!("Sample rates seeded by {}: {summary:?}", user.username);
    Ok(Flash::success(Redirect::to("/admin/tarifas/"),
                      format!("Tarifas creadas: {}. Pagos actualizados: {}.", summary.created, summary.payments_updated)))
}

#[post("/gestion/setup/gastos")]
async fn post_setup_expenses(user: UserInfo, db: &State<DbPool>) -> Result<Flash<Redirect>, Custom<String>> {
    let summary = seed_expenses(&db.0).await.map_err(status_any_error)?;
    info!("Sample expenses seeded by {}: {summary:?}", user.username);
    Ok(Flash::success(Redirect::to("/admin/gastos/"),
                      format!("Gastos creados: {}. Ya existentes: {}.", summary.created, summary.existing)))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    let rocket = rocket.mount("/", routes![
            get_home,
            get_reports,
            post_setup_rates,
            post_setup_expenses,
        ]);
    let rocket = students::extend(rocket);
    let rocket = schedules::extend(rocket);
    let rocket = sessions::extend(rocket);
    let rocket = payments::extend(rocket);
    expenses::extend(rocket)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn month_of_date() {
        let month = Month::of(NaiveDate::from_ymd_opt(2025, 2, 28).unwrap());
        assert_eq!(month.key, "2025-02");
        assert_eq!(month.month, 2);
        assert_eq!(month.year, 2025);
    }

    #[test]
    fn filters_degrade_to_none() {
        assert_eq!(flag_filter(Some("activo"), "activo"), Some(true));
        assert_eq!(flag_filter(Some("inactivo"), "activo"), Some(false));
        assert_eq!(flag_filter(None, "activo"), None);
        assert_eq!(id_filter(Some("12")), Some(12));
        assert_eq!(id_filter(Some("doce")), None);
        assert_eq!(id_filter(None), None);
    }
}
