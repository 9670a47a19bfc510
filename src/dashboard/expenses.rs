use chrono::NaiveDate;
use esquemas_proc_macros::ActiveFilters;
use rocket::request::FlashMessage;
use rocket::response::status::Custom;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use crate::admin::{choice_options, SelectOption};
use crate::auth::UserInfo;
use crate::dashboard::Month;
use crate::datetime;
use crate::db::DbPool;
use crate::expenses::{category_label, expense_select, ExpenseRecord, EXPENSE_CATEGORIES};
use crate::money::Money;
use crate::util::{like_pattern, non_blank, status_sqlx_error, FlashView};

#[derive(FromForm, Serialize, Default, Debug, ActiveFilters)]
pub struct ExpenseFilter {
    pub q: Option<String>,
    pub categoria: Option<String>,
    pub fecha_desde: Option<String>,
    pub fecha_hasta: Option<String>,
}

/// Expense row as listed in the dashboard, with the display fields resolved.
#[derive(Serialize, Debug)]
pub struct ExpenseView {
    #[serde(flatten)]
    pub gasto: ExpenseRecord,
    pub categoria: &'static str,
    pub factura_url: Option<String>,
    pub factura_nombre: Option<String>,
}
impl From<ExpenseRecord> for ExpenseView {
    fn from(gasto: ExpenseRecord) -> Self {
        Self {
            categoria: gasto.category_label(),
            factura_url: gasto.invoice_url(),
            factura_nombre: gasto.invoice_name(),
            gasto,
        }
    }
}

#[derive(FromRow, Debug)]
struct CategoryTotalRow {
    category: String,
    total: i64,
    count: i64,
}
#[derive(Serialize, Debug)]
pub struct CategoryTotal {
    pub categoria: String,
    pub label: &'static str,
    pub total: Money,
    pub cantidad: i64,
}

const EXPENSE_FILTER: &str = "(?1 IS NULL OR LOWER(g.concept) LIKE ?1 OR LOWER(g.notes) LIKE ?1)
    AND (?2 IS NULL OR g.category=?2)
    AND (?3 IS NULL OR g.spent_on>=?3)
    AND (?4 IS NULL OR g.spent_on<=?4)";

struct ExpenseQuery {
    q: Option<String>,
    categoria: Option<String>,
    desde: Option<NaiveDate>,
    hasta: Option<NaiveDate>,
}
impl ExpenseQuery {
    fn from_filter(filter: &ExpenseFilter) -> Self {
        Self {
            q: like_pattern(non_blank(&filter.q)),
            categoria: non_blank(&filter.categoria).map(str::to_string),
            desde: datetime::parse_date(non_blank(&filter.fecha_desde)),
            hasta: datetime::parse_date(non_blank(&filter.fecha_hasta)),
        }
    }
}

pub async fn filtered_expenses(pool: &SqlitePool, filter: &ExpenseFilter) -> Result<Vec<ExpenseRecord>, sqlx::Error> {
    let query = ExpenseQuery::from_filter(filter);
    sqlx::query_as::<_, ExpenseRecord>(&format!("{} WHERE {EXPENSE_FILTER} ORDER BY g.spent_on DESC, g.recorded_on DESC, g.id DESC", expense_select()))
        .bind(&query.q)
        .bind(&query.categoria)
        .bind(query.desde)
        .bind(query.hasta)
        .fetch_all(pool)
        .await
}

pub async fn category_totals(pool: &SqlitePool, filter: &ExpenseFilter) -> Result<Vec<CategoryTotal>, sqlx::Error> {
    let query = ExpenseQuery::from_filter(filter);
    let rows = sqlx::query_as::<_, CategoryTotalRow>(&format!("SELECT g.category, SUM(g.amount) AS total, COUNT(*) AS count
            FROM expenses AS g
            WHERE {EXPENSE_FILTER}
            GROUP BY g.category
            ORDER BY total DESC"))
        .bind(&query.q)
        .bind(&query.categoria)
        .bind(query.desde)
        .bind(query.hasta)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|row| CategoryTotal {
        label: category_label(&row.category),
        categoria: row.category,
        total: Money::from_cents(row.total),
        cantidad: row.count,
    }).collect())
}

fn in_month(gasto: &ExpenseRecord, month: &Month) -> bool {
    datetime::month_key(gasto.spent_on) == month.key
}

#[get("/gestion/gastos?<filter..>")]
async fn get_expenses(filter: ExpenseFilter, user: UserInfo, db: &State<DbPool>, flash: Option<FlashMessage<'_>>) -> Result<Template, Custom<String>> {
    let pool = &db.0;
    let month = Month::current();
    let gastos = filtered_expenses(pool, &filter).await.map_err(status_sqlx_error)?;
    let por_categoria = category_totals(pool, &filter).await.map_err(status_sqlx_error)?;
    let total_gastos: Money = gastos.iter().map(|g| g.amount).sum();
    let total_mes: Money = gastos.iter().filter(|g| in_month(g, &month)).map(|g| g.amount).sum();
    let gastos_mes: Vec<ExpenseView> = gastos.iter()
        .filter(|g| in_month(g, &month))
        .cloned()
        .map(ExpenseView::from)
        .collect();
    let gastos: Vec<ExpenseView> = gastos.into_iter().map(ExpenseView::from).collect();
    let categorias: Vec<SelectOption> = choice_options(&EXPENSE_CATEGORIES);
    Ok(Template::render("gestion/gastos", context! {
        titulo: "Gestión de Gastos",
        user,
        gastos,
        gastos_mes,
        total_gastos,
        total_mes,
        por_categoria,
        categorias,
        month,
        has_filters: filter.has_active_filters(),
        filters: filter,
        flash: FlashView::from_flash(flash),
    }))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_expenses,
        ])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn malformed_dates_are_ignored() {
        let filter = ExpenseFilter {
            q: Some("  ".to_string()),
            categoria: Some("limpieza".to_string()),
            fecha_desde: Some("ayer".to_string()),
            fecha_hasta: Some("2025-03-31".to_string()),
        };
        let query = ExpenseQuery::from_filter(&filter);
        assert_eq!(query.q, None);
        assert_eq!(query.categoria.as_deref(), Some("limpieza"));
        assert_eq!(query.desde, None);
        assert_eq!(query.hasta, NaiveDate::from_ymd_opt(2025, 3, 31));
    }
}
