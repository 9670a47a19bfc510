use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::{FromRow, SqliteExecutor, SqlitePool};
use crate::admin::{AdminModel, AdminQuery, AdminRow, Cell, FieldKind, FormData, FormField, SaveError};
use crate::auth::UserInfo;
use crate::datetime;
use crate::files::Upload;
use crate::money::Money;
use crate::util::like_pattern;

pub type RateId = i64;

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct RateRecord {
    pub id: RateId,
    pub name: String,
    #[sqlx(try_from = "i64")]
    pub price: Money,
    pub notes: String,
    pub active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub retired_at: Option<NaiveDateTime>,
}
impl RateRecord {
    pub fn label(&self) -> String {
        rate_label(&self.name, self.price)
    }
}

pub fn rate_label(name: &str, price: Money) -> String {
    format!("{name} - {price}€")
}

pub const SAMPLE_RATES: [(&str, i64, &str); 5] = [
    ("Matrícula Mensual", 5000, "Tarifa estándar para matrícula mensual"),
    ("Matrícula Trimestral", 14000, "Tarifa con descuento para matrícula trimestral"),
    ("Matrícula Anual", 50000, "Tarifa con descuento máximo para matrícula anual"),
    ("Clase Individual", 2500, "Tarifa por clase individual"),
    ("Material Didáctico", 1500, "Tarifa por material didáctico"),
];

pub async fn load_rate<'c>(executor: impl SqliteExecutor<'c>, rate_id: RateId) -> Result<Option<RateRecord>, sqlx::Error> {
    sqlx::query_as::<_, RateRecord>("SELECT * FROM rates WHERE id=?")
        .bind(rate_id)
        .fetch_optional(executor)
        .await
}

/// Rates ordered by name; a search term restricts the result to active rates.
pub async fn search_rates(pool: &SqlitePool, q: Option<&str>) -> Result<Vec<RateRecord>, sqlx::Error> {
    match like_pattern(q) {
        None => sqlx::query_as::<_, RateRecord>("SELECT * FROM rates ORDER BY name")
            .fetch_all(pool)
            .await,
        Some(pattern) => sqlx::query_as::<_, RateRecord>("SELECT * FROM rates
                WHERE active=1 AND (LOWER(name) LIKE ?1 OR LOWER(notes) LIKE ?1)
                ORDER BY name")
            .bind(pattern)
            .fetch_all(pool)
            .await,
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct RateSeedSummary {
    pub created: usize,
    pub payments_updated: u64,
}

/// Creates the sample rates missing by name and assigns the first rate to payments without one.
pub async fn seed_rates(pool: &SqlitePool) -> anyhow::Result<RateSeedSummary> {
    let mut tx = pool.begin().await?;
    let now = datetime::now();
    let mut summary = RateSeedSummary::default();
    for (name, price, notes) in SAMPLE_RATES {
        let res = sqlx::query("INSERT INTO rates (name, price, notes, active, created_at, updated_at) VALUES (?, ?, ?, 1, ?, ?)
                ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .bind(price)
            .bind(notes)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        if res.rows_affected() > 0 {
            info!("Rate created: {name}");
            summary.created += 1;
        }
    }
    let first: Option<(RateId, )> = sqlx::query_as("SELECT id FROM rates ORDER BY name LIMIT 1")
        .fetch_optional(&mut *tx)
        .await?;
    if let Some((rate_id, )) = first {
        let res = sqlx::query("UPDATE payments SET rate_id=?, original_amount=final_amount, discount=0 WHERE rate_id IS NULL")
            .bind(rate_id)
            .execute(&mut *tx)
            .await?;
        summary.payments_updated = res.rows_affected();
    }
    tx.commit().await?;
    Ok(summary)
}

pub struct RateAdmin;

#[rocket::async_trait]
impl AdminModel for RateAdmin {
    fn slug(&self) -> &'static str { "tarifas" }
    fn title(&self) -> &'static str { "Tarifas" }
    fn singular(&self) -> &'static str { "Tarifa" }
    fn table(&self) -> &'static str { "rates" }
    fn columns(&self) -> &'static [&'static str] {
        &["Nombre", "Precio", "Activa", "Creada", "Actualizada"]
    }
    async fn rows(&self, pool: &SqlitePool, q: Option<&str>) -> Result<Vec<AdminRow>, sqlx::Error> {
        let rates = search_rates(pool, q).await?;
        Ok(rates.into_iter().map(|r| AdminRow::new(r.id, vec![
            Cell::link(&r.name, format!("/admin/tarifas/{}/change", r.id)),
            Cell::text(format!("{}€", r.price)),
            Cell::flag(r.active),
            Cell::text(datetime::fdatetime(r.created_at)),
            Cell::text(datetime::fdatetime(r.updated_at)),
        ])).collect())
    }
    async fn fields(&self, pool: &SqlitePool, id: Option<i64>, _query: &AdminQuery) -> anyhow::Result<Option<Vec<FormField>>> {
        let rate = match id {
            Some(id) => match load_rate(pool, id).await? {
                Some(rate) => Some(rate),
                None => return Ok(None),
            },
            None => None,
        };
        let rate = rate.as_ref();
        Ok(Some(vec![
            FormField::text("name", "Nombre").value(rate.map(|r| r.name.as_str()).unwrap_or_default()).required(),
            FormField::new(FieldKind::Number, "price", "Precio").opt_value(rate.map(|r| r.price)).required().help("Precio en euros"),
            FormField::new(FieldKind::Textarea, "notes", "Observaciones").value(rate.map(|r| r.notes.as_str()).unwrap_or_default()),
            FormField::checkbox("active", "Activa", rate.map(|r| r.active).unwrap_or(true)),
        ]))
    }
    async fn save(&self, pool: &SqlitePool, id: Option<i64>, form: &mut FormData<'_>, _upload: Option<Upload>, _user: &UserInfo) -> Result<i64, SaveError> {
        let name = form.required("name");
        let price = form.required_money("price");
        if price.is_negative() {
            form.add_error("price", "El precio no puede ser negativo.");
        }
        let notes = form.text("notes");
        let active = form.flag("active");
        form.check()?;
        let now = datetime::now();
        let id = match id {
            Some(id) => {
                sqlx::query("UPDATE rates SET name=?, price=?, notes=?, active=?, updated_at=?,
                        retired_at=CASE WHEN ? THEN NULL ELSE COALESCE(retired_at, ?) END
                        WHERE id=?")
                    .bind(&name)
                    .bind(price.cents())
                    .bind(&notes)
                    .bind(active)
                    .bind(now)
                    .bind(active)
                    .bind(now)
                    .bind(id)
                    .execute(pool)
                    .await?;
                id
            }
            None => {
                let retired_at = (!active).then_some(now);
                let id: (i64, ) = sqlx::query_as("INSERT INTO rates (name, price, notes, active, created_at, updated_at, retired_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id")
                    .bind(&name)
                    .bind(price.cents())
                    .bind(&notes)
                    .bind(active)
                    .bind(now)
                    .bind(now)
                    .bind(retired_at)
                    .fetch_one(pool)
                    .await?;
                id.0
            }
        };
        Ok(id)
    }
}
