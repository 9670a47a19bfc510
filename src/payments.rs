use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use crate::admin::{with_blank, AdminModel, AdminQuery, AdminRow, Cell, FieldKind, FormData, FormField, SaveError};
use crate::auth::UserInfo;
use crate::datetime;
use crate::files::{media_url, store_file, Upload};
use crate::money::Money;
use crate::rates::{load_rate, rate_label};
use crate::receipt::{receipt_path, render_receipt, ReceiptData};
use crate::students::{load_student, rate_options, student_options};
use crate::teachers::{teacher_options, TEACHER_NAME_SQL};
use crate::util::like_pattern;

pub type PaymentId = i64;

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct PaymentRecord {
    pub id: PaymentId,
    pub student_id: i64,
    pub teacher_id: Option<i64>,
    pub rate_id: Option<i64>,
    pub number: String,
    pub paid_on: NaiveDate,
    #[sqlx(try_from = "i64")]
    pub original_amount: Money,
    #[sqlx(try_from = "i64")]
    pub discount: Money,
    #[sqlx(try_from = "i64")]
    pub final_amount: Money,
    pub concept: String,
    pub receipt_file_id: Option<i64>,
    pub student_name: String,
    pub teacher_name: Option<String>,
    pub rate_name: Option<String>,
    pub rate_price: Option<i64>,
    pub receipt_path: Option<String>,
}
impl PaymentRecord {
    pub fn rate_label(&self) -> Option<String> {
        self.rate_name.as_deref().zip(self.rate_price)
            .map(|(name, cents)| rate_label(name, Money::from_cents(cents)))
    }
    pub fn receipt_url(&self) -> Option<String> {
        self.receipt_path.as_deref().map(media_url)
    }
    fn receipt_data(&self) -> ReceiptData {
        ReceiptData {
            number: self.number.clone(),
            paid_on: self.paid_on,
            student_name: self.student_name.clone(),
            teacher_name: self.teacher_name.clone(),
            concept: self.concept.clone(),
            rate_name: self.rate_name.clone(),
            original_amount: self.original_amount,
            discount: self.discount,
            final_amount: self.final_amount,
        }
    }
}

pub fn payment_select() -> String {
    format!("SELECT p.*, s.first_name || ' ' || s.last_name AS student_name, {TEACHER_NAME_SQL} AS teacher_name,
            r.name AS rate_name, r.price AS rate_price, f.path AS receipt_path
        FROM payments AS p
        JOIN students AS s ON s.id=p.student_id
        LEFT JOIN teachers AS t ON t.id=p.teacher_id
        LEFT JOIN users AS u ON u.id=t.user_id
        LEFT JOIN rates AS r ON r.id=p.rate_id
        LEFT JOIN stored_files AS f ON f.id=p.receipt_file_id")
}

pub async fn load_payment(conn: &mut SqliteConnection, payment_id: PaymentId) -> Result<Option<PaymentRecord>, sqlx::Error> {
    sqlx::query_as::<_, PaymentRecord>(&format!("{} WHERE p.id=?", payment_select()))
        .bind(payment_id)
        .fetch_optional(&mut *conn)
        .await
}

pub fn number_prefix(year: i32) -> String {
    format!("PG-{year}-")
}
fn format_number(prefix: &str, n: i64) -> String {
    format!("{prefix}{n:04}")
}
/// Number following `last` when its suffix after `prefix` is numeric.
pub fn number_after(prefix: &str, last: &str) -> Option<String> {
    let n = last.strip_prefix(prefix)?.trim().parse::<i64>().ok()?;
    Some(format_number(prefix, n + 1))
}

/// Next free number of the form `PG-<year>-NNNN`. When the greatest number of the year
/// has no numeric suffix the highest payment id is used instead.
pub async fn next_payment_number(conn: &mut SqliteConnection, year: i32) -> Result<String, sqlx::Error> {
    let prefix = number_prefix(year);
    let last: Option<(String, )> = sqlx::query_as("SELECT number FROM payments WHERE substr(number, 1, length(?1))=?1 ORDER BY number DESC LIMIT 1")
        .bind(&prefix)
        .fetch_optional(&mut *conn)
        .await?;
    let Some((last, )) = last else {
        return Ok(format_number(&prefix, 1));
    };
    if let Some(next) = number_after(&prefix, &last) {
        return Ok(next);
    }
    warn!("Payment number {last} has no numeric suffix, numbering by id");
    let max_id: (Option<i64>, ) = sqlx::query_as("SELECT MAX(id) FROM payments")
        .fetch_one(&mut *conn)
        .await?;
    Ok(format_number(&prefix, max_id.0.map(|id| id + 1).unwrap_or(1)))
}

/// Renders and stores the receipt of a payment without one; returns the stored path.
pub async fn attach_receipt(conn: &mut SqliteConnection, payment_id: PaymentId) -> Result<Option<String>, SaveError> {
    let Some(payment) = load_payment(&mut *conn, payment_id).await? else {
        return Ok(None);
    };
    if payment.receipt_file_id.is_some() {
        return Ok(None);
    }
    let pdf = render_receipt(&payment.receipt_data())?;
    let path = receipt_path(&payment.number);
    let file_id = store_file(&mut *conn, &path, &pdf).await?;
    sqlx::query("UPDATE payments SET receipt_file_id=? WHERE id=?")
        .bind(file_id)
        .bind(payment_id)
        .execute(&mut *conn)
        .await?;
    info!("Receipt generated for payment {}: {path}", payment.number);
    Ok(Some(path))
}

pub struct PaymentAdmin;

#[rocket::async_trait]
impl AdminModel for PaymentAdmin {
    fn slug(&self) -> &'static str { "pagos" }
    fn title(&self) -> &'static str { "Pagos" }
    fn singular(&self) -> &'static str { "Pago" }
    fn table(&self) -> &'static str { "payments" }
    fn columns(&self) -> &'static [&'static str] {
        &["Número", "Alumno", "Tarifa", "Importe original", "Descuento", "Importe final", "Fecha", "Comprobante"]
    }
    fn accepts_redirect(&self) -> bool {
        true
    }
    async fn rows(&self, pool: &SqlitePool, q: Option<&str>) -> Result<Vec<AdminRow>, sqlx::Error> {
        let payments = sqlx::query_as::<_, PaymentRecord>(&format!("{}
                WHERE ?1 IS NULL OR LOWER(p.number) LIKE ?1 OR LOWER(s.first_name) LIKE ?1
                    OR LOWER(s.last_name) LIKE ?1 OR LOWER(p.concept) LIKE ?1
                ORDER BY p.paid_on DESC, p.id DESC", payment_select()))
            .bind(like_pattern(q))
            .fetch_all(pool)
            .await?;
        Ok(payments.into_iter().map(|p| {
            let receipt = match p.receipt_url() {
                Some(url) => Cell::link("Descargar PDF", url),
                None => Cell::text("-"),
            };
            AdminRow::new(p.id, vec![
                Cell::link(&p.number, format!("/admin/pagos/{}/change", p.id)),
                Cell::text(&p.student_name),
                Cell::text(p.rate_name.as_deref().unwrap_or_default()),
                Cell::text(p.original_amount),
                Cell::text(p.discount),
                Cell::text(p.final_amount),
                Cell::date(Some(p.paid_on)),
                receipt,
            ])
        }).collect())
    }
    async fn fields(&self, pool: &SqlitePool, id: Option<i64>, query: &AdminQuery) -> anyhow::Result<Option<Vec<FormField>>> {
        let mut conn = pool.acquire().await?;
        let payment = match id {
            Some(id) => match load_payment(&mut conn, id).await? {
                Some(payment) => Some(payment),
                None => return Ok(None),
            },
            None => None,
        };
        let (number, student_id, rate_id, original_amount) = match &payment {
            Some(p) => (p.number.clone(), Some(p.student_id), p.rate_id, Some(p.original_amount)),
            None => {
                let number = next_payment_number(&mut conn, datetime::today().year()).await?;
                let student = match AdminQuery::id_param(&query.alumno) {
                    Some(student_id) => load_student(&mut *conn, student_id).await?,
                    None => None,
                };
                let rate_id = student.as_ref().and_then(|s| s.default_rate_id);
                let original_amount = match rate_id {
                    Some(rate_id) => load_rate(&mut *conn, rate_id).await?.map(|r| r.price),
                    None => None,
                };
                (number, student.map(|s| s.id), rate_id, original_amount)
            }
        };
        drop(conn);
        let p = payment.as_ref();
        Ok(Some(vec![
            FormField::text("number", "Número").value(number).help("Se genera automáticamente si se deja en blanco"),
            FormField::select("student_id", "Alumno", with_blank(student_options(pool).await?)).opt_value(student_id).required(),
            FormField::select("teacher_id", "Profesor", with_blank(teacher_options(pool, false).await?)).opt_value(p.and_then(|p| p.teacher_id)),
            FormField::text("concept", "Concepto").opt_value(p.map(|p| &p.concept)),
            FormField::select("rate_id", "Tarifa", with_blank(rate_options(pool).await?)).opt_value(rate_id),
            FormField::new(FieldKind::Number, "original_amount", "Importe original").opt_value(original_amount)
                .help("Se usa el precio de la tarifa si se deja en blanco"),
            FormField::new(FieldKind::Number, "discount", "Descuento").value(p.map(|p| p.discount).unwrap_or(Money::ZERO))
                .help("Descuento aplicado en euros"),
            FormField::new(FieldKind::Number, "final_amount", "Importe final").opt_value(p.map(|p| p.final_amount))
                .help("Se calcula automáticamente: importe original menos descuento"),
            FormField::checkbox("generate_receipt", "Generar comprobante PDF", true)
                .help("Marcar esta casilla para generar automáticamente el comprobante de pago en PDF")
                .link(p.and_then(|p| p.receipt_url())),
        ]))
    }
    async fn save(&self, pool: &SqlitePool, id: Option<i64>, form: &mut FormData<'_>, _upload: Option<Upload>, _user: &UserInfo) -> Result<i64, SaveError> {
        let number = form.text("number");
        let student_id = form.required_int("student_id");
        let teacher_id = form.int("teacher_id");
        let concept = form.text("concept");
        let rate_id = form.int("rate_id");
        let original_amount = form.money("original_amount");
        let discount = form.money("discount").unwrap_or(Money::ZERO);
        let generate_receipt = form.flag("generate_receipt");
        form.check()?;

        let mut tx = pool.begin().await?;
        let original_amount = match (original_amount, rate_id) {
            (Some(amount), _) => amount,
            (None, Some(rate_id)) => load_rate(&mut *tx, rate_id).await?.map(|r| r.price).unwrap_or(Money::ZERO),
            (None, None) => Money::ZERO,
        };
        let final_amount = original_amount - discount;
        let number = if number.is_empty() {
            next_payment_number(&mut tx, datetime::today().year()).await?
        } else {
            number
        };
        let id = match id {
            Some(id) => {
                sqlx::query("UPDATE payments SET number=?, student_id=?, teacher_id=?, concept=?, rate_id=?,
                        original_amount=?, discount=?, final_amount=? WHERE id=?")
                    .bind(&number).bind(student_id).bind(teacher_id).bind(&concept).bind(rate_id)
                    .bind(original_amount.cents()).bind(discount.cents()).bind(final_amount.cents())
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                id
            }
            None => {
                let id: (i64, ) = sqlx::query_as("INSERT INTO payments (number, student_id, teacher_id, concept, rate_id,
                        original_amount, discount, final_amount, paid_on) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id")
                    .bind(&number).bind(student_id).bind(teacher_id).bind(&concept).bind(rate_id)
                    .bind(original_amount.cents()).bind(discount.cents()).bind(final_amount.cents())
                    .bind(datetime::today())
                    .fetch_one(&mut *tx)
                    .await?;
                id.0
            }
        };
        if generate_receipt {
            attach_receipt(&mut tx, id).await?;
        }
        tx.commit().await?;
        Ok(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn number_after_increments_numeric_suffix() {
        let prefix = number_prefix(2025);
        assert_eq!(prefix, "PG-2025-");
        assert_eq!(number_after(&prefix, "PG-2025-0041").as_deref(), Some("PG-2025-0042"));
        assert_eq!(number_after(&prefix, "PG-2025-9999").as_deref(), Some("PG-2025-10000"));
        assert_eq!(number_after(&prefix, "PG-2025-X1"), None);
        assert_eq!(number_after(&prefix, "PG-2024-0001"), None);
        assert_eq!(format_number(&prefix, 1), "PG-2025-0001");
    }
}
