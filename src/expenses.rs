use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use sqlx::{FromRow, SqliteExecutor, SqlitePool};
use crate::admin::{choice_label, choice_options, AdminModel, AdminQuery, AdminRow, Cell, FieldKind, FormData, FormField, SaveError};
use crate::auth::UserInfo;
use crate::datetime;
use crate::files::{file_name, media_url, store_file, validate_invoice_extension, Upload};
use crate::money::Money;
use crate::util::like_pattern;

pub type ExpenseId = i64;

pub const EXPENSE_CATEGORIES: [(&str, &str); 7] = [
    ("suministros", "Suministros"),
    ("inmobiliario", "Inmobiliario"),
    ("equipamiento", "Equipamiento"),
    ("limpieza", "Limpieza"),
    ("marketing", "Marketing"),
    ("administrativo", "Administrativo"),
    ("otros", "Otros"),
];
pub const DEFAULT_CATEGORY: &str = "otros";

pub fn category_label(code: &str) -> &'static str {
    choice_label(&EXPENSE_CATEGORIES, code)
}

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct ExpenseRecord {
    pub id: ExpenseId,
    pub concept: String,
    #[sqlx(try_from = "i64")]
    pub amount: Money,
    pub category: String,
    pub notes: String,
    pub recorded_on: NaiveDate,
    pub spent_on: NaiveDate,
    pub invoice_file_id: Option<i64>,
    pub invoice_path: Option<String>,
}
impl ExpenseRecord {
    pub fn category_label(&self) -> &'static str {
        category_label(&self.category)
    }
    pub fn invoice_url(&self) -> Option<String> {
        self.invoice_path.as_deref().map(media_url)
    }
    pub fn invoice_name(&self) -> Option<String> {
        self.invoice_path.as_deref().map(|path| short_file_name(file_name(path)))
    }
}

pub fn expense_select() -> &'static str {
    "SELECT g.*, f.path AS invoice_path
        FROM expenses AS g
        LEFT JOIN stored_files AS f ON f.id=g.invoice_file_id"
}

pub async fn load_expense<'c>(executor: impl SqliteExecutor<'c>, expense_id: ExpenseId) -> Result<Option<ExpenseRecord>, sqlx::Error> {
    sqlx::query_as::<_, ExpenseRecord>(&format!("{} WHERE g.id=?", expense_select()))
        .bind(expense_id)
        .fetch_optional(executor)
        .await
}

/// File names longer than 20 characters are cut and get `...` appended.
pub fn short_file_name(name: &str) -> String {
    if name.chars().count() > 20 {
        format!("{}...", name.chars().take(20).collect::<String>())
    } else {
        name.to_string()
    }
}

/// `gastos/<yyyy>/<mm>/<categoria>/gasto_<id>_<yyyymmdd>.<ext>`
pub fn invoice_path(expense_id: ExpenseId, category: &str, spent_on: NaiveDate, ext: &str) -> String {
    format!("gastos/{:04}/{:02}/{category}/gasto_{expense_id}_{}.{ext}",
            spent_on.year(),
            spent_on.month(),
            spent_on.format("%Y%m%d"),
    )
}

pub const SAMPLE_EXPENSES: [(&str, i64, &str, &str, (i32, u32, u32)); 8] = [
    ("Factura de electricidad - Enero 2025", 8550, "suministros", "Factura mensual de electricidad del local", (2025, 1, 15)),
    ("Factura de internet - Enero 2025", 4500, "suministros", "Servicio de internet de alta velocidad", (2025, 1, 20)),
    ("Factura de agua - Enero 2025", 3520, "suministros", "Consumo de agua del mes", (2025, 1, 25)),
    ("Material de oficina", 12000, "administrativo", "Papel, bolígrafos, carpetas y otros materiales", (2025, 1, 10)),
    ("Servicio de limpieza", 20000, "limpieza", "Limpieza mensual del local", (2025, 1, 5)),
    ("Mantenimiento de equipos", 15000, "equipamiento", "Revisión y mantenimiento de ordenadores", (2025, 1, 12)),
    ("Publicidad en redes sociales", 8000, "marketing", "Campaña publicitaria en Facebook e Instagram", (2025, 1, 18)),
    ("Seguro del local", 30000, "inmobiliario", "Póliza de seguro anual del local", (2025, 1, 1)),
];

#[derive(Debug, Default, PartialEq)]
pub struct ExpenseSeedSummary {
    pub created: usize,
    pub existing: usize,
}

/// Creates the sample expenses whose concept is not recorded yet.
pub async fn seed_expenses(pool: &SqlitePool) -> anyhow::Result<ExpenseSeedSummary> {
    let mut tx = pool.begin().await?;
    let today = datetime::today();
    let mut summary = ExpenseSeedSummary::default();
    for (concept, cents, category, notes, (y, m, d)) in SAMPLE_EXPENSES {
        let exists: Option<(i64, )> = sqlx::query_as("SELECT id FROM expenses WHERE concept=? LIMIT 1")
            .bind(concept)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_some() {
            summary.existing += 1;
            continue;
        }
        let spent_on = NaiveDate::from_ymd_opt(y, m, d).ok_or_else(|| anyhow::anyhow!("invalid date {y}-{m}-{d}"))?;
        sqlx::query("INSERT INTO expenses (concept, amount, category, notes, recorded_on, spent_on) VALUES (?, ?, ?, ?, ?, ?)")
            .bind(concept)
            .bind(cents)
            .bind(category)
            .bind(notes)
            .bind(today)
            .bind(spent_on)
            .execute(&mut *tx)
            .await?;
        info!("Expense created: {concept}");
        summary.created += 1;
    }
    tx.commit().await?;
    Ok(summary)
}

pub struct ExpenseAdmin;

#[rocket::async_trait]
impl AdminModel for ExpenseAdmin {
    fn slug(&self) -> &'static str { "gastos" }
    fn title(&self) -> &'static str { "Gastos" }
    fn singular(&self) -> &'static str { "Gasto" }
    fn table(&self) -> &'static str { "expenses" }
    fn columns(&self) -> &'static [&'static str] {
        &["Concepto", "Importe", "Categoría", "Fecha", "Fecha registro", "Factura"]
    }
    async fn rows(&self, pool: &SqlitePool, q: Option<&str>) -> Result<Vec<AdminRow>, sqlx::Error> {
        let expenses = sqlx::query_as::<_, ExpenseRecord>(&format!("{}
                WHERE ?1 IS NULL OR LOWER(g.concept) LIKE ?1 OR LOWER(g.notes) LIKE ?1
                ORDER BY g.spent_on DESC, g.recorded_on DESC, g.id DESC", expense_select()))
            .bind(like_pattern(q))
            .fetch_all(pool)
            .await?;
        Ok(expenses.into_iter().map(|g| {
            let invoice = match (g.invoice_name(), g.invoice_url()) {
                (Some(name), Some(url)) => Cell::link(name, url),
                _ => Cell::text("-"),
            };
            AdminRow::new(g.id, vec![
                Cell::link(&g.concept, format!("/admin/gastos/{}/change", g.id)),
                Cell::text(format!("{}€", g.amount)),
                Cell::text(g.category_label()),
                Cell::date(Some(g.spent_on)),
                Cell::date(Some(g.recorded_on)),
                invoice,
            ])
        }).collect())
    }
    async fn fields(&self, pool: &SqlitePool, id: Option<i64>, _query: &AdminQuery) -> anyhow::Result<Option<Vec<FormField>>> {
        let expense = match id {
            Some(id) => match load_expense(pool, id).await? {
                Some(expense) => Some(expense),
                None => return Ok(None),
            },
            None => None,
        };
        let g = expense.as_ref();
        Ok(Some(vec![
            FormField::text("concept", "Concepto").opt_value(g.map(|g| &g.concept)).required(),
            FormField::new(FieldKind::Number, "amount", "Importe").opt_value(g.map(|g| g.amount)).required().help("Importe en euros"),
            FormField::select("category", "Categoría", choice_options(&EXPENSE_CATEGORIES))
                .value(g.map(|g| g.category.as_str()).unwrap_or(DEFAULT_CATEGORY)),
            FormField::new(FieldKind::Date, "spent_on", "Fecha").date_value(Some(g.map(|g| g.spent_on).unwrap_or_else(datetime::today))).required(),
            FormField::new(FieldKind::Textarea, "notes", "Observaciones").opt_value(g.map(|g| &g.notes)),
            FormField::new(FieldKind::File, "archivo", "Factura")
                .help("Formatos permitidos: PDF, JPG, PNG")
                .link(g.and_then(|g| g.invoice_url())),
        ]))
    }
    async fn save(&self, pool: &SqlitePool, id: Option<i64>, form: &mut FormData<'_>, upload: Option<Upload>, _user: &UserInfo) -> Result<i64, SaveError> {
        let concept = form.required("concept");
        let amount = form.required_money("amount");
        if amount.is_negative() {
            form.add_error("amount", "El importe no puede ser negativo.");
        }
        let category = form.choice("category", &EXPENSE_CATEGORIES);
        let category = if category.is_empty() { DEFAULT_CATEGORY.to_string() } else { category };
        let spent_on = form.required_date("spent_on");
        let notes = form.text("notes");
        let invoice_ext = match &upload {
            Some(upload) => match validate_invoice_extension(&upload.file_name) {
                Ok(ext) => Some(ext),
                Err(message) => {
                    form.add_error("archivo", message);
                    None
                }
            },
            None => None,
        };
        form.check()?;

        let mut tx = pool.begin().await?;
        let id = match id {
            Some(id) => {
                sqlx::query("UPDATE expenses SET concept=?, amount=?, category=?, spent_on=?, notes=? WHERE id=?")
                    .bind(&concept).bind(amount.cents()).bind(&category).bind(spent_on).bind(&notes)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                id
            }
            None => {
                let id: (i64, ) = sqlx::query_as("INSERT INTO expenses (concept, amount, category, spent_on, notes, recorded_on)
                        VALUES (?, ?, ?, ?, ?, ?) RETURNING id")
                    .bind(&concept).bind(amount.cents()).bind(&category).bind(spent_on).bind(&notes)
                    .bind(datetime::today())
                    .fetch_one(&mut *tx)
                    .await?;
                id.0
            }
        };
        if let (Some(upload), Some(ext)) = (upload, invoice_ext) {
            let path = invoice_path(id, &category, spent_on, &ext);
            let file_id = store_file(&mut *tx, &path, &upload.data).await?;
            sqlx::query("UPDATE expenses SET invoice_file_id=? WHERE id=?")
                .bind(file_id)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn invoice_path_layout() {
        let spent_on = NaiveDate::from_ymd_opt(2025, 1, 5).unwrap();
        assert_eq!(invoice_path(12, "limpieza", spent_on, "pdf"), "gastos/2025/01/limpieza/gasto_12_20250105.pdf");
    }

    #[test]
    fn long_file_names_are_shortened() {
        assert_eq!(short_file_name("factura.pdf"), "factura.pdf");
        assert_eq!(short_file_name("gasto_12_20250105.pdf"), "gasto_12_20250105.pd...");
        assert_eq!(short_file_name("12345678901234567890"), "12345678901234567890");
    }

    #[test]
    fn category_labels() {
        assert_eq!(category_label("marketing"), "Marketing");
        assert_eq!(category_label("desconocida"), "");
    }
}
