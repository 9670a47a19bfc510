use chrono::NaiveDate;
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use crate::admin::{load_options, AdminModel, AdminQuery, AdminRow, Cell, FieldKind, FormData, FormField, SaveError, SelectOption};
use crate::auth::{hash_password, UserInfo};
use crate::datetime;
use crate::files::Upload;
use crate::util::like_pattern;

pub type TeacherId = i64;

/// Display name of a teacher joined as `u`: full name, or username when the name is blank.
pub const TEACHER_NAME_SQL: &str = "COALESCE(NULLIF(TRIM(u.first_name || ' ' || u.last_name), ''), u.username)";

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct TeacherRecord {
    pub id: TeacherId,
    pub user_id: i64,
    pub phone: String,
    pub active: bool,
    pub joined_on: NaiveDate,
    pub left_on: Option<NaiveDate>,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub name: String,
}

fn teacher_select() -> String {
    format!("SELECT t.*, u.username, u.first_name, u.last_name, u.email, {TEACHER_NAME_SQL} AS name
        FROM teachers AS t
        JOIN users AS u ON u.id=t.user_id")
}

pub async fn load_teacher(pool: &SqlitePool, teacher_id: TeacherId) -> Result<Option<TeacherRecord>, sqlx::Error> {
    sqlx::query_as::<_, TeacherRecord>(&format!("{} WHERE t.id=?", teacher_select()))
        .bind(teacher_id)
        .fetch_optional(pool)
        .await
}

pub async fn teacher_options(pool: &SqlitePool, only_active: bool) -> Result<Vec<SelectOption>, sqlx::Error> {
    let filter = if only_active { "WHERE t.active=1" } else { "" };
    load_options(pool, &format!("SELECT t.id, {TEACHER_NAME_SQL} FROM teachers AS t JOIN users AS u ON u.id=t.user_id {filter} ORDER BY 2")).await
}

pub struct TeacherAdmin;

#[rocket::async_trait]
impl AdminModel for TeacherAdmin {
    fn slug(&self) -> &'static str { "profesores" }
    fn title(&self) -> &'static str { "Profesores" }
    fn singular(&self) -> &'static str { "Profesor" }
    fn table(&self) -> &'static str { "teachers" }
    fn columns(&self) -> &'static [&'static str] {
        &["Profesor", "Usuario", "Teléfono", "Activo", "Fecha alta"]
    }
    async fn rows(&self, pool: &SqlitePool, q: Option<&str>) -> Result<Vec<AdminRow>, sqlx::Error> {
        let teachers = sqlx::query_as::<_, TeacherRecord>(&format!("{}
                WHERE ?1 IS NULL OR LOWER(u.username) LIKE ?1 OR LOWER(u.first_name) LIKE ?1
                    OR LOWER(u.last_name) LIKE ?1 OR LOWER(t.phone) LIKE ?1
                ORDER BY name", teacher_select()))
            .bind(like_pattern(q))
            .fetch_all(pool)
            .await?;
        Ok(teachers.into_iter().map(|t| AdminRow::new(t.id, vec![
            Cell::link(&t.name, format!("/admin/profesores/{}/change", t.id)),
            Cell::text(&t.username),
            Cell::text(&t.phone),
            Cell::flag(t.active),
            Cell::date(Some(t.joined_on)),
        ])).collect())
    }
    async fn fields(&self, pool: &SqlitePool, id: Option<i64>, _query: &AdminQuery) -> anyhow::Result<Option<Vec<FormField>>> {
        let teacher = match id {
            Some(id) => match load_teacher(pool, id).await? {
                Some(teacher) => Some(teacher),
                None => return Ok(None),
            },
            None => None,
        };
        let t = teacher.as_ref();
        let password = FormField::new(FieldKind::Password, "password", "Contraseña");
        let password = if t.is_some() {
            password.help("Déjalo en blanco para mantener la contraseña actual")
        } else {
            password.required()
        };
        Ok(Some(vec![
            FormField::text("username", "Usuario").opt_value(t.map(|t| &t.username)).required(),
            password,
            FormField::text("first_name", "Nombre").opt_value(t.map(|t| &t.first_name)),
            FormField::text("last_name", "Apellidos").opt_value(t.map(|t| &t.last_name)),
            FormField::new(FieldKind::Email, "email", "Email").opt_value(t.map(|t| &t.email)),
            FormField::text("phone", "Teléfono").opt_value(t.map(|t| &t.phone)),
            FormField::checkbox("active", "Activo", t.map(|t| t.active).unwrap_or(true)),
            FormField::new(FieldKind::Date, "left_on", "Fecha de baja").date_value(t.and_then(|t| t.left_on)),
        ]))
    }
    async fn save(&self, pool: &SqlitePool, id: Option<i64>, form: &mut FormData<'_>, _upload: Option<Upload>, _user: &UserInfo) -> Result<i64, SaveError> {
        let username = form.required("username");
        let password = if id.is_some() { form.text("password") } else { form.required("password") };
        let first_name = form.text("first_name");
        let last_name = form.text("last_name");
        let email = form.text("email");
        let phone = form.text("phone");
        let active = form.flag("active");
        let left_on = form.date("left_on");
        form.check()?;
        let password_hash = if password.is_empty() { None } else { Some(hash_password(&password)?) };
        let mut tx = pool.begin().await?;
        let id = match id {
            Some(id) => {
                sqlx::query("UPDATE users SET username=?, first_name=?, last_name=?, email=?, password_hash=COALESCE(?, password_hash)
                        WHERE id=(SELECT user_id FROM teachers WHERE id=?)")
                    .bind(&username).bind(&first_name).bind(&last_name).bind(&email).bind(&password_hash)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("UPDATE teachers SET phone=?, active=?, left_on=? WHERE id=?")
                    .bind(&phone).bind(active).bind(left_on).bind(id)
                    .execute(&mut *tx)
                    .await?;
                id
            }
            None => {
                let user_id: (i64, ) = sqlx::query_as("INSERT INTO users (username, password_hash, first_name, last_name, email) VALUES (?, ?, ?, ?, ?) RETURNING id")
                    .bind(&username).bind(&password_hash).bind(&first_name).bind(&last_name).bind(&email)
                    .fetch_one(&mut *tx)
                    .await?;
                let id: (i64, ) = sqlx::query_as("INSERT INTO teachers (user_id, phone, active, joined_on, left_on) VALUES (?, ?, ?, ?, ?) RETURNING id")
                    .bind(user_id.0).bind(&phone).bind(active).bind(datetime::today()).bind(left_on)
                    .fetch_one(&mut *tx)
                    .await?;
                id.0
            }
        };
        tx.commit().await?;
        Ok(id)
    }
}
