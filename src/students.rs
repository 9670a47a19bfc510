use chrono::NaiveDate;
use serde::Serialize;
use sqlx::{FromRow, SqliteExecutor, SqlitePool};
use crate::admin::{choice_label, choice_options, load_options, with_blank, AdminModel, AdminQuery, AdminRow, Cell, FieldKind, FormData, FormField, SaveError};
use crate::auth::UserInfo;
use crate::datetime;
use crate::files::Upload;
use crate::util::like_pattern;

pub type StudentId = i64;
pub type ParentId = i64;

pub const COURSES: [(&str, &str); 16] = [
    ("1P", "1º Primaria"),
    ("2P", "2º Primaria"),
    ("3P", "3º Primaria"),
    ("4P", "4º Primaria"),
    ("5P", "5º Primaria"),
    ("6P", "6º Primaria"),
    ("1E", "1º E.S.O"),
    ("2E", "2º E.S.O"),
    ("3E", "3º E.S.O"),
    ("4E", "4º E.S.O"),
    ("1B", "1º Bachillerato"),
    ("2B", "2º Bachillerato"),
    ("FP", "FP"),
    ("AD", "Adultos"),
    ("EB", "EBAU"),
    ("EO", "EOI"),
];

pub fn course_label(code: &str) -> &'static str {
    choice_label(&COURSES, code)
}

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct StudentRecord {
    pub id: StudentId,
    pub first_name: String,
    pub last_name: String,
    pub dni: Option<String>,
    pub course: String,
    pub phone: String,
    pub birth_date: Option<NaiveDate>,
    pub address: String,
    pub notes: String,
    pub active: bool,
    pub shared: bool,
    pub enrolled_on: NaiveDate,
    pub left_on: Option<NaiveDate>,
    pub parent_id: Option<ParentId>,
    pub default_rate_id: Option<i64>,
}
impl StudentRecord {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct ParentRecord {
    pub id: ParentId,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub notes: String,
}

pub async fn load_student<'c>(executor: impl SqliteExecutor<'c>, student_id: StudentId) -> Result<Option<StudentRecord>, sqlx::Error> {
    sqlx::query_as::<_, StudentRecord>("SELECT * FROM students WHERE id=?")
        .bind(student_id)
        .fetch_optional(executor)
        .await
}

pub async fn student_options(pool: &SqlitePool) -> Result<Vec<crate::admin::SelectOption>, sqlx::Error> {
    load_options(pool, "SELECT id, first_name || ' ' || last_name FROM students ORDER BY last_name, first_name").await
}
pub async fn rate_options(pool: &SqlitePool) -> Result<Vec<crate::admin::SelectOption>, sqlx::Error> {
    load_options(pool, "SELECT id, name || ' - ' || printf('%.2f', price / 100.0) || '€' FROM rates ORDER BY name").await
}

pub struct StudentAdmin;

#[derive(FromRow)]
struct StudentListRow {
    #[sqlx(flatten)]
    student: StudentRecord,
    rate_name: Option<String>,
}

#[rocket::async_trait]
impl AdminModel for StudentAdmin {
    fn slug(&self) -> &'static str { "alumnos" }
    fn title(&self) -> &'static str { "Alumnos" }
    fn singular(&self) -> &'static str { "Alumno" }
    fn table(&self) -> &'static str { "students" }
    fn columns(&self) -> &'static [&'static str] {
        &["Nombre", "Apellido", "DNI", "Curso", "Teléfono", "Compartido", "Tarifa predeterminada", "Activo", "Fecha alta"]
    }
    fn accepts_redirect(&self) -> bool {
        true
    }
    async fn rows(&self, pool: &SqlitePool, q: Option<&str>) -> Result<Vec<AdminRow>, sqlx::Error> {
        let students = sqlx::query_as::<_, StudentListRow>("SELECT s.*, r.name AS rate_name
                FROM students AS s
                LEFT JOIN rates AS r ON r.id=s.default_rate_id
                WHERE ?1 IS NULL
                    OR LOWER(s.first_name) LIKE ?1 OR LOWER(s.last_name) LIKE ?1
                    OR LOWER(COALESCE(s.dni, '')) LIKE ?1 OR LOWER(s.phone) LIKE ?1
                ORDER BY s.last_name, s.first_name")
            .bind(like_pattern(q))
            .fetch_all(pool)
            .await?;
        Ok(students.into_iter().map(|row| {
            let s = row.student;
            AdminRow::new(s.id, vec![
                Cell::link(&s.first_name, format!("/admin/alumnos/{}/change", s.id)),
                Cell::text(&s.last_name),
                Cell::text(s.dni.as_deref().unwrap_or_default()),
                Cell::text(course_label(&s.course)),
                Cell::text(&s.phone),
                Cell::flag(s.shared),
                Cell::text(row.rate_name.unwrap_or_default()),
                Cell::flag(s.active),
                Cell::date(Some(s.enrolled_on)),
            ]).with_link("Detalle", format!("/gestion/alumnos/{}/", s.id))
        }).collect())
    }
    async fn fields(&self, pool: &SqlitePool, id: Option<i64>, _query: &AdminQuery) -> anyhow::Result<Option<Vec<FormField>>> {
        let student = match id {
            Some(id) => match load_student(pool, id).await? {
                Some(student) => Some(student),
                None => return Ok(None),
            },
            None => None,
        };
        let s = student.as_ref();
        let parents = load_options(pool, "SELECT id, first_name || ' ' || last_name FROM parents ORDER BY last_name, first_name").await?;
        Ok(Some(vec![
            FormField::text("first_name", "Nombre").opt_value(s.map(|s| &s.first_name)).required(),
            FormField::text("last_name", "Apellido").opt_value(s.map(|s| &s.last_name)).required(),
            FormField::text("dni", "DNI").opt_value(s.and_then(|s| s.dni.as_ref())).help("DNI del alumno (opcional)"),
            FormField::select("course", "Curso", with_blank(choice_options(&COURSES)))
                .opt_value(s.map(|s| &s.course))
                .help("Curso en el que está matriculado el alumno"),
            FormField::text("phone", "Teléfono").opt_value(s.map(|s| &s.phone)),
            FormField::new(FieldKind::Date, "birth_date", "Fecha de nacimiento").date_value(s.and_then(|s| s.birth_date)),
            FormField::text("address", "Dirección").opt_value(s.map(|s| &s.address)),
            FormField::new(FieldKind::Textarea, "notes", "Observaciones").opt_value(s.map(|s| &s.notes)),
            FormField::select("parent_id", "Padre/Madre", with_blank(parents)).opt_value(s.and_then(|s| s.parent_id)),
            FormField::checkbox("active", "Activo", s.map(|s| s.active).unwrap_or(true)),
            FormField::checkbox("shared", "Compartido", s.map(|s| s.shared).unwrap_or(false))
                .help("Indica si este alumno puede ser compartido entre profesores en el mismo horario"),
            FormField::select("default_rate_id", "Tarifa predeterminada", with_blank(rate_options(pool).await?))
                .opt_value(s.and_then(|s| s.default_rate_id)),
            FormField::new(FieldKind::Date, "left_on", "Fecha de baja").date_value(s.and_then(|s| s.left_on)),
        ]))
    }
    async fn save(&self, pool: &SqlitePool, id: Option<i64>, form: &mut FormData<'_>, _upload: Option<Upload>, _user: &UserInfo) -> Result<i64, SaveError> {
        let first_name = form.required("first_name");
        let last_name = form.required("last_name");
        let dni = form.opt_text("dni");
        let course = form.choice("course", &COURSES);
        let phone = form.text("phone");
        let birth_date = form.date("birth_date");
        let address = form.text("address");
        let notes = form.text("notes");
        let parent_id = form.int("parent_id");
        let active = form.flag("active");
        let shared = form.flag("shared");
        let default_rate_id = form.int("default_rate_id");
        let left_on = form.date("left_on");
        form.check()?;
        let id = match id {
            Some(id) => {
                sqlx::query("UPDATE students SET first_name=?, last_name=?, dni=?, course=?, phone=?, birth_date=?, address=?, notes=?,
                        parent_id=?, active=?, shared=?, default_rate_id=?, left_on=? WHERE id=?")
                    .bind(&first_name).bind(&last_name).bind(&dni).bind(&course).bind(&phone).bind(birth_date)
                    .bind(&address).bind(&notes).bind(parent_id).bind(active).bind(shared).bind(default_rate_id).bind(left_on)
                    .bind(id)
                    .execute(pool)
                    .await?;
                id
            }
            None => {
                let id: (i64, ) = sqlx::query_as("INSERT INTO students (first_name, last_name, dni, course, phone, birth_date, address, notes,
                        parent_id, active, shared, default_rate_id, left_on, enrolled_on)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id")
                    .bind(&first_name).bind(&last_name).bind(&dni).bind(&course).bind(&phone).bind(birth_date)
                    .bind(&address).bind(&notes).bind(parent_id).bind(active).bind(shared).bind(default_rate_id).bind(left_on)
                    .bind(datetime::today())
                    .fetch_one(pool)
                    .await?;
                id.0
            }
        };
        Ok(id)
    }
}

pub struct ParentAdmin;

#[rocket::async_trait]
impl AdminModel for ParentAdmin {
    fn slug(&self) -> &'static str { "padres" }
    fn title(&self) -> &'static str { "Padres" }
    fn singular(&self) -> &'static str { "Padre/Madre" }
    fn table(&self) -> &'static str { "parents" }
    fn columns(&self) -> &'static [&'static str] {
        &["Nombre", "Apellido", "Teléfono"]
    }
    async fn rows(&self, pool: &SqlitePool, q: Option<&str>) -> Result<Vec<AdminRow>, sqlx::Error> {
        let parents = sqlx::query_as::<_, ParentRecord>("SELECT * FROM parents
                WHERE ?1 IS NULL OR LOWER(first_name) LIKE ?1 OR LOWER(last_name) LIKE ?1 OR LOWER(phone) LIKE ?1
                ORDER BY last_name, first_name")
            .bind(like_pattern(q))
            .fetch_all(pool)
            .await?;
        Ok(parents.into_iter().map(|p| AdminRow::new(p.id, vec![
            Cell::link(&p.first_name, format!("/admin/padres/{}/change", p.id)),
            Cell::text(&p.last_name),
            Cell::text(&p.phone),
        ])).collect())
    }
    async fn fields(&self, pool: &SqlitePool, id: Option<i64>, _query: &AdminQuery) -> anyhow::Result<Option<Vec<FormField>>> {
        let parent = match id {
            Some(id) => match sqlx::query_as::<_, ParentRecord>("SELECT * FROM parents WHERE id=?").bind(id).fetch_optional(pool).await? {
                Some(parent) => Some(parent),
                None => return Ok(None),
            },
            None => None,
        };
        let p = parent.as_ref();
        Ok(Some(vec![
            FormField::text("first_name", "Nombre").opt_value(p.map(|p| &p.first_name)).required(),
            FormField::text("last_name", "Apellido").opt_value(p.map(|p| &p.last_name)).required(),
            FormField::text("phone", "Teléfono").opt_value(p.map(|p| &p.phone)),
            FormField::new(FieldKind::Textarea, "notes", "Observaciones").opt_value(p.map(|p| &p.notes)),
        ]))
    }
    async fn save(&self, pool: &SqlitePool, id: Option<i64>, form: &mut FormData<'_>, _upload: Option<Upload>, _user: &UserInfo) -> Result<i64, SaveError> {
        let first_name = form.required("first_name");
        let last_name = form.required("last_name");
        let phone = form.text("phone");
        let notes = form.text("notes");
        form.check()?;
        let id = match id {
            Some(id) => {
                sqlx::query("UPDATE parents SET first_name=?, last_name=?, phone=?, notes=? WHERE id=?")
                    .bind(&first_name).bind(&last_name).bind(&phone).bind(&notes).bind(id)
                    .execute(pool)
                    .await?;
                id
            }
            None => {
                let id: (i64, ) = sqlx::query_as("INSERT INTO parents (first_name, last_name, phone, notes) VALUES (?, ?, ?, ?) RETURNING id")
                    .bind(&first_name).bind(&last_name).bind(&phone).bind(&notes)
                    .fetch_one(pool)
                    .await?;
                id.0
            }
        };
        Ok(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn course_labels() {
        assert_eq!(course_label("1E"), "1º E.S.O");
        assert_eq!(course_label("EB"), "EBAU");
        assert_eq!(course_label(""), "");
    }
}
