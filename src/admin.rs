use std::collections::{BTreeMap, HashMap};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rocket::form::Form;
use rocket::fs::TempFile;
use rocket::http::Status;
use rocket::request::FlashMessage;
use rocket::response::{Flash, Redirect};
use rocket::response::status::Custom;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::Serialize;
use sqlx::SqlitePool;
use crate::auth::UserInfo;
use crate::datetime;
use crate::db::{constraint_violation_message, DbPool};
use crate::files::{read_upload, Upload};
use crate::money::Money;
use crate::util::{local_redirect_target, non_blank, status_any_error, status_sqlx_error, FlashView, Page};

pub type FieldErrors = BTreeMap<String, String>;

pub const REQUIRED: &str = "Este campo es obligatorio.";
pub const FORM_ERRORS_KEY: &str = "__all__";

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Email,
    Password,
    Textarea,
    Number,
    Date,
    Time,
    Datetime,
    Checkbox,
    Select,
    File,
    Hidden,
}

#[derive(Serialize, Clone, Debug)]
pub struct SelectOption {
    pub value: String,
    pub label: String,
    pub selected: bool,
}
impl SelectOption {
    pub fn new(value: impl ToString, label: impl ToString) -> Self {
        Self { value: value.to_string(), label: label.to_string(), selected: false }
    }
    pub fn blank() -> Self {
        Self::new("", "---------")
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct FormField {
    pub name: String,
    pub label: String,
    pub kind: FieldKind,
    pub value: String,
    pub required: bool,
    pub options: Vec<SelectOption>,
    pub help: Option<String>,
    pub link: Option<String>,
    pub error: Option<String>,
}
impl FormField {
    pub fn new(kind: FieldKind, name: &str, label: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            kind,
            value: String::new(),
            required: false,
            options: vec![],
            help: None,
            link: None,
            error: None,
        }
    }
    pub fn text(name: &str, label: &str) -> Self {
        Self::new(FieldKind::Text, name, label)
    }
    pub fn checkbox(name: &str, label: &str, checked: bool) -> Self {
        Self::new(FieldKind::Checkbox, name, label).checked(checked)
    }
    pub fn select(name: &str, label: &str, options: Vec<SelectOption>) -> Self {
        Self { options, ..Self::new(FieldKind::Select, name, label) }
    }
    pub fn value(mut self, value: impl ToString) -> Self {
        self.value = value.to_string();
        self
    }
    pub fn opt_value<T: ToString>(mut self, value: Option<T>) -> Self {
        self.value = value.map(|v| v.to_string()).unwrap_or_default();
        self
    }
    pub fn date_value(self, value: Option<NaiveDate>) -> Self {
        self.opt_value(value.map(|d| d.format("%Y-%m-%d")))
    }
    pub fn time_value(self, value: Option<NaiveTime>) -> Self {
        self.opt_value(value.map(|t| t.format("%H:%M")))
    }
    pub fn datetime_value(self, value: Option<NaiveDateTime>) -> Self {
        self.opt_value(value.map(datetime::input_datetime))
    }
    pub fn checked(mut self, checked: bool) -> Self {
        self.value = if checked { "on".to_string() } else { String::new() };
        self
    }
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
    pub fn help(mut self, help: impl ToString) -> Self {
        self.help = Some(help.to_string());
        self
    }
    pub fn link(mut self, link: Option<String>) -> Self {
        self.link = link;
        self
    }
    fn mark_selected(&mut self) {
        for option in &mut self.options {
            option.selected = option.value == self.value;
        }
    }
}

/// Submitted admin form values, collects validation errors while fields are read.
pub struct FormData<'a> {
    values: &'a HashMap<String, String>,
    errors: FieldErrors,
}
impl<'a> FormData<'a> {
    pub fn new(values: &'a HashMap<String, String>) -> Self {
        Self { values, errors: FieldErrors::new() }
    }
    fn raw(&self, name: &str) -> Option<&'a str> {
        self.values.get(name).map(|s| s.trim()).filter(|s| !s.is_empty())
    }
    pub fn add_error(&mut self, name: &str, message: &str) {
        self.errors.entry(name.to_string()).or_insert_with(|| message.to_string());
    }
    pub fn text(&self, name: &str) -> String {
        self.raw(name).unwrap_or_default().to_string()
    }
    pub fn opt_text(&self, name: &str) -> Option<String> {
        self.raw(name).map(str::to_string)
    }
    pub fn required(&mut self, name: &str) -> String {
        let value = self.text(name);
        if value.is_empty() {
            self.add_error(name, REQUIRED);
        }
        value
    }
    pub fn flag(&self, name: &str) -> bool {
        matches!(self.raw(name), Some("on" | "true" | "1"))
    }
    fn parsed<T>(&mut self, name: &str, parse: impl FnOnce(&str) -> Option<T>, message: &str) -> Option<T> {
        let raw = self.raw(name)?;
        let value = parse(raw);
        if value.is_none() {
            self.add_error(name, message);
        }
        value
    }
    fn required_parsed<T: Default>(&mut self, name: &str, parse: impl FnOnce(&str) -> Option<T>, message: &str) -> T {
        if self.raw(name).is_none() {
            self.add_error(name, REQUIRED);
            return T::default();
        }
        self.parsed(name, parse, message).unwrap_or_default()
    }
    pub fn int(&mut self, name: &str) -> Option<i64> {
        self.parsed(name, |s| s.parse().ok(), "Introduce un número entero.")
    }
    pub fn required_int(&mut self, name: &str) -> i64 {
        self.required_parsed(name, |s| s.parse().ok(), "Introduce un número entero.")
    }
    pub fn date(&mut self, name: &str) -> Option<NaiveDate> {
        self.parsed(name, |s| datetime::parse_date(Some(s)), "Introduce una fecha válida.")
    }
    pub fn required_date(&mut self, name: &str) -> NaiveDate {
        self.required_parsed(name, |s| datetime::parse_date(Some(s)), "Introduce una fecha válida.")
    }
    pub fn required_time(&mut self, name: &str) -> NaiveTime {
        self.required_parsed(name, datetime::parse_time, "Introduce una hora válida.")
    }
    pub fn required_datetime(&mut self, name: &str) -> NaiveDateTime {
        self.required_parsed(name, datetime::parse_datetime, "Introduce una fecha y hora válidas.")
    }
    pub fn money(&mut self, name: &str) -> Option<Money> {
        self.parsed(name, |s| Money::parse(s).ok(), "Introduce un importe válido.")
    }
    pub fn required_money(&mut self, name: &str) -> Money {
        self.required_parsed(name, |s| Money::parse(s).ok(), "Introduce un importe válido.")
    }
    /// Blank is allowed and gives an empty string.
    pub fn choice(&mut self, name: &str, choices: &[(&str, &str)]) -> String {
        self.parsed(name, |s| choices.iter().find(|(code, _)| *code == s).map(|(code, _)| code.to_string()),
                    "Escoge una opción válida.")
            .unwrap_or_default()
    }
    /// Ids of checked `<prefix><id>` checkboxes.
    pub fn checked_ids(&self, prefix: &str) -> Vec<i64> {
        let mut ids = self.values.iter()
            .filter(|(_, v)| matches!(v.trim(), "on" | "true" | "1"))
            .filter_map(|(k, _)| k.strip_prefix(prefix)?.parse::<i64>().ok())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }
    pub fn check(&self) -> Result<(), SaveError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(SaveError::Invalid(self.errors.clone()))
        }
    }
}

#[derive(Debug)]
pub enum SaveError {
    Invalid(FieldErrors),
    Db(sqlx::Error),
    Other(anyhow::Error),
}
impl SaveError {
    pub fn field(name: &str, message: &str) -> Self {
        SaveError::Invalid(FieldErrors::from([(name.to_string(), message.to_string())]))
    }
}
impl From<sqlx::Error> for SaveError {
    fn from(value: sqlx::Error) -> Self {
        SaveError::Db(value)
    }
}
impl From<anyhow::Error> for SaveError {
    fn from(value: anyhow::Error) -> Self {
        SaveError::Other(value)
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct Cell {
    pub text: String,
    pub url: Option<String>,
}
impl Cell {
    pub fn text(text: impl ToString) -> Self {
        Self { text: text.to_string(), url: None }
    }
    pub fn link(text: impl ToString, url: impl ToString) -> Self {
        Self { text: text.to_string(), url: Some(url.to_string()) }
    }
    pub fn flag(value: bool) -> Self {
        Self::text(if value { "Sí" } else { "No" })
    }
    pub fn date(value: Option<NaiveDate>) -> Self {
        Self::text(value.map(datetime::fdate).unwrap_or_default())
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct RowLink {
    pub label: String,
    pub url: String,
}

#[derive(Serialize, Clone, Debug)]
pub struct AdminRow {
    pub id: i64,
    pub cells: Vec<Cell>,
    pub links: Vec<RowLink>,
}
impl AdminRow {
    pub fn new(id: i64, cells: Vec<Cell>) -> Self {
        Self { id, cells, links: vec![] }
    }
    pub fn with_link(mut self, label: &str, url: impl ToString) -> Self {
        self.links.push(RowLink { label: label.to_string(), url: url.to_string() });
        self
    }
}

/// Query string of admin list and add/change pages.
#[derive(FromForm, Default, Debug)]
pub struct AdminQuery {
    pub q: Option<String>,
    #[field(name = "_redirect")]
    pub redirect: Option<String>,
    pub horario: Option<String>,
    pub alumno: Option<String>,
}
impl AdminQuery {
    pub fn id_param(value: &Option<String>) -> Option<i64> {
        non_blank(value)?.parse().ok()
    }
}

/// One entity managed by the generic admin screens.
#[rocket::async_trait]
pub trait AdminModel: Send + Sync {
    fn slug(&self) -> &'static str;
    fn title(&self) -> &'static str;
    fn singular(&self) -> &'static str;
    fn table(&self) -> &'static str;
    fn columns(&self) -> &'static [&'static str];
    /// Honour `_redirect` after a successful save.
    fn accepts_redirect(&self) -> bool {
        false
    }
    async fn rows(&self, pool: &SqlitePool, q: Option<&str>) -> Result<Vec<AdminRow>, sqlx::Error>;
    /// `None` when `id` does not exist.
    async fn fields(&self, pool: &SqlitePool, id: Option<i64>, query: &AdminQuery) -> anyhow::Result<Option<Vec<FormField>>>;
    async fn save(&self, pool: &SqlitePool, id: Option<i64>, form: &mut FormData<'_>, upload: Option<Upload>, user: &UserInfo) -> Result<i64, SaveError>;
    async fn delete(&self, pool: &SqlitePool, id: i64) -> Result<u64, sqlx::Error> {
        let res = sqlx::query(&format!("DELETE FROM {} WHERE id=?", self.table()))
            .bind(id)
            .execute(pool)
            .await?;
        Ok(res.rows_affected())
    }
}

pub struct AdminRegistry {
    models: Vec<Box<dyn AdminModel>>,
}
impl AdminRegistry {
    pub fn new(models: Vec<Box<dyn AdminModel>>) -> Self {
        Self { models }
    }
    fn model(&self, slug: &str) -> Result<&dyn AdminModel, Custom<String>> {
        self.models.iter()
            .find(|m| m.slug() == slug)
            .map(|m| m.as_ref())
            .ok_or_else(|| Custom(Status::NotFound, format!("Unknown admin model: {slug}")))
    }
}

#[derive(Serialize)]
struct ModelInfo {
    slug: &'static str,
    title: &'static str,
    singular: &'static str,
}
impl ModelInfo {
    fn new(model: &dyn AdminModel) -> Self {
        Self { slug: model.slug(), title: model.title(), singular: model.singular() }
    }
}

pub async fn load_options(pool: &SqlitePool, sql: &str) -> Result<Vec<SelectOption>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (i64, String)>(sql)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(id, label)| SelectOption::new(id, label)).collect())
}
pub fn with_blank(options: Vec<SelectOption>) -> Vec<SelectOption> {
    std::iter::once(SelectOption::blank()).chain(options).collect()
}
pub fn choice_options(choices: &[(&str, &str)]) -> Vec<SelectOption> {
    choices.iter().map(|(code, label)| SelectOption::new(code, label)).collect()
}
pub fn choice_label<'a>(choices: &[(&'a str, &'a str)], code: &str) -> &'a str {
    choices.iter().find(|(c, _)| *c == code).map(|(_, label)| *label).unwrap_or("")
}

/// Copies submitted values and validation errors back into freshly built fields.
pub fn apply_submitted(fields: &mut [FormField], submitted: &HashMap<String, String>, errors: &FieldErrors) {
    for field in fields.iter_mut() {
        match field.kind {
            FieldKind::Password | FieldKind::File => field.value.clear(),
            FieldKind::Checkbox => {
                let checked = submitted.get(&field.name).is_some_and(|v| !v.trim().is_empty());
                field.value = if checked { "on".to_string() } else { String::new() };
            }
            _ => {
                if let Some(value) = submitted.get(&field.name) {
                    field.value = value.clone();
                }
            }
        }
        field.error = errors.get(&field.name).cloned();
    }
}

fn render_form(model: &dyn AdminModel, id: Option<i64>, mut fields: Vec<FormField>, form_error: Option<String>, redirect: Option<String>) -> Template {
    for field in &mut fields {
        field.mark_selected();
    }
    let action = match id {
        Some(id) => format!("/admin/{}/{id}/change", model.slug()),
        None => format!("/admin/{}/add", model.slug()),
    };
    Template::render("admin/form", context! {
        model: ModelInfo::new(model),
        id,
        action,
        fields,
        form_error,
        redirect,
    })
}

#[get("/admin")]
fn get_index(_user: UserInfo, registry: &State<AdminRegistry>, flash: Option<FlashMessage<'_>>) -> Template {
    let models = registry.models.iter().map(|m| ModelInfo::new(m.as_ref())).collect::<Vec<_>>();
    Template::render("admin/index", context! {
        models,
        flash: FlashView::from_flash(flash),
    })
}

#[get("/admin/<slug>?<query..>")]
async fn get_list(slug: &str, query: AdminQuery, _user: UserInfo, registry: &State<AdminRegistry>, db: &State<DbPool>, flash: Option<FlashMessage<'_>>) -> Result<Template, Custom<String>> {
    let model = registry.model(slug)?;
    let q = non_blank(&query.q);
    let rows = model.rows(&db.0, q).await.map_err(status_sqlx_error)?;
    Ok(Template::render("admin/list", context! {
        model: ModelInfo::new(model),
        columns: model.columns(),
        count: rows.len(),
        rows,
        q,
        flash: FlashView::from_flash(flash),
    }))
}

#[get("/admin/<slug>/add?<query..>")]
async fn get_add(slug: &str, query: AdminQuery, _user: UserInfo, registry: &State<AdminRegistry>, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let model = registry.model(slug)?;
    let fields = model.fields(&db.0, None, &query).await.map_err(status_any_error)?
        .ok_or_else(|| Custom(Status::NotFound, "Not found".to_string()))?;
    Ok(render_form(model, None, fields, None, query.redirect))
}

#[get("/admin/<slug>/<id>/change?<query..>")]
async fn get_change(slug: &str, id: i64, query: AdminQuery, _user: UserInfo, registry: &State<AdminRegistry>, db: &State<DbPool>) -> Result<Page, Custom<String>> {
    let model = registry.model(slug)?;
    let Some(fields) = model.fields(&db.0, Some(id), &query).await.map_err(status_any_error)? else {
        return Ok(Flash::error(Redirect::to(format!("/admin/{slug}/")), format!("{} con id {id} no existe.", model.singular())).into());
    };
    Ok(render_form(model, Some(id), fields, None, query.redirect).into())
}

#[derive(FromForm, Debug)]
struct AdminSubmit<'r> {
    f: HashMap<String, String>,
    archivo: Option<TempFile<'r>>,
    #[field(name = "_redirect")]
    redirect: Option<String>,
}

async fn save_impl(model: &dyn AdminModel, id: Option<i64>, submit: AdminSubmit<'_>, user: &UserInfo, pool: &SqlitePool) -> Result<Page, Custom<String>> {
    let upload = match &submit.archivo {
        Some(file) => read_upload(file).await.map_err(status_any_error)?,
        None => None,
    };
    let mut form = FormData::new(&submit.f);
    let (errors, form_error) = match model.save(pool, id, &mut form, upload, user).await {
        Ok(saved_id) => {
            info!("{} saved, id: {saved_id}, user: {}", model.singular(), user.username);
            let target = model.accepts_redirect()
                .then(|| local_redirect_target(submit.redirect.as_deref()))
                .flatten()
                .unwrap_or_else(|| format!("/admin/{}/", model.slug()));
            return Ok(Flash::success(Redirect::to(target), format!("{} guardado correctamente.", model.singular())).into());
        }
        Err(SaveError::Invalid(errors)) => (errors, None),
        Err(SaveError::Db(err)) => match constraint_violation_message(&err) {
            Some(message) => (FieldErrors::new(), Some(message.to_string())),
            None => return Err(status_sqlx_error(err)),
        },
        Err(SaveError::Other(err)) => return Err(status_any_error(err)),
    };
    let query = AdminQuery { redirect: submit.redirect.clone(), ..Default::default() };
    let mut fields = model.fields(pool, id, &query).await.map_err(status_any_error)?
        .ok_or_else(|| Custom(Status::NotFound, "Not found".to_string()))?;
    apply_submitted(&mut fields, &submit.f, &errors);
    let form_error = form_error.or_else(|| errors.get(FORM_ERRORS_KEY).cloned())
        .or_else(|| Some("Por favor, corrige los errores en el formulario.".to_string()));
    Ok(render_form(model, id, fields, form_error, submit.redirect).into())
}

#[post("/admin/<slug>/add", data = "<form>")]
async fn post_add(slug: &str, form: Form<AdminSubmit<'_>>, user: UserInfo, registry: &State<AdminRegistry>, db: &State<DbPool>) -> Result<Page, Custom<String>> {
    let model = registry.model(slug)?;
    save_impl(model, None, form.into_inner(), &user, &db.0).await
}

#[post("/admin/<slug>/<id>/change", data = "<form>")]
async fn post_change(slug: &str, id: i64, form: Form<AdminSubmit<'_>>, user: UserInfo, registry: &State<AdminRegistry>, db: &State<DbPool>) -> Result<Page, Custom<String>> {
    let model = registry.model(slug)?;
    if model.fields(&db.0, Some(id), &AdminQuery::default()).await.map_err(status_any_error)?.is_none() {
        return Ok(Flash::error(Redirect::to(format!("/admin/{slug}/")), format!("{} con id {id} no existe.", model.singular())).into());
    }
    save_impl(model, Some(id), form.into_inner(), &user, &db.0).await
}

#[post("/admin/<slug>/<id>/delete")]
async fn post_delete(slug: &str, id: i64, user: UserInfo, registry: &State<AdminRegistry>, db: &State<DbPool>) -> Result<Flash<Redirect>, Custom<String>> {
    let model = registry.model(slug)?;
    let target = Redirect::to(format!("/admin/{slug}/"));
    match model.delete(&db.0, id).await {
        Ok(0) => Ok(Flash::error(target, format!("{} con id {id} no existe.", model.singular()))),
        Ok(_) => {
            info!("{} deleted, id: {id}, user: {}", model.singular(), user.username);
            Ok(Flash::success(target, format!("{} eliminado.", model.singular())))
        }
        Err(err) => match constraint_violation_message(&err) {
            Some(_) => {
                warn!("{} id: {id} cannot be deleted: {err}", model.singular());
                Ok(Flash::error(target, "No se puede eliminar: el registro está en uso por otros datos."))
            }
            None => Err(status_sqlx_error(err)),
        },
    }
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_index,
            get_list,
            get_add,
            get_change,
            post_add,
            post_change,
            post_delete,
        ])
}

#[cfg(test)]
mod test {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn form_data_collects_errors() {
        let submitted = values(&[
            ("name", "  "),
            ("price", "12,5"),
            ("starts", "2025-13-01"),
            ("weekday", "x"),
            ("active", "on"),
            ("cat_3", "on"),
            ("cat_1", "on"),
            ("cat_x", "on"),
        ]);
        let mut form = FormData::new(&submitted);
        assert_eq!(form.required("name"), "");
        assert_eq!(form.required_money("price").cents(), 1250);
        assert_eq!(form.date("starts"), None);
        assert_eq!(form.int("weekday"), None);
        assert_eq!(form.int("missing"), None);
        assert!(form.flag("active"));
        assert!(!form.flag("shared"));
        assert_eq!(form.checked_ids("cat_"), vec![1, 3]);
        let Err(SaveError::Invalid(errors)) = form.check() else {
            panic!("errors expected");
        };
        assert_eq!(errors.get("name").map(String::as_str), Some(REQUIRED));
        assert_eq!(errors.get("starts").map(String::as_str), Some("Introduce una fecha válida."));
        assert!(errors.contains_key("weekday"));
        assert!(!errors.contains_key("missing"));
        assert!(!errors.contains_key("price"));
    }

    #[test]
    fn oversized_amount_is_a_field_error() {
        let submitted = values(&[("price", "100000000000000000000"), ("discount", "5")]);
        let mut form = FormData::new(&submitted);
        assert_eq!(form.required_money("price"), Money::ZERO);
        assert_eq!(form.money("discount").map(|m| m.cents()), Some(500));
        let Err(SaveError::Invalid(errors)) = form.check() else {
            panic!("errors expected");
        };
        assert_eq!(errors.get("price").map(String::as_str), Some("Introduce un importe válido."));
        assert!(!errors.contains_key("discount"));
    }

    #[test]
    fn choice_accepts_known_codes_and_blank() {
        const CHOICES: [(&str, &str); 2] = [("activa", "Activa"), ("baja", "Baja")];
        let submitted = values(&[("a", "baja"), ("b", ""), ("c", "otra")]);
        let mut form = FormData::new(&submitted);
        assert_eq!(form.choice("a", &CHOICES), "baja");
        assert_eq!(form.choice("b", &CHOICES), "");
        assert_eq!(form.choice("c", &CHOICES), "");
        assert!(form.check().is_err());
        assert_eq!(choice_label(&CHOICES, "activa"), "Activa");
        assert_eq!(choice_label(&CHOICES, "zzz"), "");
    }

    #[test]
    fn submitted_values_are_applied() {
        let mut fields = vec![
            FormField::text("name", "Nombre").value("old"),
            FormField::new(FieldKind::Password, "password", "Contraseña").value("secret"),
            FormField::checkbox("active", "Activo", true),
        ];
        let submitted = values(&[("name", "new"), ("password", "typed")]);
        let errors = FieldErrors::from([("name".to_string(), "bad".to_string())]);
        apply_submitted(&mut fields, &submitted, &errors);
        assert_eq!(fields[0].value, "new");
        assert_eq!(fields[0].error.as_deref(), Some("bad"));
        assert_eq!(fields[1].value, "");
        assert_eq!(fields[2].value, "");
    }
}
