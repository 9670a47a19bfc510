use chrono::NaiveDateTime;
use itertools::Itertools;
use rocket::request::FlashMessage;
use rocket::response::status::Custom;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use crate::admin::{load_options, with_blank, AdminModel, AdminQuery, AdminRow, Cell, FieldKind, FormData, FormField, SaveError};
use crate::auth::UserInfo;
use crate::datetime;
use crate::db::DbPool;
use crate::files::{media_url, store_file, validate_image_extension, Upload};
use crate::money::Money;
use crate::util::{like_pattern, status_sqlx_error, FlashView};

/// Service or installation shown on the public pages.
#[derive(Serialize, FromRow, Clone, Debug)]
pub struct SiteItem {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub image_file_id: Option<i64>,
    pub created: NaiveDateTime,
    pub updated: NaiveDateTime,
    pub image_url: Option<String>,
}

fn item_select(table: &str) -> String {
    format!("SELECT i.*, '/media/' || f.path AS image_url
        FROM {table} AS i
        LEFT JOIN stored_files AS f ON f.id=i.image_file_id")
}

pub async fn site_items(pool: &SqlitePool, table: &str, limit: Option<i64>) -> Result<Vec<SiteItem>, sqlx::Error> {
    sqlx::query_as::<_, SiteItem>(&format!("{} ORDER BY i.id LIMIT ?", item_select(table)))
        .bind(limit.unwrap_or(-1))
        .fetch_all(pool)
        .await
}

/// Validates the optional image upload, the error is reported on the `archivo` field.
pub(crate) fn image_extension(form: &mut FormData<'_>, upload: &Option<Upload>) -> Option<String> {
    let upload = upload.as_ref()?;
    match validate_image_extension(&upload.file_name) {
        Ok(ext) => Some(ext),
        Err(message) => {
            form.add_error("archivo", message);
            None
        }
    }
}

/// `<folder>/<folder>_<id>.<ext>`
pub fn image_path(folder: &str, id: i64, ext: &str) -> String {
    format!("{folder}/{folder}_{id}.{ext}")
}

/// Stores the uploaded image and links it to row `id` of `table`.
pub(crate) async fn attach_image(conn: &mut SqliteConnection, table: &str, folder: &str, id: i64, upload: Option<Upload>, ext: Option<String>) -> Result<(), sqlx::Error> {
    let (Some(upload), Some(ext)) = (upload, ext) else {
        return Ok(());
    };
    let file_id = store_file(&mut *conn, &image_path(folder, id, &ext), &upload.data).await?;
    sqlx::query(&format!("UPDATE {table} SET image_file_id=? WHERE id=?"))
        .bind(file_id)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Admin for the services and installations tables, both hold a title, text and picture.
pub struct SiteItemAdmin {
    pub slug: &'static str,
    pub title: &'static str,
    pub singular: &'static str,
    pub table: &'static str,
}
pub const SERVICE_ADMIN: SiteItemAdmin = SiteItemAdmin { slug: "servicios", title: "Servicios", singular: "Servicio", table: "services" };
pub const INSTALLATION_ADMIN: SiteItemAdmin = SiteItemAdmin { slug: "instalaciones", title: "Instalaciones", singular: "Instalación", table: "installations" };

impl SiteItemAdmin {
    async fn load(&self, pool: &SqlitePool, id: i64) -> Result<Option<SiteItem>, sqlx::Error> {
        sqlx::query_as::<_, SiteItem>(&format!("{} WHERE i.id=?", item_select(self.table)))
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}

#[rocket::async_trait]
impl AdminModel for SiteItemAdmin {
    fn slug(&self) -> &'static str { self.slug }
    fn title(&self) -> &'static str { self.title }
    fn singular(&self) -> &'static str { self.singular }
    fn table(&self) -> &'static str { self.table }
    fn columns(&self) -> &'static [&'static str] {
        &["Título", "Contenido", "Imagen", "Creado", "Actualizado"]
    }
    async fn rows(&self, pool: &SqlitePool, q: Option<&str>) -> Result<Vec<AdminRow>, sqlx::Error> {
        let items = sqlx::query_as::<_, SiteItem>(&format!("{}
                WHERE ?1 IS NULL OR LOWER(i.title) LIKE ?1 OR LOWER(i.content) LIKE ?1
                ORDER BY i.id", item_select(self.table)))
            .bind(like_pattern(q))
            .fetch_all(pool)
            .await?;
        Ok(items.into_iter().map(|i| AdminRow::new(i.id, vec![
            Cell::link(&i.title, format!("/admin/{}/{}/change", self.slug, i.id)),
            Cell::text(&i.content),
            match &i.image_url {
                Some(url) => Cell::link("Ver", url),
                None => Cell::text("-"),
            },
            Cell::text(datetime::fdatetime(i.created)),
            Cell::text(datetime::fdatetime(i.updated)),
        ])).collect())
    }
    async fn fields(&self, pool: &SqlitePool, id: Option<i64>, _query: &AdminQuery) -> anyhow::Result<Option<Vec<FormField>>> {
        let item = match id {
            Some(id) => match self.load(pool, id).await? {
                Some(item) => Some(item),
                None => return Ok(None),
            },
            None => None,
        };
        let i = item.as_ref();
        Ok(Some(vec![
            FormField::text("title", "Título").opt_value(i.map(|i| &i.title)).required(),
            FormField::new(FieldKind::Textarea, "content", "Contenido").opt_value(i.map(|i| &i.content)).required(),
            FormField::new(FieldKind::File, "archivo", "Imagen").link(i.and_then(|i| i.image_url.clone())),
        ]))
    }
    async fn save(&self, pool: &SqlitePool, id: Option<i64>, form: &mut FormData<'_>, upload: Option<Upload>, _user: &UserInfo) -> Result<i64, SaveError> {
        let title = form.required("title");
        let content = form.required("content");
        let ext = image_extension(form, &upload);
        form.check()?;
        let now = datetime::now();
        let mut tx = pool.begin().await?;
        let id = match id {
            Some(id) => {
                sqlx::query(&format!("UPDATE {} SET title=?, content=?, updated=? WHERE id=?", self.table))
                    .bind(&title).bind(&content).bind(now).bind(id)
                    .execute(&mut *tx)
                    .await?;
                id
            }
            None => {
                let id: (i64, ) = sqlx::query_as(&format!("INSERT INTO {} (title, content, created, updated) VALUES (?, ?, ?, ?) RETURNING id", self.table))
                    .bind(&title).bind(&content).bind(now).bind(now)
                    .fetch_one(&mut *tx)
                    .await?;
                id.0
            }
        };
        attach_image(&mut tx, self.table, self.slug, id, upload, ext).await?;
        tx.commit().await?;
        Ok(id)
    }
}

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct StoreCategory {
    pub id: i64,
    pub name: String,
    pub created: NaiveDateTime,
    pub updated: NaiveDateTime,
}

pub struct StoreCategoryAdmin;

#[rocket::async_trait]
impl AdminModel for StoreCategoryAdmin {
    fn slug(&self) -> &'static str { "categorias-tienda" }
    fn title(&self) -> &'static str { "Categorías de productos" }
    fn singular(&self) -> &'static str { "Categoría" }
    fn table(&self) -> &'static str { "store_categories" }
    fn columns(&self) -> &'static [&'static str] {
        &["Nombre", "Creada", "Actualizada"]
    }
    async fn rows(&self, pool: &SqlitePool, q: Option<&str>) -> Result<Vec<AdminRow>, sqlx::Error> {
        let categories = sqlx::query_as::<_, StoreCategory>("SELECT * FROM store_categories
                WHERE ?1 IS NULL OR LOWER(name) LIKE ?1 ORDER BY name")
            .bind(like_pattern(q))
            .fetch_all(pool)
            .await?;
        Ok(categories.into_iter().map(|c| AdminRow::new(c.id, vec![
            Cell::link(&c.name, format!("/admin/categorias-tienda/{}/change", c.id)),
            Cell::text(datetime::fdatetime(c.created)),
            Cell::text(datetime::fdatetime(c.updated)),
        ])).collect())
    }
    async fn fields(&self, pool: &SqlitePool, id: Option<i64>, _query: &AdminQuery) -> anyhow::Result<Option<Vec<FormField>>> {
        let name = match id {
            Some(id) => match sqlx::query_as::<_, (String, )>("SELECT name FROM store_categories WHERE id=?")
                .bind(id)
                .fetch_optional(pool)
                .await? {
                Some((name, )) => name,
                None => return Ok(None),
            },
            None => String::new(),
        };
        Ok(Some(vec![
            FormField::text("name", "Nombre").value(name).required(),
        ]))
    }
    async fn save(&self, pool: &SqlitePool, id: Option<i64>, form: &mut FormData<'_>, _upload: Option<Upload>, _user: &UserInfo) -> Result<i64, SaveError> {
        let name = form.required("name");
        form.check()?;
        let now = datetime::now();
        let id = match id {
            Some(id) => {
                sqlx::query("UPDATE store_categories SET name=?, updated=? WHERE id=?")
                    .bind(&name).bind(now).bind(id)
                    .execute(pool)
                    .await?;
                id
            }
            None => {
                let id: (i64, ) = sqlx::query_as("INSERT INTO store_categories (name, created, updated) VALUES (?, ?, ?) RETURNING id")
                    .bind(&name).bind(now).bind(now)
                    .fetch_one(pool)
                    .await?;
                id.0
            }
        };
        Ok(id)
    }
}

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct ProductRecord {
    pub id: i64,
    pub name: String,
    pub category_id: Option<i64>,
    #[sqlx(try_from = "i64")]
    pub price: Money,
    pub image_file_id: Option<i64>,
    pub available: bool,
    pub created: NaiveDateTime,
    pub updated: NaiveDateTime,
    pub category_name: Option<String>,
    pub image_path: Option<String>,
}
impl ProductRecord {
    pub fn image_url(&self) -> Option<String> {
        self.image_path.as_deref().map(media_url)
    }
}

fn product_select() -> &'static str {
    "SELECT p.*, c.name AS category_name, f.path AS image_path
        FROM products AS p
        LEFT JOIN store_categories AS c ON c.id=p.category_id
        LEFT JOIN stored_files AS f ON f.id=p.image_file_id"
}

pub struct ProductAdmin;

#[rocket::async_trait]
impl AdminModel for ProductAdmin {
    fn slug(&self) -> &'static str { "productos" }
    fn title(&self) -> &'static str { "Productos" }
    fn singular(&self) -> &'static str { "Producto" }
    fn table(&self) -> &'static str { "products" }
    fn columns(&self) -> &'static [&'static str] {
        &["Nombre", "Categoría", "Precio", "Disponible", "Imagen"]
    }
    async fn rows(&self, pool: &SqlitePool, q: Option<&str>) -> Result<Vec<AdminRow>, sqlx::Error> {
        let products = sqlx::query_as::<_, ProductRecord>(&format!("{}
                WHERE ?1 IS NULL OR LOWER(p.name) LIKE ?1 OR LOWER(COALESCE(c.name, '')) LIKE ?1
                ORDER BY p.name", product_select()))
            .bind(like_pattern(q))
            .fetch_all(pool)
            .await?;
        Ok(products.into_iter().map(|p| AdminRow::new(p.id, vec![
            Cell::link(&p.name, format!("/admin/productos/{}/change", p.id)),
            Cell::text(p.category_name.as_deref().unwrap_or("-")),
            Cell::text(format!("{}€", p.price)),
            Cell::flag(p.available),
            match p.image_url() {
                Some(url) => Cell::link("Ver", url),
                None => Cell::text("-"),
            },
        ])).collect())
    }
    async fn fields(&self, pool: &SqlitePool, id: Option<i64>, _query: &AdminQuery) -> anyhow::Result<Option<Vec<FormField>>> {
        let product = match id {
            Some(id) => match sqlx::query_as::<_, ProductRecord>(&format!("{} WHERE p.id=?", product_select()))
                .bind(id)
                .fetch_optional(pool)
                .await? {
                Some(product) => Some(product),
                None => return Ok(None),
            },
            None => None,
        };
        let p = product.as_ref();
        let categories = load_options(pool, "SELECT id, name FROM store_categories ORDER BY name").await?;
        Ok(Some(vec![
            FormField::text("name", "Nombre").opt_value(p.map(|p| &p.name)).required(),
            FormField::select("category_id", "Categoría", with_blank(categories)).opt_value(p.and_then(|p| p.category_id)),
            FormField::new(FieldKind::Number, "price", "Precio").opt_value(p.map(|p| p.price)).required().help("Precio en euros"),
            FormField::checkbox("available", "Disponible", p.map(|p| p.available).unwrap_or(true)),
            FormField::new(FieldKind::File, "archivo", "Imagen").link(p.and_then(|p| p.image_url())),
        ]))
    }
    async fn save(&self, pool: &SqlitePool, id: Option<i64>, form: &mut FormData<'_>, upload: Option<Upload>, _user: &UserInfo) -> Result<i64, SaveError> {
        let name = form.required("name");
        let category_id = form.int("category_id");
        let price = form.required_money("price");
        if price.is_negative() {
            form.add_error("price", "El precio no puede ser negativo.");
        }
        let available = form.flag("available");
        let ext = image_extension(form, &upload);
        form.check()?;
        let now = datetime::now();
        let mut tx = pool.begin().await?;
        let id = match id {
            Some(id) => {
                sqlx::query("UPDATE products SET name=?, category_id=?, price=?, available=?, updated=? WHERE id=?")
                    .bind(&name).bind(category_id).bind(price.cents()).bind(available).bind(now).bind(id)
                    .execute(&mut *tx)
                    .await?;
                id
            }
            None => {
                let id: (i64, ) = sqlx::query_as("INSERT INTO products (name, category_id, price, available, created, updated)
                        VALUES (?, ?, ?, ?, ?, ?) RETURNING id")
                    .bind(&name).bind(category_id).bind(price.cents()).bind(available).bind(now).bind(now)
                    .fetch_one(&mut *tx)
                    .await?;
                id.0
            }
        };
        attach_image(&mut tx, "products", "tienda", id, upload, ext).await?;
        tx.commit().await?;
        Ok(id)
    }
}

#[derive(Serialize, Debug)]
struct ProductView {
    #[serde(flatten)]
    product: ProductRecord,
    image_url: Option<String>,
}

#[derive(Serialize, Debug)]
struct StoreSection {
    category: Option<String>,
    products: Vec<ProductView>,
}

/// Available products grouped by category name, uncategorized last.
async fn store_sections(pool: &SqlitePool) -> Result<Vec<StoreSection>, sqlx::Error> {
    let products = sqlx::query_as::<_, ProductRecord>(&format!("{} WHERE p.available=1
            ORDER BY c.name IS NULL, c.name, p.name", product_select()))
        .fetch_all(pool)
        .await?;
    let sections = products.into_iter()
        .chunk_by(|p| p.category_name.clone())
        .into_iter()
        .map(|(category, products)| StoreSection {
            category,
            products: products.map(|product| ProductView { image_url: product.image_url(), product }).collect(),
        })
        .collect();
    Ok(sections)
}

#[get("/")]
async fn get_home(db: &State<DbPool>, flash: Option<FlashMessage<'_>>) -> Result<Template, Custom<String>> {
    let servicios = site_items(&db.0, "services", Some(3)).await.map_err(status_sqlx_error)?;
    let instalaciones = site_items(&db.0, "installations", Some(3)).await.map_err(status_sqlx_error)?;
    Ok(Template::render("site/home", context! {
        servicios,
        instalaciones,
        flash: FlashView::from_flash(flash),
    }))
}

#[get("/servicios")]
async fn get_services(db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let servicios = site_items(&db.0, "services", None).await.map_err(status_sqlx_error)?;
    Ok(Template::render("site/servicios", context! {
        servicios,
    }))
}

#[get("/instalaciones")]
async fn get_installations(db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let instalaciones = site_items(&db.0, "installations", None).await.map_err(status_sqlx_error)?;
    Ok(Template::render("site/instalaciones", context! {
        instalaciones,
    }))
}

#[get("/tienda")]
async fn get_store(db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let secciones = store_sections(&db.0).await.map_err(status_sqlx_error)?;
    Ok(Template::render("site/tienda", context! {
        secciones,
    }))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_home,
            get_services,
            get_installations,
            get_store,
        ])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn image_path_uses_folder_and_id() {
        assert_eq!(image_path("servicios", 4, "png"), "servicios/servicios_4.png");
        assert_eq!(image_path("tienda", 12, "jpg"), "tienda/tienda_12.jpg");
    }
}
