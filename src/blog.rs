use std::collections::HashSet;
use chrono::NaiveDateTime;
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use crate::admin::{AdminModel, AdminQuery, AdminRow, Cell, FieldKind, FormData, FormField, SaveError};
use crate::auth::UserInfo;
use crate::datetime;
use crate::db::DbPool;
use crate::files::Upload;
use crate::site::{attach_image, image_extension};
use crate::util::{like_pattern, status_sqlx_error};

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct BlogCategory {
    pub id: i64,
    pub name: String,
    pub created: NaiveDateTime,
    pub updated: NaiveDateTime,
}

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct BlogPost {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub image_file_id: Option<i64>,
    pub author_id: i64,
    pub created: NaiveDateTime,
    pub updated: NaiveDateTime,
    pub author_name: String,
    pub image_url: Option<String>,
    /// Comma separated category names.
    pub categories: Option<String>,
}

fn post_select() -> &'static str {
    "SELECT b.*, TRIM(u.first_name || ' ' || u.last_name) AS author_name,
            '/media/' || f.path AS image_url,
            (SELECT GROUP_CONCAT(c.name, ', ') FROM blog_post_categories AS pc
                JOIN blog_categories AS c ON c.id=pc.category_id
                WHERE pc.post_id=b.id) AS categories
        FROM blog_posts AS b
        JOIN users AS u ON u.id=b.author_id
        LEFT JOIN stored_files AS f ON f.id=b.image_file_id"
}

pub async fn all_categories(pool: &SqlitePool) -> Result<Vec<BlogCategory>, sqlx::Error> {
    sqlx::query_as::<_, BlogCategory>("SELECT * FROM blog_categories ORDER BY name")
        .fetch_all(pool)
        .await
}

/// Posts newest first, optionally only those tagged with `category_id`.
pub async fn posts(pool: &SqlitePool, category_id: Option<i64>) -> Result<Vec<BlogPost>, sqlx::Error> {
    sqlx::query_as::<_, BlogPost>(&format!("{} WHERE ?1 IS NULL OR EXISTS(
                SELECT 1 FROM blog_post_categories AS pc WHERE pc.post_id=b.id AND pc.category_id=?1)
            ORDER BY b.created DESC, b.id DESC", post_select()))
        .bind(category_id)
        .fetch_all(pool)
        .await
}

#[get("/blog")]
async fn get_blog(db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let post = posts(&db.0, None).await.map_err(status_sqlx_error)?;
    let categorias = all_categories(&db.0).await.map_err(status_sqlx_error)?;
    Ok(Template::render("blog/blog", context! {
        post,
        categorias,
    }))
}

#[get("/blog/categoria/<category_id>")]
async fn get_category(category_id: i64, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let categoria = sqlx::query_as::<_, BlogCategory>("SELECT * FROM blog_categories WHERE id=?")
        .bind(category_id)
        .fetch_optional(&db.0)
        .await
        .map_err(status_sqlx_error)?
        .ok_or_else(|| Custom(Status::NotFound, format!("Categoría {category_id} no encontrada")))?;
    let post = posts(&db.0, Some(category_id)).await.map_err(status_sqlx_error)?;
    let categorias = all_categories(&db.0).await.map_err(status_sqlx_error)?;
    Ok(Template::render("blog/categoria", context! {
        categoria,
        post,
        categorias,
    }))
}

pub struct BlogCategoryAdmin;

#[rocket::async_trait]
impl AdminModel for BlogCategoryAdmin {
    fn slug(&self) -> &'static str { "categorias-blog" }
    fn title(&self) -> &'static str { "Categorías del blog" }
    fn singular(&self) -> &'static str { "Categoría" }
    fn table(&self) -> &'static str { "blog_categories" }
    fn columns(&self) -> &'static [&'static str] {
        &["Nombre", "Creada", "Actualizada"]
    }
    async fn rows(&self, pool: &SqlitePool, q: Option<&str>) -> Result<Vec<AdminRow>, sqlx::Error> {
        let categories = sqlx::query_as::<_, BlogCategory>("SELECT * FROM blog_categories
                WHERE ?1 IS NULL OR LOWER(name) LIKE ?1 ORDER BY name")
            .bind(like_pattern(q))
            .fetch_all(pool)
            .await?;
        Ok(categories.into_iter().map(|c| AdminRow::new(c.id, vec![
            Cell::link(&c.name, format!("/admin/categorias-blog/{}/change", c.id)),
            Cell::text(datetime::fdatetime(c.created)),
            Cell::text(datetime::fdatetime(c.updated)),
        ])).collect())
    }
    async fn fields(&self, pool: &SqlitePool, id: Option<i64>, _query: &AdminQuery) -> anyhow::Result<Option<Vec<FormField>>> {
        let name = match id {
            Some(id) => match sqlx::query_as::<_, (String, )>("SELECT name FROM blog_categories WHERE id=?")
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
                sqlx::query("UPDATE blog_categories SET name=?, updated=? WHERE id=?")
                    .bind(&name).bind(now).bind(id)
                    .execute(pool)
                    .await?;
                id
            }
            None => {
                let id: (i64, ) = sqlx::query_as("INSERT INTO blog_categories (name, created, updated) VALUES (?, ?, ?) RETURNING id")
                    .bind(&name).bind(now).bind(now)
                    .fetch_one(pool)
                    .await?;
                id.0
            }
        };
        Ok(id)
    }
}

pub struct BlogPostAdmin;

#[rocket::async_trait]
impl AdminModel for BlogPostAdmin {
    fn slug(&self) -> &'static str { "posts" }
    fn title(&self) -> &'static str { "Posts" }
    fn singular(&self) -> &'static str { "Post" }
    fn table(&self) -> &'static str { "blog_posts" }
    fn columns(&self) -> &'static [&'static str] {
        &["Título", "Autor", "Categorías", "Creado"]
    }
    async fn rows(&self, pool: &SqlitePool, q: Option<&str>) -> Result<Vec<AdminRow>, sqlx::Error> {
        let posts = sqlx::query_as::<_, BlogPost>(&format!("{}
                WHERE ?1 IS NULL OR LOWER(b.title) LIKE ?1 OR LOWER(b.content) LIKE ?1
                ORDER BY b.created DESC, b.id DESC", post_select()))
            .bind(like_pattern(q))
            .fetch_all(pool)
            .await?;
        Ok(posts.into_iter().map(|p| AdminRow::new(p.id, vec![
            Cell::link(&p.title, format!("/admin/posts/{}/change", p.id)),
            Cell::text(&p.author_name),
            Cell::text(p.categories.as_deref().unwrap_or("-")),
            Cell::text(datetime::fdatetime(p.created)),
        ])).collect())
    }
    async fn fields(&self, pool: &SqlitePool, id: Option<i64>, _query: &AdminQuery) -> anyhow::Result<Option<Vec<FormField>>> {
        let post = match id {
            Some(id) => match sqlx::query_as::<_, BlogPost>(&format!("{} WHERE b.id=?", post_select()))
                .bind(id)
                .fetch_optional(pool)
                .await? {
                Some(post) => Some(post),
                None => return Ok(None),
            },
            None => None,
        };
        let tagged: HashSet<i64> = match id {
            Some(id) => sqlx::query_as::<_, (i64, )>("SELECT category_id FROM blog_post_categories WHERE post_id=?")
                .bind(id)
                .fetch_all(pool)
                .await?
                .into_iter()
                .map(|(category_id, )| category_id)
                .collect(),
            None => HashSet::new(),
        };
        let p = post.as_ref();
        let mut fields = vec![
            FormField::text("title", "Título").opt_value(p.map(|p| &p.title)).required(),
            FormField::new(FieldKind::Textarea, "content", "Contenido").opt_value(p.map(|p| &p.content)).required(),
            FormField::new(FieldKind::File, "archivo", "Imagen").link(p.and_then(|p| p.image_url.clone())),
        ];
        for category in all_categories(pool).await? {
            fields.push(FormField::checkbox(&format!("cat_{}", category.id), &category.name, tagged.contains(&category.id)));
        }
        Ok(Some(fields))
    }
    async fn save(&self, pool: &SqlitePool, id: Option<i64>, form: &mut FormData<'_>, upload: Option<Upload>, user: &UserInfo) -> Result<i64, SaveError> {
        let title = form.required("title");
        let content = form.required("content");
        let category_ids = form.checked_ids("cat_");
        let ext = image_extension(form, &upload);
        form.check()?;
        let now = datetime::now();
        let mut tx = pool.begin().await?;
        let id = match id {
            Some(id) => {
                sqlx::query("UPDATE blog_posts SET title=?, content=?, updated=? WHERE id=?")
                    .bind(&title).bind(&content).bind(now).bind(id)
                    .execute(&mut *tx)
                    .await?;
                id
            }
            None => {
                let id: (i64, ) = sqlx::query_as("INSERT INTO blog_posts (title, content, author_id, created, updated)
                        VALUES (?, ?, ?, ?, ?) RETURNING id")
                    .bind(&title).bind(&content).bind(user.id).bind(now).bind(now)
                    .fetch_one(&mut *tx)
                    .await?;
                id.0
            }
        };
        sqlx::query("DELETE FROM blog_post_categories WHERE post_id=?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        for category_id in category_ids {
            sqlx::query("INSERT OR IGNORE INTO blog_post_categories (post_id, category_id)
                    SELECT ?, id FROM blog_categories WHERE id=?")
                .bind(id)
                .bind(category_id)
                .execute(&mut *tx)
                .await?;
        }
        attach_image(&mut tx, "blog_posts", "blog", id, upload, ext).await?;
        tx.commit().await?;
        Ok(id)
    }
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_blog,
            get_category,
        ])
}
