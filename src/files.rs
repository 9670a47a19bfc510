use std::path::PathBuf;
use rocket::fs::TempFile;
use rocket::http::{ContentType, Status};
use rocket::response::status::Custom;
use rocket::tokio::io::AsyncReadExt;
use rocket::{Build, Rocket, State};
use serde::Serialize;
use sqlx::{FromRow, SqliteExecutor};
use crate::db::DbPool;
use crate::util::status_sqlx_error;

pub type FileId = i64;

pub const INVOICE_EXTENSIONS: [&str; 4] = ["pdf", "jpg", "jpeg", "png"];
pub const INVOICE_EXTENSION_ERROR: &str = "Solo se permiten archivos PDF, JPG o PNG.";
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];
pub const IMAGE_EXTENSION_ERROR: &str = "Solo se permiten imágenes JPG, PNG, GIF o WEBP.";

#[derive(Serialize, FromRow, Clone, Debug)]
pub struct FileInfo {
    pub id: FileId,
    pub path: String,
    pub size: i64,
    pub created: chrono::NaiveDateTime,
}
impl FileInfo {
    pub fn file_name(&self) -> &str {
        file_name(&self.path)
    }
    pub fn url(&self) -> String {
        media_url(&self.path)
    }
}

/// Uploaded file read into memory.
#[derive(Debug)]
pub struct Upload {
    pub file_name: String,
    pub data: Vec<u8>,
}
impl Upload {
    pub fn extension(&self) -> Option<String> {
        file_extension(&self.file_name)
    }
}

pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
pub fn file_extension(file_name: &str) -> Option<String> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}
pub fn media_url(path: &str) -> String {
    format!("/media/{path}")
}

/// Case-insensitive check of the invoice extension; returns the lower-cased extension.
pub fn validate_invoice_extension(file_name: &str) -> Result<String, &'static str> {
    match file_extension(file_name) {
        Some(ext) if INVOICE_EXTENSIONS.contains(&ext.as_str()) => Ok(ext),
        _ => Err(INVOICE_EXTENSION_ERROR),
    }
}

pub fn validate_image_extension(file_name: &str) -> Result<String, &'static str> {
    match file_extension(file_name) {
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => Ok(ext),
        _ => Err(IMAGE_EXTENSION_ERROR),
    }
}

/// Reads a multipart upload, an empty part counts as no file.
pub async fn read_upload(file: &TempFile<'_>) -> anyhow::Result<Option<Upload>> {
    if file.len() == 0 {
        return Ok(None);
    }
    let file_name = file.raw_name()
        .map(|n| n.dangerous_unsafe_unsanitized_raw().as_str().to_string())
        .unwrap_or_default();
    let mut data = Vec::with_capacity(file.len() as usize);
    file.open().await?.read_to_end(&mut data).await?;
    Ok(Some(Upload { file_name, data }))
}

/// Inserts or replaces the file stored under `path`, the id is kept on replace.
pub async fn store_file<'c>(executor: impl SqliteExecutor<'c>, path: &str, data: &[u8]) -> Result<FileId, sqlx::Error> {
    let content_type = file_extension(path)
        .and_then(|ext| ContentType::from_extension(&ext))
        .unwrap_or(ContentType::Binary);
    let id: (FileId, ) = sqlx::query_as("INSERT INTO stored_files (path, content_type, data) VALUES (?, ?, ?)
                ON CONFLICT(path) DO UPDATE SET content_type=excluded.content_type, data=excluded.data
                RETURNING id")
        .bind(path)
        .bind(content_type.to_string())
        .bind(data)
        .fetch_one(executor)
        .await?;
    info!("File stored, id: {}, path: {path}, size: {}", id.0, data.len());
    Ok(id.0)
}

pub async fn file_info<'c>(executor: impl SqliteExecutor<'c>, file_id: FileId) -> Result<Option<FileInfo>, sqlx::Error> {
    sqlx::query_as::<_, FileInfo>("SELECT id, path, LENGTH(data) AS size, created FROM stored_files WHERE id=?")
        .bind(file_id)
        .fetch_optional(executor)
        .await
}

#[get("/media/<path..>")]
async fn get_media(path: PathBuf, db: &State<DbPool>) -> Result<(ContentType, Vec<u8>), Custom<String>> {
    let path = path.iter()
        .map(|s| s.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let file = sqlx::query_as::<_, (String, Vec<u8>)>("SELECT content_type, data FROM stored_files WHERE path=?")
        .bind(&path)
        .fetch_optional(&db.0)
        .await
        .map_err(status_sqlx_error)?;
    let Some((content_type, data)) = file else {
        return Err(Custom(Status::NotFound, format!("File {path} not found")));
    };
    let content_type = ContentType::parse_flexible(&content_type).unwrap_or(ContentType::Binary);
    Ok((content_type, data))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_media,
        ])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn invoice_extension_is_case_insensitive() {
        assert_eq!(validate_invoice_extension("factura.PDF"), Ok("pdf".to_string()));
        assert_eq!(validate_invoice_extension("ticket.Jpeg"), Ok("jpeg".to_string()));
        assert_eq!(validate_invoice_extension("scan.png"), Ok("png".to_string()));
        assert_eq!(validate_invoice_extension("notas.docx"), Err(INVOICE_EXTENSION_ERROR));
        assert_eq!(validate_invoice_extension("sin_extension"), Err(INVOICE_EXTENSION_ERROR));
        assert_eq!(validate_invoice_extension(".png"), Err(INVOICE_EXTENSION_ERROR));
        assert_eq!(validate_image_extension("aula.WEBP"), Ok("webp".to_string()));
        assert_eq!(validate_image_extension("aula.pdf"), Err(IMAGE_EXTENSION_ERROR));
    }

    #[test]
    fn file_name_is_last_segment() {
        assert_eq!(file_name("gastos/2025/01/otros/gasto_1_20250110.pdf"), "gasto_1_20250110.pdf");
        assert_eq!(file_name("logo.png"), "logo.png");
        assert_eq!(media_url("comprobantes/comprobante_PG-2025-0001.pdf"), "/media/comprobantes/comprobante_PG-2025-0001.pdf");
    }
}
