use std::backtrace::Backtrace;
use log::error;
use rocket::http::Status;
use rocket::request::FlashMessage;
use rocket::response::{Flash, Redirect};
use rocket::response::status::Custom;
use rocket_dyn_templates::Template;
use serde::Serialize;

pub(crate) fn status_sqlx_error(err: sqlx::Error) -> Custom<String> {
    error!("SQL Error: {err}\nbacktrace: {}", Backtrace::capture());
    Custom(Status::InternalServerError, format!("SQLx error: {}", err))
}
pub(crate) fn status_any_error(err: anyhow::Error) -> Custom<String> {
    error!("Error: {err}\nbacktrace: {}", Backtrace::capture());
    Custom(Status::InternalServerError, format!("Error: {}", err))
}

/// Either a rendered page or a redirect carrying a flash message.
#[derive(Responder)]
pub enum Page {
    Html(Template),
    Redirect(Flash<Redirect>),
}
impl From<Template> for Page {
    fn from(value: Template) -> Self {
        Page::Html(value)
    }
}
impl From<Flash<Redirect>> for Page {
    fn from(value: Flash<Redirect>) -> Self {
        Page::Redirect(value)
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct FlashView {
    pub kind: String,
    pub message: String,
}
impl FlashView {
    pub fn from_flash(flash: Option<FlashMessage<'_>>) -> Option<Self> {
        flash.map(|f| Self { kind: f.kind().to_string(), message: f.message().to_string() })
    }
}

/// Attendance and occupancy ratios as shown in the dashboards: percent with one decimal.
pub fn percentage(part: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    (part as f64 / total as f64 * 1000.0).round() / 10.0
}

/// Lower-cased `%q%` pattern for LIKE based search, `None` for a blank term.
pub fn like_pattern(q: Option<&str>) -> Option<String> {
    let q = q?.trim();
    if q.is_empty() {
        None
    } else {
        Some(format!("%{}%", q.to_lowercase()))
    }
}

/// Trimmed non-empty query-string value.
pub fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Only local absolute paths are accepted as post-save redirect targets.
pub fn local_redirect_target(target: Option<&str>) -> Option<String> {
    let target = target?.trim();
    if target.starts_with('/') && !target.starts_with("//") {
        Some(target.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(1, 3), 33.3);
        assert_eq!(percentage(2, 3), 66.7);
        assert_eq!(percentage(5, 5), 100.0);
        assert_eq!(percentage(3, 0), 0.0);
    }

    #[test]
    fn test_like_pattern() {
        assert_eq!(like_pattern(None), None);
        assert_eq!(like_pattern(Some("  ")), None);
        assert_eq!(like_pattern(Some(" García ")), Some("%garcía%".to_string()));
    }

    #[test]
    fn test_local_redirect_target() {
        assert_eq!(local_redirect_target(Some("/gestion/alumnos/")), Some("/gestion/alumnos/".to_string()));
        assert_eq!(local_redirect_target(Some("https://evil.example")), None);
        assert_eq!(local_redirect_target(Some("//evil.example")), None);
        assert_eq!(local_redirect_target(None), None);
    }
}
