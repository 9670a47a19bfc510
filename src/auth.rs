use std::collections::HashMap;
use anyhow::anyhow;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use argon2::password_hash::SaltString;
use chrono::{NaiveDateTime, TimeDelta};
use log::{info, warn};
use rand::{Rng, RngCore};
use rocket::form::Form;
use rocket::http::{Cookie, CookieJar, SameSite, Status};
use rocket::request::{self, FlashMessage, FromRequest};
use rocket::response::{Flash, Redirect};
use rocket::response::status::Custom;
use rocket::{Build, Request, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use crate::config::BootstrapAdmin;
use crate::datetime;
use crate::db::DbPool;
use crate::util::{status_sqlx_error, FlashView, Page};
use crate::{LoginSession, SessionId, SharedAppState};

pub type UserId = i64;

pub const SESSION_COOKIE: &str = "esquemas_session_id";

/// Logins older than this are dropped.
const SESSION_TTL_HOURS: i64 = 12;

impl LoginSession {
    fn is_expired(&self, now: NaiveDateTime) -> bool {
        now - self.created >= TimeDelta::hours(SESSION_TTL_HOURS)
    }
}

/// Removes expired logins, returning how many were dropped.
fn prune_sessions(sessions: &mut HashMap<SessionId, LoginSession>, now: NaiveDateTime) -> usize {
    let before = sessions.len();
    sessions.retain(|_, session| !session.is_expired(now));
    before - sessions.len()
}

/// The logged in user; as a request guard it forwards with 401 when there is no valid session.
#[derive(Clone, Serialize, Debug)]
pub struct UserInfo {
    pub id: UserId,
    pub username: String,
    pub full_name: String,
}

#[derive(FromRow, Debug)]
struct UserRecord {
    id: UserId,
    username: String,
    password_hash: String,
    first_name: String,
    last_name: String,
    is_active: bool,
}
impl UserRecord {
    fn user_info(&self) -> UserInfo {
        let full_name = format!("{} {}", self.first_name, self.last_name).trim().to_string();
        UserInfo {
            id: self.id,
            username: self.username.clone(),
            full_name: if full_name.is_empty() { self.username.clone() } else { full_name },
        }
    }
}

pub fn generate_random_string(len: usize) -> String {
    const WOWELS: &str = "aeiouy";
    const CONSONANTS: &str = "bcdfghjklmnopqrstvwxz";
    let mut rng = rand::rng();
    (0..len)
        .map(|n| {
            let charset = if n % 2 == 0 { CONSONANTS } else { WOWELS };
            let idx = rng.random_range(0..charset.len());
            charset.as_bytes()[idx] as char
        })
        .collect()
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let mut salt = [0u8; 16];
    rand::rng().fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt).map_err(|e| anyhow!("Salt encoding failed: {e}"))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("Password hashing failed: {e}"))?;
    Ok(hash.to_string())
}
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    match PasswordHash::new(password_hash) {
        Ok(parsed) => Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(e) => {
            warn!("Stored password hash cannot be parsed: {e}");
            false
        }
    }
}

pub async fn create_user(pool: &SqlitePool, username: &str, password: &str, first_name: &str, last_name: &str, email: &str) -> anyhow::Result<UserId> {
    let hash = hash_password(password)?;
    let id: (UserId, ) = sqlx::query_as("INSERT INTO users (username, password_hash, first_name, last_name, email) VALUES (?, ?, ?, ?, ?) RETURNING id")
        .bind(username)
        .bind(hash)
        .bind(first_name)
        .bind(last_name)
        .bind(email)
        .fetch_one(pool)
        .await?;
    info!("User created, id: {}, username: {username}", id.0);
    Ok(id.0)
}

pub async fn ensure_bootstrap_admin(pool: &SqlitePool, admin: &BootstrapAdmin) -> anyhow::Result<()> {
    let (count, ): (i64, ) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await?;
    if count == 0 {
        create_user(pool, &admin.username, &admin.password, "", "", "").await?;
        info!("Bootstrap admin '{}' created", admin.username);
    }
    Ok(())
}

async fn authenticate(pool: &SqlitePool, username: &str, password: &str) -> Result<Option<UserInfo>, sqlx::Error> {
    let user = sqlx::query_as::<_, UserRecord>("SELECT id, username, password_hash, first_name, last_name, is_active FROM users WHERE username=?")
        .bind(username)
        .fetch_optional(pool)
        .await?;
    Ok(user
        .filter(|u| u.is_active && verify_password(password, &u.password_hash))
        .map(|u| u.user_info()))
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for UserInfo {
    type Error = ();
    async fn from_request(request: &'r Request<'_>) -> request::Outcome<UserInfo, ()> {
        let Some(cookie) = request.cookies().get_private(SESSION_COOKIE) else {
            return request::Outcome::Forward(Status::Unauthorized);
        };
        let Some(state) = request.rocket().state::<SharedAppState>() else {
            return request::Outcome::Error((Status::InternalServerError, ()));
        };
        let session_id = SessionId(cookie.value().to_string());
        let now = datetime::now();
        let user = state.read().ok()
            .and_then(|s| s.sessions.get(&session_id)
                .filter(|s| !s.is_expired(now))
                .map(|s| s.user_info.clone()));
        match user {
            Some(user) => request::Outcome::Success(user),
            None => request::Outcome::Forward(Status::Unauthorized),
        }
    }
}

#[derive(Debug, FromForm)]
struct LoginFormValues<'v> {
    username: &'v str,
    password: &'v str,
}

fn render_login(flash: Option<FlashView>, username: &str) -> Template {
    Template::render("login", context! {
        flash,
        username,
    })
}

#[get("/login")]
fn get_login_logged_in(_user: UserInfo) -> Redirect {
    Redirect::to("/gestion/")
}
#[get("/login", rank = 2)]
fn get_login(flash: Option<FlashMessage<'_>>) -> Template {
    render_login(FlashView::from_flash(flash), "")
}

#[post("/login", data = "<form>")]
async fn post_login(form: Form<LoginFormValues<'_>>, cookies: &CookieJar<'_>, state: &State<SharedAppState>, db: &State<DbPool>) -> Result<Page, Custom<String>> {
    let user = authenticate(&db.0, form.username, form.password).await.map_err(status_sqlx_error)?;
    let Some(user_info) = user else {
        info!("Failed login attempt for user: {}", form.username);
        let flash = FlashView { kind: "error".to_string(), message: "Usuario o contraseña incorrectos.".to_string() };
        return Ok(render_login(Some(flash), form.username).into());
    };
    let session_id = generate_random_string(32);
    info!("User log in, username: {}", user_info.username);
    let welcome = format!("¡Bienvenido {}!", user_info.username);
    let now = datetime::now();
    let mut state = state.write()
        .map_err(|e| Custom(Status::InternalServerError, e.to_string()))?;
    let expired = prune_sessions(&mut state.sessions, now);
    if expired > 0 {
        info!("Dropped {expired} expired login sessions");
    }
    state.sessions.insert(SessionId(session_id.clone()), LoginSession { user_info, created: now });
    drop(state);
    cookies.add_private(
        Cookie::build((SESSION_COOKIE, session_id))
            .same_site(SameSite::Lax)
            .http_only(true)
            .build()
    );
    Ok(Flash::success(Redirect::to("/gestion/"), welcome).into())
}

#[get("/login/logout")]
fn get_logout(cookies: &CookieJar<'_>, state: &State<SharedAppState>) -> Flash<Redirect> {
    if let Some(cookie) = cookies.get_private(SESSION_COOKIE) {
        if let Ok(mut state) = state.write() {
            if let Some(session) = state.sessions.remove(&SessionId(cookie.value().to_string())) {
                info!("User log out, username: {}, logged in since: {}", session.user_info.username, session.created);
            }
            prune_sessions(&mut state.sessions, datetime::now());
        }
        cookies.remove_private(Cookie::from(SESSION_COOKIE));
    }
    Flash::success(Redirect::to("/login/"), "Has cerrado sesión correctamente.")
}

#[catch(401)]
fn unauthorized() -> Redirect {
    Redirect::to("/login/")
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_login_logged_in,
            get_login,
            post_login,
            get_logout,
        ])
        .register("/", catchers![unauthorized])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn password_hash_verifies() {
        let hash = hash_password("s3cret").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("s3cret", &hash));
        assert!(!verify_password("other", &hash));
        assert!(!verify_password("s3cret", "not-a-hash"));
    }

    #[test]
    fn random_string_alternates_consonants_and_vowels() {
        let s = generate_random_string(32);
        assert_eq!(s.len(), 32);
        for (n, c) in s.chars().enumerate() {
            assert_eq!("aeiouy".contains(c), n % 2 == 1, "char {c} at {n}");
        }
    }

    #[test]
    fn expired_sessions_are_pruned() {
        let now = NaiveDateTime::parse_from_str("2025-03-10 20:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let session = |hours_ago: i64| LoginSession {
            user_info: UserInfo { id: 1, username: "admin".to_string(), full_name: String::new() },
            created: now - TimeDelta::hours(hours_ago),
        };
        let mut sessions = HashMap::new();
        sessions.insert(SessionId("fresh".to_string()), session(1));
        sessions.insert(SessionId("stale".to_string()), session(SESSION_TTL_HOURS));
        sessions.insert(SessionId("ancient".to_string()), session(24 * 30));

        assert_eq!(prune_sessions(&mut sessions, now), 2);
        assert_eq!(sessions.len(), 1);
        assert!(sessions.contains_key(&SessionId("fresh".to_string())));
        assert_eq!(prune_sessions(&mut sessions, now), 0);
    }
}
