use rocket::figment::Figment;
use serde::Deserialize;

#[derive(Deserialize, Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}
fn default_smtp_port() -> u16 {
    587
}

#[derive(Deserialize, Clone, Debug)]
pub struct BootstrapAdmin {
    pub username: String,
    pub password: String,
}

/// Application settings read from the same figment Rocket uses
/// (`Rocket.toml` plus `ROCKET_*` environment variables).
#[derive(Deserialize, Clone, Debug)]
pub struct AppConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_contact_reply_to")]
    pub contact_reply_to: String,
    #[serde(default = "default_mail_from")]
    pub mail_from: String,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub bootstrap_admin: Option<BootstrapAdmin>,
}
fn default_database_url() -> String {
    "sqlite://esquemas.db".to_string()
}
fn default_contact_reply_to() -> String {
    "nicoingenieroinf@gmail.com".to_string()
}
fn default_mail_from() -> String {
    "Esquemas Centro de Estudios <no-reply@esquemas.es>".to_string()
}

impl AppConfig {
    pub fn from_figment(figment: &Figment) -> anyhow::Result<Self> {
        let cfg = figment.extract::<AppConfig>()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod test {
    use rocket::figment::Figment;
    use rocket::figment::providers::Serialized;
    use super::AppConfig;

    #[test]
    fn defaults_apply_when_keys_missing() {
        let cfg = AppConfig::from_figment(&Figment::new()).unwrap();
        assert_eq!(cfg.database_url, "sqlite://esquemas.db");
        assert!(cfg.smtp.is_none());
        assert!(cfg.bootstrap_admin.is_none());
    }

    #[test]
    fn smtp_table_is_read() {
        let figment = Figment::new()
            .merge(Serialized::default("smtp", serde_json::json!({"host": "mail.example.org"})))
            .merge(Serialized::default("database_url", "sqlite::memory:"));
        let cfg = AppConfig::from_figment(&figment).unwrap();
        let smtp = cfg.smtp.unwrap();
        assert_eq!(smtp.host, "mail.example.org");
        assert_eq!(smtp.port, 587);
        assert_eq!(cfg.database_url, "sqlite::memory:");
    }
}
