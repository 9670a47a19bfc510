use std::sync::Mutex;
use anyhow::anyhow;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::info;
use crate::config::AppConfig;

#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingMail {
    pub from: String,
    pub reply_to: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}
impl OutgoingMail {
    fn to_message(&self) -> anyhow::Result<Message> {
        let message = Message::builder()
            .from(self.from.parse()?)
            .reply_to(self.reply_to.parse()?)
            .to(self.to.parse()?)
            .subject(&self.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(self.body.clone())?;
        Ok(message)
    }
}

/// Outbound mail. Without an `smtp` config table messages are kept in memory.
pub enum Mailer {
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    Memory(Mutex<Vec<OutgoingMail>>),
}
impl Mailer {
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let Some(smtp) = &cfg.smtp else {
            info!("No SMTP relay configured, outgoing mail is kept in memory");
            return Ok(Mailer::Memory(Mutex::new(Vec::new())));
        };
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)?
            .port(smtp.port);
        if let (Some(username), Some(password)) = (&smtp.username, &smtp.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        info!("SMTP relay: {}:{}", smtp.host, smtp.port);
        Ok(Mailer::Smtp(builder.build()))
    }

    pub async fn send(&self, mail: OutgoingMail) -> anyhow::Result<()> {
        let message = mail.to_message()?;
        match self {
            Mailer::Smtp(transport) => {
                transport.send(message).await?;
            }
            Mailer::Memory(outbox) => {
                outbox.lock().map_err(|e| anyhow!("{e}"))?.push(mail.clone());
            }
        }
        info!("Mail sent to: {}, subject: {}", mail.to, mail.subject);
        Ok(())
    }

    pub fn outbox(&self) -> Vec<OutgoingMail> {
        match self {
            Mailer::Smtp(_) => Vec::new(),
            Mailer::Memory(outbox) => outbox.lock().map(|o| o.clone()).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mail(to: &str) -> OutgoingMail {
        OutgoingMail {
            from: "Esquemas <no-reply@esquemas.es>".to_string(),
            reply_to: "secretaria@esquemas.es".to_string(),
            to: to.to_string(),
            subject: "Nuevo mensaje de contacto: Horarios".to_string(),
            body: "Hola".to_string(),
        }
    }

    #[rocket::async_test]
    async fn memory_outbox_collects_messages() {
        let mailer = Mailer::Memory(Mutex::new(Vec::new()));
        mailer.send(mail("ana@example.com")).await.unwrap();
        let outbox = mailer.outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].to, "ana@example.com");
    }

    #[rocket::async_test]
    async fn invalid_recipient_is_an_error() {
        let mailer = Mailer::Memory(Mutex::new(Vec::new()));
        assert!(mailer.send(mail("not an address")).await.is_err());
        assert!(mailer.outbox().is_empty());
    }
}
