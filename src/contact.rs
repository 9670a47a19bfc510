use std::collections::BTreeMap;
use lettre::Address;
use rocket::form::Form;
use rocket::request::FlashMessage;
use rocket::response::{Flash, Redirect};
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::Serialize;
use crate::config::AppConfig;
use crate::mail::{Mailer, OutgoingMail};
use crate::util::{FlashView, Page};

pub const FORM_ERROR: &str = "Por favor, corrige los errores en el formulario.";
pub const INVALID_EMAIL: &str = "Introduzca una dirección de correo electrónico válida.";
pub const HONEYPOT_ERROR: &str = "Error en el formulario. Por favor, inténtalo de nuevo.";

#[derive(FromForm, Serialize, Default, Debug, Clone)]
pub struct ContactForm {
    #[field(default = String::new())]
    pub nombre: String,
    #[field(default = String::new())]
    pub email: String,
    #[field(default = String::new())]
    pub telefono: String,
    #[field(default = String::new())]
    pub asunto: String,
    #[field(default = String::new())]
    pub contenido: String,
    #[field(default = String::new())]
    pub honeypot: String,
}

impl ContactForm {
    pub fn errors(&self) -> BTreeMap<&'static str, &'static str> {
        let mut errors = BTreeMap::new();
        for (name, value) in [("nombre", &self.nombre), ("email", &self.email), ("asunto", &self.asunto), ("contenido", &self.contenido)] {
            if value.trim().is_empty() {
                errors.insert(name, "Este campo es obligatorio.");
            }
        }
        if !errors.contains_key("email") && self.email.trim().parse::<Address>().is_err() {
            errors.insert("email", INVALID_EMAIL);
        }
        errors
    }

    pub fn mail(&self, cfg: &AppConfig) -> OutgoingMail {
        let nombre = self.nombre.trim();
        let email = self.email.trim();
        let asunto = self.asunto.trim();
        let telefono = self.telefono.trim();
        let telefono = if telefono.is_empty() { "-" } else { telefono };
        OutgoingMail {
            from: cfg.mail_from.clone(),
            reply_to: cfg.contact_reply_to.clone(),
            to: email.to_string(),
            subject: format!("Nuevo mensaje de contacto: {asunto}"),
            body: format!("Has recibido un nuevo mensaje desde el formulario de contacto:\n\n\
                Nombre: {nombre}\nEmail: {email}\nTeléfono: {telefono}\nAsunto: {asunto}\n\n\
                Mensaje:\n{}\n\n---\n\
                Este mensaje fue enviado desde el formulario de contacto de Esquemas Centro de Estudios.\n",
                self.contenido.trim()),
        }
    }
}

fn render_contact(form: &ContactForm, errors: BTreeMap<&'static str, &'static str>, flash: Option<FlashView>) -> Template {
    Template::render("site/contacto", context! {
        form,
        errors,
        flash,
    })
}

#[get("/contacto")]
fn get_contact(flash: Option<FlashMessage<'_>>) -> Template {
    render_contact(&ContactForm::default(), BTreeMap::new(), FlashView::from_flash(flash))
}

#[post("/contacto", data = "<form>")]
async fn post_contact(form: Form<ContactForm>, cfg: &State<AppConfig>, mailer: &State<Mailer>) -> Page {
    let back = || Redirect::to("/contacto/");
    let errors = form.errors();
    if !errors.is_empty() {
        let flash = FlashView { kind: "error".to_string(), message: FORM_ERROR.to_string() };
        return render_contact(&form, errors, Some(flash)).into();
    }
    if !form.honeypot.trim().is_empty() {
        warn!("Contact form rejected, honeypot filled, email: {}", form.email);
        return Flash::error(back(), HONEYPOT_ERROR).into();
    }
    match mailer.send(form.mail(cfg)).await {
        Ok(()) => Flash::success(back(), format!("¡Gracias {}! Tu mensaje ha sido enviado correctamente. Te responderemos pronto.", form.nombre.trim())).into(),
        Err(err) => {
            error!("Contact mail cannot be sent: {err}");
            Flash::error(back(), format!("Error al enviar el email: {err}")).into()
        }
    }
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_contact,
            post_contact,
        ])
}

#[cfg(test)]
mod test {
    use super::*;

    fn valid_form() -> ContactForm {
        ContactForm {
            nombre: "Lucía".to_string(),
            email: "lucia@example.com".to_string(),
            asunto: "Horarios".to_string(),
            contenido: "¿Hay clases de física los viernes?".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn email_must_be_a_deliverable_address() {
        for email in ["ana@example.com", "a.b+c@mail.example.org"] {
            let form = ContactForm { email: email.to_string(), ..valid_form() };
            assert!(form.errors().is_empty(), "{email}");
        }
        for email in ["ana,luis@example.com", "@example.com", "ana example@mail.com", "ana@@example.com", "nope"] {
            let form = ContactForm { email: email.to_string(), ..valid_form() };
            assert_eq!(form.errors().get("email").copied(), Some(INVALID_EMAIL), "{email}");
        }
    }

    #[test]
    fn required_fields_are_reported() {
        assert!(valid_form().errors().is_empty());
        let form = ContactForm { nombre: " ".to_string(), email: "nope".to_string(), ..valid_form() };
        let errors = form.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors.contains_key("nombre"));
        assert!(errors.contains_key("email"));
    }

    #[test]
    fn mail_goes_to_submitter_with_reply_to_admin() {
        let cfg = AppConfig::from_figment(&rocket::figment::Figment::new()).unwrap();
        let mail = valid_form().mail(&cfg);
        assert_eq!(mail.to, "lucia@example.com");
        assert_eq!(mail.reply_to, cfg.contact_reply_to);
        assert_eq!(mail.subject, "Nuevo mensaje de contacto: Horarios");
        assert!(mail.body.contains("Nombre: Lucía"));
        assert!(mail.body.contains("Teléfono: -"));
    }
}
