use chrono::Datelike;
use rocket::figment::Figment;
use rocket::http::{ContentType, Header, Status};
use rocket::local::blocking::{Client, LocalResponse};
use serde_json::{json, Value};
use crate::datetime;
use crate::files::INVOICE_EXTENSION_ERROR;
use crate::mail::Mailer;

const XLSX: (&str, &str) = ("application", "vnd.openxmlformats-officedocument.spreadsheetml.sheet");

fn test_figment() -> Figment {
    rocket::Config::figment()
        .merge(("database_url", "sqlite::memory:"))
        .merge(("bootstrap_admin", json!({"username": "admin", "password": "admin"})))
}

fn create_test_server() -> Client {
    Client::tracked(super::build_rocket(test_figment())).unwrap()
}

fn login(client: &Client) {
    let resp = client.post("/login/")
        .header(ContentType::Form)
        .body("username=admin&password=admin")
        .dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert_eq!(resp.headers().get_one("Location"), Some("/gestion/"));
}

fn create_logged_in_server() -> Client {
    let client = create_test_server();
    login(&client);
    client
}

fn encode(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' => (b as char).to_string(),
            _ => format!("%{b:02X}"),
        })
        .collect()
}

fn admin_body(fields: &[(&str, &str)]) -> String {
    fields.iter()
        .map(|(name, value)| format!("f%5B{name}%5D={}", encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn admin_post<'c>(client: &'c Client, url: &str, fields: &[(&str, &str)]) -> LocalResponse<'c> {
    client.post(url.to_string())
        .header(ContentType::Form)
        .body(admin_body(fields))
        .dispatch()
}

fn admin_add(client: &Client, slug: &str, fields: &[(&str, &str)]) {
    let resp = admin_post(client, &format!("/admin/{slug}/add"), fields);
    assert_eq!(resp.status(), Status::SeeOther, "saving {slug} failed: {:?}", resp.into_string());
}

const BOUNDARY: &str = "X-ESQUEMAS-BOUNDARY";

/// Admin form as `multipart/form-data` with one uploaded file.
fn admin_upload<'c>(client: &'c Client, url: &str, fields: &[(&str, &str)], file_name: &str, data: &[u8]) -> LocalResponse<'c> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"f[{name}]\"\r\n\r\n{value}\r\n").as_bytes());
    }
    body.extend_from_slice(format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"archivo\"; filename=\"{file_name}\"\r\n\
        Content-Type: application/octet-stream\r\n\r\n").as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    client.post(url.to_string())
        .header(ContentType::new("multipart", "form-data").with_params(("boundary", BOUNDARY)))
        .body(body)
        .dispatch()
}

fn body_of(client: &Client, url: &str) -> String {
    let resp = client.get(url.to_string()).dispatch();
    assert_eq!(resp.status(), Status::Ok, "GET {url}");
    resp.into_string().unwrap()
}

/// One teacher, one Monday slot and one actively enrolled student, all with id 1.
fn create_academy(client: &Client) {
    admin_add(client, "profesores", &[
        ("username", "mgarcia"),
        ("password", "clave"),
        ("first_name", "Marta"),
        ("last_name", "Garcia"),
        ("active", "on"),
    ]);
    admin_add(client, "alumnos", &[
        ("first_name", "Ana"),
        ("last_name", "Lopez"),
        ("dni", "12345678Z"),
        ("phone", "600111222"),
        ("active", "on"),
    ]);
    admin_add(client, "horarios", &[
        ("teacher_id", "1"),
        ("subject", "Matematicas"),
        ("weekday", "0"),
        ("start_time", "17:00"),
        ("end_time", "18:00"),
        ("room", "A1"),
        ("capacity", "8"),
        ("active", "on"),
    ]);
    admin_add(client, "matriculas", &[
        ("student_id", "1"),
        ("schedule_id", "1"),
        ("status", "activa"),
    ]);
}

#[test]
fn anonymous_user_is_sent_to_login() {
    let client = create_test_server();
    for url in ["/gestion/", "/gestion/alumnos/", "/admin/", "/reportes/exportar-alumnos/"] {
        let resp = client.get(url).dispatch();
        assert_eq!(resp.status(), Status::SeeOther, "{url}");
        assert_eq!(resp.headers().get_one("Location"), Some("/login/"), "{url}");
    }
}

#[test]
fn wrong_password_stays_on_login_page() {
    let client = create_test_server();
    let resp = client.post("/login/")
        .header(ContentType::Form)
        .body("username=admin&password=nope")
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert!(resp.into_string().unwrap().contains("Usuario o contraseña incorrectos."));
    let resp = client.get("/gestion/").dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
}

#[test]
fn logout_ends_session() {
    let client = create_logged_in_server();
    assert!(body_of(&client, "/gestion/").contains("admin"));
    let resp = client.get("/login/logout/").dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    let resp = client.get("/gestion/").dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert_eq!(resp.headers().get_one("Location"), Some("/login/"));
}

#[test]
fn routes_match_with_and_without_trailing_slash() {
    let client = create_logged_in_server();
    for url in ["/gestion", "/gestion/", "/gestion/alumnos", "/gestion/alumnos/", "/admin", "/admin/",
        "/admin/pagos/add", "/admin/pagos/add/", "/blog", "/blog/", "/contacto", "/contacto/"] {
        let resp = client.get(url).dispatch();
        assert_eq!(resp.status(), Status::Ok, "GET {url}");
    }
}

#[test]
fn empty_dashboards_render() {
    let client = create_logged_in_server();
    for url in [
        "/gestion/",
        "/gestion/alumnos/",
        "/gestion/horarios/",
        "/gestion/sesiones/",
        "/gestion/pagos/",
        "/gestion/gastos/",
        "/gestion/reportes/",
        "/reportes/",
        "/admin/",
    ] {
        body_of(&client, url);
    }
}

#[test]
fn public_pages_render_without_login() {
    let client = create_test_server();
    for url in ["/", "/servicios/", "/instalaciones/", "/tienda/", "/blog/", "/contacto/"] {
        body_of(&client, url);
    }
    let resp = client.get("/blog/categoria/99/").dispatch();
    assert_eq!(resp.status(), Status::NotFound);
}

#[test]
fn admin_crud_round() {
    let client = create_logged_in_server();
    admin_add(&client, "tarifas", &[("name", "Mensual"), ("price", "60.00"), ("active", "on")]);
    let list = body_of(&client, "/admin/tarifas/");
    assert!(list.contains("Mensual"));
    assert!(list.contains("60.00"));

    // validation errors re-render the form
    let resp = admin_post(&client, "/admin/tarifas/add", &[("name", ""), ("price", "-3")]);
    assert_eq!(resp.status(), Status::Ok);
    assert!(resp.into_string().unwrap().contains("Por favor, corrige los errores en el formulario."));

    admin_post(&client, "/admin/tarifas/1/change", &[("name", "Trimestral"), ("price", "150"), ("active", "on")]);
    let list = body_of(&client, "/admin/tarifas/?q=trim");
    assert!(list.contains("Trimestral"));
    assert!(!list.contains("Mensual"));

    let resp = client.post("/admin/tarifas/1/delete").dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert!(!body_of(&client, "/admin/tarifas/").contains("Trimestral"));

    let resp = client.get("/admin/no-such-model/").dispatch();
    assert_eq!(resp.status(), Status::NotFound);
}

#[test]
fn admin_redirect_is_honored_for_local_targets_only() {
    let client = create_logged_in_server();
    let body = format!("{}&_redirect=%2Fgestion%2Falumnos%2F", admin_body(&[("first_name", "Luis"), ("last_name", "Ruiz"), ("active", "on")]));
    let resp = client.post("/admin/alumnos/add").header(ContentType::Form).body(body).dispatch();
    assert_eq!(resp.headers().get_one("Location"), Some("/gestion/alumnos/"));

    let body = format!("{}&_redirect=https%3A%2F%2Fevil.example.com%2F", admin_body(&[("first_name", "Eva"), ("last_name", "Gil"), ("active", "on")]));
    let resp = client.post("/admin/alumnos/add").header(ContentType::Form).body(body).dispatch();
    assert_eq!(resp.headers().get_one("Location"), Some("/admin/alumnos/"));
}

#[test]
fn student_and_schedule_dashboards_show_enrollment() {
    let client = create_logged_in_server();
    create_academy(&client);

    let students = body_of(&client, "/gestion/alumnos/");
    assert!(students.contains("Lopez"));
    let filtered = body_of(&client, "/gestion/alumnos/?q=nobody");
    assert!(!filtered.contains("Lopez"));

    let detail = body_of(&client, "/gestion/alumnos/1/");
    assert!(detail.contains("DNI 12345678Z"));

    let schedules = body_of(&client, "/gestion/horarios/");
    assert!(schedules.contains("Matematicas"));
    assert!(schedules.contains("1 / 8"));
    let detail = body_of(&client, "/gestion/horarios/1/");
    assert!(detail.contains("Lopez"));

    let resp = client.get("/gestion/horarios/42/").dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
}

#[test]
fn new_session_provisions_attendance_for_enrolled_students() {
    let client = create_logged_in_server();
    create_academy(&client);
    admin_add(&client, "sesiones", &[
        ("schedule_id", "1"),
        ("starts_at", "2025-03-03T17:00"),
        ("ends_at", "2025-03-03T18:00"),
    ]);
    let attendance = body_of(&client, "/gestion/sesiones/1/asistencias/");
    assert!(attendance.contains("Ana Lopez"));
    assert!(attendance.contains("12345678Z"));

    let sessions = body_of(&client, "/gestion/sesiones/?estado=pasada");
    assert!(sessions.contains("Matematicas"));
    let sessions = body_of(&client, "/gestion/sesiones/?estado=futura");
    assert!(!sessions.contains("/gestion/sesiones/1/asistencias/"));

    // session ending before it starts is rejected
    let resp = admin_post(&client, "/admin/sesiones/add", &[
        ("schedule_id", "1"),
        ("starts_at", "2025-03-10T18:00"),
        ("ends_at", "2025-03-10T17:00"),
    ]);
    assert_eq!(resp.status(), Status::Ok);

    let resp = client.get("/gestion/sesiones/77/asistencias/").dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert_eq!(resp.headers().get_one("Location"), Some("/gestion/horarios/"));
}

#[test]
fn students_by_schedule_requires_ajax() {
    let client = create_logged_in_server();
    create_academy(&client);

    let resp = client.get("/gestion/api/alumnos-por-horario/?horario_id=1").dispatch();
    assert_eq!(resp.status(), Status::MethodNotAllowed);

    let resp = client.get("/gestion/api/alumnos-por-horario/?horario_id=1")
        .header(Header::new("X-Requested-With", "XMLHttpRequest"))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.content_type(), Some(ContentType::JSON));
    let json = resp.into_json::<Value>().unwrap();
    let alumnos = json["alumnos"].as_array().unwrap();
    assert_eq!(alumnos.len(), 1);
    assert_eq!(alumnos[0]["id"], 1);
    assert_eq!(alumnos[0]["dni"], "12345678Z");

    let resp = client.get("/gestion/api/alumnos-por-horario/?horario_id=9")
        .header(Header::new("X-Requested-With", "XMLHttpRequest"))
        .dispatch();
    assert_eq!(resp.status(), Status::NotFound);
}

#[test]
fn payments_are_numbered_and_get_a_receipt() {
    let client = create_logged_in_server();
    create_academy(&client);
    admin_add(&client, "tarifas", &[("name", "Mensual"), ("price", "60"), ("active", "on")]);
    admin_add(&client, "pagos", &[
        ("student_id", "1"),
        ("teacher_id", "1"),
        ("rate_id", "1"),
        ("discount", "5"),
        ("concept", "Marzo"),
        ("generate_receipt", "on"),
    ]);
    admin_add(&client, "pagos", &[
        ("student_id", "1"),
        ("original_amount", "20"),
        ("concept", "Material"),
    ]);

    let year = datetime::today().year();
    let first = format!("PG-{year}-0001");
    let second = format!("PG-{year}-0002");
    let payments = body_of(&client, "/gestion/pagos/");
    assert!(payments.contains(&first));
    assert!(payments.contains(&second));
    assert!(payments.contains("55.00"));
    assert!(payments.contains("75.00"));

    let resp = client.get(format!("/media/comprobantes/comprobante_{first}.pdf")).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.content_type(), Some(ContentType::PDF));
    assert!(resp.into_bytes().unwrap().starts_with(b"%PDF"));
    let resp = client.get(format!("/media/comprobantes/comprobante_{second}.pdf")).dispatch();
    assert_eq!(resp.status(), Status::NotFound);

    let filtered = body_of(&client, "/gestion/pagos/?imp_min=30");
    assert!(filtered.contains(&first));
    assert!(!filtered.contains(&second));

    let warned = body_of(&client, "/gestion/pagos/?imp_min=30&imp_max=abc");
    assert!(warned.contains(&first));
    assert!(!warned.contains(&second));
    assert!(warned.contains("flash-warning"));
}

#[test]
fn payment_number_falls_back_to_highest_id() {
    let client = create_logged_in_server();
    create_academy(&client);
    let year = datetime::today().year();
    let custom = format!("PG-{year}-EXTRA");
    admin_add(&client, "pagos", &[("student_id", "1"), ("original_amount", "10"), ("concept", "Enero")]);
    admin_add(&client, "pagos", &[("student_id", "1"), ("number", &custom), ("original_amount", "10"), ("concept", "Febrero")]);
    admin_add(&client, "pagos", &[("student_id", "1"), ("original_amount", "10"), ("concept", "Marzo")]);

    let payments = body_of(&client, "/gestion/pagos/");
    assert!(payments.contains(&format!("PG-{year}-0001")));
    assert!(payments.contains(&custom));
    assert!(payments.contains(&format!("PG-{year}-0003")));
    assert!(payments.contains("30.00"));
}

#[test]
fn student_with_payments_cannot_be_deleted() {
    let client = create_logged_in_server();
    create_academy(&client);
    admin_add(&client, "pagos", &[("student_id", "1"), ("original_amount", "25"), ("concept", "Marzo")]);

    let resp = client.post("/admin/alumnos/1/delete").dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert_eq!(resp.headers().get_one("Location"), Some("/admin/alumnos/"));
    let list = body_of(&client, "/admin/alumnos/");
    assert!(list.contains("No se puede eliminar: el registro está en uso por otros datos."));
    assert!(list.contains("Lopez"));
}

#[test]
fn schedule_and_payment_forms_return_to_dashboard() {
    let client = create_logged_in_server();
    create_academy(&client);
    let body = format!("{}&_redirect=%2Fgestion%2Fhorarios%2F", admin_body(&[
        ("teacher_id", "1"),
        ("subject", "Lengua"),
        ("weekday", "2"),
        ("start_time", "18:00"),
        ("end_time", "19:00"),
        ("capacity", "6"),
        ("active", "on"),
    ]));
    let resp = client.post("/admin/horarios/add").header(ContentType::Form).body(body).dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert_eq!(resp.headers().get_one("Location"), Some("/gestion/horarios/"));

    let body = format!("{}&_redirect=%2Fgestion%2Falumnos%2F1%2F", admin_body(&[
        ("student_id", "1"),
        ("original_amount", "40"),
        ("concept", "Abril"),
    ]));
    let resp = client.post("/admin/pagos/add").header(ContentType::Form).body(body).dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert_eq!(resp.headers().get_one("Location"), Some("/gestion/alumnos/1/"));
}

#[test]
fn expense_invoice_is_stored_by_date_and_category() {
    let client = create_logged_in_server();
    let fields = [
        ("concept", "Productos de limpieza"),
        ("amount", "42.10"),
        ("category", "limpieza"),
        ("spent_on", "2025-01-05"),
    ];
    let resp = admin_upload(&client, "/admin/gastos/add", &fields, "factura.PDF", b"%PDF-1.4 factura");
    assert_eq!(resp.status(), Status::SeeOther);

    let resp = client.get("/media/gastos/2025/01/limpieza/gasto_1_20250105.pdf").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.into_bytes().unwrap(), b"%PDF-1.4 factura");

    let resp = admin_upload(&client, "/admin/gastos/add", &fields, "factura.exe", b"MZ");
    assert_eq!(resp.status(), Status::Ok);
    assert!(resp.into_string().unwrap().contains(INVOICE_EXTENSION_ERROR));
    let resp = client.get("/admin/gastos/2/change").dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
}

#[test]
fn seeds_create_sample_rates_and_expenses_once() {
    let client = create_logged_in_server();
    let resp = client.post("/gestion/setup/tarifas").dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert_eq!(resp.headers().get_one("Location"), Some("/admin/tarifas/"));
    let resp = client.post("/gestion/setup/gastos").dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    let first = body_of(&client, "/gestion/gastos/");

    client.post("/gestion/setup/gastos").dispatch();
    let again = body_of(&client, "/admin/gastos/");
    assert!(again.contains("Ya existentes"));
    assert_eq!(body_of(&client, "/gestion/gastos/").matches("/admin/gastos/").count(), first.matches("/admin/gastos/").count());
}

#[test]
fn exports_are_xlsx_attachments() {
    let client = create_logged_in_server();
    create_academy(&client);
    for url in [
        "/reportes/exportar-alumnos/?estado=activo",
        "/reportes/exportar-pagos/",
        "/reportes/exportar-asistencias/?asistio=si",
        "/reportes/exportar-gastos/",
    ] {
        let resp = client.get(url).dispatch();
        assert_eq!(resp.status(), Status::Ok, "{url}");
        assert_eq!(resp.content_type(), Some(ContentType::new(XLSX.0, XLSX.1)), "{url}");
        let disposition = resp.headers().get_one("Content-Disposition").unwrap().to_string();
        assert!(disposition.starts_with("attachment; filename="), "{disposition}");
        assert!(disposition.ends_with(".xlsx\""), "{disposition}");
        assert!(resp.into_bytes().unwrap().starts_with(b"PK"));
    }
}

#[test]
fn contact_form_sends_mail_to_outbox() {
    let client = create_test_server();
    let resp = client.post("/contacto/")
        .header(ContentType::Form)
        .body("nombre=Lucia&email=lucia%40example.com&asunto=Horarios&contenido=Hola&honeypot=")
        .dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    let page = body_of(&client, "/contacto/");
    assert!(page.contains("Gracias Lucia"));

    let outbox = client.rocket().state::<Mailer>().unwrap().outbox();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].to, "lucia@example.com");
    assert_eq!(outbox[0].subject, "Nuevo mensaje de contacto: Horarios");
}

#[test]
fn contact_form_rejects_invalid_and_spam() {
    let client = create_test_server();
    let resp = client.post("/contacto/")
        .header(ContentType::Form)
        .body("nombre=&email=nope&asunto=Hola&contenido=Hola")
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let page = resp.into_string().unwrap();
    assert!(page.contains("Este campo es obligatorio."));
    assert!(page.contains("Introduzca una dirección de correo electrónico válida."));

    // a list of addresses is not one mailbox
    let resp = client.post("/contacto/")
        .header(ContentType::Form)
        .body("nombre=Ana&email=ana%2Cluis%40example.com&asunto=Hola&contenido=Hola&honeypot=")
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let page = resp.into_string().unwrap();
    assert!(page.contains("Introduzca una dirección de correo electrónico válida."));
    assert!(!page.contains("Error al enviar"));

    let resp = client.post("/contacto/")
        .header(ContentType::Form)
        .body("nombre=Bot&email=bot%40example.com&asunto=Oferta&contenido=Compra&honeypot=x")
        .dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert!(client.rocket().state::<Mailer>().unwrap().outbox().is_empty());
}

#[test]
fn blog_posts_are_listed_by_category() {
    let client = create_logged_in_server();
    admin_add(&client, "categorias-blog", &[("name", "Noticias")]);
    admin_add(&client, "categorias-blog", &[("name", "Consejos")]);
    admin_add(&client, "posts", &[("title", "Abrimos matricula"), ("content", "Ya puedes apuntarte"), ("cat_1", "on")]);
    admin_add(&client, "posts", &[("title", "Como estudiar"), ("content", "Cinco ideas"), ("cat_2", "on")]);

    let blog = body_of(&client, "/blog/");
    assert!(blog.contains("Abrimos matricula"));
    assert!(blog.contains("Como estudiar"));
    let news = body_of(&client, "/blog/categoria/1/");
    assert!(news.contains("Abrimos matricula"));
    assert!(!news.contains("Como estudiar"));
}
