use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rocket::http::{ContentType, Header};
use rocket::response::status::Custom;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use rust_xlsxwriter::{Color, Format, FormatAlign, Workbook, XlsxError};
use sqlx::{FromRow, SqlitePool};
use crate::auth::UserInfo;
use crate::dashboard::{flag_filter, id_filter, report_counts};
use crate::datetime;
use crate::db::DbPool;
use crate::expenses::ExpenseId;
use crate::money::Money;
use crate::payments::{payment_select, PaymentRecord};
use crate::rates::rate_label;
use crate::schedules::schedule_label;
use crate::students::course_label;
use crate::teachers::TEACHER_NAME_SQL;
use crate::util::{non_blank, percentage, status_any_error, status_sqlx_error};

const MAX_COLUMN_WIDTH: usize = 50;

/// Spreadsheet attachment.
#[derive(Responder)]
pub struct XlsxFile {
    data: Vec<u8>,
    content_type: ContentType,
    disposition: Header<'static>,
}
impl XlsxFile {
    fn new(name: &str, created: NaiveDateTime, data: Vec<u8>) -> Self {
        Self {
            data,
            content_type: ContentType::new("application", "vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
            disposition: Header::new("Content-Disposition",
                                     format!("attachment; filename=\"{}\"", export_file_name(name, created))),
        }
    }
}

pub fn export_file_name(name: &str, created: NaiveDateTime) -> String {
    format!("{name}_{}.xlsx", created.format("%Y%m%d_%H%M%S"))
}

#[derive(Debug, Clone, PartialEq)]
pub enum SheetValue {
    Text(String),
    Number(f64),
    Empty,
}
impl SheetValue {
    fn display_len(&self) -> usize {
        match self {
            SheetValue::Text(s) => s.chars().count(),
            SheetValue::Number(n) => n.to_string().len(),
            SheetValue::Empty => 0,
        }
    }
}
impl From<String> for SheetValue {
    fn from(value: String) -> Self {
        SheetValue::Text(value)
    }
}
impl From<&str> for SheetValue {
    fn from(value: &str) -> Self {
        SheetValue::Text(value.to_string())
    }
}
impl From<i64> for SheetValue {
    fn from(value: i64) -> Self {
        SheetValue::Number(value as f64)
    }
}
impl From<Money> for SheetValue {
    fn from(value: Money) -> Self {
        SheetValue::Number(value.to_f64())
    }
}
impl From<Option<NaiveDate>> for SheetValue {
    fn from(value: Option<NaiveDate>) -> Self {
        value.map(|d| SheetValue::Text(datetime::fdate(d))).unwrap_or(SheetValue::Empty)
    }
}
impl From<NaiveDate> for SheetValue {
    fn from(value: NaiveDate) -> Self {
        SheetValue::Text(datetime::fdate(value))
    }
}
impl From<NaiveTime> for SheetValue {
    fn from(value: NaiveTime) -> Self {
        SheetValue::Text(datetime::ftime(value))
    }
}
impl From<Option<String>> for SheetValue {
    fn from(value: Option<String>) -> Self {
        value.map(SheetValue::Text).unwrap_or(SheetValue::Empty)
    }
}

fn yes_no(value: bool) -> SheetValue {
    if value { "Sí" } else { "No" }.into()
}

pub struct Sheet {
    pub name: &'static str,
    pub header_color: u32,
    pub headers: &'static [&'static str],
    pub rows: Vec<Vec<SheetValue>>,
}
impl Sheet {
    /// Longest cell of each column plus two, capped at 50.
    pub fn column_widths(&self) -> Vec<usize> {
        self.headers.iter().enumerate().map(|(col, header)| {
            let longest = self.rows.iter()
                .filter_map(|row| row.get(col))
                .map(SheetValue::display_len)
                .fold(header.chars().count(), usize::max);
            (longest + 2).min(MAX_COLUMN_WIDTH)
        }).collect()
    }
}

pub fn workbook_bytes(sheets: &[Sheet]) -> Result<Vec<u8>, XlsxError> {
    let mut workbook = Workbook::new();
    for sheet in sheets {
        let header_format = Format::new()
            .set_bold()
            .set_font_color(Color::White)
            .set_background_color(Color::RGB(sheet.header_color))
            .set_align(FormatAlign::Center);
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(sheet.name)?;
        for (col, header) in sheet.headers.iter().enumerate() {
            worksheet.write_string_with_format(0, col as u16, *header, &header_format)?;
        }
        for (n, row) in sheet.rows.iter().enumerate() {
            let row_no = n as u32 + 1;
            for (col, value) in row.iter().enumerate() {
                match value {
                    SheetValue::Text(s) => { worksheet.write_string(row_no, col as u16, s)?; }
                    SheetValue::Number(v) => { worksheet.write_number(row_no, col as u16, *v)?; }
                    SheetValue::Empty => {}
                }
            }
        }
        for (col, width) in sheet.column_widths().into_iter().enumerate() {
            worksheet.set_column_width(col as u16, width as f64)?;
        }
    }
    workbook.save_to_buffer()
}

fn export(name: &str, sheets: Vec<Sheet>) -> Result<XlsxFile, Custom<String>> {
    let data = workbook_bytes(&sheets).map_err(|e| status_any_error(e.into()))?;
    info!("Exported {name}: {} rows", sheets.iter().map(|s| s.rows.len()).sum::<usize>());
    Ok(XlsxFile::new(name, datetime::now(), data))
}

#[derive(FromForm, Default, Debug)]
pub struct StudentExportFilter {
    pub estado: Option<String>,
    pub curso: Option<String>,
    pub compartido: Option<String>,
}

#[derive(FromRow, Debug)]
struct StudentExportRow {
    id: i64,
    first_name: String,
    last_name: String,
    dni: Option<String>,
    course: String,
    phone: String,
    birth_date: Option<NaiveDate>,
    address: String,
    shared: bool,
    active: bool,
    enrolled_on: NaiveDate,
    left_on: Option<NaiveDate>,
    parent_name: Option<String>,
    rate_name: Option<String>,
    rate_price: Option<i64>,
}

const STUDENT_HEADERS: [&str; 14] = ["ID", "Nombre", "Apellido", "DNI", "Curso", "Teléfono", "Fecha Nacimiento",
    "Dirección", "Compartido", "Activo", "Fecha Alta", "Fecha Baja", "Padre/Madre", "Tarifa Predeterminada"];

async fn student_sheet(pool: &SqlitePool, filter: &StudentExportFilter) -> Result<Sheet, sqlx::Error> {
    let rows = sqlx::query_as::<_, StudentExportRow>("SELECT s.id, s.first_name, s.last_name, s.dni, s.course, s.phone,
            s.birth_date, s.address, s.shared, s.active, s.enrolled_on, s.left_on,
            pa.first_name || ' ' || pa.last_name AS parent_name, r.name AS rate_name, r.price AS rate_price
            FROM students AS s
            LEFT JOIN parents AS pa ON pa.id=s.parent_id
            LEFT JOIN rates AS r ON r.id=s.default_rate_id
            WHERE (?1 IS NULL OR s.active=?1)
                AND (?2 IS NULL OR s.course=?2)
                AND (?3 IS NULL OR s.shared=?3)
            ORDER BY s.last_name, s.first_name")
        .bind(flag_filter(non_blank(&filter.estado), "activo"))
        .bind(non_blank(&filter.curso))
        .bind(flag_filter(non_blank(&filter.compartido), "compartido"))
        .fetch_all(pool)
        .await?;
    Ok(Sheet {
        name: "Alumnos",
        header_color: 0x366092,
        headers: &STUDENT_HEADERS,
        rows: rows.into_iter().map(|s| vec![
            s.id.into(),
            s.first_name.into(),
            s.last_name.into(),
            s.dni.into(),
            course_label(&s.course).into(),
            s.phone.into(),
            s.birth_date.into(),
            s.address.into(),
            yes_no(s.shared),
            yes_no(s.active),
            s.enrolled_on.into(),
            s.left_on.into(),
            s.parent_name.into(),
            s.rate_name.zip(s.rate_price).map(|(name, cents)| rate_label(&name, Money::from_cents(cents))).into(),
        ]).collect(),
    })
}

#[get("/reportes/exportar-alumnos?<filter..>")]
async fn export_students(filter: StudentExportFilter, _user: UserInfo, db: &State<DbPool>) -> Result<XlsxFile, Custom<String>> {
    let sheet = student_sheet(&db.0, &filter).await.map_err(status_sqlx_error)?;
    export("alumnos", vec![sheet])
}

#[derive(FromForm, Default, Debug)]
pub struct PaymentExportFilter {
    pub fecha_inicio: Option<String>,
    pub fecha_fin: Option<String>,
    pub profesor: Option<String>,
}

const PAYMENT_HEADERS: [&str; 10] = ["ID", "Alumno", "Profesor", "Fecha", "Concepto", "Importe Original",
    "Descuento", "Importe Final", "Tarifa", "Número"];

async fn payment_sheet(pool: &SqlitePool, filter: &PaymentExportFilter) -> Result<Sheet, sqlx::Error> {
    let rows = sqlx::query_as::<_, PaymentRecord>(&format!("{} WHERE (?1 IS NULL OR p.paid_on>=?1)
                AND (?2 IS NULL OR p.paid_on<=?2)
                AND (?3 IS NULL OR p.teacher_id=?3)
            ORDER BY p.paid_on DESC, p.id DESC", payment_select()))
        .bind(datetime::parse_date(non_blank(&filter.fecha_inicio)))
        .bind(datetime::parse_date(non_blank(&filter.fecha_fin)))
        .bind(id_filter(non_blank(&filter.profesor)))
        .fetch_all(pool)
        .await?;
    Ok(Sheet {
        name: "Pagos",
        header_color: 0x70AD47,
        headers: &PAYMENT_HEADERS,
        rows: rows.into_iter().map(|p| { let rate_label = p.rate_label(); vec![
            p.id.into(),
            p.student_name.into(),
            p.teacher_name.into(),
            p.paid_on.into(),
            p.concept.into(),
            p.original_amount.into(),
            p.discount.into(),
            p.final_amount.into(),
            rate_label.into(),
            p.number.into(),
        ] }).collect(),
    })
}

#[get("/reportes/exportar-pagos?<filter..>")]
async fn export_payments(filter: PaymentExportFilter, _user: UserInfo, db: &State<DbPool>) -> Result<XlsxFile, Custom<String>> {
    let sheet = payment_sheet(&db.0, &filter).await.map_err(status_sqlx_error)?;
    export("pagos", vec![sheet])
}

#[derive(FromForm, Default, Debug)]
pub struct AttendanceExportFilter {
    pub fecha_inicio: Option<String>,
    pub fecha_fin: Option<String>,
    pub horario: Option<String>,
    pub asistio: Option<String>,
}

#[derive(FromRow, Debug)]
struct AttendanceExportRow {
    id: i64,
    student_name: String,
    subject: String,
    weekday: i64,
    start_time: NaiveTime,
    end_time: NaiveTime,
    teacher_name: String,
    starts_at: NaiveDateTime,
    ends_at: NaiveDateTime,
    present: bool,
}
impl AttendanceExportRow {
    fn into_row(self) -> Vec<SheetValue> {
        let schedule = schedule_label(&self.subject, self.weekday, self.start_time, self.end_time, &self.teacher_name);
        vec![
            self.id.into(),
            self.student_name.into(),
            schedule.into(),
            self.starts_at.date().into(),
            self.starts_at.time().into(),
            self.ends_at.time().into(),
            yes_no(self.present),
        ]
    }
}

const ATTENDANCE_HEADERS: [&str; 7] = ["ID", "Alumno", "Horario", "Fecha Sesión", "Hora Inicio", "Hora Fin", "Presente"];

async fn attendance_sheet(pool: &SqlitePool, filter: &AttendanceExportFilter) -> Result<Sheet, sqlx::Error> {
    let rows = sqlx::query_as::<_, AttendanceExportRow>(&format!("SELECT a.id, a.present,
            s.first_name || ' ' || s.last_name AS student_name,
            h.subject, h.weekday, h.start_time, h.end_time, {TEACHER_NAME_SQL} AS teacher_name,
            c.starts_at, c.ends_at
            FROM attendance AS a
            JOIN students AS s ON s.id=a.student_id
            JOIN class_sessions AS c ON c.id=a.session_id
            JOIN schedules AS h ON h.id=c.schedule_id
            JOIN teachers AS t ON t.id=h.teacher_id
            JOIN users AS u ON u.id=t.user_id
            WHERE (?1 IS NULL OR date(c.starts_at)>=?1)
                AND (?2 IS NULL OR date(c.starts_at)<=?2)
                AND (?3 IS NULL OR c.schedule_id=?3)
                AND (?4 IS NULL OR a.present=?4)
            ORDER BY c.starts_at DESC, s.last_name, s.first_name"))
        .bind(datetime::parse_date(non_blank(&filter.fecha_inicio)).map(|d| d.to_string()))
        .bind(datetime::parse_date(non_blank(&filter.fecha_fin)).map(|d| d.to_string()))
        .bind(id_filter(non_blank(&filter.horario)))
        .bind(flag_filter(non_blank(&filter.asistio), "asistio"))
        .fetch_all(pool)
        .await?;
    Ok(Sheet {
        name: "Asistencias",
        header_color: 0xC5504B,
        headers: &ATTENDANCE_HEADERS,
        rows: rows.into_iter().map(AttendanceExportRow::into_row).collect(),
    })
}

#[derive(FromRow, Debug)]
struct ScheduleExportRow {
    id: i64,
    subject: String,
    teacher_name: String,
    weekday: i64,
    start_time: NaiveTime,
    end_time: NaiveTime,
    capacity: i64,
    active: bool,
    enrolled: i64,
}

const SCHEDULE_HEADERS: [&str; 10] = ["ID", "Asignatura", "Profesor", "Día", "Hora Inicio", "Hora Fin", "Capacidad",
    "Alumnos Matriculados", "Ocupación %", "Estado"];

async fn schedule_sheet(pool: &SqlitePool) -> Result<Sheet, sqlx::Error> {
    let rows = sqlx::query_as::<_, ScheduleExportRow>(&format!("SELECT h.id, h.subject, {TEACHER_NAME_SQL} AS teacher_name,
            h.weekday, h.start_time, h.end_time, h.capacity, h.active,
            (SELECT COUNT(*) FROM enrollments AS e WHERE e.schedule_id=h.id AND e.status='activa') AS enrolled
            FROM schedules AS h
            JOIN teachers AS t ON t.id=h.teacher_id
            JOIN users AS u ON u.id=t.user_id
            ORDER BY h.weekday, h.start_time"))
        .fetch_all(pool)
        .await?;
    Ok(Sheet {
        name: "Horarios",
        header_color: 0x366092,
        headers: &SCHEDULE_HEADERS,
        rows: rows.into_iter().map(|h| vec![
            h.id.into(),
            h.subject.into(),
            h.teacher_name.into(),
            datetime::weekday_name(h.weekday).into(),
            h.start_time.into(),
            h.end_time.into(),
            h.capacity.into(),
            h.enrolled.into(),
            format!("{:.1}%", percentage(h.enrolled, h.capacity)).into(),
            if h.active { "Activo" } else { "Inactivo" }.into(),
        ]).collect(),
    })
}

#[get("/reportes/exportar-asistencias?<filter..>")]
async fn export_attendance(filter: AttendanceExportFilter, _user: UserInfo, db: &State<DbPool>) -> Result<XlsxFile, Custom<String>> {
    let attendance = attendance_sheet(&db.0, &filter).await.map_err(status_sqlx_error)?;
    let schedules = schedule_sheet(&db.0).await.map_err(status_sqlx_error)?;
    export("asistencias", vec![attendance, schedules])
}

#[derive(FromForm, Default, Debug)]
pub struct ExpenseExportFilter {
    pub fecha_inicio: Option<String>,
    pub fecha_fin: Option<String>,
    pub categoria: Option<String>,
}

#[derive(FromRow, Debug)]
struct ExpenseExportRow {
    id: ExpenseId,
    concept: String,
    amount: i64,
    category: String,
    recorded_on: NaiveDate,
    notes: String,
    has_invoice: bool,
}

const EXPENSE_HEADERS: [&str; 7] = ["ID", "Concepto", "Importe", "Categoría", "Fecha", "Observaciones", "Tiene Factura"];

async fn expense_sheet(pool: &SqlitePool, filter: &ExpenseExportFilter) -> Result<Sheet, sqlx::Error> {
    let rows = sqlx::query_as::<_, ExpenseExportRow>("SELECT id, concept, amount, category, recorded_on, notes,
            invoice_file_id IS NOT NULL AS has_invoice
            FROM expenses
            WHERE (?1 IS NULL OR recorded_on>=?1)
                AND (?2 IS NULL OR recorded_on<=?2)
                AND (?3 IS NULL OR category=?3)
            ORDER BY recorded_on DESC, id DESC")
        .bind(datetime::parse_date(non_blank(&filter.fecha_inicio)))
        .bind(datetime::parse_date(non_blank(&filter.fecha_fin)))
        .bind(non_blank(&filter.categoria))
        .fetch_all(pool)
        .await?;
    Ok(Sheet {
        name: "Gastos",
        header_color: 0xFF6600,
        headers: &EXPENSE_HEADERS,
        rows: rows.into_iter().map(|g| vec![
            g.id.into(),
            g.concept.into(),
            Money::from_cents(g.amount).into(),
            g.category.into(),
            g.recorded_on.into(),
            g.notes.into(),
            yes_no(g.has_invoice),
        ]).collect(),
    })
}

#[get("/reportes/exportar-gastos?<filter..>")]
async fn export_expenses(filter: ExpenseExportFilter, _user: UserInfo, db: &State<DbPool>) -> Result<XlsxFile, Custom<String>> {
    let sheet = expense_sheet(&db.0, &filter).await.map_err(status_sqlx_error)?;
    export("gastos", vec![sheet])
}

#[get("/reportes")]
async fn get_report_index(user: UserInfo, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let counts = report_counts(&db.0).await.map_err(status_sqlx_error)?;
    Ok(Template::render("gestion/reportes", context! {
        titulo: "Reportes",
        user,
        counts,
    }))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_report_index,
            export_students,
            export_payments,
            export_attendance,
            export_expenses,
        ])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn column_widths_are_capped() {
        let sheet = Sheet {
            name: "Gastos",
            header_color: 0xFF6600,
            headers: &["ID", "Concepto"],
            rows: vec![
                vec![SheetValue::Number(7.0), "Luz".into()],
                vec![SheetValue::Number(12345.0), "x".repeat(80).into()],
            ],
        };
        assert_eq!(sheet.column_widths(), vec![7, 50]);
    }

    #[test]
    fn export_file_name_has_timestamp() {
        let created = NaiveDate::from_ymd_opt(2025, 1, 31).unwrap().and_hms_opt(9, 5, 7).unwrap();
        assert_eq!(export_file_name("pagos", created), "pagos_20250131_090507.xlsx");
    }

    #[test]
    fn workbook_is_a_zip() {
        let sheet = Sheet {
            name: "Alumnos",
            header_color: 0x366092,
            headers: &STUDENT_HEADERS,
            rows: vec![vec![SheetValue::Number(1.0), "Ana".into(), SheetValue::Empty, yes_no(true)]],
        };
        let data = workbook_bytes(&[sheet]).unwrap();
        assert_eq!(&data[..2], b"PK");
    }

    #[test]
    fn attendance_row_names_the_full_schedule() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 3).unwrap();
        let row = AttendanceExportRow {
            id: 4,
            student_name: "Ana Lopez".to_string(),
            subject: "Matematicas".to_string(),
            weekday: 0,
            start_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            teacher_name: "Marta Garcia".to_string(),
            starts_at: day.and_hms_opt(17, 0, 0).unwrap(),
            ends_at: day.and_hms_opt(18, 0, 0).unwrap(),
            present: true,
        }.into_row();
        assert_eq!(row.len(), ATTENDANCE_HEADERS.len());
        assert_eq!(row[2], SheetValue::Text("Matematicas - Lunes 17:00-18:00 (Marta Garcia)".to_string()));
        assert_eq!(row[6], SheetValue::Text("Sí".to_string()));
    }

    #[test]
    fn rate_columns_carry_the_price() {
        assert_eq!(rate_label("Matrícula Mensual", Money::from_cents(5000)), "Matrícula Mensual - 50.00€");
    }
}
