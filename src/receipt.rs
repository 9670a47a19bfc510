use anyhow::anyhow;
use chrono::NaiveDate;
use printpdf::{BuiltinFont, IndirectFontRef, Mm, PdfDocument, PdfLayerReference};
use crate::datetime;
use crate::money::Money;

pub const CENTER_NAME: &str = "Esquemas Centro de Estudios";

/// Everything printed on a payment receipt.
#[derive(Debug, Clone)]
pub struct ReceiptData {
    pub number: String,
    pub paid_on: NaiveDate,
    pub student_name: String,
    pub teacher_name: Option<String>,
    pub concept: String,
    pub rate_name: Option<String>,
    pub original_amount: Money,
    pub discount: Money,
    pub final_amount: Money,
}

pub fn receipt_path(number: &str) -> String {
    format!("comprobantes/comprobante_{number}.pdf")
}

struct Cursor<'a> {
    layer: &'a PdfLayerReference,
    y: f32,
}
impl Cursor<'_> {
    fn line(&mut self, text: &str, size: f32, font: &IndirectFontRef) {
        self.layer.use_text(text, size, Mm(20.0), Mm(self.y), font);
        self.y -= size * 0.6;
    }
    fn row(&mut self, label: &str, value: &str, regular: &IndirectFontRef, bold: &IndirectFontRef) {
        self.layer.use_text(label, 11.0, Mm(20.0), Mm(self.y), bold);
        self.layer.use_text(value, 11.0, Mm(80.0), Mm(self.y), regular);
        self.y -= 8.0;
    }
}

fn amount(value: Money) -> String {
    format!("{value} EUR")
}

pub fn render_receipt(data: &ReceiptData) -> anyhow::Result<Vec<u8>> {
    let title = format!("Comprobante de pago {}", data.number);
    let (doc, page, layer) = PdfDocument::new(title.as_str(), Mm(210.0), Mm(297.0), "Comprobante");
    let regular = doc.add_builtin_font(BuiltinFont::Helvetica).map_err(|e| anyhow!("{e:?}"))?;
    let bold = doc.add_builtin_font(BuiltinFont::HelveticaBold).map_err(|e| anyhow!("{e:?}"))?;
    let layer = doc.get_page(page).get_layer(layer);

    let mut cursor = Cursor { layer: &layer, y: 270.0 };
    cursor.line(CENTER_NAME, 18.0, &bold);
    cursor.line("Comprobante de pago", 14.0, &regular);
    cursor.y -= 6.0;
    cursor.row("Numero:", &data.number, &regular, &bold);
    cursor.row("Fecha:", &datetime::fdate(data.paid_on), &regular, &bold);
    cursor.row("Alumno:", &data.student_name, &regular, &bold);
    if let Some(teacher) = &data.teacher_name {
        cursor.row("Profesor:", teacher, &regular, &bold);
    }
    if !data.concept.is_empty() {
        cursor.row("Concepto:", &data.concept, &regular, &bold);
    }
    if let Some(rate) = &data.rate_name {
        cursor.row("Tarifa:", rate, &regular, &bold);
    }
    cursor.y -= 4.0;
    cursor.row("Importe original:", &amount(data.original_amount), &regular, &bold);
    cursor.row("Descuento:", &amount(data.discount), &regular, &bold);
    cursor.row("Importe final:", &amount(data.final_amount), &bold, &bold);

    doc.save_to_bytes().map_err(|e| anyhow!("{e:?}"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn receipt_is_a_pdf() {
        let data = ReceiptData {
            number: "PG-2025-0001".to_string(),
            paid_on: NaiveDate::from_ymd_opt(2025, 2, 3).unwrap(),
            student_name: "Lucia Perez".to_string(),
            teacher_name: None,
            concept: "Febrero".to_string(),
            rate_name: Some("Matricula Mensual".to_string()),
            original_amount: Money::from_cents(5000),
            discount: Money::from_cents(500),
            final_amount: Money::from_cents(4500),
        };
        let pdf = render_receipt(&data).unwrap();
        assert!(pdf.starts_with(b"%PDF"));
        assert_eq!(receipt_path(&data.number), "comprobantes/comprobante_PG-2025-0001.pdf");
    }
}
