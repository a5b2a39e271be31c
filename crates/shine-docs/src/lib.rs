//! Contract documents rendered to PDF.
//!
//! Rendering is pure: the same contract and generation date always produce
//! the same bytes, which lets the document cache deduplicate by hash. Body
//! text is set in Courier so [`wrap_text`] can split by character count.

use chrono::NaiveDate;
use image::{ImageBuffer, Rgb, RgbImage};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use shine_core::contract::{
    ContractType, PaymentFrequency, PricePoint, SignatureImage, PROVIDER,
};
use shine_core::money::{format_money, PriceRange};
use shine_core::Contract;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "shine-docs";

const PAGE_WIDTH: f32 = 595.0;
const PAGE_HEIGHT: f32 = 842.0;
const MARGIN: f32 = 50.0;
const FOOTER_Y: f32 = 30.0;
const LINE_HEIGHT: f32 = 13.0;
const BODY_SIZE: f32 = 9.5;
/// Courier advances 0.6 em per glyph: 495pt / (9.5pt * 0.6).
pub const BODY_CHARS: usize = 86;
const VALUE_X: f32 = 200.0;
/// Label column, one glyph short of the value column.
const LABEL_CHARS: usize = 25;
const VALUE_CHARS: usize = 60;
const SIGNATURE_WIDTH: f32 = 180.0;
const SIGNATURE_HEIGHT: f32 = 60.0;

const HEADING_FONT: &str = "F1";
const BODY_FONT: &str = "F2";

const TERMS: &[&str] = &[
    "Services. The Provider will perform the cleaning services described in this agreement at the property address given, using its own trained staff, equipment and products unless the parties agree otherwise in writing.",
    "Access. The Client will provide safe access to the property at the agreed times. Where access is not available on arrival, the visit may be charged in full.",
    "Payment. The Client will pay each period's amount by the due date shown on the payment request. The deposit is payable on signing and is credited against the first period.",
    "Changes. Any change to the scope, frequency or price of the services requires a written variation signed by both parties.",
    "Cancellation. Either party may cancel this agreement with 14 days' written notice. Amounts for services already performed remain payable.",
    "Satisfaction. The Client should report any concern within 24 hours of a visit; the Provider will return to rectify the affected areas at no charge.",
    "Liability. The Provider holds public liability insurance. Its liability for loss or damage is limited to the cost of repair or replacement of the affected item.",
    "Privacy. Personal information is used only to deliver the services and to administer this agreement.",
];

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("signature image could not be decoded: {0}")]
    Signature(String),
    #[error("pdf assembly failed: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("writing pdf: {0}")]
    Io(#[from] std::io::Error),
}

/// Split text into lines of at most `max_chars` characters, breaking on
/// whitespace and hard-splitting words longer than a line. Explicit newlines
/// start a new line.
pub fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut lines = Vec::new();
    for paragraph in text.split('\n') {
        let mut line = String::new();
        let mut line_len = 0;
        for word in paragraph.split_whitespace() {
            let mut word: Vec<char> = word.chars().collect();
            while word.len() > max_chars {
                if line_len > 0 {
                    lines.push(std::mem::take(&mut line));
                    line_len = 0;
                }
                let rest = word.split_off(max_chars);
                lines.push(word.iter().collect());
                word = rest;
            }
            let needed = if line_len == 0 { word.len() } else { line_len + 1 + word.len() };
            if needed > max_chars {
                lines.push(std::mem::take(&mut line));
                line_len = 0;
            }
            if line_len > 0 {
                line.push(' ');
                line_len += 1;
            }
            line.extend(word.iter());
            line_len += word.len();
        }
        lines.push(line);
    }
    lines
}

/// Render a contract. `generated_on` is printed in the header.
pub fn render_contract(contract: &Contract, generated_on: NaiveDate) -> Result<Vec<u8>, DocumentError> {
    let mut composer = Composer::new();
    let mut images = Vec::new();

    header(&mut composer, contract, generated_on);
    parties(&mut composer, contract);
    service(&mut composer, contract);
    financials(&mut composer, contract);
    term(&mut composer, contract);
    terms_and_conditions(&mut composer);
    signatures(&mut composer, contract, &mut images)?;

    let pages = composer.finish(contract.contract_number.as_str());
    let bytes = assemble(pages, images)?;
    debug!(contract = %contract.contract_number, bytes = bytes.len(), "rendered contract pdf");
    Ok(bytes)
}

fn header(c: &mut Composer, contract: &Contract, generated_on: NaiveDate) {
    c.title("SERVICE AGREEMENT");
    c.field("Contract number", contract.contract_number.as_str());
    c.field("Agreement type", contract_type_label(contract.contract_type));
    c.field("Status", contract.status.as_str());
    c.field("Generated", &long_date(generated_on));
}

fn parties(c: &mut Composer, contract: &Contract) {
    c.heading("1. Parties");
    c.subheading("Service provider");
    c.field("Name", PROVIDER.name);
    c.field("ABN", PROVIDER.abn);
    c.field("Address", PROVIDER.address);
    c.field("Email", PROVIDER.email);
    c.field("Phone", PROVIDER.phone);
    c.gap(4.0);
    c.subheading("Client");
    c.field("Name", &contract.client.name);
    if let Some(company) = &contract.client.company {
        c.field("Company", company);
    }
    c.field("Email", &contract.client.email);
    if let Some(phone) = &contract.client.phone {
        c.field("Phone", phone);
    }
}

fn service(c: &mut Composer, contract: &Contract) {
    let s = &contract.service;
    c.heading("2. Property and service");
    c.field("Description", &s.description);
    c.field(
        "Frequency",
        s.frequency
            .as_deref()
            .unwrap_or(contract.financials.payment_frequency.label()),
    );
    if let Some(address) = &s.property_address {
        c.field("Property address", address);
    }
    if let Some(kind) = &s.property_type {
        c.field("Property type", kind);
    }
    if let Some(requirements) = &s.special_requirements {
        c.field("Special requirements", requirements);
    }
}

fn financials(c: &mut Composer, contract: &Contract) {
    let f = &contract.financials;
    c.heading("3. Financial terms");
    c.field("Payment frequency", f.payment_frequency.label());
    c.field("Amount per period", &format_money(f.payment_amount_per_period));
    let periods = match (f.payment_frequency, f.periods) {
        (PaymentFrequency::OneTime, _) => "Single payment".to_string(),
        (_, Some(n)) => n.to_string(),
        (_, None) => "Ongoing".to_string(),
    };
    c.field("Number of periods", &periods);
    c.field("Total contract value", &format_money(f.total_contract_value));
    if let Some(o) = &f.total_override {
        c.field("Total agreed because", &o.reason);
    }
    c.field("Deposit", &format_money(f.deposit));
    c.field("Currency", &f.currency);
    c.field("Price basis", &price_point_label(&f.price_point));

    let q = &f.quote;
    c.gap(4.0);
    c.subheading(&format!("Quote breakdown (pricing rules {})", q.rule_table_version));
    c.field("Base price", &range_text(q.base));
    for item in q.line_items() {
        c.field(&item.name, &range_text(item.delta));
    }
    match q.total {
        Some(total) => c.field("Quoted total", &range_text(total)),
        None => c.field("Quoted total", "Priced on inspection"),
    }
}

fn term(c: &mut Composer, contract: &Contract) {
    let t = &contract.term;
    c.heading("4. Term");
    c.field("Start date", &long_date(t.start_date));
    match t.effective_end() {
        Some(end) => c.field("End date", &long_date(end)),
        None => c.field("End date", "Ongoing until cancelled"),
    }
    if let Some(months) = t.duration_months {
        c.field("Duration", &format!("{months} month(s)"));
    }
    c.field("Automatic renewal", if t.auto_renew { "Yes" } else { "No" });
}

fn terms_and_conditions(c: &mut Composer) {
    c.heading("5. Terms and conditions");
    for (i, clause) in TERMS.iter().enumerate() {
        c.paragraph(&format!("{}. {clause}", i + 1));
        c.gap(3.0);
    }
}

fn signatures(
    c: &mut Composer,
    contract: &Contract,
    images: &mut Vec<(String, Stream)>,
) -> Result<(), DocumentError> {
    c.heading("6. Signatures");

    c.subheading("Client");
    match &contract.client_signature {
        Some(sig) => {
            let name = format!("Im{}", images.len() + 1);
            let (stream, width, height) = image_xobject(&sig.image)?;
            images.push((name.clone(), stream));
            c.image(&name, width, height);
            c.field("Signed by", &contract.client.name);
            c.field("Signed at", &sig.signed_at.format("%d %B %Y %H:%M UTC").to_string());
            c.field("Signed from", &sig.ip_address);
        }
        None => blank_signature(c, &contract.client.name),
    }

    c.gap(6.0);
    c.subheading(&format!("For {}", PROVIDER.name));
    match &contract.business_signature {
        Some(sig) => {
            let name = format!("Im{}", images.len() + 1);
            let (stream, width, height) = image_xobject(&sig.image)?;
            images.push((name.clone(), stream));
            c.image(&name, width, height);
            c.field("Signed by", &sig.signer);
            c.field("Signed at", &sig.signed_at.format("%d %B %Y %H:%M UTC").to_string());
        }
        None => blank_signature(c, "Authorised officer"),
    }
    Ok(())
}

fn blank_signature(c: &mut Composer, name: &str) {
    c.gap(SIGNATURE_HEIGHT / 2.0);
    c.field("Signature", "______________________________");
    c.field("Name", name);
    c.field("Date", "____________________");
}

/// Decode a PNG or JPEG signature, flatten any transparency onto white and
/// scale the placement to fit the signature box.
fn image_xobject(signature: &SignatureImage) -> Result<(Stream, f32, f32), DocumentError> {
    let bytes = signature
        .decode()
        .map_err(|err| DocumentError::Signature(err.to_string()))?;
    let decoded = image::load_from_memory(&bytes)
        .map_err(|err| DocumentError::Signature(err.to_string()))?
        .to_rgba8();
    let (w, h) = decoded.dimensions();
    let flattened: RgbImage = ImageBuffer::from_fn(w, h, |x, y| {
        let [r, g, b, a] = decoded.get_pixel(x, y).0;
        let blend = |channel: u8| -> u8 {
            let alpha = u16::from(a);
            ((u16::from(channel) * alpha + 255 * (255 - alpha)) / 255) as u8
        };
        Rgb([blend(r), blend(g), blend(b)])
    });

    let stream = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => i64::from(w),
            "Height" => i64::from(h),
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
        },
        flattened.into_raw(),
    );
    let scale = (SIGNATURE_WIDTH / w as f32).min(SIGNATURE_HEIGHT / h as f32);
    Ok((stream, w as f32 * scale, h as f32 * scale))
}

fn assemble(pages: Vec<Vec<Operation>>, images: Vec<(String, Stream)>) -> Result<Vec<u8>, DocumentError> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let heading_font = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica-Bold",
        "Encoding" => "WinAnsiEncoding",
    });
    let body_font = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
        "Encoding" => "WinAnsiEncoding",
    });
    let mut xobjects = lopdf::Dictionary::new();
    for (name, stream) in images {
        let id = doc.add_object(stream);
        xobjects.set(name, id);
    }
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            HEADING_FONT => heading_font,
            BODY_FONT => body_font,
        },
        "XObject" => xobjects,
    });

    let mut kids = Vec::with_capacity(pages.len());
    for operations in pages {
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(Object::from(page_id));
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), Object::Real(PAGE_WIDTH), Object::Real(PAGE_HEIGHT)],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out)?;
    Ok(out)
}

/// Lays text out top to bottom, starting a new page when the next line
/// would run into the footer.
struct Composer {
    done: Vec<Vec<Operation>>,
    current: Vec<Operation>,
    y: f32,
}

impl Composer {
    fn new() -> Self {
        Self {
            done: Vec::new(),
            current: Vec::new(),
            y: PAGE_HEIGHT - MARGIN,
        }
    }

    fn ensure(&mut self, height: f32) {
        if self.y - height < MARGIN {
            self.done.push(std::mem::take(&mut self.current));
            self.y = PAGE_HEIGHT - MARGIN;
        }
    }

    fn text_at(&mut self, font: &str, size: f32, x: f32, y: f32, text: &str) {
        self.current.extend([
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec![font.into(), Object::Real(size)]),
            Operation::new("Td", vec![Object::Real(x), Object::Real(y)]),
            Operation::new("Tj", vec![Object::string_literal(encode_text(text))]),
            Operation::new("ET", vec![]),
        ]);
    }

    fn title(&mut self, text: &str) {
        self.ensure(30.0);
        self.y -= 18.0;
        self.text_at(HEADING_FONT, 18.0, MARGIN, self.y, text);
        self.y -= 14.0;
    }

    fn heading(&mut self, text: &str) {
        self.ensure(LINE_HEIGHT * 3.0);
        self.y -= 16.0;
        self.text_at(HEADING_FONT, 12.5, MARGIN, self.y, text);
        self.y -= LINE_HEIGHT;
    }

    fn subheading(&mut self, text: &str) {
        self.ensure(LINE_HEIGHT * 2.0);
        self.text_at(HEADING_FONT, 10.5, MARGIN, self.y, text);
        self.y -= LINE_HEIGHT;
    }

    fn paragraph(&mut self, text: &str) {
        for line in wrap_text(text, BODY_CHARS) {
            self.ensure(LINE_HEIGHT);
            self.text_at(BODY_FONT, BODY_SIZE, MARGIN, self.y, &line);
            self.y -= LINE_HEIGHT;
        }
    }

    /// Wrapped label in the left column, wrapped value in the right. The
    /// row is as tall as the longer of the two.
    fn field(&mut self, label: &str, value: &str) {
        let labels = wrap_text(label, LABEL_CHARS);
        let values = wrap_text(value, VALUE_CHARS);
        for row in 0..labels.len().max(values.len()) {
            self.ensure(LINE_HEIGHT);
            if let Some(line) = labels.get(row) {
                self.text_at(BODY_FONT, BODY_SIZE, MARGIN, self.y, line);
            }
            if let Some(line) = values.get(row) {
                self.text_at(BODY_FONT, BODY_SIZE, VALUE_X, self.y, line);
            }
            self.y -= LINE_HEIGHT;
        }
    }

    fn image(&mut self, name: &str, width: f32, height: f32) {
        self.ensure(height + 6.0);
        self.y -= height;
        self.current.extend([
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    Object::Real(width),
                    0.into(),
                    0.into(),
                    Object::Real(height),
                    Object::Real(MARGIN),
                    Object::Real(self.y),
                ],
            ),
            Operation::new("Do", vec![Object::Name(name.as_bytes().to_vec())]),
            Operation::new("Q", vec![]),
        ]);
        self.y -= 6.0;
    }

    fn gap(&mut self, height: f32) {
        self.y -= height;
    }

    /// Close the last page and stamp every page with its number.
    fn finish(mut self, document_number: &str) -> Vec<Vec<Operation>> {
        self.done.push(std::mem::take(&mut self.current));
        let total = self.done.len();
        let mut pages = std::mem::take(&mut self.done);
        for (i, ops) in pages.iter_mut().enumerate() {
            self.current = std::mem::take(ops);
            let footer = format!("{document_number}  |  Page {} of {total}", i + 1);
            self.text_at(BODY_FONT, 8.0, MARGIN, FOOTER_Y, &footer);
            *ops = std::mem::take(&mut self.current);
        }
        pages
    }
}

/// Map text onto WinAnsi bytes. Typographic quotes and dashes fold to ASCII;
/// anything else outside Latin-1 becomes `?`.
fn encode_text(text: &str) -> Vec<u8> {
    text.chars()
        .map(|ch| match ch {
            '\u{2013}' | '\u{2014}' => b'-',
            '\u{2018}' | '\u{2019}' => b'\'',
            '\u{201C}' | '\u{201D}' => b'"',
            '\u{20AC}' => 0x80,
            c if (' '..='~').contains(&c) || ('\u{A0}'..='\u{FF}').contains(&c) => c as u32 as u8,
            _ => b'?',
        })
        .collect()
}

fn range_text(range: PriceRange) -> String {
    if range.low == range.high {
        format_money(range.low)
    } else {
        format!("{} - {}", format_money(range.low), format_money(range.high))
    }
}

fn price_point_label(point: &PricePoint) -> String {
    match point {
        PricePoint::Low => "Low end of the quoted range".to_string(),
        PricePoint::High => "High end of the quoted range".to_string(),
        PricePoint::Confirmed { amount } => format!("Confirmed at {}", format_money(*amount)),
        PricePoint::Manual { amount, note } => {
            format!("Manual quote of {}: {note}", format_money(*amount))
        }
    }
}

fn contract_type_label(kind: ContractType) -> &'static str {
    match kind {
        ContractType::AirbnbLongTerm => "Short-stay property (long-term)",
        ContractType::CommercialRecurring => "Commercial (recurring)",
        ContractType::CommercialOneTime => "Commercial (one-time)",
        ContractType::ResidentialRecurring => "Residential (recurring)",
        ContractType::GeneralService => "General service",
    }
}

fn long_date(date: NaiveDate) -> String {
    date.format("%-d %B %Y").to_string()
}
