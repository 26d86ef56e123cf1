//! In-process converters: delimited text, plain text, light markup, PDF text
//! extraction and images.
//!
//! Everything here is deterministic and runs on the blocking pool. The only
//! failure a caller should expect is `InvalidInput` for bytes that do not
//! match the declared source format.

use super::ooxml::{
    self, escape_markup, Block, Picture, EMU_PER_INCH, MAX_TABLE_COLS, MAX_TABLE_ROWS,
};
use super::{Attempt, BackendKind, ConvertBackend};
use crate::error::BackendError;
use crate::formats::Format;
use async_trait::async_trait;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use std::io::Cursor;
use tracing::info;

/// Line width for HTML rendered as plain text.
const TEXT_WIDTH: usize = 80;

type Converter = fn(&[u8], Format, Format) -> Result<Vec<u8>, BackendError>;

pub struct NativeEngine;

impl NativeEngine {
    pub fn new() -> Self {
        Self
    }

    /// Whether an in-process converter exists for the pair.
    pub fn supports(source: Format, target: Format) -> bool {
        converter_for(source, target).is_some()
    }

    /// Run the converter for the pair on the current thread.
    pub fn convert(input: &[u8], source: Format, target: Format) -> Result<Vec<u8>, BackendError> {
        let convert = converter_for(source, target).ok_or_else(|| {
            BackendError::unavailable(format!("no native converter for {} -> {}", source, target))
        })?;
        convert(input, source, target)
    }
}

impl Default for NativeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConvertBackend for NativeEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn attempt(&self, attempt: &Attempt<'_>) -> Result<Vec<u8>, BackendError> {
        let (source, target) = (attempt.source, attempt.target);
        if !Self::supports(source, target) {
            return Err(BackendError::unavailable(format!(
                "no native converter for {} -> {}",
                source, target
            )));
        }

        info!("Converting {} -> {} in-process", source, target);
        let input = attempt.input.clone();
        let task = tokio::task::spawn_blocking(move || Self::convert(&input, source, target));

        match tokio::time::timeout_at(attempt.deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(BackendError::unavailable(format!(
                "native converter crashed: {}",
                join_err
            ))),
            Err(_) => Err(BackendError::timeout("native conversion exceeded its deadline")),
        }
    }
}

fn converter_for(source: Format, target: Format) -> Option<Converter> {
    use Format::*;
    match (source, target) {
        (Csv, Xlsx) => Some(csv_to_xlsx),
        (Csv, Html) => Some(csv_to_html),
        (Csv, Docx) => Some(csv_to_docx),
        (Txt, Html) => Some(txt_to_html),
        (Txt, Docx) => Some(txt_to_docx),
        (Txt, Csv) => Some(txt_to_csv),
        (Txt, Xlsx) => Some(txt_to_xlsx),
        (Md, Html) => Some(md_to_html),
        (Html, Txt) => Some(html_to_txt),
        (Html, Csv | Xlsx) => Some(html_to_table),
        (Pdf, Txt | Html | Csv | Xlsx) => Some(pdf_extract_text),
        (s, Pdf) if s.is_image() => Some(image_to_pdf),
        (s, Png | Jpg) if s.is_image() && s != target => Some(image_transcode),
        (s, Html) if s.is_image() => Some(image_to_html),
        (s, Docx) if s.is_image() => Some(image_to_docx),
        _ => None,
    }
}

// ── Text ────────────────────────────────────────────────────────────────────

fn decode_text(input: &[u8]) -> Result<&str, BackendError> {
    let text = std::str::from_utf8(input)
        .map_err(|e| BackendError::invalid_input(format!("input is not valid UTF-8: {}", e)))?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text))
}

fn malformed_csv(e: csv::Error) -> BackendError {
    BackendError::invalid_input(format!("malformed CSV: {}", e))
}

/// Parse comma-separated text. Rows may differ in length; blank lines are
/// skipped.
pub(crate) fn parse_csv(text: &str) -> Result<Vec<Vec<String>>, BackendError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(malformed_csv)?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
    }

    if rows.is_empty() {
        return Err(BackendError::invalid_input("CSV input has no rows"));
    }
    Ok(rows)
}

fn write_csv(rows: &[Vec<String>]) -> Result<Vec<u8>, BackendError> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());
    for row in rows {
        writer
            .write_record(row)
            .map_err(|e| BackendError::unavailable(format!("CSV encoding failed: {}", e)))?;
    }
    writer
        .into_inner()
        .map_err(|e| BackendError::unavailable(format!("CSV encoding failed: {}", e.error())))
}

fn csv_to_xlsx(input: &[u8], _: Format, _: Format) -> Result<Vec<u8>, BackendError> {
    let rows = parse_csv(decode_text(input)?)?;
    ooxml::workbook(&rows)
}

fn csv_to_html(input: &[u8], _: Format, _: Format) -> Result<Vec<u8>, BackendError> {
    let rows = parse_csv(decode_text(input)?)?;
    let mut table = String::from("<table id=\"data-table\">\n");
    for (i, row) in rows.iter().enumerate() {
        let tag = if i == 0 { "th" } else { "td" };
        table.push_str("  <tr>");
        for cell in row {
            table.push_str(&format!("<{tag}>{}</{tag}>", escape_markup(cell)));
        }
        table.push_str("</tr>\n");
    }
    table.push_str("</table>");

    let style = "body { font-family: Arial, sans-serif; margin: 20px; }\n        \
                 table { border-collapse: collapse; width: 100%; }\n        \
                 th, td { border: 1px solid #ddd; padding: 8px; text-align: left; }\n        \
                 th { background-color: #f2f2f2; }";
    Ok(html_page("CSV Data", style, &format!("<h1>CSV Data</h1>\n{}", table)).into_bytes())
}

fn csv_to_docx(input: &[u8], _: Format, _: Format) -> Result<Vec<u8>, BackendError> {
    let rows = parse_csv(decode_text(input)?)?;
    let mut blocks = vec![Block::Heading("CSV Data".to_string())];

    let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
    if rows.len() > MAX_TABLE_ROWS {
        blocks.push(Block::Paragraph(format!(
            "Note: Showing first {} rows of {} total rows.",
            MAX_TABLE_ROWS,
            rows.len()
        )));
    }
    if columns > MAX_TABLE_COLS {
        blocks.push(Block::Paragraph(format!(
            "Note: Showing first {} columns of {} total columns.",
            MAX_TABLE_COLS, columns
        )));
    }
    let table = rows
        .into_iter()
        .take(MAX_TABLE_ROWS)
        .map(|row| row.into_iter().take(MAX_TABLE_COLS).collect())
        .collect();
    blocks.push(Block::Table(table));

    ooxml::document(&blocks)
}

fn txt_to_html(input: &[u8], _: Format, _: Format) -> Result<Vec<u8>, BackendError> {
    let text = decode_text(input)?;
    let style = "body { font-family: 'Courier New', monospace; line-height: 1.6; margin: 40px; background-color: #f9f9f9; }\n        \
                 .content { background-color: white; padding: 30px; border-radius: 8px; white-space: pre-wrap; word-wrap: break-word; }\n        \
                 h1 { color: #333; border-bottom: 2px solid #ccc; padding-bottom: 10px; }";
    let body = format!(
        "<h1>Text Document</h1>\n<div class=\"content\">{}</div>",
        escape_markup(text)
    );
    Ok(html_page("Text Document", style, &body).into_bytes())
}

fn txt_to_docx(input: &[u8], _: Format, _: Format) -> Result<Vec<u8>, BackendError> {
    let text = decode_text(input)?;
    let blocks: Vec<Block> = text
        .lines()
        .map(|line| Block::Paragraph(line.to_string()))
        .collect();
    ooxml::document(&blocks)
}

/// `line,text` rows for every non-blank line.
fn numbered_lines(text: &str) -> Vec<Vec<String>> {
    let mut rows = vec![vec!["line".to_string(), "text".to_string()]];
    rows.extend(
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(i, line)| vec![(i + 1).to_string(), line.trim_end().to_string()]),
    );
    rows
}

fn txt_to_csv(input: &[u8], _: Format, _: Format) -> Result<Vec<u8>, BackendError> {
    write_csv(&numbered_lines(decode_text(input)?))
}

fn txt_to_xlsx(input: &[u8], _: Format, _: Format) -> Result<Vec<u8>, BackendError> {
    ooxml::workbook(&numbered_lines(decode_text(input)?))
}

// ── Markup ──────────────────────────────────────────────────────────────────

fn html_page(title: &str, style: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{}</title>
    <style>
        {}
    </style>
</head>
<body>
{}
</body>
</html>"#,
        escape_markup(title),
        style,
        body
    )
}

fn md_to_html(input: &[u8], _: Format, _: Format) -> Result<Vec<u8>, BackendError> {
    Ok(markdown_document(decode_text(input)?).into_bytes())
}

/// Full HTML page for a markdown source.
pub(crate) fn markdown_document(md: &str) -> String {
    let style = "body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; margin: 40px; line-height: 1.6; }\n        \
                 pre { background: #f4f4f4; padding: 16px; overflow-x: auto; }\n        \
                 code { background: #f4f4f4; padding: 2px 6px; }";
    html_page("Document", style, &markdown_to_html_simple(md))
}

static RE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]+)`").unwrap());
static RE_BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());
static RE_EM: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*]+)\*").unwrap());
static RE_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]\(([^)\s]+)\)").unwrap());

/// Escape a line of markdown and render its inline spans.
fn inline_markdown(text: &str) -> String {
    let html = escape_markup(text);
    let html = RE_CODE.replace_all(&html, "<code>${1}</code>");
    let html = RE_BOLD.replace_all(&html, "<strong>${1}</strong>");
    let html = RE_EM.replace_all(&html, "<em>${1}</em>");
    RE_LINK
        .replace_all(&html, r#"<a href="${2}">${1}</a>"#)
        .into_owned()
}

/// Line-oriented markdown: headings, bullet items, fenced code and paragraphs.
fn markdown_to_html_simple(md: &str) -> String {
    let mut html = String::new();
    let mut in_code_block = false;
    let mut in_list = false;

    for line in md.lines() {
        if in_code_block {
            if line.starts_with("```") {
                html.push_str("</code></pre>\n");
                in_code_block = false;
            } else {
                html.push_str(&escape_markup(line));
                html.push('\n');
            }
            continue;
        }

        let item = line.strip_prefix("- ").or_else(|| line.strip_prefix("* "));
        if in_list && item.is_none() {
            html.push_str("</ul>\n");
            in_list = false;
        }

        if line.starts_with("```") {
            html.push_str("<pre><code>");
            in_code_block = true;
        } else if let Some(text) = line.strip_prefix("### ") {
            html.push_str(&format!("<h3>{}</h3>\n", inline_markdown(text)));
        } else if let Some(text) = line.strip_prefix("## ") {
            html.push_str(&format!("<h2>{}</h2>\n", inline_markdown(text)));
        } else if let Some(text) = line.strip_prefix("# ") {
            html.push_str(&format!("<h1>{}</h1>\n", inline_markdown(text)));
        } else if let Some(text) = item {
            if !in_list {
                html.push_str("<ul>\n");
                in_list = true;
            }
            html.push_str(&format!("<li>{}</li>\n", inline_markdown(text)));
        } else if !line.trim().is_empty() {
            html.push_str(&format!("<p>{}</p>\n", inline_markdown(line)));
        }
    }

    if in_code_block {
        html.push_str("</code></pre>\n");
    }
    if in_list {
        html.push_str("</ul>\n");
    }
    html
}

fn html_to_txt(input: &[u8], _: Format, _: Format) -> Result<Vec<u8>, BackendError> {
    let html = decode_text(input)?;
    let text = html2text::from_read(html.as_bytes(), TEXT_WIDTH);
    Ok(text.trim().as_bytes().to_vec())
}

static TABLE: Lazy<Selector> = Lazy::new(|| Selector::parse("table").unwrap());
static ROW: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").unwrap());
static CELL: Lazy<Selector> = Lazy::new(|| Selector::parse("th, td").unwrap());

/// Rows of every `<table>` in the document, in order, with cell text
/// whitespace-collapsed.
fn html_table_rows(html: &str) -> Vec<Vec<String>> {
    let document = Html::parse_document(html);
    let mut rows = Vec::new();
    for table in document.select(&TABLE) {
        for row in table.select(&ROW) {
            let cells: Vec<String> = row
                .select(&CELL)
                .map(|cell| {
                    cell.text()
                        .flat_map(str::split_whitespace)
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect();
            if !cells.is_empty() {
                rows.push(cells);
            }
        }
    }
    rows
}

/// Single-column sheet of the non-blank lines of `text`.
fn text_rows(text: &str) -> Vec<Vec<String>> {
    let mut rows = vec![vec!["Text Content".to_string()]];
    rows.extend(
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| vec![l.to_string()]),
    );
    rows
}

/// Tables become rows; a page without tables falls back to its text lines.
fn html_to_table(input: &[u8], _: Format, target: Format) -> Result<Vec<u8>, BackendError> {
    let html = decode_text(input)?;
    let mut rows = html_table_rows(html);
    if rows.is_empty() {
        rows = text_rows(&html2text::from_read(html.as_bytes(), TEXT_WIDTH));
        // Header only.
        if rows.len() == 1 {
            return Err(BackendError::invalid_input("HTML document has no text"));
        }
    }
    tabular(&rows, target)
}

fn tabular(rows: &[Vec<String>], target: Format) -> Result<Vec<u8>, BackendError> {
    match target {
        Format::Csv => write_csv(rows),
        Format::Xlsx => ooxml::workbook(rows),
        other => Err(BackendError::unavailable(format!("cannot tabulate into {}", other))),
    }
}

// ── PDF ─────────────────────────────────────────────────────────────────────

fn pdf_extract_text(input: &[u8], _: Format, target: Format) -> Result<Vec<u8>, BackendError> {
    if !Format::Pdf.matches_signature(input) {
        return Err(BackendError::invalid_input("input is not a PDF document"));
    }
    let text = pdf_extract::extract_text_from_mem(input)
        .map_err(|e| BackendError::invalid_input(format!("cannot extract text from PDF: {}", e)))?;
    let text = text.trim();

    match target {
        Format::Txt => Ok(text.as_bytes().to_vec()),
        Format::Html => {
            let style = "body { font-family: Arial, sans-serif; margin: 40px; line-height: 1.6; }\n        \
                         pre { white-space: pre-wrap; word-wrap: break-word; }";
            let body = format!(
                "<h1>Extracted PDF Content</h1>\n<pre>{}</pre>",
                escape_markup(text)
            );
            Ok(html_page("Extracted PDF Content", style, &body).into_bytes())
        }
        _ => tabular(&text_rows(text), target),
    }
}

// ── Images ──────────────────────────────────────────────────────────────────

fn decode_image(input: &[u8], source: Format) -> Result<DynamicImage, BackendError> {
    let format = ImageFormat::from_extension(source.extension()).ok_or_else(|| {
        BackendError::unavailable(format!("{} is not an image format", source))
    })?;
    image::load_from_memory_with_format(input, format)
        .map_err(|e| BackendError::invalid_input(format!("cannot decode {} image: {}", source, e)))
}

fn encode_image(img: &DynamicImage, target: Format) -> Result<Vec<u8>, BackendError> {
    let mut out = Cursor::new(Vec::new());
    let result = match target {
        // JPEG has no alpha channel.
        Format::Jpg => DynamicImage::ImageRgb8(img.to_rgb8()).write_to(&mut out, ImageFormat::Jpeg),
        Format::Png => img.write_to(&mut out, ImageFormat::Png),
        other => {
            return Err(BackendError::unavailable(format!(
                "cannot encode images as {}",
                other
            )))
        }
    };
    result.map_err(|e| BackendError::unavailable(format!("image encoding failed: {}", e)))?;
    Ok(out.into_inner())
}

fn image_transcode(input: &[u8], source: Format, target: Format) -> Result<Vec<u8>, BackendError> {
    encode_image(&decode_image(input, source)?, target)
}

fn image_to_html(input: &[u8], source: Format, _: Format) -> Result<Vec<u8>, BackendError> {
    let img = decode_image(input, source)?;
    let data = base64::engine::general_purpose::STANDARD.encode(input);
    let body = format!(
        r#"<img src="data:{};base64,{}" width="{}" height="{}" alt="Converted image">"#,
        source.content_type(),
        data,
        img.width(),
        img.height()
    );
    let style = "body { margin: 0; display: flex; justify-content: center; }\n        img { max-width: 100%; height: auto; }";
    Ok(html_page("Image", style, &body).into_bytes())
}

/// Letter page with one-inch margins.
const PAGE_WIDTH_IN: f64 = 6.5;
const PAGE_HEIGHT_IN: f64 = 9.0;
const SCREEN_DPI: f64 = 96.0;

/// Display size in EMU: natural size at screen resolution, shrunk to fit the
/// page, never enlarged.
fn fit_to_page(width: u32, height: u32) -> (u64, u64) {
    let (w_in, h_in) = (width as f64 / SCREEN_DPI, height as f64 / SCREEN_DPI);
    let scale = (PAGE_WIDTH_IN / w_in).min(PAGE_HEIGHT_IN / h_in).min(1.0);
    (
        (w_in * scale * EMU_PER_INCH).round() as u64,
        (h_in * scale * EMU_PER_INCH).round() as u64,
    )
}

fn image_to_docx(input: &[u8], source: Format, _: Format) -> Result<Vec<u8>, BackendError> {
    let img = decode_image(input, source)?;
    let (data, extension) = match source {
        Format::Png => (input.to_vec(), "png"),
        Format::Jpg => (input.to_vec(), "jpeg"),
        _ => (encode_image(&img, Format::Png)?, "png"),
    };
    let (width_emu, height_emu) = fit_to_page(img.width(), img.height());
    ooxml::document(&[Block::Picture(Picture {
        data,
        extension,
        width_emu,
        height_emu,
    })])
}

/// Single-page PDF with the image as a JPEG XObject, one point per pixel.
fn image_to_pdf(input: &[u8], source: Format, _: Format) -> Result<Vec<u8>, BackendError> {
    let img = decode_image(input, source)?;
    let jpeg = encode_image(&img, Format::Jpg)?;
    Ok(single_image_pdf(&jpeg, img.width(), img.height()))
}

fn single_image_pdf(jpeg: &[u8], width: u32, height: u32) -> Vec<u8> {
    let content = format!("q\n{width} 0 0 {height} 0 0 cm\n/Im0 Do\nQ");

    let mut image_obj = format!(
        "<< /Type /XObject /Subtype /Image /Width {width} /Height {height} /ColorSpace /DeviceRGB /BitsPerComponent 8 /Filter /DCTDecode /Length {} >>\nstream\n",
        jpeg.len()
    )
    .into_bytes();
    image_obj.extend_from_slice(jpeg);
    image_obj.extend_from_slice(b"\nendstream");

    let objects: Vec<Vec<u8>> = vec![
        b"<< /Type /Catalog /Pages 2 0 R >>".to_vec(),
        b"<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_vec(),
        format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {width} {height}] /Resources << /XObject << /Im0 4 0 R >> >> /Contents 5 0 R >>"
        )
        .into_bytes(),
        image_obj,
        format!("<< /Length {} >>\nstream\n{}\nendstream", content.len(), content).into_bytes(),
    ];
    write_pdf(&objects)
}

/// Serialize numbered objects (the first is the catalog) with a valid xref
/// table.
fn write_pdf(objects: &[Vec<u8>]) -> Vec<u8> {
    let mut pdf = b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n".to_vec();
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(pdf.len());
        pdf.extend_from_slice(format!("{} 0 obj\n", i + 1).as_bytes());
        pdf.extend_from_slice(body);
        pdf.extend_from_slice(b"\nendobj\n");
    }

    let xref = pdf.len();
    pdf.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1).as_bytes());
    for offset in offsets {
        pdf.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    pdf.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref
        )
        .as_bytes(),
    );
    pdf
}
