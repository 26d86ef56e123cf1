//! Minimal Office Open XML packages (xlsx, docx) written with `zip`.

use crate::error::BackendError;
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;
const RELS_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";
const SHEET_NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
const WORD_NS: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";
const OFFICE_DOC_REL: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument";
const IMAGE_REL: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships/image";
const REL_NS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const DRAWING_NS: &str = "http://schemas.openxmlformats.org/drawingml/2006/wordprocessingDrawing";
const GRAPHIC_NS: &str = "http://schemas.openxmlformats.org/drawingml/2006/main";
const PICTURE_NS: &str = "http://schemas.openxmlformats.org/drawingml/2006/picture";

pub const EMU_PER_INCH: f64 = 914_400.0;

/// Word tables are capped to keep documents openable.
pub const MAX_TABLE_ROWS: usize = 100;
pub const MAX_TABLE_COLS: usize = 15;

/// A paragraph, table or picture in a generated Word document.
pub enum Block {
    Heading(String),
    Paragraph(String),
    Table(Vec<Vec<String>>),
    Picture(Picture),
}

/// An embedded PNG or JPEG image, displayed at the given size.
pub struct Picture {
    pub data: Vec<u8>,
    /// `png` or `jpeg`.
    pub extension: &'static str,
    pub width_emu: u64,
    pub height_emu: u64,
}

/// Escape text for XML/HTML character data and attribute values.
pub fn escape_markup(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Spreadsheet column name for a zero-based index (0 -> A, 26 -> AA).
pub fn column_name(mut index: usize) -> String {
    let mut name = Vec::new();
    loop {
        name.push(b'A' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    name.reverse();
    String::from_utf8(name).unwrap_or_default()
}

fn is_numeric(value: &str) -> bool {
    !value.is_empty()
        && value.trim() == value
        && value.parse::<f64>().map(f64::is_finite).unwrap_or(false)
}

/// Single-sheet workbook. The first row is styled bold as a header.
pub fn workbook(rows: &[Vec<String>]) -> Result<Vec<u8>, BackendError> {
    let mut sheet_data = String::new();
    for (r, row) in rows.iter().enumerate() {
        let row_num = r + 1;
        let style = if r == 0 { r#" s="1""# } else { "" };
        sheet_data.push_str(&format!(r#"<row r="{row_num}">"#));
        for (c, value) in row.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            let cell_ref = format!("{}{}", column_name(c), row_num);
            if is_numeric(value) {
                sheet_data.push_str(&format!(r#"<c r="{cell_ref}"{style}><v>{value}</v></c>"#));
            } else {
                sheet_data.push_str(&format!(
                    r#"<c r="{cell_ref}" t="inlineStr"{style}><is><t xml:space="preserve">{}</t></is></c>"#,
                    escape_markup(value)
                ));
            }
        }
        sheet_data.push_str("</row>");
    }

    let content_types = format!(
        r#"{XML_DECL}<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/><Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/></Types>"#
    );
    let root_rels = format!(
        r#"{XML_DECL}<Relationships xmlns="{RELS_NS}"><Relationship Id="rId1" Type="{OFFICE_DOC_REL}" Target="xl/workbook.xml"/></Relationships>"#
    );
    let workbook = format!(
        r#"{XML_DECL}<workbook xmlns="{SHEET_NS}" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Sheet1" sheetId="1" r:id="rId1"/></sheets></workbook>"#
    );
    let workbook_rels = format!(
        r#"{XML_DECL}<Relationships xmlns="{RELS_NS}"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/></Relationships>"#
    );
    let styles = format!(
        r#"{XML_DECL}<styleSheet xmlns="{SHEET_NS}"><fonts count="2"><font><sz val="11"/><name val="Calibri"/></font><font><b/><sz val="11"/><name val="Calibri"/></font></fonts><fills count="2"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill></fills><borders count="1"><border><left/><right/><top/><bottom/><diagonal/></border></borders><cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs><cellXfs count="2"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/><xf numFmtId="0" fontId="1" fillId="0" borderId="0" xfId="0" applyFont="1"/></cellXfs></styleSheet>"#
    );
    let sheet = format!(
        r#"{XML_DECL}<worksheet xmlns="{SHEET_NS}"><sheetData>{sheet_data}</sheetData></worksheet>"#
    );

    write_package(&[
        ("[Content_Types].xml", content_types),
        ("_rels/.rels", root_rels),
        ("xl/workbook.xml", workbook),
        ("xl/_rels/workbook.xml.rels", workbook_rels),
        ("xl/styles.xml", styles),
        ("xl/worksheets/sheet1.xml", sheet),
    ])
}

/// Word document made of headings, paragraphs, bordered tables and inline
/// pictures.
pub fn document(blocks: &[Block]) -> Result<Vec<u8>, BackendError> {
    let mut body = String::new();
    let mut media: Vec<(String, &[u8])> = Vec::new();
    let mut relationships = String::new();
    for block in blocks {
        match block {
            Block::Heading(text) => body.push_str(&format!(
                r#"<w:p><w:r><w:rPr><w:b/><w:sz w:val="32"/></w:rPr><w:t xml:space="preserve">{}</w:t></w:r></w:p>"#,
                escape_markup(text)
            )),
            Block::Paragraph(text) => body.push_str(&format!(
                r#"<w:p><w:r><w:t xml:space="preserve">{}</w:t></w:r></w:p>"#,
                escape_markup(text)
            )),
            Block::Table(rows) => {
                body.push_str(r#"<w:tbl><w:tblPr><w:tblW w:w="0" w:type="auto"/><w:tblBorders><w:top w:val="single" w:sz="4"/><w:left w:val="single" w:sz="4"/><w:bottom w:val="single" w:sz="4"/><w:right w:val="single" w:sz="4"/><w:insideH w:val="single" w:sz="4"/><w:insideV w:val="single" w:sz="4"/></w:tblBorders></w:tblPr>"#);
                let width = rows.iter().map(Vec::len).max().unwrap_or(0);
                for (r, row) in rows.iter().enumerate() {
                    body.push_str("<w:tr>");
                    for c in 0..width {
                        let text = row.get(c).map(String::as_str).unwrap_or("");
                        let bold = if r == 0 { "<w:rPr><w:b/></w:rPr>" } else { "" };
                        body.push_str(&format!(
                            r#"<w:tc><w:p><w:r>{bold}<w:t xml:space="preserve">{}</w:t></w:r></w:p></w:tc>"#,
                            escape_markup(text)
                        ));
                    }
                    body.push_str("</w:tr>");
                }
                body.push_str("</w:tbl>");
            }
            Block::Picture(picture) => {
                let n = media.len() + 1;
                let name = format!("image{}.{}", n, picture.extension);
                relationships.push_str(&format!(
                    r#"<Relationship Id="rId{n}" Type="{IMAGE_REL}" Target="media/{name}"/>"#
                ));
                body.push_str(&picture_paragraph(n, &name, picture));
                media.push((format!("word/media/{}", name), picture.data.as_slice()));
            }
        }
    }

    let content_types = format!(
        r#"{XML_DECL}<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Default Extension="png" ContentType="image/png"/><Default Extension="jpeg" ContentType="image/jpeg"/><Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/></Types>"#
    );
    let root_rels = format!(
        r#"{XML_DECL}<Relationships xmlns="{RELS_NS}"><Relationship Id="rId1" Type="{OFFICE_DOC_REL}" Target="word/document.xml"/></Relationships>"#
    );
    let document = format!(
        r#"{XML_DECL}<w:document xmlns:w="{WORD_NS}" xmlns:r="{REL_NS}" xmlns:wp="{DRAWING_NS}"><w:body>{body}<w:sectPr/></w:body></w:document>"#
    );
    let document_rels = format!(r#"{XML_DECL}<Relationships xmlns="{RELS_NS}">{relationships}</Relationships>"#);

    let mut parts: Vec<(String, &[u8])> = vec![
        ("[Content_Types].xml".to_string(), content_types.as_bytes()),
        ("_rels/.rels".to_string(), root_rels.as_bytes()),
        ("word/document.xml".to_string(), document.as_bytes()),
        ("word/_rels/document.xml.rels".to_string(), document_rels.as_bytes()),
    ];
    parts.extend(media);
    write_package(&parts)
}

/// Centred paragraph holding one inline picture.
fn picture_paragraph(n: usize, name: &str, picture: &Picture) -> String {
    let (cx, cy) = (picture.width_emu, picture.height_emu);
    format!(
        r#"<w:p><w:pPr><w:jc w:val="center"/></w:pPr><w:r><w:drawing><wp:inline distT="0" distB="0" distL="0" distR="0"><wp:extent cx="{cx}" cy="{cy}"/><wp:docPr id="{n}" name="Picture {n}"/><a:graphic xmlns:a="{GRAPHIC_NS}"><a:graphicData uri="{PICTURE_NS}"><pic:pic xmlns:pic="{PICTURE_NS}"><pic:nvPicPr><pic:cNvPr id="{n}" name="{name}"/><pic:cNvPicPr/></pic:nvPicPr><pic:blipFill><a:blip r:embed="rId{n}"/><a:stretch><a:fillRect/></a:stretch></pic:blipFill><pic:spPr><a:xfrm><a:off x="0" y="0"/><a:ext cx="{cx}" cy="{cy}"/></a:xfrm><a:prstGeom prst="rect"><a:avLst/></a:prstGeom></pic:spPr></pic:pic></a:graphicData></a:graphic></wp:inline></w:drawing></w:r></w:p>"#
    )
}

fn write_package<N, D>(parts: &[(N, D)]) -> Result<Vec<u8>, BackendError>
where
    N: AsRef<str>,
    D: AsRef<[u8]>,
{
    let mut buffer = Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(&mut buffer);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, content) in parts {
        let name = name.as_ref();
        zip.start_file(name, options)
            .map_err(|e| BackendError::unavailable(format!("Failed to add {}: {}", name, e)))?;
        zip.write_all(content.as_ref())?;
    }
    zip.finish()
        .map_err(|e| BackendError::unavailable(format!("Failed to finalize package: {}", e)))?;

    Ok(buffer.into_inner())
}
