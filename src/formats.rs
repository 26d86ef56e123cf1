use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Every document format the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Txt,
    Csv,
    Md,
    Html,
    Rtf,
    Doc,
    Docx,
    Odt,
    Xls,
    Xlsx,
    Ods,
    Ppt,
    Pptx,
    Odp,
    Pdf,
    Jpg,
    Png,
    Gif,
    Bmp,
    Tiff,
}

impl Format {
    pub const ALL: &'static [Format] = &[
        Format::Txt,
        Format::Csv,
        Format::Md,
        Format::Html,
        Format::Rtf,
        Format::Doc,
        Format::Docx,
        Format::Odt,
        Format::Xls,
        Format::Xlsx,
        Format::Ods,
        Format::Ppt,
        Format::Pptx,
        Format::Odp,
        Format::Pdf,
        Format::Jpg,
        Format::Png,
        Format::Gif,
        Format::Bmp,
        Format::Tiff,
    ];

    /// Canonical file extension, without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            Format::Txt => "txt",
            Format::Csv => "csv",
            Format::Md => "md",
            Format::Html => "html",
            Format::Rtf => "rtf",
            Format::Doc => "doc",
            Format::Docx => "docx",
            Format::Odt => "odt",
            Format::Xls => "xls",
            Format::Xlsx => "xlsx",
            Format::Ods => "ods",
            Format::Ppt => "ppt",
            Format::Pptx => "pptx",
            Format::Odp => "odp",
            Format::Pdf => "pdf",
            Format::Jpg => "jpg",
            Format::Png => "png",
            Format::Gif => "gif",
            Format::Bmp => "bmp",
            Format::Tiff => "tiff",
        }
    }

    pub fn content_type(self) -> String {
        mime_guess::from_ext(self.extension())
            .first()
            .unwrap_or(mime::APPLICATION_OCTET_STREAM)
            .to_string()
    }

    pub fn is_image(self) -> bool {
        matches!(
            self,
            Format::Jpg | Format::Png | Format::Gif | Format::Bmp | Format::Tiff
        )
    }

    /// Whether `data` starts the way a file of this format must. Plain-text
    /// formats carry no signature and always match.
    pub fn matches_signature(self, data: &[u8]) -> bool {
        const ZIP: &[u8] = b"PK\x03\x04";
        const OLE: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

        match self {
            Format::Pdf => data.starts_with(b"%PDF"),
            Format::Docx | Format::Xlsx | Format::Pptx | Format::Odt | Format::Ods | Format::Odp => {
                data.starts_with(ZIP)
            }
            Format::Doc | Format::Xls | Format::Ppt => data.starts_with(OLE),
            Format::Rtf => data.starts_with(b"{\\rtf"),
            Format::Png => data.starts_with(b"\x89PNG\r\n\x1a\n"),
            Format::Jpg => data.starts_with(&[0xFF, 0xD8, 0xFF]),
            Format::Gif => data.starts_with(b"GIF8"),
            Format::Bmp => data.starts_with(b"BM"),
            Format::Tiff => data.starts_with(b"II*\0") || data.starts_with(b"MM\0*"),
            Format::Txt | Format::Csv | Format::Md | Format::Html => true,
        }
    }

    /// Derive the format from a file name's extension.
    pub fn from_path(path: &Path) -> Result<Self, UnknownFormat> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| UnknownFormat(path.display().to_string()))?;
        ext.parse()
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown format: {0}")]
pub struct UnknownFormat(pub String);

impl FromStr for Format {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().trim_start_matches('.').to_lowercase();
        let canonical = match lower.as_str() {
            "jpeg" => "jpg",
            "htm" => "html",
            "tif" => "tiff",
            "markdown" => "md",
            other => other,
        };
        Format::ALL
            .iter()
            .copied()
            .find(|f| f.extension() == canonical)
            .ok_or_else(|| UnknownFormat(s.to_string()))
    }
}
