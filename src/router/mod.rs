use crate::config::EngineConfig;
use crate::engines::BackendKind;
use crate::error::FailureKind;
use crate::formats::Format;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use BackendKind::{HtmlRender, Native, Office, Remote};
use Format::*;

/// Declares that `backend` can convert every source into every target
/// listed (identical pairs excluded).
#[derive(Debug, Clone, Copy)]
pub struct Route {
    pub sources: &'static [Format],
    pub targets: &'static [Format],
    pub backend: BackendKind,
}

const WORD: &[Format] = &[Doc, Docx, Odt, Rtf];
const SHEETS: &[Format] = &[Xls, Xlsx, Ods];
const SLIDES: &[Format] = &[Ppt, Pptx, Odp];
const OFFICE: &[Format] = &[Doc, Docx, Odt, Rtf, Xls, Xlsx, Ods, Ppt, Pptx, Odp];
const IMAGES: &[Format] = &[Jpg, Png, Gif, Bmp, Tiff];

/// Default capability data.
pub const DEFAULT_ROUTES: &[Route] = &[
    // In-process
    Route { sources: &[Csv], targets: &[Xlsx, Html, Docx], backend: Native },
    Route { sources: &[Txt], targets: &[Html, Docx, Csv, Xlsx], backend: Native },
    Route { sources: &[Md], targets: &[Html], backend: Native },
    Route { sources: &[Html], targets: &[Txt, Csv, Xlsx], backend: Native },
    Route { sources: &[Pdf], targets: &[Txt, Html, Csv, Xlsx], backend: Native },
    Route { sources: IMAGES, targets: &[Pdf, Png, Jpg, Html, Docx], backend: Native },
    // Office suite
    Route {
        sources: &[Doc, Docx, Odt, Rtf, Xls, Xlsx, Ods, Ppt, Pptx, Odp, Txt, Html, Csv],
        targets: &[Pdf],
        backend: Office,
    },
    Route { sources: OFFICE, targets: &[Html], backend: Office },
    Route { sources: &[Doc, Docx, Odt, Rtf, Txt, Html], targets: WORD, backend: Office },
    Route { sources: &[Xls, Xlsx, Ods, Csv], targets: &[Xls, Xlsx, Ods, Csv], backend: Office },
    Route { sources: SLIDES, targets: SLIDES, backend: Office },
    Route { sources: &[Pdf], targets: &[Odt, Rtf, Docx], backend: Office },
    // HTML renderer
    Route { sources: &[Html, Md], targets: &[Pdf, Png, Jpg], backend: HtmlRender },
    // Remote API
    Route {
        sources: &[Txt, Csv, Md, Html, Rtf, Doc, Docx, Odt, Xls, Xlsx, Ods, Ppt, Pptx, Odp, Jpg, Png, Gif, Bmp, Tiff],
        targets: &[Pdf],
        backend: Remote,
    },
    Route {
        sources: &[Pdf],
        targets: &[Jpg, Png, Doc, Docx, Ppt, Pptx, Xls, Xlsx, Html, Txt, Csv, Odt, Rtf],
        backend: Remote,
    },
    Route { sources: IMAGES, targets: &[Txt, Docx], backend: Remote },
    Route { sources: WORD, targets: SLIDES, backend: Remote },
    Route { sources: SLIDES, targets: WORD, backend: Remote },
    Route { sources: SHEETS, targets: WORD, backend: Remote },
];

/// A supported pair and the backends that serve it, in try order.
#[derive(Debug, Clone, Serialize)]
pub struct Capability {
    pub source: Format,
    pub target: Format,
    pub backends: Vec<BackendKind>,
}

/// Read-only map from (source, target) to the ordered backend list.
/// Built once at startup and shared by every request.
#[derive(Debug, Clone)]
pub struct CapabilityTable {
    entries: HashMap<(Format, Format), Vec<BackendKind>>,
}

impl CapabilityTable {
    pub fn new(routes: &[Route], prefer_html_render: bool) -> Self {
        let mut entries: HashMap<(Format, Format), Vec<BackendKind>> = HashMap::new();

        for route in routes {
            for &source in route.sources {
                for &target in route.targets {
                    if source == target {
                        continue;
                    }
                    let backends = entries.entry((source, target)).or_default();
                    if !backends.contains(&route.backend) {
                        backends.push(route.backend);
                    }
                }
            }
        }

        for backends in entries.values_mut() {
            backends.sort_by_key(|kind| priority(*kind, prefer_html_render));
        }

        Self { entries }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(DEFAULT_ROUTES, config.prefer_html_render)
    }

    /// Ordered backends for the pair, or `Unsupported`.
    pub fn lookup(&self, source: Format, target: Format) -> Result<&[BackendKind], FailureKind> {
        if source == target {
            return Err(FailureKind::Unsupported);
        }
        self.entries
            .get(&(source, target))
            .filter(|backends| !backends.is_empty())
            .map(Vec::as_slice)
            .ok_or(FailureKind::Unsupported)
    }

    pub fn is_supported(&self, source: Format, target: Format) -> bool {
        self.lookup(source, target).is_ok()
    }

    /// Whether the format takes part in any declared pair.
    pub fn knows(&self, format: Format) -> bool {
        self.entries
            .keys()
            .any(|(source, target)| *source == format || *target == format)
    }

    /// Every format appearing in the table, sorted.
    pub fn supported_formats(&self) -> Vec<Format> {
        let formats: BTreeSet<Format> = self
            .entries
            .keys()
            .flat_map(|(source, target)| [*source, *target])
            .collect();
        formats.into_iter().collect()
    }

    /// Every supported pair, sorted by source then target.
    pub fn pairs(&self) -> Vec<Capability> {
        let mut pairs: Vec<Capability> = self
            .entries
            .iter()
            .map(|((source, target), backends)| Capability {
                source: *source,
                target: *target,
                backends: backends.clone(),
            })
            .collect();
        pairs.sort_by_key(|c| (c.source, c.target));
        pairs
    }
}

fn priority(kind: BackendKind, prefer_html_render: bool) -> u8 {
    match (kind, prefer_html_render) {
        (Native, _) => 0,
        (HtmlRender, true) | (Office, false) => 1,
        (Office, true) | (HtmlRender, false) => 2,
        (Remote, _) => 3,
    }
}
