use crate::converter::{ConversionEngine, ConversionRequest};
use crate::engines::ConvertOptions;
use crate::error::{AppError, Result};
use crate::formats::Format;
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Multipart framing overhead allowed on top of the file size limit.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

const BACKEND_HEADER: &str = "x-docrelay-backend";
const ATTEMPTS_HEADER: &str = "x-docrelay-attempts";

pub struct AppState {
    pub engine: ConversionEngine,
}

/// Build the HTTP application around `engine`.
pub fn app(engine: ConversionEngine) -> Router {
    let body_limit = engine.config().max_file_size + MULTIPART_OVERHEAD;
    let state = Arc::new(AppState { engine });

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/convert", post(convert_handler))
        .route("/health", get(health_handler))
        .route("/capabilities", get(capabilities_handler))
        .route("/info", get(info_handler))
        .route("/", get(info_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state)
}

/// Conversion endpoint. The source format comes from `source_format` or the
/// uploaded file's extension; the target from `format`.
pub async fn convert_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Response> {
    let mut file_data: Option<(String, Bytes)> = None;
    let mut target: Option<Format> = None;
    let mut source: Option<Format> = None;
    let mut options = ConvertOptions::default();

    // Parse multipart form data
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError::InvalidRequest(format!("Failed to parse multipart data: {}", e))
    })? {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let data = field.bytes().await.map_err(|e| {
                    AppError::InvalidRequest(format!("Failed to read file data: {}", e))
                })?;

                info!("Received file: {} ({} bytes)", filename, data.len());
                file_data = Some((filename, data));
            }
            "format" => target = Some(parse_format(&text(field).await?)?),
            "source_format" => source = Some(parse_format(&text(field).await?)?),
            "landscape" => options.landscape = is_truthy(&text(field).await?),
            "printBackground" => options.print_background = is_truthy(&text(field).await?),
            "pageWidth" => options.page_width = Some(text(field).await?),
            "pageHeight" => options.page_height = Some(text(field).await?),
            _ => {
                // Ignore unknown fields
            }
        }
    }

    let (filename, data) = file_data.ok_or(AppError::NoFileProvided)?;
    let target = target
        .ok_or_else(|| AppError::InvalidRequest("Missing target format field 'format'".to_string()))?;
    let source = match source {
        Some(format) => format,
        None => Format::from_path(Path::new(&filename))
            .map_err(|e| AppError::InvalidRequest(format!("Cannot detect source format: {}", e)))?,
    };

    let request = ConversionRequest::new(data, source, target).with_options(options);
    let converted = state.engine.convert(&request).await?;

    let stem = Path::new(&filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("converted");

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, converted.content_type()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", converted.filename(stem)),
            ),
            (HeaderName::from_static(BACKEND_HEADER), converted.backend.to_string()),
            (
                HeaderName::from_static(ATTEMPTS_HEADER),
                converted.attempts.len().to_string(),
            ),
        ],
        converted.data,
    )
        .into_response())
}

async fn text(field: axum::extract::multipart::Field<'_>) -> Result<String> {
    field
        .text()
        .await
        .map(|s| s.trim().to_string())
        .map_err(|e| AppError::InvalidRequest(format!("Failed to read form field: {}", e)))
}

fn parse_format(value: &str) -> Result<Format> {
    value
        .parse()
        .map_err(|e| AppError::InvalidRequest(format!("{}", e)))
}

fn is_truthy(value: &str) -> bool {
    value == "true" || value == "1"
}

/// Readiness check: 503 until the native backend is operational.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.engine.readiness().await;
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if readiness.ready { "healthy" } else { "unavailable" },
            "service": "docrelay",
            "backends": readiness.backends,
        })),
    )
}

pub async fn capabilities_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "pairs": state.engine.table().pairs() }))
}

/// Information endpoint - lists supported formats
pub async fn info_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let formats: Vec<&str> = state
        .engine
        .table()
        .supported_formats()
        .into_iter()
        .map(Format::extension)
        .collect();

    Json(json!({
        "service": "docrelay",
        "version": env!("CARGO_PKG_VERSION"),
        "supported_formats": formats,
        "max_file_size": state.engine.config().max_file_size,
        "endpoints": {
            "convert": {
                "path": "/convert",
                "method": "POST",
                "description": "Convert a file to the requested format. Backends are tried in preference order until one succeeds.",
                "content_type": "multipart/form-data",
                "fields": {
                    "file": "The file to convert (required)",
                    "format": "Target format, e.g. 'pdf', 'xlsx' (required)",
                    "source_format": "Source format (optional, defaults to the file extension)",
                    "landscape": "Boolean - use landscape orientation (optional)",
                    "printBackground": "Boolean - print background graphics (optional, HTML only)",
                    "pageWidth": "Page width (optional, e.g., '8.5in', '210mm')",
                    "pageHeight": "Page height (optional, e.g., '11in', '297mm')"
                }
            },
            "health": {
                "path": "/health",
                "method": "GET",
                "description": "Readiness check with per-backend status"
            },
            "capabilities": {
                "path": "/capabilities",
                "method": "GET",
                "description": "Every supported conversion pair and its backend order"
            },
            "info": {
                "path": "/info",
                "method": "GET",
                "description": "Service information and supported formats"
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values() {
        assert!(is_truthy("true"));
        assert!(is_truthy("1"));
        assert!(!is_truthy("yes"));
    }

    #[test]
    fn format_field_accepts_aliases() {
        assert_eq!(parse_format("jpeg").unwrap(), Format::Jpg);
        assert!(matches!(parse_format("exe"), Err(AppError::InvalidRequest(_))));
    }
}
