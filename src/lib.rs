//! # docrelay
//!
//! Document conversion with backend fallback.
//!
//! A request names a source and target [`Format`]. The [`CapabilityTable`]
//! lists, per pair, the backends able to serve it in preference order:
//! in-process converters, a headless office suite, a headless browser, and a
//! remote conversion API. [`ConversionEngine`] tries them in that order until
//! one succeeds, inside a private working area that never outlives the call.
//!
//! ```no_run
//! use docrelay::{ConversionEngine, ConversionRequest, EngineConfig, Format};
//!
//! # async fn demo() -> Result<(), docrelay::ConversionError> {
//! let engine = ConversionEngine::new(EngineConfig::from_env());
//! let request = ConversionRequest::new(&b"hello,1\nworld,2"[..], Format::Csv, Format::Xlsx);
//! let converted = engine.convert(&request).await?;
//! println!("{} bytes from {}", converted.data.len(), converted.backend);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod converter;
pub mod engines;
pub mod error;
pub mod formats;
pub mod handlers;
pub mod health;
pub mod router;
pub mod workspace;

pub use config::EngineConfig;
pub use converter::{ConversionEngine, ConversionRequest, Converted, Readiness};
pub use engines::{Attempt, BackendKind, Backends, ConvertBackend, ConvertOptions};
pub use error::{AppError, BackendAttempt, BackendError, ConversionError, FailureKind};
pub use formats::Format;
pub use health::BackendHealthRegistry;
pub use router::CapabilityTable;
pub use workspace::{WorkingArea, Workspace};
