//! Import pipeline: fetch an uploaded file, split it into records, validate
//! each record and persist the valid ones as content posts.

pub mod config;
pub mod content;
pub mod fetch;
pub mod parser;
pub mod pipeline;
pub mod validate;

pub use config::{FetchLimits, PipelineConfig};
pub use content::{ContentStore, ContentStoreError, CreateOutcome, PgContentStore};
pub use fetch::{FetchError, FileFetcher, HttpFetcher};
pub use parser::{ParseError, ParseOptions};
pub use pipeline::{ImportPipeline, ImportReport, PipelineError, PipelineFailure, row_key};
pub use validate::{Category, NewContentPost, PostStatus, RowFailure};
