//! Shared types, error model, and configuration for Knowledge Horizon.
//!
//! This crate is the foundation depended on by all other Horizon crates.
//! It provides:
//! - [`HorizonError`]: the unified error type
//! - Domain types ([`Execution`], [`WipArticle`], [`Report`], [`Association`])
//! - The immutable execution snapshot ([`ExecutionConfig`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod execution;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, OpenRouterConfig, PipelineConfig, PubMedConfig, config_dir,
    config_file_path, expand_home, init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{HorizonError, Result};
pub use execution::{
    BROAD_SEARCH_STRATEGY, Category, DateRange, EnrichmentPrompts, ExecutionConfig, LlmStage,
    PresentationConfig, PromptTemplate, QueryConfig, ResolvedStages, RetrievalConfig,
    SemanticFilterConfig, StageModelConfig, StageSettings, StreamConfig,
};
pub use types::{
    Article, Association, Execution, ExecutionStatus, PartialDate, Report,
    ReportArticle, RetrievedArticle, Stream, WipArticle, new_id,
};
