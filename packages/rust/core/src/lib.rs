//! Pipeline orchestration and domain logic for Knowledge Horizon.
//!
//! [`PipelineService`] drives an execution from retrieval to a finished,
//! enriched report and streams [`PipelineEvent`]s while it works. The
//! [`curation`] functions apply curator overrides afterwards.

pub mod context;
pub mod curation;
pub mod dedup;
mod enrichment;
pub mod events;
mod filter;
pub mod materialize;
pub mod pipeline;
pub mod progress;
pub mod prompts;
mod retrieve;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{FilterTotals, PipelineContext, StageStats};
pub use enrichment::{match_category, parse_stance};
pub use events::{PipelineEvent, PipelineStage};
pub use pipeline::PipelineService;
pub use progress::{ProgressSink, Tracked, track_progress};
