//! Fakes and fixtures for pipeline tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::StreamExt;
use horizon_llm::{CompletionRequest, LanguageModel};
use horizon_retrieval::{ArticleSource, SearchOutcome, SourceRegistry};
use horizon_shared::{
    DateRange, ExecutionConfig, PartialDate, PipelineConfig, QueryConfig, Result,
    RetrievalConfig, RetrievedArticle, SemanticFilterConfig, StreamConfig,
};
use horizon_storage::Storage;

use crate::events::PipelineEvent;
use crate::pipeline::PipelineService;

/// Returns the same articles for every query.
pub(crate) struct StaticSource {
    pub articles: Vec<RetrievedArticle>,
}

#[async_trait]
impl ArticleSource for StaticSource {
    fn id(&self) -> &str {
        "pubmed"
    }

    async fn search(&self, _query: &str, _range: &DateRange, max_results: usize) -> Result<SearchOutcome> {
        Ok(SearchOutcome {
            articles: self.articles.iter().take(max_results).cloned().collect(),
            total_available: self.articles.len(),
        })
    }
}

type Respond = dyn Fn(&CompletionRequest) -> Result<String> + Send + Sync;

/// Answers every request through a test-supplied closure.
pub(crate) struct ScriptedModel {
    respond: Box<Respond>,
    delay: Duration,
}

impl ScriptedModel {
    pub fn new(respond: impl Fn(&CompletionRequest) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.respond)(&request)
    }
}

/// Value of a `Label: value` line in a rendered prompt.
pub(crate) fn field<'a>(prompt: &'a str, label: &str) -> &'a str {
    let prefix = format!("{label}: ");
    prompt
        .lines()
        .find_map(|line| line.strip_prefix(prefix.as_str()))
        .unwrap_or("")
}

pub(crate) async fn temp_storage() -> Arc<Storage> {
    let path = std::env::temp_dir().join(format!("kh_core_test_{}.db", uuid::Uuid::now_v7()));
    Arc::new(Storage::open(&path).await.expect("open test db"))
}

pub(crate) fn article(title: &str, doi: Option<&str>, abstract_text: Option<&str>) -> RetrievedArticle {
    RetrievedArticle {
        title: title.into(),
        authors: vec!["Doe J".into(), "Roe R".into()],
        abstract_text: abstract_text.map(Into::into),
        journal: Some("Obesity Reviews".into()),
        publication_date: PartialDate::from_parts(2025, Some(1), Some(3)),
        pmid: None,
        doi: doi.map(Into::into),
        url: None,
    }
}

pub(crate) fn stream_config(filter: SemanticFilterConfig) -> StreamConfig {
    StreamConfig {
        retrieval: RetrievalConfig {
            queries: vec![QueryConfig {
                query_id: "q1".into(),
                query_expression: "setmelanotide OR mc4r".into(),
                source: "pubmed".into(),
                semantic_filter: filter,
            }],
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) fn week() -> DateRange {
    DateRange::new(
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(),
    )
    .unwrap()
}

pub(crate) fn service(
    storage: Arc<Storage>,
    articles: Vec<RetrievedArticle>,
    model: ScriptedModel,
) -> PipelineService {
    service_with(
        storage,
        articles,
        model,
        PipelineConfig {
            progress_interval: 2,
            ..Default::default()
        },
    )
}

pub(crate) fn service_with(
    storage: Arc<Storage>,
    articles: Vec<RetrievedArticle>,
    model: ScriptedModel,
    settings: PipelineConfig,
) -> PipelineService {
    let mut sources = SourceRegistry::new();
    sources.register(Arc::new(StaticSource { articles }));
    PipelineService::new(storage, Arc::new(sources), Arc::new(model), settings, "test/model")
}

/// Insert a stream and one pending execution of it.
pub(crate) async fn pending_execution(storage: &Storage, config: &StreamConfig) -> (String, String) {
    let stream = storage
        .insert_stream("MC4R obesity", "user-1", config)
        .await
        .expect("insert stream");
    let execution = storage
        .create_execution(&stream.id, "user-1", &ExecutionConfig::snapshot(config, week(), None))
        .await
        .expect("create execution");
    (stream.id, execution.id)
}

pub(crate) async fn run(service: &PipelineService, execution_id: &str) -> Vec<Result<PipelineEvent>> {
    service.run_pipeline(execution_id).collect().await
}
