//! PubMed E-utilities source: `esearch` for ids, `efetch` for records.

use async_trait::async_trait;
use horizon_shared::{DateRange, HorizonError, PubMedConfig, Result};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::{ArticleSource, SearchOutcome, pubmed_xml};

pub const PUBMED_SOURCE_ID: &str = "pubmed";

/// User-Agent string for E-utilities requests.
const USER_AGENT: &str = concat!("KnowledgeHorizon/", env!("CARGO_PKG_VERSION"));

/// Ids per `efetch` request; keeps request URLs bounded.
const EFETCH_BATCH: usize = 200;

/// PubMed search via NCBI E-utilities.
pub struct PubMedSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl PubMedSource {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| HorizonError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Build from the `[pubmed]` config section, reading the API key env var if set.
    pub fn from_config(config: &PubMedConfig) -> Result<Self> {
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty());
        Self::new(&config.base_url, config.timeout_secs, api_key)
    }

    async fn esearch(
        &self,
        query: &str,
        range: &DateRange,
        max_results: usize,
    ) -> Result<ESearchResult> {
        let url = format!("{}/esearch.fcgi", self.base_url);
        let mindate = range.start.format("%Y/%m/%d").to_string();
        let maxdate = range.end.format("%Y/%m/%d").to_string();
        let retmax = max_results.to_string();

        let mut params = vec![
            ("db", "pubmed"),
            ("term", query),
            ("retmode", "json"),
            ("retmax", retmax.as_str()),
            ("datetype", "pdat"),
            ("mindate", mindate.as_str()),
            ("maxdate", maxdate.as_str()),
            ("sort", "relevance"),
        ];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.as_str()));
        }

        let body = self.get_text(&url, &params).await?;
        let parsed: ESearchResponse = serde_json::from_str(&body)
            .map_err(|e| HorizonError::parse(format!("esearch response: {e}")))?;
        Ok(parsed.esearchresult)
    }

    async fn efetch(&self, ids: &[String]) -> Result<String> {
        let url = format!("{}/efetch.fcgi", self.base_url);
        let id_list = ids.join(",");

        let mut params = vec![
            ("db", "pubmed"),
            ("id", id_list.as_str()),
            ("retmode", "xml"),
            ("rettype", "abstract"),
        ];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.as_str()));
        }

        self.get_text(&url, &params).await
    }

    async fn get_text(&self, url: &str, params: &[(&str, &str)]) -> Result<String> {
        let response = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|e| HorizonError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HorizonError::Network(format!("{url}: HTTP {status}")));
        }

        response
            .text()
            .await
            .map_err(|e| HorizonError::Network(format!("{url}: failed to read body: {e}")))
    }
}

#[async_trait]
impl ArticleSource for PubMedSource {
    fn id(&self) -> &str {
        PUBMED_SOURCE_ID
    }

    #[instrument(skip_all, fields(query = %query, max_results))]
    async fn search(
        &self,
        query: &str,
        range: &DateRange,
        max_results: usize,
    ) -> Result<SearchOutcome> {
        if max_results == 0 {
            return Ok(SearchOutcome::default());
        }

        let found = self.esearch(query, range, max_results).await?;
        let total_available = found.count.parse::<usize>().unwrap_or(found.idlist.len());
        let ids: Vec<String> = found.idlist.into_iter().take(max_results).collect();
        debug!(total_available, ids = ids.len(), "esearch complete");

        let mut articles = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(EFETCH_BATCH) {
            let xml = self.efetch(chunk).await?;
            articles.extend(pubmed_xml::parse_articles(&xml));
        }

        info!(
            fetched = articles.len(),
            total_available, "pubmed search complete"
        );
        Ok(SearchOutcome {
            articles,
            total_available,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ESearchResponse {
    esearchresult: ESearchResult,
}

#[derive(Debug, Deserialize)]
struct ESearchResult {
    #[serde(default)]
    count: String,
    #[serde(default)]
    idlist: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const EFETCH_XML: &str = r#"<?xml version="1.0" ?>
<!DOCTYPE PubmedArticleSet PUBLIC "-//NLM//DTD PubMedArticle, 1st January 2024//EN" "https://dtd.nlm.nih.gov/ncbi/pubmed/out/pubmed_240101.dtd">
<PubmedArticleSet>
<PubmedArticle>
  <MedlineCitation Status="MEDLINE" Owner="NLM">
    <PMID Version="1">38000001</PMID>
    <Article PubModel="Print">
      <Journal>
        <JournalIssue CitedMedium="Internet">
          <PubDate><Year>2025</Year><Month>Jan</Month></PubDate>
        </JournalIssue>
        <Title>Obesity Reviews</Title>
      </Journal>
      <ArticleTitle>Setmelanotide in hypothalamic obesity.</ArticleTitle>
      <Abstract><AbstractText>Results were positive.</AbstractText></Abstract>
      <AuthorList>
        <Author><LastName>Smith</LastName><Initials>AB</Initials></Author>
      </AuthorList>
    </Article>
  </MedlineCitation>
  <PubmedData>
    <ArticleIdList>
      <ArticleId IdType="pubmed">38000001</ArticleId>
      <ArticleId IdType="doi">10.1111/obr.1</ArticleId>
    </ArticleIdList>
  </PubmedData>
</PubmedArticle>
</PubmedArticleSet>"#;

    fn week() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn search_fetches_and_parses() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .and(query_param("term", "setmelanotide"))
            .and(query_param("mindate", "2025/01/01"))
            .and(query_param("maxdate", "2025/01/07"))
            .and(query_param("retmax", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"esearchresult":{"count":"3","retmax":"1","idlist":["38000001"]}}"#,
            ))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/efetch.fcgi"))
            .and(query_param("id", "38000001"))
            .respond_with(ResponseTemplate::new(200).set_body_string(EFETCH_XML))
            .mount(&server)
            .await;

        let source = PubMedSource::new(server.uri(), 5, None).unwrap();
        let outcome = source.search("setmelanotide", &week(), 50).await.unwrap();

        assert_eq!(outcome.total_available, 3);
        assert_eq!(outcome.articles.len(), 1);
        let article = &outcome.articles[0];
        assert_eq!(article.pmid.as_deref(), Some("38000001"));
        assert_eq!(article.doi.as_deref(), Some("10.1111/obr.1"));
        assert_eq!(article.publication_date.to_string(), "2025-01");
    }

    #[tokio::test]
    async fn empty_search_is_not_an_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"esearchresult":{"count":"0","idlist":[]}}"#,
            ))
            .mount(&server)
            .await;

        let source = PubMedSource::new(server.uri(), 5, None).unwrap();
        let outcome = source.search("nothing", &week(), 10).await.unwrap();
        assert!(outcome.articles.is_empty());
        assert_eq!(outcome.total_available, 0);
    }

    #[tokio::test]
    async fn http_failure_is_network_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let source = PubMedSource::new(server.uri(), 5, None).unwrap();
        let err = source.search("anything", &week(), 10).await.unwrap_err();
        assert_eq!(err.kind(), "NetworkError");
    }
}
