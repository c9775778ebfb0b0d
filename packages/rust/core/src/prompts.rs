//! Built-in prompt templates and `{placeholder}` rendering.
//!
//! Streams may override the summary prompts; the filter and categorization
//! prompts are fixed because their responses are parsed.

use std::sync::LazyLock;

use horizon_shared::{Article, PromptTemplate, WipArticle};
use regex::Regex;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").expect("valid regex"));

/// Replace `{name}` slots with the matching value. Unknown slots are kept
/// verbatim so literal braces in custom prompts survive.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value).to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

pub const FILTER_SYSTEM: &str = "You are screening biomedical literature for a research \
monitoring service. Judge how well an article matches the inclusion criteria. Respond \
with a JSON object: {\"score\": <number between 0 and 1>, \"reasoning\": \"<one or two sentences>\"}.";

pub const FILTER_USER: &str = "Inclusion criteria:\n{criteria}\n\n\
Title: {title}\nJournal: {journal}\nPublished: {publication_date}\n\nAbstract:\n{abstract}";

pub const CATEGORIZE_SYSTEM: &str = "You sort research articles into report sections. \
Pick exactly one category from the list. Respond with the category id only.";

pub const CATEGORIZE_USER: &str = "Categories:\n{categories}\n\n\
Title: {title}\n\nSummary:\n{summary}";

pub fn article_summary() -> PromptTemplate {
    PromptTemplate {
        system_prompt: "You write concise summaries of biomedical research articles for \
busy clinicians and researchers. Use plain language, state the study design, the main \
finding, and its significance in at most four sentences."
            .into(),
        user_prompt_template: "Title: {title}\nAuthors: {authors}\nJournal: {journal}\n\
Published: {publication_date}\n\nAbstract:\n{abstract}"
            .into(),
    }
}

pub fn category_summary() -> PromptTemplate {
    PromptTemplate {
        system_prompt: "You write one section of a literature monitoring report. Synthesize \
the articles into a short narrative that highlights common themes, notable results, and \
disagreements. Do not list the articles one by one."
            .into(),
        user_prompt_template: "Section: {category_name}\nTopics: {category_topics}\n\n\
Articles ({article_count}):\n{articles}"
            .into(),
    }
}

pub fn executive_summary() -> PromptTemplate {
    PromptTemplate {
        system_prompt: "You write the executive summary of a literature monitoring report. \
In one or two paragraphs, tell the reader what happened in the field this period and why \
it matters."
            .into(),
        user_prompt_template: "Report: {report_name}\nArticles included: {article_count}\n\n\
Section summaries:\n{category_summaries}\n\nArticles:\n{articles}"
            .into(),
    }
}

/// Template variables describing one article.
pub fn article_vars<'a>(article: &'a ArticleFields<'a>) -> [(&'static str, &'a str); 6] {
    [
        ("title", article.title),
        ("authors", article.authors.as_str()),
        ("journal", article.journal),
        ("publication_date", article.publication_date.as_str()),
        ("abstract", article.abstract_text),
        ("summary", article.summary),
    ]
}

/// Borrowed article fields prepared for rendering.
pub struct ArticleFields<'a> {
    pub title: &'a str,
    pub authors: String,
    pub journal: &'a str,
    pub publication_date: String,
    pub abstract_text: &'a str,
    pub summary: &'a str,
}

impl<'a> ArticleFields<'a> {
    pub fn new(
        title: &'a str,
        authors: &[String],
        journal: Option<&'a str>,
        publication_date: String,
        abstract_text: Option<&'a str>,
        summary: Option<&'a str>,
    ) -> Self {
        Self {
            title,
            authors: format_authors(authors),
            journal: journal.unwrap_or("unknown"),
            publication_date,
            abstract_text: abstract_text.unwrap_or(""),
            summary: summary.unwrap_or(""),
        }
    }

    pub fn from_article(article: &'a Article, summary: Option<&'a str>) -> Self {
        Self::new(
            &article.title,
            &article.authors,
            article.journal.as_deref(),
            article.publication_date.to_string(),
            article.abstract_text.as_deref(),
            summary,
        )
    }

    pub fn from_wip(article: &'a WipArticle) -> Self {
        Self::new(
            &article.title,
            &article.authors,
            article.journal.as_deref(),
            article.publication_date.to_string(),
            article.abstract_text.as_deref(),
            None,
        )
    }
}

/// "A, B, C et al." for long author lists.
fn format_authors(authors: &[String]) -> String {
    match authors.len() {
        0 => "unknown".into(),
        1..=3 => authors.join(", "),
        _ => format!("{} et al.", authors[..3].join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_fills_known_and_keeps_unknown() {
        let out = render(
            "Score {title} against {criteria}. Reply as {json}.",
            &[("title", "MC4R trial"), ("criteria", "human studies")],
        );
        assert_eq!(out, "Score MC4R trial against human studies. Reply as {json}.");
    }

    #[test]
    fn render_leaves_json_examples_alone() {
        let out = render(r#"{"score": 0.5}"#, &[("score", "x")]);
        assert_eq!(out, r#"{"score": 0.5}"#);
    }

    #[test]
    fn author_list_truncates() {
        let authors: Vec<String> = ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect();
        assert_eq!(format_authors(&authors), "A, B, C et al.");
        assert_eq!(format_authors(&authors[..2]), "A, B");
        assert_eq!(format_authors(&[]), "unknown");
    }

    #[test]
    fn article_fields_default_missing_parts() {
        let fields = ArticleFields::new("T", &[], None, String::new(), None, Some("short"));
        let vars = article_vars(&fields);
        let rendered = render("{title}|{journal}|{abstract}|{summary}", &vars);
        assert_eq!(rendered, "T|unknown||short");
    }
}
