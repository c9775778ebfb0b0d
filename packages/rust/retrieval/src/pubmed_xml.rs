//! `efetch` XML → [`RetrievedArticle`].
//!
//! The document is parsed with `scraper`'s lenient HTML parser, which
//! lowercases element and attribute names; selectors below are written in
//! lowercase accordingly.

use std::sync::LazyLock;

use horizon_shared::{PartialDate, RetrievedArticle};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::warn;

static MEDLINE_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d{4})(?:\s+([A-Za-z]{3}))?").expect("valid regex")
});

fn sel(css: &str) -> Selector {
    Selector::parse(css).expect("valid selector")
}

/// Parse every `PubmedArticle` in an efetch response. Records without a
/// title or without any dated element are dropped.
pub(crate) fn parse_articles(xml: &str) -> Vec<RetrievedArticle> {
    let doc = Html::parse_document(xml);
    let article_sel = sel("pubmedarticle");

    doc.select(&article_sel)
        .filter_map(|node| parse_article(node))
        .collect()
}

fn parse_article(node: ElementRef<'_>) -> Option<RetrievedArticle> {
    let title = first_text(node, "articletitle")?;
    if title.is_empty() {
        return None;
    }

    let pmid = first_text(node, "medlinecitation > pmid");
    let Some(publication_date) = publication_date(node) else {
        warn!(pmid = pmid.as_deref().unwrap_or(""), "dropping record without a publication year");
        return None;
    };
    let doi = first_text(node, r#"pubmeddata > articleidlist > articleid[idtype="doi"]"#)
        .or_else(|| first_text(node, r#"elocationid[eidtype="doi"]"#));

    Some(RetrievedArticle {
        title,
        authors: authors(node),
        abstract_text: abstract_text(node),
        journal: first_text(node, "journal > title"),
        publication_date,
        url: pmid
            .as_ref()
            .map(|id| format!("https://pubmed.ncbi.nlm.nih.gov/{id}/")),
        pmid,
        doi,
    })
}

/// Collapse whitespace in an element's text content.
fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(node: ElementRef<'_>, css: &str) -> Option<String> {
    node.select(&sel(css))
        .next()
        .map(element_text)
        .filter(|s| !s.is_empty())
}

fn authors(node: ElementRef<'_>) -> Vec<String> {
    let author_sel = sel("authorlist > author");
    node.select(&author_sel)
        .filter_map(|author| {
            if let Some(collective) = first_text(author, "collectivename") {
                return Some(collective);
            }
            let last = first_text(author, "lastname")?;
            match first_text(author, "initials") {
                Some(initials) => Some(format!("{last} {initials}")),
                None => Some(last),
            }
        })
        .collect()
}

/// Join structured abstract sections, prefixing each with its label.
fn abstract_text(node: ElementRef<'_>) -> Option<String> {
    let section_sel = sel("abstract > abstracttext");
    let sections: Vec<String> = node
        .select(&section_sel)
        .filter_map(|section| {
            let text = element_text(section);
            if text.is_empty() {
                return None;
            }
            match section.value().attr("label") {
                Some(label) if !label.is_empty() => Some(format!("{label}: {text}")),
                _ => Some(text),
            }
        })
        .collect();

    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

/// Journal issue date first, then the electronic and indexing dates.
/// `None` when no element carries a usable year.
fn publication_date(node: ElementRef<'_>) -> Option<PartialDate> {
    if let Some(date) = node.select(&sel("journalissue > pubdate")).next() {
        if let Some(parsed) = structured_date(date) {
            return Some(parsed);
        }

        // e.g. "2024 Jan-Feb" or "2023 Winter"
        if let Some(caps) = first_text(date, "medlinedate")
            .as_deref()
            .and_then(|medline| MEDLINE_DATE.captures(medline))
        {
            if let Some(year) = caps.get(1).and_then(|y| y.as_str().parse::<i32>().ok()) {
                let month = caps.get(2).and_then(|m| parse_month(m.as_str()));
                return Some(PartialDate::from_parts(year, month, None));
            }
        }
    }

    [
        "article > articledate",
        "medlinecitation > datecompleted",
        "medlinecitation > daterevised",
    ]
    .into_iter()
    .find_map(|css| node.select(&sel(css)).next().and_then(structured_date))
}

/// `<Year>`/`<Month>`/`<Day>` children of a date element.
fn structured_date(date: ElementRef<'_>) -> Option<PartialDate> {
    let year = first_text(date, "year").and_then(|y| y.parse::<i32>().ok())?;
    Some(PartialDate::from_parts(
        year,
        first_text(date, "month").and_then(|m| parse_month(&m)),
        first_text(date, "day").and_then(|d| d.parse::<u32>().ok()),
    ))
}

/// Month as number or English abbreviation/name.
fn parse_month(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<u32>() {
        return (1..=12).contains(&n).then_some(n);
    }
    let prefix: String = raw.chars().take(3).collect::<String>().to_lowercase();
    let month = match prefix.as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}
