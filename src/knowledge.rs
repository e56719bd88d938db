//! Short encyclopedia summaries for predicted answers.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://en.wikipedia.org/w/api.php";
pub const DEFAULT_SENTENCES: usize = 3;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("\"{title}\" may refer to: {}", .options.join(", "))]
    Disambiguation { title: String, options: Vec<String> },

    #[error("page \"{0}\" does not match any pages")]
    PageNotFound(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Malformed(String),
}

/// Source of short topic summaries.
pub trait KnowledgeBase {
    /// Returns a summary of the best page for `topic`.
    ///
    /// An ambiguous topic fails with [`KnowledgeError::Disambiguation`]
    /// carrying the candidate page titles.
    fn summary(&self, topic: &str) -> Result<String, KnowledgeError>;
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    query: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    search: Vec<SearchHit>,
    #[serde(default)]
    searchinfo: Option<SearchInfo>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    title: String,
}

#[derive(Debug, Deserialize)]
struct SearchInfo {
    suggestion: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PagesQuery {
    #[serde(default)]
    pages: Vec<Page>,
}

#[derive(Debug, Deserialize)]
struct Page {
    title: String,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    pageprops: HashMap<String, serde_json::Value>,
    extract: Option<String>,
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    title: String,
}

#[derive(Debug, PartialEq)]
enum PageKind {
    Article(String),
    Disambiguation(String),
    Missing,
}

/// Prefers the search suggestion, then the first hit.
fn pick_title(topic: &str, query: SearchQuery) -> Result<String, KnowledgeError> {
    query
        .searchinfo
        .and_then(|info| info.suggestion)
        .or_else(|| query.search.into_iter().next().map(|hit| hit.title))
        .ok_or_else(|| KnowledgeError::PageNotFound(topic.to_string()))
}

fn classify(page: &Page) -> PageKind {
    if page.missing || page.invalid {
        PageKind::Missing
    } else if page.pageprops.contains_key("disambiguation") {
        PageKind::Disambiguation(page.title.clone())
    } else {
        PageKind::Article(page.title.clone())
    }
}

fn first_page(query: PagesQuery) -> Result<Page, KnowledgeError> {
    query
        .pages
        .into_iter()
        .next()
        .ok_or_else(|| KnowledgeError::Malformed("no pages in response".to_string()))
}

/// Client for the MediaWiki action API.
pub struct Wikipedia {
    client: reqwest::blocking::Client,
    api_url: String,
    sentences: usize,
}

impl Wikipedia {
    pub fn new() -> Result<Self, KnowledgeError> {
        Self::with_api_url(DEFAULT_API_URL)
    }

    pub fn with_api_url(api_url: &str) -> Result<Self, KnowledgeError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(None::<Duration>)
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.to_string(),
            sentences: DEFAULT_SENTENCES,
        })
    }

    /// Number of sentences kept in each summary.
    pub fn with_sentences(mut self, sentences: usize) -> Self {
        self.sentences = sentences;
        self
    }

    fn query<T: DeserializeOwned + Default>(&self, params: &[(&str, &str)]) -> Result<T, KnowledgeError> {
        let mut all = vec![("action", "query"), ("format", "json"), ("formatversion", "2")];
        all.extend_from_slice(params);

        let response: ApiResponse<T> = self
            .client
            .get(&self.api_url)
            .query(&all)
            .send()?
            .error_for_status()?
            .json()?;
        Ok(response.query.unwrap_or_default())
    }

    fn resolve_title(&self, topic: &str) -> Result<String, KnowledgeError> {
        let query: SearchQuery = self.query(&[
            ("list", "search"),
            ("srsearch", topic),
            ("srlimit", "1"),
            ("srprop", ""),
            ("srinfo", "suggestion"),
        ])?;
        pick_title(topic, query)
    }

    fn page(&self, title: &str) -> Result<Page, KnowledgeError> {
        first_page(self.query(&[
            ("prop", "info|pageprops"),
            ("ppprop", "disambiguation"),
            ("redirects", "1"),
            ("titles", title),
        ])?)
    }

    fn links(&self, title: &str) -> Result<Vec<String>, KnowledgeError> {
        let page = first_page(self.query(&[
            ("prop", "links"),
            ("plnamespace", "0"),
            ("pllimit", "max"),
            ("titles", title),
        ])?)?;
        Ok(page.links.into_iter().map(|link| link.title).collect())
    }

    fn extract(&self, title: &str) -> Result<String, KnowledgeError> {
        let sentences = self.sentences.to_string();
        let page = first_page(self.query(&[
            ("prop", "extracts"),
            ("explaintext", "1"),
            ("exsentences", sentences.as_str()),
            ("titles", title),
        ])?)?;
        Ok(page.extract.unwrap_or_default())
    }
}

impl KnowledgeBase for Wikipedia {
    fn summary(&self, topic: &str) -> Result<String, KnowledgeError> {
        let title = self.resolve_title(topic)?;
        log::debug!("'{topic}' resolved to page '{title}'");

        match classify(&self.page(&title)?) {
            PageKind::Article(title) => self.extract(&title),
            PageKind::Disambiguation(title) => {
                let options = self.links(&title)?;
                Err(KnowledgeError::Disambiguation { title, options })
            }
            PageKind::Missing => Err(KnowledgeError::PageNotFound(title)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse<T: DeserializeOwned>(json: &str) -> T {
        let response: ApiResponse<T> = serde_json::from_str(json).unwrap();
        response.query.unwrap()
    }

    #[test]
    fn suggestion_wins_over_first_hit() {
        let query: SearchQuery = parse(
            r#"{"query":{"searchinfo":{"suggestion":"crane bird"},"search":[{"ns":0,"title":"Crane"}]}}"#,
        );
        assert_eq!(pick_title("crame", query).unwrap(), "crane bird");

        let query: SearchQuery = parse(r#"{"query":{"searchinfo":{},"search":[{"title":"Crane"}]}}"#);
        assert_eq!(pick_title("crane", query).unwrap(), "Crane");
    }

    #[test]
    fn no_hits_means_no_page() {
        let query: SearchQuery = parse(r#"{"query":{"searchinfo":{"totalhits":0},"search":[]}}"#);
        assert!(matches!(
            pick_title("zzzz (animal)", query),
            Err(KnowledgeError::PageNotFound(t)) if t == "zzzz (animal)"
        ));
    }

    #[test]
    fn pages_are_classified() {
        let query: PagesQuery = parse(
            r#"{"query":{"pages":[{"pageid":1,"ns":0,"title":"Crane","pageprops":{"disambiguation":""}}]}}"#,
        );
        assert_eq!(
            classify(&first_page(query).unwrap()),
            PageKind::Disambiguation("Crane".into())
        );

        let query: PagesQuery =
            parse(r#"{"query":{"pages":[{"ns":0,"title":"Blue jay","pageid":7}]}}"#);
        assert_eq!(
            classify(&first_page(query).unwrap()),
            PageKind::Article("Blue jay".into())
        );

        let query: PagesQuery =
            parse(r#"{"query":{"pages":[{"ns":0,"title":"Nope","missing":true}]}}"#);
        assert_eq!(classify(&first_page(query).unwrap()), PageKind::Missing);
    }

    #[test]
    fn disambiguation_message_lists_options() {
        let err = KnowledgeError::Disambiguation {
            title: "Crane".into(),
            options: vec!["Crane (bird)".into(), "Crane (machine)".into()],
        };
        assert_eq!(
            err.to_string(),
            "\"Crane\" may refer to: Crane (bird), Crane (machine)"
        );
    }
}
