//! arXiv export API adapter.
//!
//! Queries `export.arxiv.org/api/query` by category and submission date, newest first, and
//! decodes the Atom response with `quick-xml`'s serde support.

use url::Url;

use super::*;

/// Atom feed, reduced to its entries.
#[derive(Debug, Deserialize)]
struct Feed {
  /// Result entries
  #[serde(rename = "entry", default)]
  entries: Vec<Entry>,
}

/// One Atom entry.
#[derive(Debug, Deserialize)]
struct Entry {
  /// Abstract page URL with version, or an error URL
  id:         String,
  /// Title, possibly wrapped over several lines
  #[serde(default)]
  title:      String,
  /// Abstract
  #[serde(default)]
  summary:    String,
  /// First version timestamp, absent on error entries
  #[serde(default)]
  published:  Option<DateTime<Utc>>,
  /// Authors
  #[serde(rename = "author", default)]
  authors:    Vec<AtomAuthor>,
  /// Subject classifications
  #[serde(rename = "category", default)]
  categories: Vec<AtomCategory>,
  /// Abstract and PDF links
  #[serde(rename = "link", default)]
  links:      Vec<AtomLink>,
}

/// `<author>`.
#[derive(Debug, Deserialize)]
struct AtomAuthor {
  /// Display name
  name: String,
}

/// `<category term="..."/>`.
#[derive(Debug, Deserialize)]
struct AtomCategory {
  /// arXiv category such as `cs.AI`
  #[serde(rename = "@term")]
  term: String,
}

/// `<link href="..." rel="..." title="..."/>`.
#[derive(Debug, Deserialize)]
struct AtomLink {
  /// Target
  #[serde(rename = "@href")]
  href:  String,
  /// Relation, `alternate` for the abstract page
  #[serde(rename = "@rel", default)]
  rel:   Option<String>,
  /// `pdf` for the PDF link
  #[serde(rename = "@title", default)]
  title: Option<String>,
}

impl Entry {
  /// Whether this entry reports a query error instead of a paper.
  fn is_error(&self) -> bool { self.id.contains("/api/errors") }

  /// Converts the entry into a record.
  fn into_record(self) -> Result<PaperRecord> {
    let id = normalize_arxiv_id(&self.id)
      .ok_or_else(|| DigestError::Fetch(format!("unrecognised arXiv entry id {:?}", self.id)))?;
    let published = self
      .published
      .ok_or_else(|| DigestError::Fetch(format!("entry {id} has no publication date")))?;
    let pdf_url = self.links.iter().find(|l| l.title.as_deref() == Some("pdf")).map(|l| l.href.clone());
    let abs_url = self
      .links
      .iter()
      .find(|l| l.rel.as_deref() == Some("alternate"))
      .map(|l| l.href.clone())
      .unwrap_or_else(|| format!("https://arxiv.org/abs/{id}"));
    Ok(PaperRecord {
      title: format::collapse_whitespace(&self.title),
      abstract_text: format::collapse_whitespace(&self.summary),
      authors: self.authors.into_iter().map(|a| format::collapse_whitespace(&a.name)).collect(),
      tags: self.categories.into_iter().map(|c| c.term).collect(),
      pdf_url,
      abs_url,
      published,
      matched_keyword: None,
      id,
    })
  }
}

/// Lists new submissions through the arXiv export API.
#[derive(Debug, Clone)]
pub struct ArxivSource {
  /// HTTP client with the request timeout applied
  http:      reqwest::Client,
  /// Query endpoint
  endpoint:  Url,
  /// Entries per page
  page_size: usize,
}

impl ArxivSource {
  /// Creates an adapter for `endpoint`.
  pub fn new(endpoint: &str, page_size: usize, timeout: Duration) -> Result<Self> {
    let endpoint = Url::parse(endpoint)
      .map_err(|e| DigestError::Config(format!("source.endpoint {endpoint:?} is not a URL: {e}")))?;
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("digester/", env!("CARGO_PKG_VERSION")))
      .build()?;
    Ok(Self { http, endpoint, page_size: page_size.max(1) })
  }

  /// Creates an adapter from the `[source]` section.
  pub fn from_config(config: &crate::config::SourceConfig) -> Result<Self> {
    Self::new(&config.endpoint, config.page_size, Duration::from_secs(config.timeout_secs))
  }

  /// The `search_query` parameter for `query`.
  ///
  /// ```
  /// use chrono::NaiveDate;
  /// use digester::source::{ArxivSource, FetchQuery};
  ///
  /// let day = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
  /// let query = FetchQuery { categories: vec!["cs.AI".into(), "cs.CL".into()], ..FetchQuery::single_day(day) };
  /// assert_eq!(
  ///   ArxivSource::search_query(&query),
  ///   "(cat:cs.AI OR cat:cs.CL) AND submittedDate:[202401150000 TO 202401152359]"
  /// );
  /// ```
  pub fn search_query(query: &FetchQuery) -> String {
    let window = format!(
      "submittedDate:[{}0000 TO {}2359]",
      query.from.format("%Y%m%d"),
      query.to.format("%Y%m%d")
    );
    let categories: Vec<_> = query.categories.iter().map(|c| format!("cat:{}", c.trim())).collect();
    match categories.len() {
      0 => window,
      1 => format!("{} AND {window}", categories[0]),
      _ => format!("({}) AND {window}", categories.join(" OR ")),
    }
  }

  /// Decodes one Atom response.
  pub fn parse_feed(xml: &str) -> Result<Vec<PaperRecord>> {
    let feed: Feed = quick_xml::de::from_str(xml)
      .map_err(|e| DigestError::Fetch(format!("malformed arXiv feed: {e}")))?;
    if let Some(entry) = feed.entries.iter().find(|e| e.is_error()) {
      return Err(DigestError::Fetch(format!(
        "arXiv rejected the query: {}",
        format::collapse_whitespace(&entry.summary)
      )));
    }
    feed.entries.into_iter().map(Entry::into_record).collect()
  }
}

#[async_trait]
impl PaperSource for ArxivSource {
  async fn fetch_page(&self, query: &FetchQuery, offset: usize) -> Result<Page> {
    let mut url = self.endpoint.clone();
    url
      .query_pairs_mut()
      .append_pair("search_query", &Self::search_query(query))
      .append_pair("start", &offset.to_string())
      .append_pair("max_results", &self.page_size.to_string())
      .append_pair("sortBy", "submittedDate")
      .append_pair("sortOrder", "descending");
    debug!("GET {url}");

    let response = self.http.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
      return Err(DigestError::Api {
        status:  status.as_u16(),
        message: format!("arXiv listing returned {status}"),
      });
    }
    let body = response.text().await?;
    trace!("arXiv response: {} bytes", body.len());

    let records = Self::parse_feed(&body)?;
    Ok(Page { exhausted: records.len() < self.page_size, records })
  }
}

#[cfg(test)]
mod tests {
  use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
  };

  use super::*;

  const FEED: &str = include_str!("../../tests/fixtures/arxiv_feed.xml");
  const ERROR_FEED: &str = include_str!("../../tests/fixtures/arxiv_error.xml");

  #[test]
  fn test_parse_feed() {
    let records = ArxivSource::parse_feed(FEED).unwrap();
    assert_eq!(records.len(), 2);

    let first = &records[0];
    assert_eq!(first.id, "2401.08001");
    assert_eq!(first.title, "Self-Refining Agents: Planning with Large Language Models");
    assert_eq!(
      first.abstract_text,
      "We present a planning agent built on a large language model that refines its own plans. \
       Experiments show strong gains."
    );
    assert_eq!(first.authors, ["Ada Lovelace", "Alan Turing"]);
    assert_eq!(first.tags, ["cs.AI", "cs.CL"]);
    assert_eq!(first.pdf_url.as_deref(), Some("http://arxiv.org/pdf/2401.08001v2"));
    assert_eq!(first.abs_url, "http://arxiv.org/abs/2401.08001v2");
    assert_eq!(first.published.to_rfc3339(), "2024-01-15T18:59:59+00:00");

    assert_eq!(records[1].pdf_url, None);
    assert_eq!(records[1].pdf_location(), "https://arxiv.org/pdf/2401.08002");
  }

  #[test]
  fn test_error_entry_is_fetch_error() {
    let err = ArxivSource::parse_feed(ERROR_FEED).unwrap_err();
    assert!(matches!(err, DigestError::Fetch(ref msg) if msg.contains("unbalanced parentheses")));
  }

  #[test]
  fn test_garbage_is_fetch_error() {
    let truncated = "<feed><entry><id>http://arxiv.org/abs/2401.1</id></feed>";
    assert!(matches!(ArxivSource::parse_feed(truncated), Err(DigestError::Fetch(_))));
  }

  #[test]
  fn test_empty_feed_has_no_records() {
    let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom"><title>none</title></feed>"#;
    assert!(ArxivSource::parse_feed(xml).unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_fetch_page_sends_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/query"))
      .and(query_param("start", "0"))
      .and(query_param("max_results", "2"))
      .and(query_param("search_query", "cat:cs.AI AND submittedDate:[202401150000 TO 202401152359]"))
      .respond_with(ResponseTemplate::new(200).set_body_string(FEED))
      .expect(1)
      .mount(&server)
      .await;

    let source =
      ArxivSource::new(&format!("{}/api/query", server.uri()), 2, Duration::from_secs(5)).unwrap();
    let query = FetchQuery {
      categories: vec!["cs.AI".into()],
      ..FetchQuery::single_day(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap())
    };
    let page = source.fetch_page(&query, 0).await.unwrap();
    assert_eq!(page.records.len(), 2);
    assert!(!page.exhausted);
  }

  #[tokio::test]
  async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

    let source = ArxivSource::new(&server.uri(), 10, Duration::from_secs(5)).unwrap();
    let err = source.fetch_page(&FetchQuery::single_day(Utc::now().date_naive()), 0).await.unwrap_err();
    assert!(err.is_transient());
  }
}
