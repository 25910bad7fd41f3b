//! Paper metadata as delivered by the listing service.
//!
//! A [`PaperRecord`] is created by a [`PaperSource`](crate::source::PaperSource) during a run and
//! is never mutated afterwards. The parts of it the report needs are persisted alongside each
//! analysis so a report can be regenerated without re-fetching.
//!
//! # Examples
//!
//! ```
//! use digester::paper::normalize_arxiv_id;
//!
//! assert_eq!(normalize_arxiv_id("http://arxiv.org/abs/2401.01234v2").as_deref(), Some("2401.01234"));
//! assert_eq!(normalize_arxiv_id("hep-th/9901001v1").as_deref(), Some("hep-th/9901001"));
//! assert_eq!(normalize_arxiv_id("not an id"), None);
//! ```

use super::*;

lazy_static! {
  /// New-style (`2401.01234`) or old-style (`cs.AI/0101001`) arXiv identifiers with an optional
  /// version suffix.
  static ref ARXIV_ID: Regex =
    Regex::new(r"(?x)((?:\d{4}\.\d{4,5})|(?:[a-z\-]+(?:\.[A-Z]{2})?/\d{7}))(?:v\d+)?$")
      .expect("arXiv id pattern is valid");
}

/// Metadata for a single candidate paper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperRecord {
  /// arXiv identifier without version suffix, unique and stable across runs
  pub id:              String,
  /// Title with whitespace collapsed
  pub title:           String,
  /// Abstract with whitespace collapsed
  pub abstract_text:   String,
  /// Author names in listing order
  pub authors:         Vec<String>,
  /// Source-assigned topic tags such as `cs.CL`
  pub tags:            Vec<String>,
  /// Direct PDF location if known
  pub pdf_url:         Option<String>,
  /// Abstract page
  pub abs_url:         String,
  /// First publication time
  pub published:       DateTime<Utc>,
  /// Longest pre-filter keyword found in the title, when the keyword filter is active
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub matched_keyword: Option<String>,
}

impl PaperRecord {
  /// Comma separated author list, shortened with "et al." past `limit` names.
  pub fn authors_line(&self, limit: usize) -> String {
    if limit > 0 && self.authors.len() > limit {
      format!("{} et al.", self.authors[..limit].join(", "))
    } else {
      self.authors.join(", ")
    }
  }

  /// The PDF location, falling back to the canonical arXiv URL for the identifier.
  pub fn pdf_location(&self) -> String {
    self.pdf_url.clone().unwrap_or_else(|| format!("https://arxiv.org/pdf/{}", self.id))
  }

  /// File name used when storing this paper's PDF.
  pub fn pdf_filename(&self) -> PathBuf {
    PathBuf::from(format!("{}.pdf", format::sanitize_filename(&self.id)))
  }
}

/// Whole-word, case-insensitive keyword search over paper titles.
///
/// Keyword edges that are ASCII letters or digits must sit on a word boundary, and a trailing
/// plural `s`/`es` is accepted, so `agent` finds "Agents" while `RL` does not fire on "world".
#[derive(Debug, Clone, Default)]
pub struct KeywordMatcher {
  /// Keyword and its compiled pattern, longest keyword first
  patterns: Vec<(String, Regex)>,
}

impl KeywordMatcher {
  /// Compiles `keywords`, skipping blank ones.
  pub fn new(keywords: &[String]) -> Self {
    let mut patterns: Vec<(String, Regex)> = keywords
      .iter()
      .map(|k| k.trim())
      .filter(|k| !k.is_empty())
      .filter_map(|keyword| match Regex::new(&keyword_pattern(keyword)) {
        Ok(regex) => Some((keyword.to_string(), regex)),
        Err(e) => {
          warn!("Ignoring keyword {keyword:?}: {e}");
          None
        },
      })
      .collect();
    patterns.sort_by_key(|(keyword, _)| std::cmp::Reverse(keyword.chars().count()));
    Self { patterns }
  }

  /// Whether no keywords are configured, in which case every paper passes.
  pub fn is_empty(&self) -> bool { self.patterns.is_empty() }

  /// The longest keyword occurring in `title`.
  pub fn best_match(&self, title: &str) -> Option<&str> {
    self.patterns.iter().find(|(_, regex)| regex.is_match(title)).map(|(keyword, _)| keyword.as_str())
  }
}

/// `(?i)\bkeyword(?:s|es)?\b`, with boundaries only on ASCII alphanumeric edges.
fn keyword_pattern(keyword: &str) -> String {
  let starts_word = keyword.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
  let ends_word = keyword.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
  format!(
    "(?i){}{}{}",
    if starts_word { r"\b" } else { "" },
    regex::escape(keyword),
    if ends_word { r"(?:s|es)?\b" } else { "" }
  )
}

/// Extracts a bare arXiv identifier from an id, abs/pdf URL or Atom `<id>` value.
pub fn normalize_arxiv_id(raw: &str) -> Option<String> {
  let trimmed = raw.trim().trim_end_matches(".pdf").trim_end_matches('/');
  ARXIV_ID.captures(trimmed).and_then(|c| c.get(1)).map(|m| m.as_str().to_string())
}
