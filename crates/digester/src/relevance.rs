//! Relevance triage: one classification call per candidate paper.
//!
//! The model is shown the paper's title and abstract together with every configured category and
//! asked to answer with a single category name, or `NONE`. The answer is mapped back onto the
//! taxonomy conservatively: anything that is not an exact (case-insensitive) category name drops
//! the paper. An empty answer, or a call that fails after retries, is a
//! [`DigestError::Classification`] for that paper only.

use super::*;
use crate::{llm::LanguageModel, retry::RetryPolicy};

/// One research category of the taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
  /// Display name, also the answer expected from the model
  pub name:        String,
  /// What belongs in this category
  #[serde(default)]
  pub description: String,
  /// Terms used by the source keyword pre-filter
  #[serde(default)]
  pub keywords:    Vec<String>,
}

/// The ordered list of categories; order is report display order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Taxonomy {
  /// Categories in display order
  categories: Vec<Category>,
}

impl Taxonomy {
  /// Wraps categories in display order.
  pub fn new(categories: Vec<Category>) -> Self { Self { categories } }

  /// Categories in display order.
  pub fn categories(&self) -> &[Category] { &self.categories }

  /// Display position of `name`, ignoring case.
  pub fn position(&self, name: &str) -> Option<usize> {
    self.categories.iter().position(|c| c.name.eq_ignore_ascii_case(name.trim()))
  }

  /// The configured spelling of `name`, ignoring case.
  pub fn canonical(&self, name: &str) -> Option<&str> {
    self.position(name).map(|i| self.categories[i].name.as_str())
  }
}

/// Keep/drop outcome for one paper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelevanceDecision {
  /// Paper the decision is about
  pub paper_id: String,
  /// Whether the paper goes on to analysis
  pub keep:     bool,
  /// Assigned category, present exactly when kept
  pub category: Option<String>,
}

impl RelevanceDecision {
  /// Keep the paper under `category`.
  pub fn keep(paper_id: impl Into<String>, category: impl Into<String>) -> Self {
    Self { paper_id: paper_id.into(), keep: true, category: Some(category.into()) }
  }

  /// Drop the paper.
  pub fn drop(paper_id: impl Into<String>) -> Self {
    Self { paper_id: paper_id.into(), keep: false, category: None }
  }
}

/// How a model answer maps onto the taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
  /// Names a configured category
  Category(String),
  /// Explicitly out of scope
  Irrelevant,
  /// Does not map cleanly
  Unmapped(String),
  /// Nothing usable
  Empty,
}

/// Answers that explicitly reject a paper.
const REJECTIONS: [&str; 5] = ["none", "drop", "irrelevant", "not relevant", "无"];

/// Maps a raw model answer onto the taxonomy.
///
/// Only the first non-empty line counts. Surrounding quotes, Markdown emphasis, trailing
/// punctuation and a leading `Category:` label are ignored. An answer that is itself a category
/// name wins over label stripping.
///
/// ```
/// use digester::relevance::{parse_verdict, Category, Taxonomy, Verdict};
///
/// let taxonomy = Taxonomy::new(vec![Category {
///   name:        "Agents".into(),
///   description: String::new(),
///   keywords:    vec![],
/// }]);
/// assert_eq!(parse_verdict(&taxonomy, "**Category: agents.**"), Verdict::Category("Agents".into()));
/// assert_eq!(parse_verdict(&taxonomy, "NONE"), Verdict::Irrelevant);
/// assert!(matches!(parse_verdict(&taxonomy, "Agents or LLM"), Verdict::Unmapped(_)));
/// ```
pub fn parse_verdict(taxonomy: &Taxonomy, raw: &str) -> Verdict {
  let Some(line) = raw.lines().map(str::trim).find(|l| !l.is_empty()) else {
    return Verdict::Empty;
  };
  let strip: &[char] = &['*', '_', '`', '"', '\'', '“', '”', '「', '」', '.', '。', ':', '：', ' '];
  let mut answer = line.trim_matches(strip);
  if let Some(name) = taxonomy.canonical(answer) {
    return Verdict::Category(name.to_string());
  }
  for label in ["category", "类别", "分类"] {
    let Some(rest) = answer
      .get(..label.len())
      .filter(|prefix| prefix.eq_ignore_ascii_case(label))
      .map(|_| answer[label.len()..].trim_start_matches(['*', '_', ' ']))
    else {
      continue;
    };
    // A label only counts when followed by a separator, so names such as "分类算法" survive.
    if rest.is_empty() || rest.starts_with([':', '：']) {
      answer = rest.trim_matches(strip);
      break;
    }
  }
  if answer.is_empty() {
    return Verdict::Empty;
  }
  if let Some(name) = taxonomy.canonical(answer) {
    return Verdict::Category(name.to_string());
  }
  if REJECTIONS.iter().any(|r| answer.eq_ignore_ascii_case(r)) {
    return Verdict::Irrelevant;
  }
  Verdict::Unmapped(answer.to_string())
}

/// Classifies papers against the taxonomy with one model call each.
pub struct RelevanceFilter {
  /// Model used for classification
  llm:      Arc<dyn LanguageModel>,
  /// Accepted categories
  taxonomy: Arc<Taxonomy>,
  /// Retry policy for the classification call
  retry:    RetryPolicy,
}

impl RelevanceFilter {
  /// Creates a filter over `taxonomy`.
  pub fn new(llm: Arc<dyn LanguageModel>, taxonomy: Arc<Taxonomy>, retry: RetryPolicy) -> Self {
    Self { llm, taxonomy, retry }
  }

  /// Prompt sent for `paper`.
  pub fn prompt(&self, paper: &PaperRecord) -> String {
    let mut prompt = String::from(
      "You triage new computer-science papers for a research digest. Decide which ONE of the \
       categories below the paper primarily belongs to.\n\nCategories:\n",
    );
    for category in self.taxonomy.categories() {
      if category.description.is_empty() {
        prompt.push_str(&format!("- {}\n", category.name));
      } else {
        prompt.push_str(&format!("- {}: {}\n", category.name, category.description));
      }
    }
    prompt.push_str(&format!(
      "\nTitle: {}\n\nAbstract: {}\n\nAnswer with exactly one category name from the list, \
       spelled as shown, or NONE if the paper fits none of them. Do not explain.",
      paper.title, paper.abstract_text
    ));
    prompt
  }

  /// Decides whether `paper` is kept and under which category.
  pub async fn classify(&self, paper: &PaperRecord) -> Result<RelevanceDecision> {
    let prompt = self.prompt(paper);
    let reply = self
      .retry
      .run(&format!("Relevance call for {}", paper.id), || self.llm.classify(&prompt))
      .await
      .map_err(|e| DigestError::Classification {
        paper_id: paper.id.clone(),
        reason:   e.to_string(),
      })?;

    match parse_verdict(&self.taxonomy, &reply.text) {
      Verdict::Category(name) => {
        debug!("Keeping {} as {name}", paper.id);
        Ok(RelevanceDecision::keep(&paper.id, name))
      },
      Verdict::Irrelevant => {
        debug!("Dropping {}: not relevant", paper.id);
        Ok(RelevanceDecision::drop(&paper.id))
      },
      Verdict::Unmapped(answer) => {
        debug!("Dropping {}: answer {answer:?} matches no category", paper.id);
        Ok(RelevanceDecision::drop(&paper.id))
      },
      Verdict::Empty => Err(DigestError::Classification {
        paper_id: paper.id.clone(),
        reason:   "empty classification response".to_string(),
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use super::*;
  use crate::llm::{Conversation, Reply};

  /// Answers every classification with the next scripted reply.
  struct Scripted(Mutex<Vec<Result<Reply>>>);

  #[async_trait]
  impl LanguageModel for Scripted {
    async fn classify(&self, _prompt: &str) -> Result<Reply> {
      self.0.lock().unwrap().remove(0)
    }

    async fn converse(&self, _conversation: &Conversation, _question: &str) -> Result<Reply> {
      unreachable!("relevance never converses")
    }
  }

  fn taxonomy() -> Arc<Taxonomy> {
    Arc::new(Taxonomy::new(
      ["LLM", "Agents", "多模态"]
        .into_iter()
        .map(|n| Category { name: n.into(), description: format!("{n} papers"), keywords: vec![] })
        .collect(),
    ))
  }

  fn paper() -> PaperRecord {
    PaperRecord {
      id:              "2401.00002".into(),
      title:           "Tool Use".into(),
      abstract_text:   "Agents that call tools.".into(),
      authors:         vec![],
      tags:            vec![],
      pdf_url:         None,
      abs_url:         String::new(),
      published:       Utc::now(),
      matched_keyword: None,
    }
  }

  fn filter(replies: Vec<Result<Reply>>) -> RelevanceFilter {
    RelevanceFilter::new(
      Arc::new(Scripted(Mutex::new(replies))),
      taxonomy(),
      RetryPolicy::immediate(2, Duration::from_secs(1)),
    )
  }

  #[test]
  fn test_parse_variants() {
    let t = taxonomy();
    assert_eq!(parse_verdict(&t, "llm"), Verdict::Category("LLM".into()));
    assert_eq!(parse_verdict(&t, "\n  \"Agents\"\nbecause it uses tools"), Verdict::Category("Agents".into()));
    assert_eq!(parse_verdict(&t, "类别：多模态。"), Verdict::Category("多模态".into()));
    assert_eq!(parse_verdict(&t, "Irrelevant."), Verdict::Irrelevant);
    assert_eq!(parse_verdict(&t, "Robotics"), Verdict::Unmapped("Robotics".into()));
    assert_eq!(parse_verdict(&t, " \n\t"), Verdict::Empty);
    assert_eq!(parse_verdict(&t, "Category:"), Verdict::Empty);
  }

  #[test]
  fn test_names_starting_with_a_label_are_kept() {
    let t = Taxonomy::new(
      ["分类算法", "Category Theory"]
        .into_iter()
        .map(|name| Category { name: name.into(), description: String::new(), keywords: vec![] })
        .collect(),
    );
    assert_eq!(parse_verdict(&t, "分类算法"), Verdict::Category("分类算法".into()));
    assert_eq!(parse_verdict(&t, "category theory."), Verdict::Category("Category Theory".into()));
    assert_eq!(parse_verdict(&t, "分类：分类算法"), Verdict::Category("分类算法".into()));
    assert_eq!(parse_verdict(&t, "Category: Category Theory"), Verdict::Category("Category Theory".into()));
    assert_eq!(parse_verdict(&t, "Category Learning"), Verdict::Unmapped("Category Learning".into()));
  }

  #[test]
  fn test_prompt_lists_categories() {
    let prompt = filter(vec![]).prompt(&paper());
    assert!(prompt.contains("- LLM: LLM papers"));
    assert!(prompt.contains("- 多模态: 多模态 papers"));
    assert!(prompt.contains("Agents that call tools."));
  }

  #[tokio::test]
  async fn test_keep_and_drop() {
    let f = filter(vec![Ok(Reply::text("Agents")), Ok(Reply::text("Quantum chemistry"))]);
    assert_eq!(f.classify(&paper()).await.unwrap(), RelevanceDecision::keep("2401.00002", "Agents"));
    assert_eq!(f.classify(&paper()).await.unwrap(), RelevanceDecision::drop("2401.00002"));
  }

  #[tokio::test]
  async fn test_failures_are_classification_errors() {
    let f = filter(vec![
      Ok(Reply::text("")),
      Err(DigestError::Timeout(Duration::from_secs(1))),
      Err(DigestError::Timeout(Duration::from_secs(1))),
    ]);
    let empty = f.classify(&paper()).await.unwrap_err();
    assert!(matches!(empty, DigestError::Classification { ref paper_id, .. } if paper_id == "2401.00002"));
    let timeout = f.classify(&paper()).await.unwrap_err();
    assert!(timeout.to_string().contains("timed out"));
  }
}
