//! The per-paper question sequence and its resumable cache.
//!
//! For every kept paper the [`AnalysisEngine`] asks the configured questions, in order, inside a
//! single [`Conversation`] so later questions see earlier answers. Each answer is appended to the
//! [`CacheStore`] before the next question is asked. That gives three cases when a paper is
//! analysed:
//!
//! 1. A complete cache entry exists: it is returned as is and the model is not called.
//! 2. A partial entry exists: the conversation is rebuilt from the stored answers and the sequence
//!    resumes at the first unanswered question. Answered questions are never asked again.
//! 3. No entry exists: a new partial entry is opened and the sequence starts from the top.
//!
//! A call that still fails after retries (timeouts included) stops the sequence. The entry stays
//! partial with every answer recorded so far and the failure is reported as
//! [`DigestError::Analysis`]; the caller moves on to the next paper.

use super::*;
use crate::{
  llm::{Conversation, ConversationHandle, LanguageModel, Message},
  retry::RetryPolicy,
  store::CacheStore,
};

/// One answered question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionAnswer {
  /// Question as configured
  pub question: String,
  /// Model answer
  pub answer:   String,
}

impl QuestionAnswer {
  /// Pairs a question with its answer.
  pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
    Self { question: question.into(), answer: answer.into() }
  }
}

/// Whether every configured question has been answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Completion {
  /// All questions answered
  Complete,
  /// The sequence was interrupted
  Partial,
}

impl Display for Completion {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Complete => write!(f, "complete"),
      Self::Partial => write!(f, "partial"),
    }
  }
}

impl FromStr for Completion {
  type Err = DigestError;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "complete" => Ok(Self::Complete),
      "partial" => Ok(Self::Partial),
      other => Err(DigestError::Config(format!("unknown completion status {other:?}"))),
    }
  }
}

/// Everything known about one analysed paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
  /// The paper
  pub paper:        PaperRecord,
  /// Category assigned by the relevance filter
  pub category:     String,
  /// Answers in question order
  pub answers:      Vec<QuestionAnswer>,
  /// Handle for continuing the discussion, stored verbatim
  pub conversation: Option<ConversationHandle>,
  /// Completion status
  pub completion:   Completion,
  /// Stored PDF, if it was downloaded
  pub pdf_path:     Option<PathBuf>,
  /// Time of the last recorded answer or status change
  pub analyzed_at:  DateTime<Utc>,
}

impl AnalysisResult {
  /// A fresh, empty, partial result.
  pub fn new(paper: PaperRecord, category: impl Into<String>) -> Self {
    Self {
      paper,
      category: category.into(),
      answers: Vec::new(),
      conversation: None,
      completion: Completion::Partial,
      pdf_path: None,
      analyzed_at: Utc::now(),
    }
  }

  /// Whether questions are still missing.
  pub fn is_partial(&self) -> bool { self.completion == Completion::Partial }
}

/// Where a returned result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
  /// Complete cache entry, no model calls
  CacheHit,
  /// Resumed a partial entry at the given zero-based question index
  Resumed(usize),
  /// Started from the first question
  Fresh,
}

/// Outcome of analysing one paper.
#[derive(Debug)]
pub struct Analysis {
  /// The result as it now stands in the cache
  pub result: AnalysisResult,
  /// Cache hit, resumption or fresh start
  pub origin: Origin,
  /// Questions submitted to the model by this call
  pub asked:  usize,
  /// Why the sequence stopped early, if it did
  pub error:  Option<DigestError>,
}

/// Runs the question sequence for kept papers.
pub struct AnalysisEngine {
  /// Model answering the questions
  llm:               Arc<dyn LanguageModel>,
  /// Persistent cache
  store:             Arc<CacheStore>,
  /// Ordered questions
  questions:         Arc<Vec<String>>,
  /// Wrapper applied to each question, `{question}` is replaced
  question_template: String,
  /// Opening system message
  system_prompt:     String,
  /// Upper bound on document text placed in the context
  max_context_chars: usize,
  /// Retry policy for each question
  retry:             RetryPolicy,
}

impl AnalysisEngine {
  /// Creates an engine asking `questions` in order.
  pub fn new(
    llm: Arc<dyn LanguageModel>,
    store: Arc<CacheStore>,
    questions: Arc<Vec<String>>,
    retry: RetryPolicy,
  ) -> Self {
    Self {
      llm,
      store,
      questions,
      question_template: "{question}".to_string(),
      system_prompt: String::new(),
      max_context_chars: 60_000,
      retry,
    }
  }

  /// Sets the wrapper applied to each question.
  pub fn with_question_template(mut self, template: impl Into<String>) -> Self {
    self.question_template = template.into();
    self
  }

  /// Sets the opening system message.
  pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
    self.system_prompt = prompt.into();
    self
  }

  /// Sets the bound on document text placed in the context.
  pub fn with_max_context_chars(mut self, max: usize) -> Self {
    self.max_context_chars = max;
    self
  }

  /// The configured questions.
  pub fn questions(&self) -> &[String] { &self.questions }

  /// Leading context for `paper`: system prompt, metadata and optional document text.
  fn context(&self, paper: &PaperRecord, document: Option<&str>) -> Vec<Message> {
    let mut context = Vec::new();
    if !self.system_prompt.trim().is_empty() {
      context.push(Message::system(self.system_prompt.clone()));
    }
    let mut intro = format!(
      "Paper: {}\narXiv: {} ({})\nAuthors: {}\nSubjects: {}\n\nAbstract:\n{}",
      paper.title,
      paper.id,
      paper.abs_url,
      paper.authors_line(0),
      paper.tags.join(", "),
      paper.abstract_text
    );
    if let Some(text) = document.map(str::trim).filter(|t| !t.is_empty()) {
      intro.push_str("\n\nFull text (extracted from the PDF):\n");
      intro.push_str(&format::truncate_chars(text, self.max_context_chars));
    }
    context.push(Message::system(intro));
    context
  }

  /// Question text as sent to the model.
  fn phrase(&self, question: &str) -> String { self.question_template.replace("{question}", question) }

  /// Analyses `paper` under `category`, resuming or short-circuiting through the cache.
  ///
  /// `document` is extracted full text placed in the context when available. For an existing
  /// entry the stored category wins over `category`.
  ///
  /// Only store failures are returned as `Err`; model failures end up in [`Analysis::error`].
  pub async fn analyze(
    &self,
    paper: &PaperRecord,
    category: &str,
    document: Option<&str>,
  ) -> Result<Analysis> {
    let (mut result, origin) = match self.store.load(&paper.id).await? {
      Some(entry) if entry.completion == Completion::Complete => {
        debug!("Cache hit for {}", paper.id);
        return Ok(Analysis { result: entry, origin: Origin::CacheHit, asked: 0, error: None });
      },
      Some(entry) => {
        let from = entry.answers.len();
        info!("Resuming {} at question {} of {}", paper.id, from + 1, self.questions.len());
        (entry, Origin::Resumed(from))
      },
      None => {
        self.store.begin(paper, category).await?;
        (AnalysisResult::new(paper.clone(), category), Origin::Fresh)
      },
    };

    // Stored turns are wrapped the same way they were when asked.
    let replayed = result
      .answers
      .iter()
      .map(|turn| QuestionAnswer::new(self.phrase(&turn.question), turn.answer.clone()));
    let mut conversation =
      Conversation::new(&paper.id, &paper.title, self.context(paper, document)).with_turns(replayed);
    conversation.handle = result.conversation.clone();

    let mut asked = 0;
    for (position, question) in self.questions.iter().enumerate().skip(result.answers.len()) {
      asked += 1;
      let phrased = self.phrase(question);
      let label = format!("Question {} for {}", position + 1, paper.id);
      let reply = self
        .retry
        .run(&label, || self.llm.converse(&conversation, &phrased))
        .await
        .and_then(|reply| {
          if reply.text.trim().is_empty() {
            Err(DigestError::EmptyResponse)
          } else {
            Ok(reply)
          }
        });

      let reply = match reply {
        Ok(reply) => reply,
        Err(e) => {
          self.store.mark(&paper.id, Completion::Partial).await?;
          result.completion = Completion::Partial;
          let error = self.interrupted(paper, position, e);
          return Ok(Analysis { result, origin, asked, error: Some(error) });
        },
      };

      if result.conversation.is_none() {
        if let Some(handle) = reply.handle {
          self.store.set_conversation(&paper.id, &handle).await?;
          conversation.handle = Some(handle.clone());
          result.conversation = Some(handle);
        }
      }

      let turn = QuestionAnswer::new(question.clone(), reply.text.trim());
      self.store.append_answer(&paper.id, position, &turn).await?;
      conversation.record(QuestionAnswer::new(phrased, turn.answer.clone()));
      result.answers.push(turn);
      result.analyzed_at = Utc::now();
    }

    self.store.mark(&paper.id, Completion::Complete).await?;
    result.completion = Completion::Complete;
    info!("Analysed {} ({} questions asked)", paper.id, asked);
    Ok(Analysis { result, origin, asked, error: None })
  }

  /// Logs and wraps a failure at `position`.
  fn interrupted(&self, paper: &PaperRecord, position: usize, cause: DigestError) -> DigestError {
    warn!(paper = %paper.id, question = position + 1, "Analysis interrupted: {cause}");
    DigestError::Analysis { paper_id: paper.id.clone(), question: position + 1, reason: cause.to_string() }
  }
}
