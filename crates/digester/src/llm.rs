//! Language model access for relevance triage and paper analysis.
//!
//! The pipeline needs two call shapes from a model:
//!
//! - [`LanguageModel::classify`]: a single self-contained prompt, used once per candidate paper
//! - [`LanguageModel::converse`]: one question asked inside a per-paper [`Conversation`] that
//!   carries the paper context and every earlier question/answer turn
//!
//! Both return a [`Reply`] with the generated text and, optionally, an opaque
//! [`ConversationHandle`] that lets a human continue the discussion elsewhere. Handles are stored
//! and forwarded verbatim and never inspected.
//!
//! [`ChatClient`] implements the trait against any OpenAI-compatible `chat/completions`
//! endpoint (Kimi, OpenAI, DeepSeek).
//!
//! # Examples
//!
//! ```no_run
//! use digester::{
//!   config::LlmConfig,
//!   llm::{ChatClient, Conversation, LanguageModel, Message},
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LlmConfig { api_key: "sk-...".into(), ..LlmConfig::default() };
//! let client = ChatClient::new(&config)?;
//!
//! let conversation = Conversation::new("2401.00001", "A Paper", vec![Message::system("Be brief.")]);
//! let reply = client.converse(&conversation, "What problem does it solve?").await?;
//! println!("{}", reply.text);
//! # Ok(())
//! # }
//! ```

use url::Url;

use super::*;
use crate::{analysis::QuestionAnswer, config::LlmConfig};

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  /// Instructions framing the whole conversation
  System,
  /// Prompt or question
  User,
  /// Model output
  Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
  /// Who is speaking
  pub role:    Role,
  /// What was said
  pub content: String,
}

impl Message {
  /// A system message.
  pub fn system(content: impl Into<String>) -> Self { Self { role: Role::System, content: content.into() } }

  /// A user message.
  pub fn user(content: impl Into<String>) -> Self { Self { role: Role::User, content: content.into() } }

  /// An assistant message.
  pub fn assistant(content: impl Into<String>) -> Self {
    Self { role: Role::Assistant, content: content.into() }
  }
}

/// Opaque reference to an external conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationHandle(String);

impl ConversationHandle {
  /// Wraps a handle exactly as received.
  pub fn new(raw: impl Into<String>) -> Self { Self(raw.into()) }

  /// The handle as received.
  pub fn as_str(&self) -> &str { &self.0 }
}

impl Display for ConversationHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

/// Model output for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
  /// Generated text
  pub text:   String,
  /// Reference for resuming the discussion, if the model provides one
  pub handle: Option<ConversationHandle>,
}

impl Reply {
  /// A reply without a handle.
  pub fn text(text: impl Into<String>) -> Self { Self { text: text.into(), handle: None } }
}

/// Shared context for every question asked about one paper.
///
/// A conversation is rebuilt from stored answers when an interrupted analysis resumes; replaying
/// earlier turns as context is not the same as asking them again.
#[derive(Debug, Clone)]
pub struct Conversation {
  /// Paper the conversation is about
  pub paper_id: String,
  /// Paper title, used for share links
  pub title:    String,
  /// System prompt and paper context
  context:      Vec<Message>,
  /// Earlier questions and their answers, in order
  turns:        Vec<QuestionAnswer>,
  /// Handle received from the first reply that carried one
  pub handle:   Option<ConversationHandle>,
}

impl Conversation {
  /// Opens a conversation with its fixed leading context.
  pub fn new(paper_id: impl Into<String>, title: impl Into<String>, context: Vec<Message>) -> Self {
    Self {
      paper_id: paper_id.into(),
      title: title.into(),
      context,
      turns: Vec::new(),
      handle: None,
    }
  }

  /// Replays previously answered turns.
  pub fn with_turns(mut self, turns: impl IntoIterator<Item = QuestionAnswer>) -> Self {
    self.turns.extend(turns);
    self
  }

  /// Records an answered turn.
  pub fn record(&mut self, turn: QuestionAnswer) { self.turns.push(turn); }

  /// Number of answered turns.
  pub fn answered(&self) -> usize { self.turns.len() }

  /// Earlier turns.
  pub fn turns(&self) -> &[QuestionAnswer] { &self.turns }

  /// The full message list for asking `question` next.
  pub fn messages_for(&self, question: &str) -> Vec<Message> {
    let mut messages = self.context.clone();
    for turn in &self.turns {
      messages.push(Message::user(turn.question.clone()));
      messages.push(Message::assistant(turn.answer.clone()));
    }
    messages.push(Message::user(question));
    messages
  }
}

/// A chat model as the pipeline uses it.
#[async_trait]
pub trait LanguageModel: Send + Sync {
  /// Answers a single self-contained prompt.
  async fn classify(&self, prompt: &str) -> Result<Reply>;

  /// Asks `question` with everything in `conversation` as context.
  async fn converse(&self, conversation: &Conversation, question: &str) -> Result<Reply>;
}

/// Request body for `chat/completions`.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
  /// Model name
  model:       &'a str,
  /// Conversation so far
  messages:    Vec<Message>,
  /// Sampling temperature
  temperature: f32,
  /// Completion token limit
  max_tokens:  u32,
}

/// Response body of `chat/completions`, reduced to what is used.
#[derive(Debug, Deserialize)]
struct ChatResponse {
  /// Completion identifier
  #[serde(default)]
  id:      Option<String>,
  /// Candidate completions
  #[serde(default)]
  choices: Vec<ChatChoice>,
}

/// One candidate completion.
#[derive(Debug, Deserialize)]
struct ChatChoice {
  /// Generated message
  message: ChatChoiceMessage,
}

/// Generated message inside a choice.
#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
  /// Text, absent for tool calls
  #[serde(default)]
  content: Option<String>,
}

/// Client for OpenAI-compatible chat completion APIs.
#[derive(Debug, Clone)]
pub struct ChatClient {
  /// Shared HTTP client with the call timeout applied
  http:        reqwest::Client,
  /// Full `chat/completions` URL
  endpoint:    String,
  /// Bearer token
  api_key:     String,
  /// Model name
  model:       String,
  /// Sampling temperature
  temperature: f32,
  /// Completion token limit
  max_tokens:  u32,
  /// Web chat accepting a `prefill` query
  share_url:   Option<Url>,
}

impl ChatClient {
  /// Builds a client from the `[llm]` section.
  pub fn new(config: &LlmConfig) -> Result<Self> {
    let http = reqwest::Client::builder().timeout(config.timeout()).build()?;
    let share_url = match config.share_url() {
      Some(raw) => Some(
        Url::parse(raw)
          .map_err(|e| DigestError::Config(format!("llm.share_url {raw:?} is not a URL: {e}")))?,
      ),
      None => None,
    };
    Ok(Self {
      http,
      endpoint: format!("{}/chat/completions", config.base_url().trim_end_matches('/')),
      api_key: config.api_key.clone(),
      model: config.model().to_string(),
      temperature: config.temperature,
      max_tokens: config.max_tokens,
      share_url,
    })
  }

  /// Sends one completion request and returns the completion id and text.
  async fn complete(&self, messages: Vec<Message>) -> Result<(Option<String>, String)> {
    let request = ChatRequest {
      model: &self.model,
      messages,
      temperature: self.temperature,
      max_tokens: self.max_tokens,
    };
    debug!("POST {} ({} messages)", self.endpoint, request.messages.len());
    let response =
      self.http.post(&self.endpoint).bearer_auth(&self.api_key).json(&request).send().await?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      let message = if body.trim().is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
      } else {
        format::truncate_chars(body.trim(), 500)
      };
      return Err(DigestError::Api { status: status.as_u16(), message });
    }

    let body: ChatResponse = response.json().await?;
    trace!("Completion {:?} with {} choices", body.id, body.choices.len());
    let text = body
      .choices
      .into_iter()
      .next()
      .and_then(|choice| choice.message.content)
      .map(|content| content.trim().to_string())
      .filter(|content| !content.is_empty())
      .ok_or(DigestError::EmptyResponse)?;
    Ok((body.id, text))
  }

  /// Link that opens the provider's web chat primed to continue discussing the paper.
  fn share_link(&self, conversation: &Conversation) -> Option<ConversationHandle> {
    let base = self.share_url.as_ref()?;
    let prefill = format!(
      "Let's continue discussing the arXiv paper {} \"{}\" (https://arxiv.org/abs/{}).",
      conversation.paper_id, conversation.title, conversation.paper_id
    );
    let mut url = base.clone();
    url.query_pairs_mut().append_pair("prefill", &prefill);
    Some(ConversationHandle::new(url.to_string()))
  }
}

#[async_trait]
impl LanguageModel for ChatClient {
  async fn classify(&self, prompt: &str) -> Result<Reply> {
    let (id, text) = self.complete(vec![Message::user(prompt)]).await?;
    Ok(Reply { text, handle: id.map(ConversationHandle::new) })
  }

  async fn converse(&self, conversation: &Conversation, question: &str) -> Result<Reply> {
    let (id, text) = self.complete(conversation.messages_for(question)).await?;
    let handle = self.share_link(conversation).or_else(|| id.map(ConversationHandle::new));
    Ok(Reply { text, handle })
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;
  use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
  };

  use super::*;
  use crate::config::Provider;

  fn config_for(server: &MockServer, share_url: Option<&str>) -> LlmConfig {
    LlmConfig {
      provider: Provider::OpenAi,
      base_url: Some(format!("{}/v1", server.uri())),
      api_key: "sk-test".into(),
      share_url: share_url.map(String::from),
      ..LlmConfig::default()
    }
  }

  fn completion(id: &str, content: &str) -> serde_json::Value {
    json!({
      "id": id,
      "object": "chat.completion",
      "choices": [{ "index": 0, "message": { "role": "assistant", "content": content }, "finish_reason": "stop" }]
    })
  }

  #[test]
  fn test_messages_replay_turns_in_order() {
    let conversation = Conversation::new("p1", "T", vec![Message::system("sys")]).with_turns(vec![
      QuestionAnswer::new("q1", "a1"),
      QuestionAnswer::new("q2", "a2"),
    ]);
    let messages = conversation.messages_for("q3");
    let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["sys", "q1", "a1", "q2", "a2", "q3"]);
    assert_eq!(messages[2].role, Role::Assistant);
    assert_eq!(messages.last().unwrap().role, Role::User);
  }

  #[tokio::test]
  async fn test_classify_posts_single_user_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/v1/chat/completions"))
      .and(header("authorization", "Bearer sk-test"))
      .and(body_partial_json(json!({ "model": "gpt-4-turbo", "max_tokens": 4000 })))
      .respond_with(ResponseTemplate::new(200).set_body_json(completion("cmpl-1", "  LLM \n")))
      .expect(1)
      .mount(&server)
      .await;

    let client = ChatClient::new(&config_for(&server, None)).unwrap();
    let reply = client.classify("Which category?").await.unwrap();
    assert_eq!(reply.text, "LLM");
    assert_eq!(reply.handle, Some(ConversationHandle::new("cmpl-1")));
  }

  #[tokio::test]
  async fn test_converse_builds_share_link() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/v1/chat/completions"))
      .respond_with(ResponseTemplate::new(200).set_body_json(completion("cmpl-2", "It solves X.")))
      .mount(&server)
      .await;

    let client = ChatClient::new(&config_for(&server, Some("https://chat.example.com/"))).unwrap();
    let conversation = Conversation::new("2401.00001", "Paper", vec![]);
    let reply = client.converse(&conversation, "What?").await.unwrap();
    let handle = reply.handle.unwrap();
    assert!(handle.as_str().starts_with("https://chat.example.com/?prefill="));
    assert!(handle.as_str().contains("2401.00001"));
  }

  #[tokio::test]
  async fn test_error_status_maps_to_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
      .mount(&server)
      .await;

    let client = ChatClient::new(&config_for(&server, None)).unwrap();
    let err = client.classify("hi").await.unwrap_err();
    assert!(matches!(err, DigestError::Api { status: 429, ref message } if message == "rate limited"));
    assert!(err.is_transient());
  }

  #[tokio::test]
  async fn test_blank_content_is_empty_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200).set_body_json(completion("cmpl-3", "   ")))
      .mount(&server)
      .await;

    let client = ChatClient::new(&config_for(&server, None)).unwrap();
    let err = client.classify("hi").await.unwrap_err();
    assert!(matches!(err, DigestError::EmptyResponse));
  }
}
