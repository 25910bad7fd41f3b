//! Configuration file loading, environment substitution and validation.
//!
//! The configuration is a single TOML document read once at start-up. Every section has
//! defaults, so a minimal file only needs an API key:
//!
//! ```
//! use digester::config::Config;
//!
//! let config = Config::from_toml_str(r#"
//!   [llm]
//!   api_key = "sk-test"
//! "#).unwrap();
//!
//! assert_eq!(config.analysis.questions.len(), 6);
//! assert_eq!(config.llm.retry.max_attempts, 3);
//! ```
//!
//! A missing or invalid file is fatal: [`Config::load`] returns [`DigestError::Config`] naming
//! the offending path.

use chrono::{NaiveTime, Weekday};
use lettre::message::Mailbox;

use super::*;
use crate::{relevance::Category, schedule::ScheduleMode};

/// The annotated example configuration written by `digester init`.
pub const EXAMPLE_CONFIG: &str =
  include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/config/digester.example.toml"));

lazy_static! {
  /// `${NAME}` placeholders inside configuration strings.
  static ref ENV_PLACEHOLDER: Regex =
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid");
}

/// Complete configuration for a digester deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Process-wide settings
  pub system:        SystemConfig,
  /// Where run directories and the cache live
  pub output:        OutputConfig,
  /// Paper listing settings
  pub source:        SourceConfig,
  /// Language model provider and retry policy
  pub llm:           LlmConfig,
  /// Question sequence and per-paper behaviour
  pub analysis:      AnalysisConfig,
  /// Research taxonomy in report display order
  pub categories:    Vec<Category>,
  /// Report rendering
  pub report:        ReportConfig,
  /// Mail delivery
  pub email:         EmailConfig,
  /// Periodic trigger
  pub scheduler:     SchedulerConfig,
  /// Operator notifications
  pub notifications: NotificationConfig,
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
  /// Default log filter when no `-v` flag or `RUST_LOG` is given
  pub log_level: String,
  /// Directory for daily rolling log files, console only when unset
  pub log_dir:   Option<PathBuf>,
}

/// Output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
  /// Root under which one directory per run date is created
  pub base_dir:   PathBuf,
  /// SQLite analysis cache, defaults to `<base_dir>/analysis_cache.db`
  pub cache_path: Option<PathBuf>,
}

/// Paper listing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
  /// arXiv export API query endpoint
  pub endpoint:           String,
  /// arXiv categories to list, `cs.*` for the whole archive
  pub categories:         Vec<String>,
  /// Entries requested per page
  pub page_size:          usize,
  /// Upper bound on papers per run, `0` for no bound
  pub max_papers:         usize,
  /// Number of days before the run date included in the submission window
  pub lookback_days:      u32,
  /// Pause between page requests
  pub request_delay_secs: u64,
  /// Per-request timeout
  pub timeout_secs:       u64,
  /// Only yield papers whose title contains a keyword as a whole word
  pub keyword_filter:     bool,
  /// Extra keywords in addition to every category's keywords
  pub keywords:           Vec<String>,
}

/// Supported OpenAI-compatible providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
  /// Moonshot AI Kimi
  #[default]
  Kimi,
  /// OpenAI
  #[serde(rename = "openai")]
  OpenAi,
  /// DeepSeek
  DeepSeek,
}

impl Provider {
  /// API base URL used when `llm.base_url` is not set.
  pub fn default_base_url(&self) -> &'static str {
    match self {
      Self::Kimi => "https://api.moonshot.cn/v1",
      Self::OpenAi => "https://api.openai.com/v1",
      Self::DeepSeek => "https://api.deepseek.com/v1",
    }
  }

  /// Model used when `llm.model` is not set.
  pub fn default_model(&self) -> &'static str {
    match self {
      Self::Kimi => "kimi-k2-0711-preview",
      Self::OpenAi => "gpt-4-turbo",
      Self::DeepSeek => "deepseek-chat",
    }
  }

  /// Web chat that accepts a `prefill` query, if the provider has one.
  pub fn default_share_url(&self) -> Option<&'static str> {
    match self {
      Self::Kimi => Some("https://kimi.moonshot.cn/"),
      Self::OpenAi | Self::DeepSeek => None,
    }
  }
}

impl Display for Provider {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Kimi => write!(f, "kimi"),
      Self::OpenAi => write!(f, "openai"),
      Self::DeepSeek => write!(f, "deepseek"),
    }
  }
}

/// Language model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
  /// Which provider the defaults below come from
  pub provider:     Provider,
  /// Overrides the provider's API base URL
  pub base_url:     Option<String>,
  /// Bearer token
  pub api_key:      String,
  /// Overrides the provider's default model
  pub model:        Option<String>,
  /// Sampling temperature
  pub temperature:  f32,
  /// Completion token limit
  pub max_tokens:   u32,
  /// Time budget for a single call
  pub timeout_secs: u64,
  /// Overrides the provider's web chat used for "continue discussion" links
  pub share_url:    Option<String>,
  /// Bounded retry for transient failures
  pub retry:        RetryConfig,
}

impl LlmConfig {
  /// Effective API base URL.
  pub fn base_url(&self) -> &str {
    self.base_url.as_deref().unwrap_or_else(|| self.provider.default_base_url())
  }

  /// Effective model name.
  pub fn model(&self) -> &str { self.model.as_deref().unwrap_or_else(|| self.provider.default_model()) }

  /// Effective share URL.
  pub fn share_url(&self) -> Option<&str> {
    self.share_url.as_deref().or_else(|| self.provider.default_share_url())
  }

  /// Per-call timeout.
  pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }
}

/// Retry schedule for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Total attempts including the first one
  pub max_attempts:       u32,
  /// Delay after the first failure
  pub initial_backoff_ms: u64,
  /// Ceiling for any single delay
  pub max_backoff_ms:     u64,
  /// Growth factor between consecutive delays
  pub multiplier:         f64,
}

/// Question sequence and per-paper behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
  /// Ordered questions asked of every kept paper
  pub questions:         Vec<String>,
  /// Wrapper around each question, `{question}` is replaced
  pub question_template: String,
  /// System message opening every conversation
  pub system_prompt:     String,
  /// Papers analysed at the same time
  pub concurrency:       usize,
  /// Download each kept paper's PDF into the run directory
  pub download_pdfs:     bool,
  /// Add extracted PDF text to the conversation context
  pub include_pdf_text:  bool,
  /// Pages of text extracted from each PDF
  pub max_pdf_pages:     usize,
  /// Upper bound on extracted text placed in the context
  pub max_context_chars: usize,
}

/// Report rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
  /// Top-level heading
  pub title:        String,
  /// Also write one file per category
  pub per_category: bool,
  /// Authors listed before "et al.", `0` for all
  pub author_limit: usize,
}

/// Mail delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
  /// Send the report after each run
  pub enabled:           bool,
  /// SMTP relay host
  pub smtp_server:       String,
  /// SMTP port, 587 for STARTTLS or 465 for implicit TLS
  pub smtp_port:         u16,
  /// Use implicit TLS instead of STARTTLS
  pub use_ssl:           bool,
  /// SMTP user
  pub username:          String,
  /// SMTP password or app password
  pub password:          String,
  /// Sender address, defaults to the username
  pub from:              String,
  /// Primary recipients
  pub to:                Vec<String>,
  /// Carbon copy recipients
  pub cc:                Vec<String>,
  /// Blind carbon copy recipients
  pub bcc:               Vec<String>,
  /// Subject line, `{date}` is replaced with the run date
  pub subject_template:  String,
  /// Attach the Markdown report file
  pub attach_report:     bool,
  /// Attach every downloaded PDF of the reported papers
  pub attach_pdfs:       bool,
  /// Attachments larger than this are skipped
  pub max_attachment_mb: u64,
  /// SMTP session timeout
  pub timeout_secs:      u64,
}

impl EmailConfig {
  /// Sender address with the username as fallback.
  pub fn sender(&self) -> &str { if self.from.trim().is_empty() { &self.username } else { &self.from } }

  /// Subject for a run date.
  pub fn subject(&self, date: NaiveDate) -> String {
    self.subject_template.replace("{date}", &date.format("%Y-%m-%d").to_string())
  }
}

/// Periodic trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
  /// Daily, weekly or fixed interval
  pub mode:             ScheduleMode,
  /// Local wall-clock time `HH:MM` for daily and weekly runs
  pub run_time:         String,
  /// Day of week for weekly runs
  pub weekday:          String,
  /// Minutes between interval runs
  pub interval_minutes: u64,
  /// Run once immediately when the scheduler starts
  pub run_on_startup:   bool,
}

impl SchedulerConfig {
  /// Parsed `run_time`.
  pub fn time_of_day(&self) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(self.run_time.trim(), "%H:%M").map_err(|e| {
      DigestError::Config(format!("scheduler.run_time {:?} is not HH:MM: {e}", self.run_time))
    })
  }

  /// Parsed `weekday`.
  pub fn day_of_week(&self) -> Result<Weekday> {
    self.weekday.trim().parse::<Weekday>().map_err(|_| {
      DigestError::Config(format!("scheduler.weekday {:?} is not a day of the week", self.weekday))
    })
  }
}

/// Operator notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  /// Mail the `to` recipients when a run aborts
  pub failure: bool,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      system:        SystemConfig::default(),
      output:        OutputConfig::default(),
      source:        SourceConfig::default(),
      llm:           LlmConfig::default(),
      analysis:      AnalysisConfig::default(),
      categories:    default_categories(),
      report:        ReportConfig::default(),
      email:         EmailConfig::default(),
      scheduler:     SchedulerConfig::default(),
      notifications: NotificationConfig::default(),
    }
  }
}

impl Default for SystemConfig {
  fn default() -> Self { Self { log_level: "info".to_string(), log_dir: None } }
}

impl Default for OutputConfig {
  fn default() -> Self { Self { base_dir: PathBuf::from("output"), cache_path: None } }
}

impl Default for SourceConfig {
  fn default() -> Self {
    Self {
      endpoint:           "https://export.arxiv.org/api/query".to_string(),
      categories:         vec!["cs.*".to_string()],
      page_size:          100,
      max_papers:         0,
      lookback_days:      1,
      request_delay_secs: 2,
      timeout_secs:       30,
      keyword_filter:     true,
      keywords:           Vec::new(),
    }
  }
}

impl Default for LlmConfig {
  fn default() -> Self {
    Self {
      provider:     Provider::Kimi,
      base_url:     None,
      api_key:      String::new(),
      model:        None,
      temperature:  0.3,
      max_tokens:   4000,
      timeout_secs: 120,
      share_url:    None,
      retry:        RetryConfig::default(),
    }
  }
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self { max_attempts: 3, initial_backoff_ms: 1000, max_backoff_ms: 30_000, multiplier: 2.0 }
  }
}

impl Default for AnalysisConfig {
  fn default() -> Self {
    Self {
      questions:         [
        "总结一下论文的主要内容",
        "这篇论文试图解决什么问题？",
        "有哪些相关研究？引用不能只给出序号，需要结合pdf reference章节给出相关研究的论文标题。",
        "论文如何解决这个问题？",
        "论文做了哪些实验？实验结论如何？",
        "有什么可以进一步探索的点？",
      ]
      .map(String::from)
      .to_vec(),
      question_template: "请基于论文内容回答以下问题：{question}".to_string(),
      system_prompt:     "You are a meticulous research assistant. You read computer-science \
                          papers closely and answer questions about them accurately, citing \
                          the paper's own content."
        .to_string(),
      concurrency:       1,
      download_pdfs:     true,
      include_pdf_text:  false,
      max_pdf_pages:     12,
      max_context_chars: 60_000,
    }
  }
}

impl Default for ReportConfig {
  fn default() -> Self {
    Self { title: "arXiv CS 论文日报".to_string(), per_category: false, author_limit: 5 }
  }
}

impl Default for EmailConfig {
  fn default() -> Self {
    Self {
      enabled:           false,
      smtp_server:       "smtp.gmail.com".to_string(),
      smtp_port:         587,
      use_ssl:           false,
      username:          String::new(),
      password:          String::new(),
      from:              String::new(),
      to:                Vec::new(),
      cc:                Vec::new(),
      bcc:               Vec::new(),
      subject_template:  "arXiv CS 论文日报 {date}".to_string(),
      attach_report:     true,
      attach_pdfs:       false,
      max_attachment_mb: 20,
      timeout_secs:      60,
    }
  }
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      mode:             ScheduleMode::Daily,
      run_time:         "09:00".to_string(),
      weekday:          "Mon".to_string(),
      interval_minutes: 1440,
      run_on_startup:   false,
    }
  }
}

impl Default for NotificationConfig {
  fn default() -> Self { Self { failure: true } }
}

/// The research taxonomy used when the file does not define `[[categories]]`.
pub fn default_categories() -> Vec<Category> {
  let table: [(&str, &str, &[&str]); 9] = [
    ("大模型", "Large language models: architecture, scaling, capabilities and evaluation", &[
      "large language model",
      "LLM",
      "GPT",
    ]),
    ("智能体", "LLM-driven agents, tool use, planning and multi-agent systems", &[
      "agent",
      "intelligent agent",
      "multi-agent",
      "autonomous agent",
    ]),
    ("强化学习", "Reinforcement learning, including RLHF and preference optimisation", &[
      "reinforcement learning",
      "RL",
      "PPO",
      "DPO",
    ]),
    ("多模态", "Vision-language, audio-visual and other multimodal models", &[
      "multimodal",
      "vision-language",
      "image-text",
      "audio-visual",
      "video",
      "VLM",
      "MLLM",
    ]),
    ("微调", "Fine-tuning and parameter-efficient adaptation", &[
      "fine-tuning",
      "adapter",
      "LoRA",
      "QLoRA",
    ]),
    ("预训练", "Pre-training data, objectives and recipes", &["pre-training", "pre-trained"]),
    ("优化算法", "Optimizers and training optimisation algorithms", &["optimizer"]),
    ("检索增强生成", "Retrieval-augmented generation", &["RAG", "retrieval-augmented generation"]),
    ("后训练", "Post-training: alignment, instruction tuning and distillation", &["post-training"]),
  ];
  table
    .into_iter()
    .map(|(name, description, keywords)| Category {
      name:        name.to_string(),
      description: description.to_string(),
      keywords:    keywords.iter().map(|k| k.to_string()).collect(),
    })
    .collect()
}

impl Config {
  /// Reads, substitutes and validates the configuration at `path`.
  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|e| {
      DigestError::Config(format!("Cannot read configuration file {}: {e}", path.display()))
    })?;
    let config = Self::from_toml_str(&raw).map_err(|e| {
      DigestError::Config(format!("Invalid configuration in {}: {e}", path.display()))
    })?;
    debug!("Loaded configuration from {}", path.display());
    Ok(config)
  }

  /// Parses configuration text, substituting `${NAME}` placeholders from the environment.
  pub fn from_toml_str(raw: &str) -> Result<Self> {
    let mut value: toml::Value = toml::from_str(raw)?;
    substitute_env(&mut value);
    let config: Config = value.try_into()?;
    config.validate()?;
    Ok(config)
  }

  /// Picks the configuration file to load.
  ///
  /// An explicit path always wins. Otherwise `./digester.toml` and then
  /// `<config dir>/digester/config.toml` are tried in that order.
  pub fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
      return Ok(path.to_path_buf());
    }
    let candidates = Self::candidate_paths();
    candidates.iter().find(|p| p.is_file()).cloned().ok_or_else(|| {
      let tried = candidates.iter().map(|p| p.display().to_string()).collect::<Vec<_>>();
      DigestError::Config(format!(
        "No configuration file found (tried {}). Run `digester init` to create one.",
        tried.join(", ")
      ))
    })
  }

  /// Locations searched when no explicit configuration path is given.
  pub fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("digester.toml")];
    if let Some(dir) = dirs::config_dir() {
      paths.push(dir.join("digester").join("config.toml"));
    }
    paths
  }

  /// Checks invariants that serde cannot express.
  pub fn validate(&self) -> Result<()> {
    let key = self.llm.api_key.trim();
    if key.is_empty() || ENV_PLACEHOLDER.is_match(key) {
      return Err(DigestError::Config(
        "llm.api_key is empty or references an unset environment variable".to_string(),
      ));
    }
    if self.analysis.questions.is_empty() {
      return Err(DigestError::Config("analysis.questions must contain at least one question".into()));
    }
    if self.analysis.questions.iter().any(|q| q.trim().is_empty()) {
      return Err(DigestError::Config("analysis.questions contains an empty question".into()));
    }
    if self.analysis.concurrency == 0 {
      return Err(DigestError::Config("analysis.concurrency must be at least 1".into()));
    }
    if self.source.page_size == 0 {
      return Err(DigestError::Config("source.page_size must be at least 1".into()));
    }
    if self.categories.is_empty() {
      return Err(DigestError::Config("at least one [[categories]] entry is required".into()));
    }
    let mut seen = std::collections::HashSet::new();
    for category in &self.categories {
      let name = category.name.trim().to_lowercase();
      if name.is_empty() {
        return Err(DigestError::Config("category names must not be empty".into()));
      }
      if !seen.insert(name) {
        return Err(DigestError::Config(format!("duplicate category {:?}", category.name)));
      }
    }
    if self.email.enabled {
      if self.email.smtp_server.trim().is_empty() {
        return Err(DigestError::Config("email.smtp_server is required when email is enabled".into()));
      }
      if self.email.sender().trim().is_empty() {
        return Err(DigestError::Config("email.from or email.username is required".into()));
      }
      if self.email.to.is_empty() && self.email.cc.is_empty() && self.email.bcc.is_empty() {
        return Err(DigestError::Config("email is enabled but has no recipients".into()));
      }
      for (field, addresses) in
        [("email.to", &self.email.to), ("email.cc", &self.email.cc), ("email.bcc", &self.email.bcc)]
      {
        if let Some((address, e)) =
          addresses.iter().find_map(|a| a.parse::<Mailbox>().err().map(|e| (a, e)))
        {
          return Err(DigestError::Config(format!(
            "{field} contains an invalid address {address:?}: {e}"
          )));
        }
      }
    }
    self.scheduler.time_of_day()?;
    if self.scheduler.mode == ScheduleMode::Weekly {
      self.scheduler.day_of_week()?;
    }
    if self.scheduler.mode == ScheduleMode::Interval && self.scheduler.interval_minutes == 0 {
      return Err(DigestError::Config("scheduler.interval_minutes must be at least 1".into()));
    }
    Ok(())
  }

  /// Keywords used by the source pre-filter: `source.keywords` plus every category's keywords.
  pub fn filter_keywords(&self) -> Vec<String> {
    if !self.source.keyword_filter {
      return Vec::new();
    }
    let mut keywords = self.source.keywords.clone();
    keywords.extend(self.categories.iter().flat_map(|c| c.keywords.iter().cloned()));
    keywords.sort();
    keywords.dedup();
    keywords
  }

  /// `<base_dir>/<yymmdd>`.
  pub fn run_dir(&self, date: NaiveDate) -> PathBuf { self.output.base_dir.join(format::date_dir(date)) }

  /// Where a run's PDFs are stored.
  pub fn pdf_dir(&self, date: NaiveDate) -> PathBuf { self.run_dir(date).join("pdf_downloads") }

  /// Where a run's reports are written.
  pub fn report_dir(&self, date: NaiveDate) -> PathBuf { self.run_dir(date).join("reports") }

  /// Snapshot of the papers fetched for a run.
  pub fn papers_snapshot(&self, date: NaiveDate) -> PathBuf { self.run_dir(date).join("papers.json") }

  /// SQLite analysis cache.
  pub fn cache_path(&self) -> PathBuf {
    self.output.cache_path.clone().unwrap_or_else(|| self.output.base_dir.join("analysis_cache.db"))
  }

  /// Lock file guarding against overlapping runs.
  pub fn lock_path(&self) -> PathBuf { self.output.base_dir.join(".run.lock") }

  /// A copy safe to print, with credentials masked.
  pub fn redacted(&self) -> Self {
    let mut copy = self.clone();
    copy.llm.api_key = mask(&copy.llm.api_key);
    copy.email.password = mask(&copy.email.password);
    copy
  }
}

/// Keeps the last four characters of a secret.
fn mask(secret: &str) -> String {
  let count = secret.chars().count();
  if count <= 4 {
    return "****".to_string();
  }
  let tail: String = secret.chars().skip(count - 4).collect();
  format!("****{tail}")
}

/// Replaces `${NAME}` in every string value with the variable's value, leaving unset ones as is.
fn substitute_env(value: &mut toml::Value) {
  match value {
    toml::Value::String(s) if s.contains("${") => {
      let replaced = ENV_PLACEHOLDER.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| {
          warn!("Environment variable {} is not set", &caps[1]);
          caps[0].to_string()
        })
      });
      *s = replaced.into_owned();
    },
    toml::Value::Array(items) => items.iter_mut().for_each(substitute_env),
    toml::Value::Table(table) => table.iter_mut().for_each(|(_, v)| substitute_env(v)),
    _ => {},
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_example_config_parses() {
    let text = EXAMPLE_CONFIG.replace("${KIMI_API_KEY}", "sk-example");
    let config = Config::from_toml_str(&text).unwrap();
    assert_eq!(config.categories.len(), 9);
    assert_eq!(config.categories[0].name, "大模型");
    assert_eq!(config.analysis.questions, AnalysisConfig::default().questions);
    assert_eq!(config.llm.model(), "kimi-k2-0711-preview");
    assert_eq!(config.scheduler.time_of_day().unwrap(), NaiveTime::from_hms_opt(9, 0, 0).unwrap());
  }

  #[traced_test]
  #[test]
  fn test_env_substitution() {
    std::env::set_var("DIGESTER_TEST_SUBSTITUTED_KEY", "sk-from-env");
    let config = Config::from_toml_str(
      r#"
      [llm]
      api_key = "${DIGESTER_TEST_SUBSTITUTED_KEY}"

      [email]
      username = "${DIGESTER_TEST_DEFINITELY_UNSET}"
      "#,
    )
    .unwrap();
    assert_eq!(config.llm.api_key, "sk-from-env");
    assert_eq!(config.email.username, "${DIGESTER_TEST_DEFINITELY_UNSET}");
    assert!(logs_contain("DIGESTER_TEST_DEFINITELY_UNSET is not set"));
  }

  #[test]
  fn test_unresolved_api_key_rejected() {
    let err = Config::from_toml_str("[llm]\napi_key = \"${DIGESTER_TEST_NEVER_SET}\"").unwrap_err();
    assert!(err.to_string().contains("llm.api_key"));
  }

  #[test]
  fn test_validation_errors() {
    let base = "[llm]\napi_key = \"k\"\n";
    let cases = [
      ("[analysis]\nquestions = []\n", "at least one question"),
      ("[[categories]]\nname = \"LLM\"\n[[categories]]\nname = \"llm\"\n", "duplicate category"),
      ("[email]\nenabled = true\nfrom = \"a@b.c\"\n", "no recipients"),
      (
        "[email]\nenabled = true\nfrom = \"a@b.c\"\nto = [\"reader@example.com\"]\ncc = [\"not an address\"]\n",
        "email.cc contains an invalid address",
      ),
      ("[scheduler]\nrun_time = \"9am\"\n", "HH:MM"),
      ("[scheduler]\nmode = \"weekly\"\nweekday = \"someday\"\n", "day of the week"),
    ];
    for (extra, expected) in cases {
      let err = Config::from_toml_str(&format!("{base}{extra}")).unwrap_err();
      assert!(err.to_string().contains(expected), "{extra:?} gave {err}");
    }
  }

  #[test]
  fn test_missing_file_names_path() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let err = Config::load(&path).unwrap_err();
    assert!(matches!(err, DigestError::Config(_)));
    assert!(err.to_string().contains("absent.toml"));
  }

  #[test]
  fn test_layout_and_redaction() {
    let mut config = Config::from_toml_str("[llm]\napi_key = \"sk-abcdef123456\"").unwrap();
    config.output.base_dir = PathBuf::from("/data/digests");
    let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
    assert_eq!(config.pdf_dir(date), PathBuf::from("/data/digests/240309/pdf_downloads"));
    assert_eq!(config.cache_path(), PathBuf::from("/data/digests/analysis_cache.db"));
    assert_eq!(config.redacted().llm.api_key, "****3456");
    assert_eq!(config.email.subject(date), "arXiv CS 论文日报 2024-03-09");
  }

  #[test]
  fn test_filter_keywords_respects_switch() {
    let mut config = Config::from_toml_str("[llm]\napi_key = \"k\"").unwrap();
    assert!(config.filter_keywords().iter().any(|k| k == "LoRA"));
    config.source.keyword_filter = false;
    assert!(config.filter_keywords().is_empty());
  }
}
