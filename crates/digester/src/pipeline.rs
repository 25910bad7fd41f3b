//! Run orchestration.
//!
//! A [`Pipeline`] drives one run for a date: crawl the listing, classify and analyse every
//! candidate, render the report and mail it. Each stage is also available on its own (`crawl`,
//! `analyze`, `report`, `send`) so a failed run can be continued by hand.
//!
//! Only run-scoped failures (listing, configuration, cache store, lock) are returned as `Err`.
//! Paper-scoped failures are recorded as [`Outcome`]s on the [`RunSummary`] and the run moves on
//! to the next paper.
//!
//! At most one run operates on an output directory at a time: an in-process mutex guards against
//! overlapping calls on the same pipeline and a [`RunLock`] file against other processes.

use std::collections::HashSet;

use futures::{future, stream, StreamExt, TryStreamExt};

use super::*;
use crate::{
  analysis::{Analysis, AnalysisEngine, Completion, Origin},
  config::Config,
  dispatch::{DispatchNotifier, DispatchReport, MailTransport, SmtpTransport},
  llm::{ChatClient, LanguageModel},
  lock::RunLock,
  pdf::PdfStore,
  relevance::{RelevanceFilter, Taxonomy},
  report::{Report, ReportAssembler, ReportWriter},
  retry::RetryPolicy,
  source::{self, ArxivSource, FetchQuery, PaperSource},
  store::CacheStore,
};

/// Everything a run needs, built once and shared by every stage.
#[derive(Clone)]
pub struct Context {
  /// Loaded configuration
  pub config:    Arc<Config>,
  /// Paper listing
  pub source:    Arc<dyn PaperSource>,
  /// Language model for classification and analysis
  pub llm:       Arc<dyn LanguageModel>,
  /// Analysis cache
  pub store:     Arc<CacheStore>,
  /// Mail transport, `None` when mail is disabled
  pub transport: Option<Arc<dyn MailTransport>>,
  /// Retry policy for model calls
  pub retry:     RetryPolicy,
}

impl Context {
  /// Builds the production collaborators described by `config`.
  pub async fn from_config(config: Config) -> Result<Self> {
    let source: Arc<dyn PaperSource> = Arc::new(ArxivSource::from_config(&config.source)?);
    let llm: Arc<dyn LanguageModel> = Arc::new(ChatClient::new(&config.llm)?);
    let store = Arc::new(CacheStore::open(config.cache_path()).await?);
    let transport = if config.email.enabled {
      Some(Arc::new(SmtpTransport::new(&config.email)?) as Arc<dyn MailTransport>)
    } else {
      None
    };
    let retry = RetryPolicy::from_config(&config.llm.retry, config.llm.timeout());
    Ok(Self { config: Arc::new(config), source, llm, store, transport, retry })
  }
}

/// Pipeline stage a recorded failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  /// Relevance classification
  Classification,
  /// Question sequence
  Analysis,
  /// PDF download or extraction
  Attachment,
}

impl Display for Stage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Classification => write!(f, "classification"),
      Self::Analysis => write!(f, "analysis"),
      Self::Attachment => write!(f, "attachment"),
    }
  }
}

/// A paper-scoped failure recorded during a run.
#[derive(Debug)]
pub struct Outcome {
  /// Where it happened
  pub stage:    Stage,
  /// Affected paper
  pub paper_id: String,
  /// What happened
  pub error:    DigestError,
}

/// What a run did.
#[derive(Debug)]
pub struct RunSummary {
  /// Date the run covers
  pub run_date:    NaiveDate,
  /// Distinct candidates listed
  pub fetched:     usize,
  /// Candidates judged irrelevant or not classifiable
  pub dropped:     usize,
  /// Papers answered entirely from the cache
  pub cache_hits:  usize,
  /// Papers sent through the question sequence, resumed ones included
  pub analyzed:    usize,
  /// Of those, papers resumed from a partial entry
  pub resumed:     usize,
  /// Of those, papers still partial after this run
  pub partial:     usize,
  /// Paper-scoped failures in processing order
  pub outcomes:    Vec<Outcome>,
  /// Main report file, once written
  pub report_path: Option<PathBuf>,
  /// Mail delivery, when attempted
  pub dispatch:    Option<DispatchReport>,
}

impl RunSummary {
  /// An empty summary for `run_date`.
  pub fn new(run_date: NaiveDate, fetched: usize) -> Self {
    Self {
      run_date,
      fetched,
      dropped: 0,
      cache_hits: 0,
      analyzed: 0,
      resumed: 0,
      partial: 0,
      outcomes: Vec::new(),
      report_path: None,
      dispatch: None,
    }
  }

  /// Recorded failures of `stage`.
  pub fn outcomes_of(&self, stage: Stage) -> impl Iterator<Item = &Outcome> {
    self.outcomes.iter().filter(move |o| o.stage == stage)
  }

  /// Folds one paper's result into the counts.
  fn absorb(&mut self, processed: Processed) {
    match processed.disposition {
      Disposition::CacheHit => self.cache_hits += 1,
      Disposition::Dropped => self.dropped += 1,
      Disposition::Analyzed { origin, completion } => {
        self.analyzed += 1;
        if matches!(origin, Origin::Resumed(_)) {
          self.resumed += 1;
        }
        if completion == Completion::Partial {
          self.partial += 1;
        }
      },
    }
    self.outcomes.extend(processed.outcomes);
  }
}

/// How one paper left the run.
#[derive(Debug)]
enum Disposition {
  /// Complete cache entry reused
  CacheHit,
  /// Not relevant, or classification failed
  Dropped,
  /// Went through the analysis engine
  Analyzed {
    /// Fresh or resumed
    origin:     Origin,
    /// State after this run
    completion: Completion,
  },
}

/// One paper's result plus its recorded failures.
#[derive(Debug)]
struct Processed {
  /// How the paper left the run
  disposition: Disposition,
  /// Paper-scoped failures
  outcomes:    Vec<Outcome>,
}

impl Processed {
  /// No failures recorded.
  fn clean(disposition: Disposition) -> Self { Self { disposition, outcomes: Vec::new() } }
}

/// A written report.
#[derive(Debug)]
pub struct RenderedReport {
  /// Grouped results
  pub report:   Report,
  /// Rendered Markdown
  pub markdown: String,
  /// Main report file
  pub path:     PathBuf,
}

/// Both halves of the run lock, released together.
struct RunGuard<'a> {
  /// In-process half
  _local: tokio::sync::MutexGuard<'a, ()>,
  /// Cross-process half
  _file:  RunLock,
}

/// Runs the stages for a date.
pub struct Pipeline {
  /// Shared collaborators
  ctx:       Context,
  /// Relevance stage
  filter:    RelevanceFilter,
  /// Analysis stage
  engine:    AnalysisEngine,
  /// Report grouping and rendering
  assembler: ReportAssembler,
  /// PDF downloads
  pdfs:      PdfStore,
  /// Held for the duration of a stage
  running:   tokio::sync::Mutex<()>,
}

impl Pipeline {
  /// Wires every stage to `ctx`.
  pub fn new(ctx: Context) -> Result<Self> {
    let config = ctx.config.clone();
    let taxonomy = Arc::new(Taxonomy::new(config.categories.clone()));
    let filter = RelevanceFilter::new(ctx.llm.clone(), taxonomy.clone(), ctx.retry.clone());
    let engine = AnalysisEngine::new(
      ctx.llm.clone(),
      ctx.store.clone(),
      Arc::new(config.analysis.questions.clone()),
      ctx.retry.clone(),
    )
    .with_question_template(config.analysis.question_template.clone())
    .with_system_prompt(config.analysis.system_prompt.clone())
    .with_max_context_chars(config.analysis.max_context_chars);
    let assembler =
      ReportAssembler::new(taxonomy, config.report.title.clone(), config.analysis.questions.len())
        .with_author_limit(config.report.author_limit);
    let pdfs = PdfStore::new(ctx.retry.clone().with_timeout(config.llm.timeout()))?;
    Ok(Self { ctx, filter, engine, assembler, pdfs, running: tokio::sync::Mutex::new(()) })
  }

  /// Shared collaborators.
  pub fn context(&self) -> &Context { &self.ctx }

  /// Takes both halves of the run lock.
  async fn lock(&self) -> Result<RunGuard<'_>> {
    let lock_path = self.ctx.config.lock_path();
    let local =
      self.running.try_lock().map_err(|_| DigestError::RunInProgress(lock_path.clone()))?;
    let file = RunLock::acquire_async(lock_path).await?;
    Ok(RunGuard { _local: local, _file: file })
  }

  /// Runs every stage for `date`.
  ///
  /// A run-scoped failure aborts the run and, when configured, mails a failure notice to the
  /// primary recipients before the error is returned.
  pub async fn run(&self, date: NaiveDate) -> Result<RunSummary> {
    let _guard = self.lock().await?;
    info!("Starting run for {date}");
    match self.run_stages(date).await {
      Ok(summary) => {
        info!(
          "Run for {date} finished: {} fetched, {} dropped, {} cached, {} analysed ({} partial)",
          summary.fetched, summary.dropped, summary.cache_hits, summary.analyzed, summary.partial
        );
        Ok(summary)
      },
      Err(e) => {
        error!("Run for {date} aborted: {e}");
        self.notify_failure(date, &e).await;
        Err(e)
      },
    }
  }

  /// Body of [`Pipeline::run`], with the lock held.
  async fn run_stages(&self, date: NaiveDate) -> Result<RunSummary> {
    let papers = self.fetch(date).await?;
    let mut summary = self.process_all(date, papers).await?;
    let rendered = self.render(date).await?;
    summary.report_path = Some(rendered.path.clone());
    if self.ctx.config.email.enabled {
      summary.dispatch = self.deliver(date, &rendered).await;
    }
    Ok(summary)
  }

  /// Fetches the candidates for `date` and snapshots them in the run directory.
  pub async fn crawl(&self, date: NaiveDate) -> Result<Vec<PaperRecord>> {
    let _guard = self.lock().await?;
    self.fetch(date).await
  }

  /// Classifies and analyses the snapshot written by [`Pipeline::crawl`].
  pub async fn analyze(&self, date: NaiveDate) -> Result<RunSummary> {
    let _guard = self.lock().await?;
    let papers = self.read_snapshot(date).await?;
    self.process_all(date, papers).await
  }

  /// Regenerates the report for `date` from the cache.
  pub async fn report(&self, date: NaiveDate) -> Result<RenderedReport> {
    let _guard = self.lock().await?;
    self.render(date).await
  }

  /// Regenerates the report for `date` and mails it.
  pub async fn send(&self, date: NaiveDate) -> Result<Option<DispatchReport>> {
    if self.ctx.transport.is_none() || !self.ctx.config.email.enabled {
      return Err(DigestError::Config("email.enabled is false; nothing to send".into()));
    }
    let _guard = self.lock().await?;
    let rendered = self.render(date).await?;
    Ok(self.deliver(date, &rendered).await)
  }

  /// Lists, de-duplicates and snapshots the candidates for `date`.
  async fn fetch(&self, date: NaiveDate) -> Result<Vec<PaperRecord>> {
    let config = &self.ctx.config;
    let query = FetchQuery::for_run(config, date);
    let retry = self.ctx.retry.clone().with_timeout(Duration::from_secs(config.source.timeout_secs));
    info!("Fetching papers submitted {} to {}", query.from, query.to);

    let mut seen = HashSet::new();
    let papers: Vec<PaperRecord> = source::papers(self.ctx.source.as_ref(), &query, &retry)
      .try_filter(|paper| future::ready(seen.insert(paper.id.clone())))
      .try_collect()
      .await?;
    info!("Fetched {} candidate papers", papers.len());

    let snapshot = config.papers_snapshot(date);
    if let Some(dir) = snapshot.parent() {
      tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(&snapshot, serde_json::to_vec_pretty(&papers)?).await?;
    debug!("Snapshot written to {}", snapshot.display());
    Ok(papers)
  }

  /// Reads the candidates written by an earlier crawl.
  async fn read_snapshot(&self, date: NaiveDate) -> Result<Vec<PaperRecord>> {
    let snapshot = self.ctx.config.papers_snapshot(date);
    let raw = tokio::fs::read(&snapshot).await.map_err(|e| {
      DigestError::Fetch(format!(
        "No fetched papers for {date} at {} ({e}); run `digester crawl` first",
        snapshot.display()
      ))
    })?;
    Ok(serde_json::from_slice(&raw)?)
  }

  /// Sends every paper through classification and analysis.
  async fn process_all(&self, date: NaiveDate, papers: Vec<PaperRecord>) -> Result<RunSummary> {
    let mut summary = RunSummary::new(date, papers.len());
    let concurrency = self.ctx.config.analysis.concurrency.max(1);
    let mut processed = stream::iter(papers.iter())
      .map(|paper| async move { (paper, self.process(date, paper).await) })
      .buffered(concurrency);
    // Run membership follows listing order, not completion order.
    while let Some((paper, step)) = processed.next().await {
      let step = step?;
      if !matches!(step.disposition, Disposition::Dropped) {
        self.ctx.store.record_run(date, &paper.id).await?;
      }
      summary.absorb(step);
    }
    Ok(summary)
  }

  /// Handles one paper: cache check, classification, PDF and analysis.
  async fn process(&self, date: NaiveDate, paper: &PaperRecord) -> Result<Processed> {
    let store = &self.ctx.store;
    let category = match store.load(&paper.id).await? {
      Some(entry) if entry.completion == Completion::Complete => {
        debug!("{} is already analysed", paper.id);
        return Ok(Processed::clean(Disposition::CacheHit));
      },
      Some(entry) => entry.category,
      None => match self.filter.classify(paper).await {
        Ok(decision) => match decision.category {
          Some(category) if decision.keep => category,
          _ => return Ok(Processed::clean(Disposition::Dropped)),
        },
        Err(e) => {
          warn!(paper = %paper.id, "Dropping after classification failure: {e}");
          return Ok(Processed {
            disposition: Disposition::Dropped,
            outcomes:    vec![Outcome { stage: Stage::Classification, paper_id: paper.id.clone(), error: e }],
          });
        },
      },
    };

    let mut outcomes = Vec::new();
    let (pdf_path, document) = self.prepare_pdf(date, paper, &mut outcomes).await;
    let Analysis { result, origin, error, .. } =
      self.engine.analyze(paper, &category, document.as_deref()).await?;

    if let Some(path) = &pdf_path {
      if result.pdf_path.as_ref() != Some(path) {
        store.set_pdf_path(&paper.id, path).await?;
      }
    }
    if let Some(error) = error {
      outcomes.push(Outcome { stage: Stage::Analysis, paper_id: paper.id.clone(), error });
    }
    Ok(Processed {
      disposition: Disposition::Analyzed { origin, completion: result.completion },
      outcomes,
    })
  }

  /// Downloads the PDF and extracts its text as configured. Failures are recorded, never fatal.
  async fn prepare_pdf(
    &self,
    date: NaiveDate,
    paper: &PaperRecord,
    outcomes: &mut Vec<Outcome>,
  ) -> (Option<PathBuf>, Option<String>) {
    let analysis = &self.ctx.config.analysis;
    if !analysis.download_pdfs && !analysis.include_pdf_text {
      return (None, None);
    }

    let path = match self.pdfs.fetch(paper, &self.ctx.config.pdf_dir(date)).await {
      Ok(path) => path,
      Err(e) => {
        warn!(paper = %paper.id, "PDF unavailable: {e}");
        outcomes.push(Outcome { stage: Stage::Attachment, paper_id: paper.id.clone(), error: e });
        return (None, None);
      },
    };
    if !analysis.include_pdf_text {
      return (Some(path), None);
    }
    match PdfStore::extract_text(&path, analysis.max_pdf_pages).await {
      Ok(text) => (Some(path), Some(text)),
      Err(e) => {
        warn!(paper = %paper.id, "PDF text unavailable: {e}");
        outcomes.push(Outcome { stage: Stage::Attachment, paper_id: paper.id.clone(), error: e });
        (Some(path), None)
      },
    }
  }

  /// Builds and writes the report for `date` from the cache.
  async fn render(&self, date: NaiveDate) -> Result<RenderedReport> {
    let results = self.ctx.store.run_results(date).await?;
    let report = self.assembler.assemble(date, results);
    let markdown = self.assembler.render_markdown(&report);
    let writer = ReportWriter::new(self.ctx.config.report_dir(date));
    let path = writer.write(date, &markdown).await?;
    if self.ctx.config.report.per_category {
      writer.write_sections(&self.assembler, &report).await?;
    }
    Ok(RenderedReport { report, markdown, path })
  }

  /// Mails `rendered`. Returns `None` when there is no transport or nothing to report.
  async fn deliver(&self, date: NaiveDate, rendered: &RenderedReport) -> Option<DispatchReport> {
    let transport = self.ctx.transport.clone()?;
    if rendered.report.is_empty() {
      info!("No papers for {date}; not sending mail");
      return None;
    }

    let email = &self.ctx.config.email;
    let mut attachments = Vec::new();
    if email.attach_report {
      attachments.push(rendered.path.clone());
    }
    if email.attach_pdfs {
      attachments.extend(rendered.report.pdf_paths());
    }
    let notifier = DispatchNotifier::from_config(transport, email);
    let report = notifier.dispatch(&email.subject(date), &rendered.markdown, &attachments).await;
    info!("Report mailed to {} of {} recipients", report.delivered(), report.deliveries.len());
    Some(report)
  }

  /// Mails a failure notice if configured to.
  async fn notify_failure(&self, date: NaiveDate, failure: &DigestError) {
    let config = &self.ctx.config;
    if !config.notifications.failure || !config.email.enabled {
      return;
    }
    let Some(transport) = self.ctx.transport.clone() else { return };
    let report =
      DispatchNotifier::from_config(transport, &config.email).notify_failure(date, failure).await;
    if report.failed() > 0 {
      warn!("Failure notice reached {} of {} recipients", report.delivered(), report.deliveries.len());
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use super::*;
  use crate::{
    dispatch::OutgoingMail,
    llm::{Conversation, Reply},
    relevance::Category,
    source::Page,
  };

  /// One page of fixed records.
  struct Fixed(Vec<PaperRecord>);

  #[async_trait]
  impl PaperSource for Fixed {
    async fn fetch_page(&self, _query: &FetchQuery, _offset: usize) -> Result<Page> {
      Ok(Page { records: self.0.clone(), exhausted: true })
    }
  }

  /// Keeps everything as `LLM` and answers every question.
  #[derive(Default)]
  struct Agreeable {
    classified: Mutex<usize>,
  }

  #[async_trait]
  impl LanguageModel for Agreeable {
    async fn classify(&self, _prompt: &str) -> Result<Reply> {
      *self.classified.lock().unwrap() += 1;
      Ok(Reply::text("LLM"))
    }

    async fn converse(&self, _conversation: &Conversation, question: &str) -> Result<Reply> {
      Ok(Reply::text(format!("re: {question}")))
    }
  }

  /// Refuses every message.
  struct Refusing;

  #[async_trait]
  impl MailTransport for Refusing {
    async fn deliver(&self, _mail: &OutgoingMail) -> Result<()> {
      Err(DigestError::Api { status: 550, message: "no".into() })
    }
  }

  fn paper(id: &str) -> PaperRecord {
    PaperRecord {
      id:              id.into(),
      title:           format!("Paper {id}"),
      abstract_text:   "An abstract.".into(),
      authors:         vec!["A. Author".into()],
      tags:            vec!["cs.CL".into()],
      pdf_url:         None,
      abs_url:         format!("https://arxiv.org/abs/{id}"),
      published:       Utc::now(),
      matched_keyword: None,
    }
  }

  async fn context(base: &Path, papers: Vec<PaperRecord>, llm: Arc<Agreeable>) -> Context {
    let mut config = Config::default();
    config.output.base_dir = base.to_path_buf();
    config.analysis.questions = vec!["Q1".into(), "Q2".into()];
    config.analysis.question_template = "{question}".into();
    config.analysis.download_pdfs = false;
    config.categories = vec![Category { name: "LLM".into(), description: String::new(), keywords: vec![] }];
    Context {
      config:    Arc::new(config),
      source:    Arc::new(Fixed(papers)),
      llm,
      store:     Arc::new(CacheStore::open_in_memory().await.unwrap()),
      transport: None,
      retry:     RetryPolicy::immediate(1, Duration::from_secs(5)),
    }
  }

  fn date() -> NaiveDate { NaiveDate::from_ymd_opt(2024, 1, 15).unwrap() }

  #[traced_test]
  #[tokio::test]
  async fn test_duplicates_are_processed_once() {
    let dir = tempdir().unwrap();
    let llm = Arc::new(Agreeable::default());
    let ctx = context(dir.path(), vec![paper("1"), paper("1"), paper("2")], llm.clone()).await;
    let pipeline = Pipeline::new(ctx).unwrap();

    let summary = pipeline.run(date()).await.unwrap();
    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.analyzed, 2);
    assert_eq!(*llm.classified.lock().unwrap(), 2);
    assert!(summary.report_path.unwrap().ends_with("reports/daily_report_240115.md"));
    assert!(logs_contain("Run for 2024-01-15 finished"));
  }

  #[tokio::test]
  async fn test_second_run_is_all_cache_hits() {
    let dir = tempdir().unwrap();
    let llm = Arc::new(Agreeable::default());
    let pipeline = Pipeline::new(context(dir.path(), vec![paper("1")], llm.clone()).await).unwrap();

    pipeline.run(date()).await.unwrap();
    let again = pipeline.run(date()).await.unwrap();
    assert_eq!(again.cache_hits, 1);
    assert_eq!(again.analyzed, 0);
    assert_eq!(*llm.classified.lock().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_stages_can_run_separately() {
    let dir = tempdir().unwrap();
    let llm = Arc::new(Agreeable::default());
    let pipeline = Pipeline::new(context(dir.path(), vec![paper("1")], llm).await).unwrap();

    let err = pipeline.analyze(date()).await.unwrap_err();
    assert!(matches!(err, DigestError::Fetch(ref msg) if msg.contains("digester crawl")));

    assert_eq!(pipeline.crawl(date()).await.unwrap().len(), 1);
    assert!(dir.path().join("240115").join("papers.json").exists());
    assert_eq!(pipeline.analyze(date()).await.unwrap().analyzed, 1);

    let rendered = pipeline.report(date()).await.unwrap();
    assert_eq!(rendered.report.paper_count(), 1);
    assert!(rendered.markdown.contains("Paper 1"));
  }

  #[tokio::test]
  async fn test_lock_held_by_live_process_blocks_run() {
    let dir = tempdir().unwrap();
    let llm = Arc::new(Agreeable::default());
    let pipeline = Pipeline::new(context(dir.path(), vec![paper("1")], llm).await).unwrap();

    let _held = RunLock::acquire(pipeline.context().config.lock_path()).unwrap();
    assert!(matches!(pipeline.run(date()).await, Err(DigestError::RunInProgress(_))));
  }

  #[tokio::test]
  async fn test_send_requires_mail() {
    let dir = tempdir().unwrap();
    let llm = Arc::new(Agreeable::default());
    let pipeline = Pipeline::new(context(dir.path(), vec![], llm).await).unwrap();
    assert!(matches!(pipeline.send(date()).await, Err(DigestError::Config(_))));
  }

  #[tokio::test]
  async fn test_delivery_failures_do_not_fail_the_run() {
    let dir = tempdir().unwrap();
    let llm = Arc::new(Agreeable::default());
    let mut ctx = context(dir.path(), vec![paper("1")], llm).await;
    let mut config = (*ctx.config).clone();
    config.email.enabled = true;
    config.email.to = vec!["a@example.com".into()];
    ctx.config = Arc::new(config);
    ctx.transport = Some(Arc::new(Refusing));

    let summary = Pipeline::new(ctx).unwrap().run(date()).await.unwrap();
    let dispatch = summary.dispatch.unwrap();
    assert_eq!(dispatch.failed(), 1);
    assert!(matches!(dispatch.deliveries[0].error, Some(DigestError::Delivery { .. })));
  }
}
