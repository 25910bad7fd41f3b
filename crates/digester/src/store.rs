//! Persistent analysis cache backed by SQLite.
//!
//! The cache is the only state that survives between runs. It holds one entry per analysed
//! paper, keyed by paper id, with the paper metadata the report needs, the assigned category,
//! the conversation handle, the completion status and the answers recorded so far.
//!
//! Answers are written one row at a time, immediately after each answer arrives, so a crash in
//! the middle of a question sequence leaves a partial entry that the next run resumes. Answers
//! are append-only and strictly positional: [`CacheStore::append_answer`] refuses any position
//! other than the next one.
//!
//! Run membership (`run_papers`) records which entries were selected by which run, in
//! processing order, so a run's report can be regenerated from the cache alone.
//!
//! # Examples
//!
//! ```no_run
//! use digester::store::CacheStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = CacheStore::open(CacheStore::default_path()).await?;
//! if let Some(entry) = store.load("2401.00001").await? {
//!   println!("{} answers recorded", entry.answers.len());
//! }
//! # Ok(())
//! # }
//! ```

use rusqlite::{params, OptionalExtension};
use tokio_rusqlite::Connection;

use super::*;
use crate::{
  analysis::{AnalysisResult, Completion, QuestionAnswer},
  llm::ConversationHandle,
};

/// Handle to the analysis cache.
///
/// All access goes through a single connection, so writes are serialized.
pub struct CacheStore {
  /// Async SQLite connection handle
  conn: Connection,
}

/// Entry counts by status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
  /// Entries with every question answered
  pub complete: usize,
  /// Entries still missing answers
  pub partial:  usize,
  /// Distinct run dates recorded
  pub runs:     usize,
}

/// An entry as stored, before JSON and status decoding.
struct RawEntry {
  /// Serialized paper record
  paper:        String,
  /// Assigned category
  category:     String,
  /// Stored conversation handle
  conversation: Option<String>,
  /// `complete` or `partial`
  status:       String,
  /// Stored PDF location
  pdf_path:     Option<String>,
  /// Last write
  updated_at:   DateTime<Utc>,
  /// Answers in position order
  answers:      Vec<QuestionAnswer>,
}

impl RawEntry {
  /// Decodes the stored representation.
  fn into_result(self) -> Result<AnalysisResult> {
    Ok(AnalysisResult {
      paper:        serde_json::from_str(&self.paper)?,
      category:     self.category,
      answers:      self.answers,
      conversation: self.conversation.map(ConversationHandle::new),
      completion:   self.status.parse()?,
      pdf_path:     self.pdf_path.map(PathBuf::from),
      analyzed_at:  self.updated_at,
    })
  }
}

/// Reads one entry and its answers.
fn read_entry(conn: &rusqlite::Connection, paper_id: &str) -> rusqlite::Result<Option<RawEntry>> {
  let entry = conn
    .prepare_cached(
      "SELECT paper, category, conversation, status, pdf_path, updated_at
       FROM analyses WHERE paper_id = ?1",
    )?
    .query_row(params![paper_id], |row| {
      Ok(RawEntry {
        paper:        row.get(0)?,
        category:     row.get(1)?,
        conversation: row.get(2)?,
        status:       row.get(3)?,
        pdf_path:     row.get(4)?,
        updated_at:   row.get(5)?,
        answers:      Vec::new(),
      })
    })
    .optional()?;

  let Some(mut entry) = entry else { return Ok(None) };
  let mut stmt = conn.prepare_cached(
    "SELECT question, answer FROM answers WHERE paper_id = ?1 ORDER BY position ASC",
  )?;
  entry.answers = stmt
    .query_map(params![paper_id], |row| {
      Ok(QuestionAnswer { question: row.get(0)?, answer: row.get(1)? })
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(Some(entry))
}

impl CacheStore {
  /// Opens or creates the cache at `path`, applying the schema.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      tokio::fs::create_dir_all(parent).await?;
    }
    let conn = Connection::open(path).await?;
    Self::initialize(conn).await
  }

  /// Opens a throwaway in-memory cache.
  pub async fn open_in_memory() -> Result<Self> { Self::initialize(Connection::open_in_memory().await?).await }

  /// Applies the schema.
  async fn initialize(conn: Connection) -> Result<Self> {
    conn
      .call(|conn| {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations/init.sql")))?;
        Ok(())
      })
      .await?;
    Ok(Self { conn })
  }

  /// Default cache location when none is configured.
  ///
  /// - On Unix: `~/.local/share/digester/analysis_cache.db`
  /// - On macOS: `~/Library/Application Support/digester/analysis_cache.db`
  /// - On Windows: `%APPDATA%\digester\analysis_cache.db`
  pub fn default_path() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("digester").join("analysis_cache.db")
  }

  /// Loads the entry for `paper_id`, if any.
  pub async fn load(&self, paper_id: &str) -> Result<Option<AnalysisResult>> {
    let paper_id = paper_id.to_string();
    let raw = self.conn.call(move |conn| Ok(read_entry(conn, &paper_id)?)).await?;
    raw.map(RawEntry::into_result).transpose()
  }

  /// Opens a new, empty, partial entry.
  pub async fn begin(&self, paper: &PaperRecord, category: &str) -> Result<()> {
    let paper_id = paper.id.clone();
    let paper_json = serde_json::to_string(paper)?;
    let category = category.to_string();
    let now = Utc::now();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO analyses (paper_id, paper, category, status, started_at, updated_at)
           VALUES (?1, ?2, ?3, 'partial', ?4, ?4)",
          params![paper_id, paper_json, category, now],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Stores the conversation handle unless one is already stored.
  pub async fn set_conversation(&self, paper_id: &str, handle: &ConversationHandle) -> Result<()> {
    let paper_id = paper_id.to_string();
    let handle = handle.as_str().to_string();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE analyses SET conversation = ?2 WHERE paper_id = ?1 AND conversation IS NULL",
          params![paper_id, handle],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Appends the answer at `position` (zero-based).
  ///
  /// Fails with [`DigestError::CacheOrder`] unless `position` equals the number of answers
  /// already stored.
  pub async fn append_answer(&self, paper_id: &str, position: usize, turn: &QuestionAnswer) -> Result<()> {
    let id = paper_id.to_string();
    let turn = turn.clone();
    let now = Utc::now();
    let stored = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let count: usize =
          tx.query_row("SELECT COUNT(*) FROM answers WHERE paper_id = ?1", params![id], |row| row.get(0))?;
        if count != position {
          return Ok(Err(count));
        }
        tx.execute(
          "INSERT INTO answers (paper_id, position, question, answer, answered_at)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          params![id, position, turn.question, turn.answer, now],
        )?;
        tx.execute("UPDATE analyses SET updated_at = ?2 WHERE paper_id = ?1", params![id, now])?;
        tx.commit()?;
        Ok(Ok(()))
      })
      .await?;
    stored.map_err(|expected| DigestError::CacheOrder {
      paper_id: paper_id.to_string(),
      expected,
      got: position,
    })
  }

  /// Sets the completion status.
  pub async fn mark(&self, paper_id: &str, completion: Completion) -> Result<()> {
    let paper_id = paper_id.to_string();
    let now = Utc::now();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE analyses SET status = ?2, updated_at = ?3 WHERE paper_id = ?1",
          params![paper_id, completion.to_string(), now],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Records where the paper's PDF was stored.
  pub async fn set_pdf_path(&self, paper_id: &str, pdf_path: &Path) -> Result<()> {
    let paper_id = paper_id.to_string();
    let pdf_path = pdf_path.display().to_string();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE analyses SET pdf_path = ?2 WHERE paper_id = ?1",
          params![paper_id, pdf_path],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Adds `paper_id` to the run for `run_date`, keeping its first position if already present.
  pub async fn record_run(&self, run_date: NaiveDate, paper_id: &str) -> Result<()> {
    let paper_id = paper_id.to_string();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT OR IGNORE INTO run_papers (run_date, paper_id, seq)
           SELECT ?1, ?2, COALESCE(MAX(seq), 0) + 1 FROM run_papers WHERE run_date = ?1",
          params![run_date, paper_id],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Every entry selected by the run for `run_date`, in processing order.
  pub async fn run_results(&self, run_date: NaiveDate) -> Result<Vec<AnalysisResult>> {
    let raw = self
      .conn
      .call(move |conn| {
        let ids = conn
          .prepare_cached("SELECT paper_id FROM run_papers WHERE run_date = ?1 ORDER BY seq ASC")?
          .query_map(params![run_date], |row| row.get::<_, String>(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
          if let Some(entry) = read_entry(conn, &id)? {
            entries.push(entry);
          }
        }
        Ok(entries)
      })
      .await?;
    raw.into_iter().map(RawEntry::into_result).collect()
  }

  /// Entry counts for status output.
  pub async fn stats(&self) -> Result<CacheStats> {
    let stats = self
      .conn
      .call(|conn| {
        let count = |sql: &str| conn.query_row(sql, [], |row| row.get::<_, usize>(0));
        Ok(CacheStats {
          complete: count("SELECT COUNT(*) FROM analyses WHERE status = 'complete'")?,
          partial:  count("SELECT COUNT(*) FROM analyses WHERE status = 'partial'")?,
          runs:     count("SELECT COUNT(DISTINCT run_date) FROM run_papers")?,
        })
      })
      .await?;
    Ok(stats)
  }

  /// Identifiers of entries that still miss answers.
  pub async fn partial_ids(&self) -> Result<Vec<String>> {
    let ids = self
      .conn
      .call(|conn| {
        Ok(
          conn
            .prepare_cached("SELECT paper_id FROM analyses WHERE status = 'partial' ORDER BY updated_at")?
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?,
        )
      })
      .await?;
    Ok(ids)
  }
}
