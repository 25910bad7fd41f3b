//! Listing of candidate papers for a date window.
//!
//! A [`PaperSource`] answers one page of a listing at a time. [`papers`] turns those pages into a
//! lazy stream that:
//!
//! - is finite: it ends on a short or empty page, or once `max_papers` records were yielded
//! - is restartable: the same query always issues the same requests
//! - applies the keyword pre-filter, if configured
//! - retries each page under the [`RetryPolicy`], and ends with [`DigestError::Fetch`] once
//!   retries are exhausted
//!
//! # Examples
//!
//! ```no_run
//! use chrono::NaiveDate;
//! use digester::{
//!   config::Config,
//!   retry::RetryPolicy,
//!   source::{papers, ArxivSource, FetchQuery},
//! };
//! use futures::TryStreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let source = ArxivSource::from_config(&config.source)?;
//! let query = FetchQuery::for_run(&config, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
//! let retry = RetryPolicy::default();
//!
//! let found: Vec<_> = papers(&source, &query, &retry).try_collect().await?;
//! println!("{} candidate papers", found.len());
//! # Ok(())
//! # }
//! ```

use futures::{
  stream::{self, BoxStream},
  StreamExt, TryStreamExt,
};

use super::*;
use crate::{config::Config, paper::KeywordMatcher, retry::RetryPolicy};

pub mod arxiv;

pub use arxiv::ArxivSource;

/// What to list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchQuery {
  /// First submission day, inclusive
  pub from:       NaiveDate,
  /// Last submission day, inclusive
  pub to:         NaiveDate,
  /// Source categories such as `cs.AI`
  pub categories: Vec<String>,
  /// Pre-filter terms, empty to keep everything
  pub keywords:   Vec<String>,
  /// Upper bound on yielded records, `0` for none
  pub max_papers: usize,
  /// Pause before every page after the first
  pub page_delay: Duration,
}

impl FetchQuery {
  /// A query covering a single day.
  pub fn single_day(date: NaiveDate) -> Self {
    Self {
      from:       date,
      to:         date,
      categories: Vec::new(),
      keywords:   Vec::new(),
      max_papers: 0,
      page_delay: Duration::ZERO,
    }
  }

  /// The query a run for `date` issues: `lookback_days` days up to and including `date`.
  pub fn for_run(config: &Config, date: NaiveDate) -> Self {
    let back = config.source.lookback_days.max(1) - 1;
    let from = date.checked_sub_days(chrono::Days::new(u64::from(back))).unwrap_or(date);
    Self {
      from,
      to: date,
      categories: config.source.categories.clone(),
      keywords: config.filter_keywords(),
      max_papers: config.source.max_papers,
      page_delay: Duration::from_secs(config.source.request_delay_secs),
    }
  }
}

/// One page of listing results.
#[derive(Debug, Clone, Default)]
pub struct Page {
  /// Records in listing order
  pub records:   Vec<PaperRecord>,
  /// No further pages exist
  pub exhausted: bool,
}

/// A paper listing service.
#[async_trait]
pub trait PaperSource: Send + Sync {
  /// Fetches the page of `query` starting at `offset`.
  async fn fetch_page(&self, query: &FetchQuery, offset: usize) -> Result<Page>;
}

/// Position in the listing between pages.
#[derive(Debug, Clone, Copy)]
struct Cursor {
  /// Offset of the next page
  offset: usize,
  /// Pages fetched so far
  pages:  usize,
  /// The last page was the final one
  done:   bool,
}

/// Streams every record of `query`, fetching pages only as they are consumed.
pub fn papers<'a>(
  source: &'a dyn PaperSource,
  query: &'a FetchQuery,
  retry: &'a RetryPolicy,
) -> BoxStream<'a, Result<PaperRecord>> {
  let start = Cursor { offset: 0, pages: 0, done: false };
  let matcher = KeywordMatcher::new(&query.keywords);
  let pages = stream::try_unfold(start, move |cursor| {
    let matcher = matcher.clone();
    async move {
      if cursor.done {
        return Ok::<_, DigestError>(None);
      }
      if cursor.pages > 0 && !query.page_delay.is_zero() {
        tokio::time::sleep(query.page_delay).await;
      }

      let label = format!("Listing page at offset {}", cursor.offset);
      let page = retry.run(&label, || source.fetch_page(query, cursor.offset)).await.map_err(|e| {
        error!("{label} failed: {e}");
        match e {
          DigestError::Fetch(_) => e,
          other => DigestError::Fetch(other.to_string()),
        }
      })?;

      let fetched = page.records.len();
      let kept: Vec<_> = page
        .records
        .into_iter()
        .filter_map(|mut paper| {
          if matcher.is_empty() {
            return Some(paper);
          }
          paper.matched_keyword = Some(matcher.best_match(&paper.title)?.to_string());
          Some(paper)
        })
        .collect();
      info!("Listing offset {}: {fetched} entries, {} after keyword filter", cursor.offset, kept.len());

      let next = Cursor {
        offset: cursor.offset + fetched,
        pages:  cursor.pages + 1,
        done:   page.exhausted || fetched == 0,
      };
      Ok(Some((kept, next)))
    }
  });

  let records = pages.map_ok(|kept| stream::iter(kept.into_iter().map(Ok))).try_flatten();
  if query.max_papers > 0 {
    records.take(query.max_papers).boxed()
  } else {
    records.boxed()
  }
}
