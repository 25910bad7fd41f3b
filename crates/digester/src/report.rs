//! Category-grouped Markdown reports.
//!
//! A [`Report`] is assembled once per run from that run's analysis results, cache hits included.
//! Sections follow the taxonomy's display order; categories the taxonomy does not know follow
//! in the order they were first seen. Within a section, papers keep the order in which they were
//! analysed. Partial results are listed with a visible marker rather than left out.

use std::collections::HashMap;

use super::*;
use crate::{analysis::AnalysisResult, relevance::Taxonomy};

/// Categories listed under "Most active categories".
const TOP_CATEGORIES: usize = 3;

/// One category and its papers.
#[derive(Debug, Clone)]
pub struct ReportSection {
  /// Category name
  pub category: String,
  /// Papers in analysis order
  pub results:  Vec<AnalysisResult>,
}

/// All results of one run, grouped by category.
#[derive(Debug, Clone)]
pub struct Report {
  /// Run the report belongs to
  pub run_date:     NaiveDate,
  /// When the report was assembled
  pub generated_at: DateTime<Utc>,
  /// Sections in display order, empty categories omitted
  pub sections:     Vec<ReportSection>,
}

impl Report {
  /// Number of papers across all sections.
  pub fn paper_count(&self) -> usize { self.sections.iter().map(|s| s.results.len()).sum() }

  /// Number of partial results.
  pub fn partial_count(&self) -> usize {
    self.sections.iter().flat_map(|s| &s.results).filter(|r| r.is_partial()).count()
  }

  /// Whether the report lists no papers.
  pub fn is_empty(&self) -> bool { self.sections.is_empty() }

  /// Up to `limit` sections with the most papers, ties kept in display order.
  pub fn busiest_sections(&self, limit: usize) -> Vec<&ReportSection> {
    let mut sections: Vec<_> = self.sections.iter().collect();
    sections.sort_by_key(|s| std::cmp::Reverse(s.results.len()));
    sections.truncate(limit);
    sections
  }

  /// Stored PDFs of every listed paper.
  pub fn pdf_paths(&self) -> Vec<PathBuf> {
    self.sections.iter().flat_map(|s| &s.results).filter_map(|r| r.pdf_path.clone()).collect()
  }
}

/// Builds and renders reports.
pub struct ReportAssembler {
  /// Display order
  taxonomy:       Arc<Taxonomy>,
  /// Top-level heading
  title:          String,
  /// Number of configured questions, for partial markers
  question_count: usize,
  /// Authors shown before "et al."
  author_limit:   usize,
}

impl ReportAssembler {
  /// Creates an assembler ordering sections by `taxonomy`.
  pub fn new(taxonomy: Arc<Taxonomy>, title: impl Into<String>, question_count: usize) -> Self {
    Self { taxonomy, title: title.into(), question_count, author_limit: 5 }
  }

  /// Sets how many authors are listed before "et al.".
  pub fn with_author_limit(mut self, limit: usize) -> Self {
    self.author_limit = limit;
    self
  }

  /// Groups `results` into sections.
  pub fn assemble(&self, run_date: NaiveDate, results: Vec<AnalysisResult>) -> Report {
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<AnalysisResult>> = HashMap::new();
    for result in results {
      let category =
        self.taxonomy.canonical(&result.category).map(String::from).unwrap_or_else(|| result.category.clone());
      if !grouped.contains_key(&category) {
        order.push(category.clone());
      }
      grouped.entry(category).or_default().push(result);
    }

    // Known categories by taxonomy position, unknown ones after them by first appearance.
    let taxonomy = &self.taxonomy;
    order.sort_by_key(|name| taxonomy.position(name).unwrap_or(usize::MAX));

    let sections = order
      .into_iter()
      .filter_map(|category| {
        grouped.remove(&category).map(|results| ReportSection { category, results })
      })
      .collect();
    Report { run_date, generated_at: Utc::now(), sections }
  }

  /// Renders the whole report as Markdown.
  pub fn render_markdown(&self, report: &Report) -> String {
    let mut out = format!("# {}\n\n", self.title);
    out.push_str(&format!("- **Run date**: {}\n", report.run_date.format("%Y-%m-%d")));
    out.push_str(&format!(
      "- **Generated**: {}\n",
      report.generated_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str(&format!("- **Papers**: {}\n", report.paper_count()));
    if report.partial_count() > 0 {
      out.push_str(&format!("- **Partial analyses**: {}\n", report.partial_count()));
    }
    out.push('\n');

    if report.is_empty() {
      out.push_str("No relevant papers were found for this run.\n");
      return out;
    }

    out.push_str("## Overview\n\n| Category | Papers |\n| --- | ---: |\n");
    for section in &report.sections {
      out.push_str(&format!("| {} | {} |\n", section.category, section.results.len()));
    }
    out.push('\n');
    out.push_str("**Most active categories**\n\n");
    for (rank, section) in report.busiest_sections(TOP_CATEGORIES).into_iter().enumerate() {
      let count = section.results.len();
      out.push_str(&format!("{}. **{}** ({count} papers)\n", rank + 1, section.category));
    }
    out.push('\n');

    for section in &report.sections {
      out.push_str(&self.render_section(section));
    }
    out
  }

  /// Renders one category section.
  pub fn render_section(&self, section: &ReportSection) -> String {
    let mut out = format!("## {} ({})\n\n", section.category, section.results.len());
    for (index, result) in section.results.iter().enumerate() {
      out.push_str(&self.render_entry(index + 1, result));
    }
    out
  }

  /// Renders one paper entry.
  fn render_entry(&self, number: usize, result: &AnalysisResult) -> String {
    let paper = &result.paper;
    let mut out = format!("### {number}. {}\n\n", paper.title);
    out.push_str(&format!("- **arXiv**: [{}]({})\n", paper.id, paper.abs_url));
    if !paper.authors.is_empty() {
      out.push_str(&format!("- **Authors**: {}\n", paper.authors_line(self.author_limit)));
    }
    if !paper.tags.is_empty() {
      out.push_str(&format!("- **Subjects**: {}\n", paper.tags.join(", ")));
    }
    if let Some(keyword) = &paper.matched_keyword {
      out.push_str(&format!("- **Matched keyword**: {keyword}\n"));
    }
    out.push_str(&format!("- **PDF**: [{}]({})", paper.pdf_location(), paper.pdf_location()));
    if let Some(path) = &result.pdf_path {
      out.push_str(&format!(" (saved as `{}`)", path.display()));
    }
    out.push('\n');
    if let Some(handle) = &result.conversation {
      out.push_str(&format!("- **Continue the discussion**: [open conversation]({handle})\n"));
    }
    out.push('\n');

    if result.is_partial() {
      out.push_str(&format!(
        "> ⚠️ **Partial analysis**: answered {} of {} questions. The remaining questions will be \
         asked on the next run.\n\n",
        result.answers.len(),
        self.question_count
      ));
    }

    for qa in &result.answers {
      out.push_str(&format!("#### {}\n\n{}\n\n", qa.question, qa.answer.trim()));
    }
    out.push_str("---\n\n");
    out
  }
}

/// Writes rendered reports into a run's report directory.
pub struct ReportWriter {
  /// `<run dir>/reports`
  dir: PathBuf,
}

impl ReportWriter {
  /// Writes into `dir`, creating it on first write.
  pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

  /// Path of the main report for `run_date`.
  pub fn report_path(&self, run_date: NaiveDate) -> PathBuf {
    self.dir.join(format!("daily_report_{}.md", format::date_dir(run_date)))
  }

  /// Writes the main report, replacing an earlier one for the same date.
  pub async fn write(&self, run_date: NaiveDate, markdown: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(&self.dir).await?;
    let path = self.report_path(run_date);
    tokio::fs::write(&path, markdown).await?;
    info!("Report written to {}", path.display());
    Ok(path)
  }

  /// Writes one file per section.
  pub async fn write_sections(
    &self,
    assembler: &ReportAssembler,
    report: &Report,
  ) -> Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(&self.dir).await?;
    let mut written = Vec::with_capacity(report.sections.len());
    for section in &report.sections {
      let path = self.dir.join(format!(
        "{}_{}.md",
        format::sanitize_filename(&section.category),
        format::date_dir(report.run_date)
      ));
      tokio::fs::write(&path, assembler.render_section(section)).await?;
      written.push(path);
    }
    Ok(written)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    analysis::{Completion, QuestionAnswer},
    llm::ConversationHandle,
    relevance::Category,
  };

  fn taxonomy() -> Arc<Taxonomy> {
    Arc::new(Taxonomy::new(
      ["LLM", "Agents", "RAG"]
        .into_iter()
        .map(|n| Category { name: n.into(), description: String::new(), keywords: vec![] })
        .collect(),
    ))
  }

  fn result(id: &str, category: &str, answered: usize, completion: Completion) -> AnalysisResult {
    let paper = PaperRecord {
      id:              id.into(),
      title:           format!("Title {id}"),
      abstract_text:   String::new(),
      authors:         vec!["Ada".into()],
      tags:            vec!["cs.CL".into()],
      pdf_url:         None,
      abs_url:         format!("https://arxiv.org/abs/{id}"),
      published:       Utc::now(),
      matched_keyword: None,
    };
    let mut result = AnalysisResult::new(paper, category);
    result.answers =
      (1..=answered).map(|i| QuestionAnswer::new(format!("Q{i}"), format!("A{i} for {id}"))).collect();
    result.completion = completion;
    result.conversation = Some(ConversationHandle::new(format!("https://chat.example/{id}")));
    result
  }

  fn date() -> NaiveDate { NaiveDate::from_ymd_opt(2024, 1, 15).unwrap() }

  #[test]
  fn test_sections_follow_taxonomy_order() {
    let assembler = ReportAssembler::new(taxonomy(), "Digest", 2);
    let report = assembler.assemble(date(), vec![
      result("a", "Agents", 2, Completion::Complete),
      result("b", "LLM", 2, Completion::Complete),
      result("c", "llm", 2, Completion::Complete),
    ]);
    let layout: Vec<_> =
      report.sections.iter().map(|s| (s.category.as_str(), s.results.len())).collect();
    assert_eq!(layout, [("LLM", 2), ("Agents", 1)]);
    let ids: Vec<_> = report.sections[0].results.iter().map(|r| r.paper.id.as_str()).collect();
    assert_eq!(ids, ["b", "c"]);

    let markdown = assembler.render_markdown(&report);
    let llm = markdown.find("## LLM (2)").unwrap();
    let agents = markdown.find("## Agents (1)").unwrap();
    assert!(llm < agents);
  }

  #[test]
  fn test_unknown_categories_follow_in_first_seen_order() {
    let assembler = ReportAssembler::new(taxonomy(), "Digest", 2);
    let report = assembler.assemble(date(), vec![
      result("a", "Robotics", 2, Completion::Complete),
      result("b", "RAG", 2, Completion::Complete),
      result("c", "Audio", 2, Completion::Complete),
      result("d", "Robotics", 2, Completion::Complete),
    ]);
    let names: Vec<_> = report.sections.iter().map(|s| s.category.as_str()).collect();
    assert_eq!(names, ["RAG", "Robotics", "Audio"]);
  }

  #[test]
  fn test_entry_contents_and_partial_marker() {
    let assembler = ReportAssembler::new(taxonomy(), "Digest", 5);
    let report = assembler.assemble(date(), vec![result("p", "LLM", 2, Completion::Partial)]);
    let markdown = assembler.render_markdown(&report);
    assert!(markdown.starts_with("# Digest\n"));
    assert!(markdown.contains("answered 2 of 5 questions"));
    assert!(markdown.contains("[open conversation](https://chat.example/p)"));
    assert!(markdown.contains("#### Q1\n\nA1 for p"));
    assert!(markdown.contains("https://arxiv.org/pdf/p"));
    assert!(markdown.find("#### Q1").unwrap() < markdown.find("#### Q2").unwrap());
    assert_eq!(report.partial_count(), 1);
  }

  #[test]
  fn test_overview_ranks_busiest_categories() {
    let assembler = ReportAssembler::new(taxonomy(), "Digest", 2);
    let mut keyed = result("e", "RAG", 2, Completion::Complete);
    keyed.paper.matched_keyword = Some("retrieval".into());
    let report = assembler.assemble(date(), vec![
      result("a", "Agents", 2, Completion::Complete),
      result("b", "LLM", 2, Completion::Complete),
      result("c", "Robotics", 2, Completion::Complete),
      result("d", "Agents", 2, Completion::Complete),
      keyed,
    ]);
    let busiest: Vec<_> = report.busiest_sections(3).iter().map(|s| s.category.as_str()).collect();
    assert_eq!(busiest, ["Agents", "LLM", "RAG"]);

    let markdown = assembler.render_markdown(&report);
    assert!(markdown.contains("| Agents | 2 |"));
    assert!(markdown.contains("1. **Agents** (2 papers)\n2. **LLM** (1 papers)\n3. **RAG** (1 papers)\n"));
    assert!(!markdown.contains("**Robotics** (1 papers)"));
    assert!(markdown.find("Most active categories").unwrap() < markdown.find("## LLM (1)").unwrap());
    assert!(markdown.contains("- **Matched keyword**: retrieval"));
    assert_eq!(markdown.matches("Matched keyword").count(), 1);
  }

  #[test]
  fn test_empty_report() {
    let assembler = ReportAssembler::new(taxonomy(), "Digest", 5);
    let report = assembler.assemble(date(), vec![]);
    assert!(report.is_empty());
    assert!(assembler.render_markdown(&report).contains("No relevant papers"));
  }

  #[tokio::test]
  async fn test_writer_layout() {
    let dir = tempdir().unwrap();
    let assembler = ReportAssembler::new(taxonomy(), "Digest", 2);
    let report = assembler.assemble(date(), vec![
      result("a", "Agents", 2, Completion::Complete),
      result("b", "LLM", 2, Completion::Complete),
    ]);
    let writer = ReportWriter::new(dir.path().join("reports"));
    let path = writer.write(date(), &assembler.render_markdown(&report)).await.unwrap();
    assert_eq!(path, dir.path().join("reports").join("daily_report_240115.md"));
    let sections = writer.write_sections(&assembler, &report).await.unwrap();
    assert_eq!(sections[0], dir.path().join("reports").join("LLM_240115.md"));
    assert!(std::fs::read_to_string(&sections[1]).unwrap().starts_with("## Agents (1)"));
  }
}
