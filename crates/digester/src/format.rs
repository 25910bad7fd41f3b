//! Text helpers shared by the source adapter, report writer and PDF store.

use super::*;

lazy_static! {
  /// Runs of any whitespace, including the hard line breaks arXiv puts inside titles.
  static ref WHITESPACE: Regex = Regex::new(r"\s+").expect("whitespace pattern is valid");
  /// Characters that are unsafe in file names on at least one supported platform.
  static ref UNSAFE_FILENAME: Regex =
    Regex::new(r#"[/\\:*?"<>|\x00-\x1f]"#).expect("file name pattern is valid");
}

/// Collapses every run of whitespace into a single space and trims both ends.
///
/// ```
/// use digester::format::collapse_whitespace;
///
/// assert_eq!(collapse_whitespace("  Attention\n  Is All\tYou Need "), "Attention Is All You Need");
/// ```
pub fn collapse_whitespace(text: &str) -> String { WHITESPACE.replace_all(text.trim(), " ").into_owned() }

/// Replaces characters that cannot appear in a file name with `_`.
pub fn sanitize_filename(name: &str) -> String {
  let cleaned = UNSAFE_FILENAME.replace_all(name.trim(), "_");
  let cleaned = cleaned.trim_matches('.');
  if cleaned.is_empty() {
    "unnamed".to_string()
  } else {
    cleaned.to_string()
  }
}

/// Truncates `text` to at most `max_chars` characters, appending an ellipsis when shortened.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
  if text.chars().count() <= max_chars {
    return text.to_string();
  }
  let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
  out.push('…');
  out
}

/// Directory name used for a run date, e.g. `240115`.
pub fn date_dir(date: NaiveDate) -> String { date.format("%y%m%d").to_string() }

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sanitize_filename() {
    assert_eq!(sanitize_filename("cs.AI/0101001"), "cs.AI_0101001");
    assert_eq!(sanitize_filename("a:b*c?"), "a_b_c_");
    assert_eq!(sanitize_filename(" .. "), "unnamed");
  }

  #[test]
  fn test_truncate_chars() {
    assert_eq!(truncate_chars("short", 10), "short");
    assert_eq!(truncate_chars("大模型智能体强化学习", 5), "大模型智…");
  }

  #[test]
  fn test_date_dir() {
    let date = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
    assert_eq!(date_dir(date), "240105");
  }
}
