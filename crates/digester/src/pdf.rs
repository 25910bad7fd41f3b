//! PDF download, validation and text extraction.
//!
//! PDFs are stored per run under `<run dir>/pdf_downloads/<id>.pdf`. A file that is already
//! present is reused. Downloaded bytes are parsed with `lopdf` before they are written so a
//! truncated download or an HTML error page never ends up on disk.
//!
//! Every failure here is paper-scoped and reported as [`DigestError::Attachment`].

use lopdf::Document;

use super::*;
use crate::retry::RetryPolicy;

/// Downloads and reads paper PDFs.
#[derive(Debug, Clone)]
pub struct PdfStore {
  /// HTTP client with the download timeout applied
  http:  reqwest::Client,
  /// Retry policy for downloads
  retry: RetryPolicy,
}

impl PdfStore {
  /// Creates a store whose downloads follow `retry`.
  pub fn new(retry: RetryPolicy) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(retry.timeout)
      .user_agent(concat!("digester/", env!("CARGO_PKG_VERSION")))
      .build()?;
    Ok(Self { http, retry })
  }

  /// Ensures `paper`'s PDF is stored in `dir` and returns its path.
  pub async fn fetch(&self, paper: &PaperRecord, dir: &Path) -> Result<PathBuf> {
    let path = dir.join(paper.pdf_filename());
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
      debug!("Reusing {}", path.display());
      return Ok(path);
    }

    let attachment_error = |reason: String| DigestError::Attachment { path: path.clone(), reason };
    let url = paper.pdf_location();
    let bytes = self
      .retry
      .run(&format!("PDF download for {}", paper.id), || self.download(&url))
      .await
      .map_err(|e| attachment_error(e.to_string()))?;

    Document::load_mem(&bytes).map_err(|e| attachment_error(format!("not a readable PDF: {e}")))?;
    tokio::fs::create_dir_all(dir).await.map_err(|e| attachment_error(e.to_string()))?;
    tokio::fs::write(&path, &bytes).await.map_err(|e| attachment_error(e.to_string()))?;
    info!("Saved PDF for {} ({} KiB)", paper.id, bytes.len() / 1024);
    Ok(path)
  }

  /// Fetches raw bytes from `url`.
  async fn download(&self, url: &str) -> Result<Vec<u8>> {
    debug!("GET {url}");
    let response = self.http.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
      return Err(DigestError::Api { status: status.as_u16(), message: format!("PDF download returned {status}") });
    }
    Ok(response.bytes().await?.to_vec())
  }

  /// Extracts the text of the first `max_pages` pages of the PDF at `path`.
  ///
  /// Parsing is CPU-bound and runs on the blocking pool.
  pub async fn extract_text(path: &Path, max_pages: usize) -> Result<String> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || extract_text_blocking(&owned, max_pages))
      .await
      .map_err(|e| DigestError::Attachment { path: path.to_path_buf(), reason: e.to_string() })?
  }
}

/// Synchronous half of [`PdfStore::extract_text`].
fn extract_text_blocking(path: &Path, max_pages: usize) -> Result<String> {
  let attachment_error =
    |reason: String| DigestError::Attachment { path: path.to_path_buf(), reason };
  let doc = Document::load(path).map_err(|e| attachment_error(e.to_string()))?;
  let pages: Vec<u32> = doc.get_pages().keys().copied().take(max_pages.max(1)).collect();
  let text = doc.extract_text(&pages).map_err(|e| attachment_error(e.to_string()))?;
  Ok(format::collapse_whitespace(&text))
}

#[cfg(test)]
pub(crate) mod tests {
  use lopdf::{
    content::{Content, Operation},
    dictionary, Object, Stream,
  };
  use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
  };

  use super::*;

  /// A one-page PDF containing `text`.
  pub(crate) fn sample_pdf(text: &str) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
      "Type" => "Font",
      "Subtype" => "Type1",
      "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
      "Font" => dictionary! { "F1" => font_id },
    });
    let content = Content {
      operations: vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec!["F1".into(), 24.into()]),
        Operation::new("Td", vec![72.into(), 720.into()]),
        Operation::new("Tj", vec![Object::string_literal(text)]),
        Operation::new("ET", vec![]),
      ],
    };
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
    let page_id = doc.add_object(dictionary! {
      "Type" => "Page",
      "Parent" => pages_id,
      "Contents" => content_id,
    });
    doc.objects.insert(
      pages_id,
      Object::Dictionary(dictionary! {
        "Type" => "Pages",
        "Kids" => vec![page_id.into()],
        "Count" => 1,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
      }),
    );
    let catalog_id = doc.add_object(dictionary! {
      "Type" => "Catalog",
      "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
  }

  fn paper(pdf_url: String) -> PaperRecord {
    PaperRecord {
      id:              "2401.00009".into(),
      title:           "T".into(),
      abstract_text:   String::new(),
      authors:         vec![],
      tags:            vec![],
      pdf_url:         Some(pdf_url),
      abs_url:         String::new(),
      published:       Utc::now(),
      matched_keyword: None,
    }
  }

  fn store() -> PdfStore { PdfStore::new(RetryPolicy::immediate(2, Duration::from_secs(5))).unwrap() }

  #[tokio::test]
  async fn test_fetch_stores_and_reuses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/pdf/2401.00009"))
      .respond_with(ResponseTemplate::new(200).set_body_bytes(sample_pdf("Hello Digest")))
      .expect(1)
      .mount(&server)
      .await;

    let dir = tempdir().unwrap();
    let paper = paper(format!("{}/pdf/2401.00009", server.uri()));
    let stored = store().fetch(&paper, dir.path()).await.unwrap();
    assert_eq!(stored, dir.path().join("2401.00009.pdf"));
    assert!(stored.exists());

    // Second call must not hit the server again.
    let again = store().fetch(&paper, dir.path()).await.unwrap();
    assert_eq!(again, stored);

    let text = PdfStore::extract_text(&stored, 3).await.unwrap();
    assert!(text.contains("Hello"));
  }

  #[tokio::test]
  async fn test_non_pdf_is_rejected_and_not_written() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(200).set_body_string("<html>captcha</html>"))
      .mount(&server)
      .await;

    let dir = tempdir().unwrap();
    let paper = paper(format!("{}/pdf/2401.00009", server.uri()));
    let err = store().fetch(&paper, dir.path()).await.unwrap_err();
    assert!(matches!(err, DigestError::Attachment { .. }));
    assert!(!dir.path().join("2401.00009.pdf").exists());
  }

  #[tokio::test]
  async fn test_missing_pdf_is_attachment_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(404)).mount(&server).await;

    let dir = tempdir().unwrap();
    let err = store().fetch(&paper(format!("{}/pdf/x", server.uri())), dir.path()).await.unwrap_err();
    assert!(err.to_string().contains("404"));
  }
}
