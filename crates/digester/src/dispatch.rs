//! Report delivery by mail.
//!
//! [`DispatchNotifier`] turns a rendered Markdown report into an HTML mail with a plain-text
//! alternative, attaches the requested files and hands one message per recipient to a
//! [`MailTransport`]. Every recipient's outcome is recorded on its own: a failure for one address
//! never prevents delivery to the others. An attachment that cannot be read is left out of every
//! message and recorded as [`DigestError::Attachment`].
//!
//! [`SmtpTransport`] is the production transport, built on `lettre`.

use lettre::{
  message::{header::ContentType, Attachment as MailAttachment, Mailbox, MultiPart},
  transport::smtp::authentication::Credentials,
  Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
};
use pulldown_cmark::{html, Options, Parser};

use super::*;
use crate::config::EmailConfig;

/// A file ready to be attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
  /// File name shown to the recipient
  pub filename:     String,
  /// MIME type
  pub content_type: String,
  /// File contents
  pub bytes:        Vec<u8>,
}

/// One message addressed to a single envelope recipient.
#[derive(Debug, Clone)]
pub struct OutgoingMail {
  /// Envelope recipient
  pub recipient:   String,
  /// Visible `To` header
  pub to:          Vec<String>,
  /// Visible `Cc` header
  pub cc:          Vec<String>,
  /// Subject line
  pub subject:     String,
  /// Plain-text body, the Markdown source
  pub text_body:   String,
  /// HTML body
  pub html_body:   String,
  /// Shared attachments
  pub attachments: Arc<Vec<Attachment>>,
}

/// Something that can deliver a message.
#[async_trait]
pub trait MailTransport: Send + Sync {
  /// Delivers `mail` to its envelope recipient.
  async fn deliver(&self, mail: &OutgoingMail) -> Result<()>;
}

/// Who receives the report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipients {
  /// Primary recipients
  pub to:  Vec<String>,
  /// Visible copies
  pub cc:  Vec<String>,
  /// Hidden copies
  pub bcc: Vec<String>,
}

impl Recipients {
  /// Every distinct address, `to` first, then `cc`, then `bcc`.
  pub fn all(&self) -> Vec<String> {
    let mut all: Vec<String> = Vec::new();
    for address in self.to.iter().chain(&self.cc).chain(&self.bcc) {
      let address = address.trim();
      if !address.is_empty() && !all.iter().any(|a| a.eq_ignore_ascii_case(address)) {
        all.push(address.to_string());
      }
    }
    all
  }
}

/// Delivery outcome for one recipient.
#[derive(Debug)]
pub struct DeliveryOutcome {
  /// Address
  pub recipient: String,
  /// Why delivery failed, `None` when delivered
  pub error:     Option<DigestError>,
}

/// Everything that happened during one dispatch.
#[derive(Debug, Default)]
pub struct DispatchReport {
  /// One entry per recipient, in attempt order
  pub deliveries:          Vec<DeliveryOutcome>,
  /// Attachments that were left out
  pub attachment_failures: Vec<DigestError>,
}

impl DispatchReport {
  /// Recipients that received the report.
  pub fn delivered(&self) -> usize { self.deliveries.iter().filter(|d| d.error.is_none()).count() }

  /// Recipients that did not.
  pub fn failed(&self) -> usize { self.deliveries.len() - self.delivered() }
}

/// Converts Markdown into an HTML document suitable for mail clients.
///
/// ```
/// let html = digester::dispatch::markdown_to_html("# Digest\n\n| a | b |\n|---|---|\n| 1 | 2 |");
/// assert!(html.contains("<h1>Digest</h1>"));
/// assert!(html.contains("<table>"));
/// ```
pub fn markdown_to_html(markdown: &str) -> String {
  let options = Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH;
  let mut body = String::new();
  html::push_html(&mut body, Parser::new_ext(markdown, options));
  format!(
    "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><style>body{{font-family:-apple-system,\
     Segoe UI,Helvetica,Arial,sans-serif;line-height:1.6;max-width:860px;margin:auto;color:#24292f}}\
     table{{border-collapse:collapse}}td,th{{border:1px solid #d0d7de;padding:4px 10px}}\
     blockquote{{border-left:4px solid #d29922;margin:0;padding:0 12px;color:#57606a}}</style>\
     </head><body>\n{body}</body></html>\n"
  )
}

/// MIME type for an attachment, by extension.
pub fn content_type_for(path: &Path) -> &'static str {
  match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
    Some("pdf") => "application/pdf",
    Some("md") | Some("markdown") => "text/markdown; charset=utf-8",
    Some("txt") | Some("log") => "text/plain; charset=utf-8",
    Some("html") | Some("htm") => "text/html; charset=utf-8",
    Some("json") => "application/json",
    Some("png") => "image/png",
    Some("jpg") | Some("jpeg") => "image/jpeg",
    Some("zip") => "application/zip",
    _ => "application/octet-stream",
  }
}

/// Sends reports to the configured recipients.
pub struct DispatchNotifier {
  /// Delivery mechanism
  transport:            Arc<dyn MailTransport>,
  /// Who receives the report
  recipients:           Recipients,
  /// Attachments above this size are left out
  max_attachment_bytes: u64,
}

impl DispatchNotifier {
  /// Creates a notifier delivering through `transport`.
  pub fn new(transport: Arc<dyn MailTransport>, recipients: Recipients, max_attachment_bytes: u64) -> Self {
    Self { transport, recipients, max_attachment_bytes }
  }

  /// Creates a notifier from the `[email]` section.
  pub fn from_config(transport: Arc<dyn MailTransport>, config: &EmailConfig) -> Self {
    Self::new(
      transport,
      Recipients { to: config.to.clone(), cc: config.cc.clone(), bcc: config.bcc.clone() },
      config.max_attachment_mb.saturating_mul(1024 * 1024),
    )
  }

  /// Reads each attachment once.
  pub async fn load_attachments(&self, paths: &[PathBuf]) -> (Vec<Attachment>, Vec<DigestError>) {
    let mut loaded = Vec::new();
    let mut failures = Vec::new();
    for path in paths {
      match self.load_attachment(path).await {
        Ok(attachment) => loaded.push(attachment),
        Err(e) => {
          warn!("Leaving out attachment: {e}");
          failures.push(e);
        },
      }
    }
    (loaded, failures)
  }

  /// Reads and checks one attachment.
  async fn load_attachment(&self, path: &Path) -> Result<Attachment> {
    let error = |reason: String| DigestError::Attachment { path: path.to_path_buf(), reason };
    let metadata = tokio::fs::metadata(path).await.map_err(|e| error(e.to_string()))?;
    if metadata.len() > self.max_attachment_bytes {
      return Err(error(format!(
        "{} bytes exceeds the {} byte attachment limit",
        metadata.len(),
        self.max_attachment_bytes
      )));
    }
    let bytes = tokio::fs::read(path).await.map_err(|e| error(e.to_string()))?;
    let filename = path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_else(|| "attachment".to_string());
    Ok(Attachment { filename, content_type: content_type_for(path).to_string(), bytes })
  }

  /// Sends `markdown` with `attachments` to every recipient.
  pub async fn dispatch(&self, subject: &str, markdown: &str, attachments: &[PathBuf]) -> DispatchReport {
    let (loaded, attachment_failures) = self.load_attachments(attachments).await;
    let html_body = markdown_to_html(markdown);
    let attachments = Arc::new(loaded);

    let mut deliveries = Vec::new();
    for recipient in self.recipients.all() {
      let mail = OutgoingMail {
        recipient:   recipient.clone(),
        to:          self.recipients.to.clone(),
        cc:          self.recipients.cc.clone(),
        subject:     subject.to_string(),
        text_body:   markdown.to_string(),
        html_body:   html_body.clone(),
        attachments: attachments.clone(),
      };
      let error = match self.transport.deliver(&mail).await {
        Ok(()) => {
          info!("Report delivered to {recipient}");
          None
        },
        Err(e) => {
          warn!("Delivery to {recipient} failed: {e}");
          Some(DigestError::Delivery { recipient: recipient.clone(), reason: e.to_string() })
        },
      };
      deliveries.push(DeliveryOutcome { recipient, error });
    }
    DispatchReport { deliveries, attachment_failures }
  }

  /// Tells the primary recipients that a run failed.
  pub async fn notify_failure(&self, run_date: NaiveDate, failure: &DigestError) -> DispatchReport {
    let subject = format!("[digester] Run for {} failed", run_date.format("%Y-%m-%d"));
    let body = format!(
      "# Run failed\n\nThe digest run for **{}** stopped before completion.\n\n```\n{failure}\n```\n\n\
       Analyses recorded before the failure are cached and will be reused by the next run.\n",
      run_date.format("%Y-%m-%d")
    );
    let primary = Self {
      transport:            self.transport.clone(),
      recipients:           Recipients { to: self.recipients.to.clone(), ..Recipients::default() },
      max_attachment_bytes: self.max_attachment_bytes,
    };
    primary.dispatch(&subject, &body, &[]).await
  }
}

/// Delivers mail through an SMTP relay.
pub struct SmtpTransport {
  /// Pooled async SMTP client
  mailer: AsyncSmtpTransport<Tokio1Executor>,
  /// Sender mailbox
  from:   Mailbox,
}

impl SmtpTransport {
  /// Connects according to the `[email]` section: implicit TLS when `use_ssl`, STARTTLS otherwise.
  pub fn new(config: &EmailConfig) -> Result<Self> {
    let builder = if config.use_ssl {
      AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_server)?
    } else {
      AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_server)?
    };
    let mut builder = builder.port(config.smtp_port).timeout(Some(Duration::from_secs(config.timeout_secs)));
    if !config.username.trim().is_empty() {
      builder = builder.credentials(Credentials::new(config.username.clone(), config.password.clone()));
    }
    let from: Mailbox = config.sender().parse()?;
    Ok(Self { mailer: builder.build(), from })
  }

  /// Builds the MIME message for `mail`.
  fn message(&self, mail: &OutgoingMail) -> Result<lettre::Message> {
    let mut builder = lettre::Message::builder().from(self.from.clone()).subject(mail.subject.clone());
    for to in header_mailboxes(&mail.to) {
      builder = builder.to(to);
    }
    for cc in header_mailboxes(&mail.cc) {
      builder = builder.cc(cc);
    }
    let envelope = lettre::address::Envelope::new(
      Some(self.from.email.clone()),
      vec![mail.recipient.parse::<Address>()?],
    )?;
    builder = builder.envelope(envelope);

    let mut body = MultiPart::mixed()
      .multipart(MultiPart::alternative_plain_html(mail.text_body.clone(), mail.html_body.clone()));
    for attachment in mail.attachments.iter() {
      let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
        DigestError::Attachment { path: PathBuf::from(&attachment.filename), reason: e.to_string() }
      })?;
      body = body.singlepart(
        MailAttachment::new(attachment.filename.clone()).body(attachment.bytes.clone(), content_type),
      );
    }
    Ok(builder.multipart(body)?)
  }
}

/// Parses header addresses, leaving out the ones that are not valid mailboxes.
///
/// Headers are informational; the envelope decides who receives the message.
fn header_mailboxes(addresses: &[String]) -> Vec<Mailbox> {
  addresses
    .iter()
    .filter_map(|address| match address.parse::<Mailbox>() {
      Ok(mailbox) => Some(mailbox),
      Err(e) => {
        warn!("Leaving {address:?} out of the mail headers: {e}");
        None
      },
    })
    .collect()
}

#[async_trait]
impl MailTransport for SmtpTransport {
  async fn deliver(&self, mail: &OutgoingMail) -> Result<()> {
    let message = self.message(mail)?;
    debug!("SMTP send to {}", mail.recipient);
    self.mailer.send(message).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use super::*;

  /// Records deliveries and fails for one address.
  #[derive(Default)]
  struct Recording {
    sent:    Mutex<Vec<OutgoingMail>>,
    refuses: Option<String>,
  }

  #[async_trait]
  impl MailTransport for Recording {
    async fn deliver(&self, mail: &OutgoingMail) -> Result<()> {
      if self.refuses.as_deref() == Some(mail.recipient.as_str()) {
        return Err(DigestError::Api { status: 550, message: "mailbox unavailable".into() });
      }
      self.sent.lock().unwrap().push(mail.clone());
      Ok(())
    }
  }

  fn recipients() -> Recipients {
    Recipients {
      to:  vec!["a@example.com".into(), "b@example.com".into()],
      cc:  vec!["c@example.com".into(), "A@example.com".into()],
      bcc: vec!["d@example.com".into()],
    }
  }

  #[test]
  fn test_recipients_are_deduplicated() {
    assert_eq!(recipients().all(), ["a@example.com", "b@example.com", "c@example.com", "d@example.com"]);
  }

  #[traced_test]
  #[tokio::test]
  async fn test_one_failure_does_not_stop_others() {
    let transport = Arc::new(Recording { refuses: Some("b@example.com".into()), ..Recording::default() });
    let notifier = DispatchNotifier::new(transport.clone(), recipients(), 1024);
    let report = notifier.dispatch("Digest", "# Hello", &[]).await;

    assert_eq!(report.delivered(), 3);
    assert_eq!(report.failed(), 1);
    assert!(matches!(
      report.deliveries[1].error,
      Some(DigestError::Delivery { ref recipient, .. }) if recipient == "b@example.com"
    ));
    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[2].recipient, "d@example.com");
    assert!(sent[2].cc.iter().all(|cc| cc != "d@example.com"));
    assert!(sent[0].html_body.contains("<h1>Hello</h1>"));
    assert_eq!(sent[0].text_body, "# Hello");
    assert!(logs_contain("Delivery to b@example.com failed"));
  }

  #[tokio::test]
  async fn test_bad_attachments_are_left_out() {
    let dir = tempdir().unwrap();
    let report_path = dir.path().join("daily_report_240115.md");
    std::fs::write(&report_path, "# report").unwrap();
    let large = dir.path().join("large.pdf");
    std::fs::write(&large, vec![0u8; 2048]).unwrap();
    let missing = dir.path().join("missing.pdf");

    let transport = Arc::new(Recording::default());
    let notifier = DispatchNotifier::new(transport.clone(), recipients(), 1024);
    let report = notifier.dispatch("Digest", "# report", &[report_path, large, missing]).await;

    assert_eq!(report.attachment_failures.len(), 2);
    assert!(report.attachment_failures.iter().all(|e| matches!(e, DigestError::Attachment { .. })));
    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 4);
    assert_eq!(sent[0].attachments.len(), 1);
    assert_eq!(sent[0].attachments[0].filename, "daily_report_240115.md");
    assert_eq!(sent[0].attachments[0].content_type, "text/markdown; charset=utf-8");
  }

  #[tokio::test]
  async fn test_failure_notice_goes_to_primary_recipients() {
    let transport = Arc::new(Recording::default());
    let notifier = DispatchNotifier::new(transport.clone(), recipients(), 1024);
    let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
    notifier.notify_failure(date, &DigestError::Fetch("arXiv unreachable".into())).await;

    let sent = transport.sent.lock().unwrap();
    let addressed: Vec<_> = sent.iter().map(|m| m.recipient.as_str()).collect();
    assert_eq!(addressed, ["a@example.com", "b@example.com"]);
    assert!(sent[0].subject.contains("2024-01-15"));
    assert!(sent[0].text_body.contains("arXiv unreachable"));
  }

  #[test]
  fn test_smtp_message_has_envelope_for_single_recipient() {
    let config = EmailConfig {
      enabled: true,
      from: "digest@example.com".into(),
      ..EmailConfig::default()
    };
    let transport = SmtpTransport::new(&config).unwrap();
    let mail = OutgoingMail {
      recipient:   "hidden@example.com".into(),
      to:          vec!["a@example.com".into()],
      cc:          vec![],
      subject:     "Digest".into(),
      text_body:   "# Digest".into(),
      html_body:   markdown_to_html("# Digest"),
      attachments: Arc::new(vec![Attachment {
        filename:     "r.md".into(),
        content_type: "text/markdown; charset=utf-8".into(),
        bytes:        b"# Digest".to_vec(),
      }]),
    };
    let message = transport.message(&mail).unwrap();
    let to: Vec<_> = message.envelope().to().iter().map(|a| a.to_string()).collect();
    assert_eq!(to, ["hidden@example.com"]);
    let raw = String::from_utf8(message.formatted()).unwrap();
    assert!(raw.contains("To: a@example.com"));
    assert!(!raw.contains("hidden@example.com"));
  }

  #[traced_test]
  #[test]
  fn test_malformed_header_address_does_not_block_delivery() {
    let config = EmailConfig {
      enabled: true,
      from: "digest@example.com".into(),
      ..EmailConfig::default()
    };
    let transport = SmtpTransport::new(&config).unwrap();
    let mail = OutgoingMail {
      recipient:   "good@example.com".into(),
      to:          vec!["good@example.com".into()],
      cc:          vec!["not an address".into()],
      subject:     "Digest".into(),
      text_body:   "# Digest".into(),
      html_body:   markdown_to_html("# Digest"),
      attachments: Arc::new(Vec::new()),
    };
    let message = transport.message(&mail).unwrap();
    let to: Vec<_> = message.envelope().to().iter().map(|a| a.to_string()).collect();
    assert_eq!(to, ["good@example.com"]);
    let raw = String::from_utf8(message.formatted()).unwrap();
    assert!(raw.contains("To: good@example.com"));
    assert!(!raw.contains("not an address"));
    assert!(logs_contain("Leaving \"not an address\" out of the mail headers"));
  }
}
