//! Portal collaborator: login with a solved CAPTCHA and record extraction.
//!
//! The workflow talks to [`PortalConnector`]/[`PortalSession`] only. The
//! DULMS implementation drives the ASP.NET pages with a cookie-carrying
//! `reqwest` client and reads the grid tables with `scraper`.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::captcha::CaptchaChallenge;
use crate::deadline::parse_portal_date;
use crate::models::RawRecord;

const LOGIN_PATH: &str = "Login.aspx";
const ASSIGNMENTS_PATH: &str = "Assignment/AssignmentStudentList";
const QUIZZES_PATH: &str = "Quizzes/StudentQuizzes";
const LOGIN_SUCCESS_MARKER: &str = "Profile/StudentProfile";
const ASSIGNMENT_TABLE: &str = "gvAssignment";
const QUIZ_TABLE: &str = "gvQuiz";
const MIN_CELLS: usize = 6;

#[derive(Debug, Error)]
pub enum PortalError {
  /// The portal refused the credentials or the CAPTCHA answer.
  #[error("{0}")]
  Rejected(String),
  /// The portal refused the CAPTCHA answer; a fresh challenge may succeed.
  #[error("{0}")]
  CaptchaRejected(String),
  #[error("portal request failed: {0}")]
  Network(#[from] reqwest::Error),
  /// A page did not have the structure we extract from.
  #[error("{0}")]
  Layout(String),
}

#[async_trait]
pub trait PortalSession: Send + Sync {
  async fn captcha(&self) -> Result<CaptchaChallenge, PortalError>;
  async fn login(&self, username: &str, password: &str, captcha_solution: &str) -> Result<(), PortalError>;
  async fn assignments(&self) -> Result<Vec<RawRecord>, PortalError>;
  async fn quizzes(&self) -> Result<Vec<RawRecord>, PortalError>;
}

/// Opens one isolated session per run.
pub trait PortalConnector: Send + Sync {
  fn connect(&self) -> Result<Box<dyn PortalSession>, PortalError>;
}

fn selector(css: &str) -> Result<Selector, PortalError> {
  Selector::parse(css).map_err(|e| PortalError::Layout(format!("invalid selector {css:?}: {e:?}")))
}

fn text_of(element: ElementRef<'_>) -> String {
  element.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

/// Hidden ASP.NET fields to echo back plus the CAPTCHA image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginForm {
  pub hidden_fields: Vec<(String, String)>,
  pub captcha: CaptchaChallenge,
}

pub fn parse_login_page(html: &str) -> Result<LoginForm, PortalError> {
  let document = Html::parse_document(html);

  let hidden_fields = document
    .select(&selector("input[type=hidden]")?)
    .filter_map(|input| {
      let name = input.value().attr("name")?;
      Some((name.to_string(), input.value().attr("value").unwrap_or_default().to_string()))
    })
    .collect();

  let src = document
    .select(&selector("img#imgCaptcha")?)
    .next()
    .and_then(|img| img.value().attr("src"))
    .ok_or_else(|| PortalError::Layout("CAPTCHA image not found on login page".into()))?;
  let encoded = src
    .strip_prefix("data:image")
    .and_then(|rest| rest.split_once(','))
    .map(|(_, data)| data.trim())
    .ok_or_else(|| PortalError::Layout("CAPTCHA image source is not a data URL".into()))?;
  let image = STANDARD
    .decode(encoded)
    .map_err(|e| PortalError::Layout(format!("CAPTCHA image is not valid base64: {e}")))?;

  Ok(LoginForm { hidden_fields, captcha: CaptchaChallenge { image } })
}

/// Text of the login error label, if the page shows one.
pub fn login_error_message(html: &str) -> Option<String> {
  let document = Html::parse_document(html);
  let label = selector("#lblMessage").ok()?;
  document
    .select(&label)
    .next()
    .map(text_of)
    .filter(|text| !text.is_empty())
}

/// Classifies a login rejection by the portal's message.
pub fn rejection(message: String) -> PortalError {
  if message.to_lowercase().contains("captcha") {
    PortalError::CaptchaRejected(message)
  } else {
    PortalError::Rejected(message)
  }
}

/// Reads one GridView table. The first row is the header; rows with fewer
/// than six cells (pagers, empty-data rows) are skipped.
pub fn parse_record_table(html: &str, table_id: &str, page_url: &Url) -> Result<Vec<RawRecord>, PortalError> {
  let document = Html::parse_document(html);
  let table = document
    .select(&selector(&format!("table#{table_id}"))?)
    .next()
    .ok_or_else(|| PortalError::Layout(format!("table #{table_id} not found")))?;
  let row_selector = selector("tr")?;
  let cell_selector = selector("td")?;
  let link_selector = selector("a")?;

  let mut records = Vec::new();
  for row in table.select(&row_selector).skip(1) {
    let cells: Vec<ElementRef<'_>> = row.select(&cell_selector).collect();
    if cells.len() < MIN_CELLS {
      continue;
    }

    let (title, url) = match cells[1].select(&link_selector).next() {
      Some(link) => {
        let href = link.value().attr("href").and_then(|href| page_url.join(href).ok());
        (text_of(link), href.map(String::from))
      }
      None => (text_of(cells[1]), Some(page_url.to_string())),
    };

    let deadline_text = text_of(cells[3]);
    let deadline = parse_portal_date(&deadline_text);
    if deadline.is_none() && !deadline_text.is_empty() {
      warn!(table = table_id, deadline = %deadline_text, "failed to parse deadline date");
    }

    records.push(RawRecord {
      title,
      course: text_of(cells[2]),
      deadline,
      submission: text_of(cells[5]),
      url,
    });
  }
  Ok(records)
}

/// Connector for the DULMS student portal.
pub struct DulmsPortal {
  base_url: Url,
  request_timeout: Duration,
}

impl DulmsPortal {
  pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, PortalError> {
    let mut base_url = Url::parse(base_url)
      .map_err(|e| PortalError::Layout(format!("invalid portal URL {base_url:?}: {e}")))?;
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }
    Ok(Self { base_url, request_timeout })
  }

  fn endpoint(&self, path: &str) -> Result<Url, PortalError> {
    self.base_url
      .join(path)
      .map_err(|e| PortalError::Layout(format!("invalid portal path {path:?}: {e}")))
  }
}

impl PortalConnector for DulmsPortal {
  fn connect(&self) -> Result<Box<dyn PortalSession>, PortalError> {
    let client = reqwest::Client::builder()
      .cookie_store(true)
      .timeout(self.request_timeout)
      .build()?;
    Ok(Box::new(DulmsSession {
      client,
      login_url: self.endpoint(LOGIN_PATH)?,
      assignments_url: self.endpoint(ASSIGNMENTS_PATH)?,
      quizzes_url: self.endpoint(QUIZZES_PATH)?,
      hidden_fields: Mutex::new(Vec::new()),
    }))
  }
}

struct DulmsSession {
  client: reqwest::Client,
  login_url: Url,
  assignments_url: Url,
  quizzes_url: Url,
  hidden_fields: Mutex<Vec<(String, String)>>,
}

impl DulmsSession {
  async fn fetch(&self, url: &Url) -> Result<String, PortalError> {
    let body = self.client
      .get(url.clone())
      .send()
      .await?
      .error_for_status()?
      .text()
      .await?;
    Ok(body)
  }

  async fn records(&self, url: &Url, table_id: &str) -> Result<Vec<RawRecord>, PortalError> {
    info!(%url, "fetching record table");
    let html = self.fetch(url).await?;
    let records = parse_record_table(&html, table_id, url)?;
    info!(table = table_id, count = records.len(), "extracted records");
    Ok(records)
  }
}

#[async_trait]
impl PortalSession for DulmsSession {
  async fn captcha(&self) -> Result<CaptchaChallenge, PortalError> {
    let html = self.fetch(&self.login_url).await?;
    let form = parse_login_page(&html)?;
    *self.hidden_fields.lock().await = form.hidden_fields;
    Ok(form.captcha)
  }

  async fn login(&self, username: &str, password: &str, captcha_solution: &str) -> Result<(), PortalError> {
    let mut form = self.hidden_fields.lock().await.clone();
    form.extend([
      ("username".to_string(), username.to_string()),
      ("password".to_string(), password.to_string()),
      ("txtCaptcha".to_string(), captcha_solution.to_string()),
      ("btnLogin".to_string(), "Login".to_string()),
    ]);

    let response = self.client
      .post(self.login_url.clone())
      .form(&form)
      .send()
      .await?
      .error_for_status()?;
    if response.url().as_str().contains(LOGIN_SUCCESS_MARKER) {
      info!(username, "login successful");
      return Ok(());
    }

    let body = response.text().await?;
    let message = login_error_message(&body).unwrap_or_else(|| "login was not accepted by the portal".into());
    Err(rejection(message))
  }

  async fn assignments(&self) -> Result<Vec<RawRecord>, PortalError> {
    self.records(&self.assignments_url, ASSIGNMENT_TABLE).await
  }

  async fn quizzes(&self) -> Result<Vec<RawRecord>, PortalError> {
    self.records(&self.quizzes_url, QUIZ_TABLE).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{TimeZone, Utc};
  use wiremock::matchers::{body_string_contains, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  const LOGIN_PAGE: &str = r#"
    <html><body><form method="post" action="Login.aspx">
      <input type="hidden" name="__VIEWSTATE" value="abc123" />
      <input type="hidden" name="__EVENTVALIDATION" value="ev" />
      <input id="username" name="username" />
      <input id="password" name="password" type="password" />
      <img id="imgCaptcha" src="data:image/png;base64,AQID" />
      <input id="txtCaptcha" name="txtCaptcha" />
    </form></body></html>
  "#;

  const ASSIGNMENTS_PAGE: &str = r#"
    <table id="gvAssignment">
      <tr><th>#</th><th>Title</th><th>Course</th><th>Deadline</th><th>Grade</th><th>Status</th></tr>
      <tr>
        <td>1</td><td><a href="/Assignment/Details/41">  Lab   Report 3 </a></td><td>CS101</td>
        <td>05/11/2026</td><td>-</td><td>Not Submitted</td>
      </tr>
      <tr>
        <td>2</td><td>Reading Summary</td><td>ENG201</td><td>TBA</td><td>-</td><td>Submitted</td>
      </tr>
      <tr><td colspan="6">1 2 3</td></tr>
    </table>
  "#;

  fn page_url() -> Url {
    Url::parse("https://dulms.example/Assignment/AssignmentStudentList").unwrap()
  }

  #[test]
  fn login_page_yields_hidden_fields_and_captcha() {
    let form = parse_login_page(LOGIN_PAGE).unwrap();
    assert_eq!(form.captcha.image, vec![1, 2, 3]);
    assert_eq!(
      form.hidden_fields,
      vec![
        ("__VIEWSTATE".to_string(), "abc123".to_string()),
        ("__EVENTVALIDATION".to_string(), "ev".to_string()),
      ]
    );
  }

  #[test]
  fn login_page_without_captcha_is_a_layout_error() {
    let err = parse_login_page("<html><body>maintenance</body></html>").unwrap_err();
    assert!(matches!(err, PortalError::Layout(ref msg) if msg.contains("CAPTCHA image not found")));

    let err = parse_login_page(r#"<img id="imgCaptcha" src="/captcha.ashx" />"#).unwrap_err();
    assert!(matches!(err, PortalError::Layout(ref msg) if msg.contains("not a data URL")));
  }

  #[test]
  fn record_table_rows_are_extracted() {
    let records = parse_record_table(ASSIGNMENTS_PAGE, "gvAssignment", &page_url()).unwrap();
    assert_eq!(records.len(), 2);

    assert_eq!(records[0].title, "Lab Report 3");
    assert_eq!(records[0].course, "CS101");
    assert_eq!(records[0].deadline, Some(Utc.with_ymd_and_hms(2026, 11, 5, 0, 0, 0).unwrap()));
    assert_eq!(records[0].submission, "Not Submitted");
    assert_eq!(records[0].url.as_deref(), Some("https://dulms.example/Assignment/Details/41"));

    assert_eq!(records[1].title, "Reading Summary");
    assert_eq!(records[1].deadline, None);
    assert_eq!(records[1].url.as_deref(), Some(page_url().as_str()));
  }

  #[test]
  fn missing_table_is_a_layout_error() {
    let err = parse_record_table("<html></html>", "gvQuiz", &page_url()).unwrap_err();
    assert!(matches!(err, PortalError::Layout(ref msg) if msg == "table #gvQuiz not found"));
  }

  #[test]
  fn header_only_table_is_empty() {
    let html = r#"<table id="gvQuiz"><tr><th>Title</th></tr></table>"#;
    assert!(parse_record_table(html, "gvQuiz", &page_url()).unwrap().is_empty());
  }

  #[test]
  fn error_label_text_is_read() {
    let html = r#"<span id="lblMessage"> Invalid   CAPTCHA code </span>"#;
    assert_eq!(login_error_message(html).as_deref(), Some("Invalid CAPTCHA code"));
    assert_eq!(login_error_message(r#"<span id="lblMessage"></span>"#), None);
  }

  #[tokio::test]
  async fn session_logs_in_with_hidden_fields_and_solution() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/Login.aspx"))
      .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_PAGE))
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/Login.aspx"))
      .and(body_string_contains("__VIEWSTATE=abc123"))
      .and(body_string_contains("txtCaptcha=x7k2"))
      .and(body_string_contains("username=student"))
      .respond_with(ResponseTemplate::new(302).insert_header("Location", "/Profile/StudentProfile"))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/Profile/StudentProfile"))
      .respond_with(ResponseTemplate::new(200).set_body_string("<html>welcome</html>"))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/Assignment/AssignmentStudentList"))
      .respond_with(ResponseTemplate::new(200).set_body_string(ASSIGNMENTS_PAGE))
      .mount(&server)
      .await;

    let portal = DulmsPortal::new(&server.uri(), Duration::from_secs(5)).unwrap();
    let session = portal.connect().unwrap();
    let challenge = session.captcha().await.unwrap();
    assert_eq!(challenge.image, vec![1, 2, 3]);
    session.login("student", "secret", "x7k2").await.unwrap();

    let assignments = session.assignments().await.unwrap();
    assert_eq!(assignments.len(), 2);
    assert!(assignments[0].url.as_deref().unwrap().starts_with(&server.uri()));
  }

  #[tokio::test]
  async fn rejected_login_reports_the_portal_message() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/Login.aspx"))
      .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_PAGE))
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/Login.aspx"))
      .respond_with(ResponseTemplate::new(200).set_body_string(
        r#"<html><span id="lblMessage">Invalid username or password</span></html>"#,
      ))
      .mount(&server)
      .await;

    let session = DulmsPortal::new(&server.uri(), Duration::from_secs(5)).unwrap().connect().unwrap();
    session.captcha().await.unwrap();
    let err = session.login("student", "wrong", "x7k2").await.unwrap_err();
    assert!(matches!(err, PortalError::Rejected(ref msg) if msg == "Invalid username or password"));
  }

  #[tokio::test]
  async fn wrong_captcha_answers_are_told_apart() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/Login.aspx"))
      .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_PAGE))
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/Login.aspx"))
      .respond_with(ResponseTemplate::new(200).set_body_string(
        r#"<html><span id="lblMessage">Invalid CAPTCHA code</span></html>"#,
      ))
      .mount(&server)
      .await;

    let session = DulmsPortal::new(&server.uri(), Duration::from_secs(5)).unwrap().connect().unwrap();
    session.captcha().await.unwrap();
    let err = session.login("student", "secret", "wrong").await.unwrap_err();
    assert!(matches!(err, PortalError::CaptchaRejected(ref msg) if msg == "Invalid CAPTCHA code"));
  }

  #[test]
  fn rejection_messages_are_classified() {
    assert!(matches!(rejection("Captcha is incorrect".into()), PortalError::CaptchaRejected(_)));
    assert!(matches!(rejection("Account locked".into()), PortalError::Rejected(_)));
  }

  #[tokio::test]
  async fn server_errors_are_network_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/Quizzes/StudentQuizzes"))
      .respond_with(ResponseTemplate::new(503))
      .mount(&server)
      .await;

    let session = DulmsPortal::new(&server.uri(), Duration::from_secs(5)).unwrap().connect().unwrap();
    let err = session.quizzes().await.unwrap_err();
    assert!(matches!(err, PortalError::Network(_)));
  }

  #[test]
  fn base_url_keeps_its_path_prefix() {
    let portal = DulmsPortal::new("https://lms.example/dulms", Duration::from_secs(1)).unwrap();
    assert_eq!(portal.endpoint(LOGIN_PATH).unwrap().as_str(), "https://lms.example/dulms/Login.aspx");
  }
}
