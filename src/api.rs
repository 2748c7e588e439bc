use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT, COOKIE, SET_COOKIE};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time;

use crate::autosave::FieldPersister;
use crate::config::GeneralConfig;
use crate::models::{NewNote, Note, RegisterRequest, User};
use crate::session::{self, Session, XSRF_HEADER};

/// Laravel's status for a missing or stale CSRF token.
const CSRF_MISMATCH: u16 = 419;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not logged in")]
    Unauthenticated,
    #[error("{0}")]
    Rejected(String),
    #[error("{context} failed: {status}")]
    Status {
        context: &'static str,
        status: StatusCode,
    },
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

pub struct APIClient {
    client: Client,
    base_url: String,
    max_attempts: u32,
    session: Mutex<Session>,
    session_path: Option<PathBuf>,
}

impl APIClient {
    /// Client restoring the session saved under the config directory.
    pub fn from_config(config: &GeneralConfig) -> Result<Self> {
        let path = session::session_path();
        let session = Session::load(&path);
        Self::new(config, session, Some(path))
    }

    /// `session_path` of `None` keeps the session in memory only.
    pub fn new(
        config: &GeneralConfig,
        session: Session,
        session_path: Option<PathBuf>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: config.api_base_url(),
            max_attempts: config.max_attempts.max(1),
            session: Mutex::new(session),
            session_path,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session(&self) -> Session {
        self.lock_session().clone()
    }

    fn persist_session(&self, session: &Session) {
        if let Some(path) = &self.session_path {
            if let Err(e) = session.save(path) {
                tracing::warn!("Failed to save session: {:#}", e);
            }
        }
    }

    fn absorb_cookies(&self, resp: &Response) {
        let headers = resp
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok());
        let mut session = self.lock_session();
        if session.absorb_set_cookies(headers) {
            self.persist_session(&session);
        }
    }

    fn update_user(&self, user: Option<User>) {
        let mut session = self.lock_session();
        session.set_user(user);
        self.persist_session(&session);
    }

    fn clear_session(&self) {
        self.lock_session().clear();
        if let Some(path) = &self.session_path {
            if let Err(e) = Session::delete(path) {
                tracing::warn!("Failed to delete session file: {:#}", e);
            }
        }
    }

    async fn prime_csrf(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/sanctum/csrf-cookie", self.base_url))
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        self.absorb_cookies(&resp);
        check(resp, "CSRF cookie").await?;
        Ok(())
    }

    async fn session_request<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&T>,
    ) -> Result<Response> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            let url = format!("{}{}", self.base_url, path);
            let mut builder = self
                .client
                .request(method.clone(), &url)
                .header(ACCEPT, "application/json")
                .header("X-Requested-With", "XMLHttpRequest");

            let (cookies, xsrf) = {
                let session = self.lock_session();
                (session.cookie_header(), session.xsrf_token())
            };
            if let Some(cookies) = cookies.and_then(|c| HeaderValue::from_str(&c).ok()) {
                builder = builder.header(COOKIE, cookies);
            }
            if let Some(token) = xsrf {
                builder = builder.header(XSRF_HEADER, token);
            }

            if let Some(b) = body {
                builder = builder.json(b);
            }

            match builder.send().await {
                Ok(resp) => {
                    self.absorb_cookies(&resp);

                    if resp.status().as_u16() == CSRF_MISMATCH
                        && attempts == 1
                        && self.prime_csrf().await.is_ok()
                    {
                        tracing::debug!("CSRF token refreshed, retrying {} {}", method, path);
                        continue;
                    }

                    if resp.status().is_server_error() && attempts < self.max_attempts {
                        time::sleep(Duration::from_millis(500 * attempts as u64)).await;
                        continue;
                    }

                    return Ok(resp);
                }
                Err(e) if attempts < self.max_attempts => {
                    tracing::warn!("{} {} failed (attempt {}): {}", method, path, attempts, e);
                    time::sleep(Duration::from_millis(500 * attempts as u64)).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<User> {
        self.prime_csrf().await.context("Failed to reach server")?;
        let body = serde_json::json!({ "email": email, "password": password });
        let resp = self
            .session_request(Method::POST, "/api/login", Some(&body))
            .await?;
        let user: User = check(resp, "Login").await?.json().await?;
        tracing::info!("Logged in as user {}", user.id);
        self.update_user(Some(user.clone()));
        Ok(user)
    }

    /// Register, then log in with the same credentials.
    pub async fn register(&self, request: &RegisterRequest) -> Result<User> {
        self.prime_csrf().await.context("Failed to reach server")?;
        let resp = self
            .session_request(Method::POST, "/api/register", Some(request))
            .await?;
        check(resp, "Registration").await?;
        self.login(&request.email, &request.password).await
    }

    /// Ends the server session. The local session is dropped even when the
    /// server says it had already expired.
    pub async fn logout(&self) -> Result<()> {
        let resp = self
            .session_request::<()>(Method::POST, "/api/logout", None)
            .await?;
        match check(resp, "Logout").await {
            Ok(_) => {}
            Err(e) if is_unauthenticated(&e) => {}
            Err(e) => return Err(e),
        }
        self.clear_session();
        tracing::info!("Logged out");
        Ok(())
    }

    /// The logged-in user, or `None` when the server does not recognise the
    /// session.
    pub async fn current_user(&self) -> Result<Option<User>> {
        let resp = self
            .session_request::<()>(Method::GET, "/api/user", None)
            .await?;
        match check(resp, "Fetch user").await {
            Ok(resp) => {
                let user: User = resp.json().await?;
                self.update_user(Some(user.clone()));
                Ok(Some(user))
            }
            Err(e) if is_unauthenticated(&e) => {
                self.update_user(None);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list_notes(&self) -> Result<Vec<Note>> {
        let resp = self
            .session_request::<()>(Method::GET, "/api/notes", None)
            .await?;
        let notes = check(resp, "Fetch notes").await?.json().await?;
        Ok(notes)
    }

    pub async fn create_note(&self, note: &NewNote) -> Result<Note> {
        let resp = self
            .session_request(Method::POST, "/api/notes", Some(note))
            .await?;
        let created: Note = check(resp, "Create note").await?.json().await?;
        tracing::info!("Created note {}", created.id);
        Ok(created)
    }

    pub async fn update_note_field(&self, id: i64, field: &str, value: &str) -> Result<()> {
        let mut body = serde_json::Map::new();
        body.insert(field.to_string(), serde_json::Value::from(value));
        let path = format!("/api/notes/{}", id);
        let resp = self
            .session_request(Method::PATCH, &path, Some(&body))
            .await?;
        check(resp, "Update note").await?;
        Ok(())
    }

    pub async fn delete_note(&self, id: i64) -> Result<()> {
        let path = format!("/api/notes/{}", id);
        let resp = self
            .session_request::<()>(Method::DELETE, &path, None)
            .await?;
        check(resp, "Delete note").await?;
        tracing::info!("Deleted note {}", id);
        Ok(())
    }
}

async fn check(resp: Response, context: &'static str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthenticated.into());
    }
    if status.is_client_error() {
        if let Ok(body) = resp.json::<ErrorBody>().await {
            return Err(ApiError::Rejected(body.message).into());
        }
    }
    Err(ApiError::Status { context, status }.into())
}

pub fn is_unauthenticated(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<ApiError>(),
        Some(ApiError::Unauthenticated)
    )
}

/// Autosave collaborator writing one note field per `PATCH /api/notes/{id}`.
pub struct NotePersister {
    client: Arc<APIClient>,
}

impl NotePersister {
    pub fn new(client: Arc<APIClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FieldPersister<i64, String> for NotePersister {
    async fn persist_field(&self, entity: &i64, field: &str, value: &String) -> Result<()> {
        self.client
            .update_note_field(*entity, field, value)
            .await
            .with_context(|| format!("Saving {} of note {}", field, entity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthenticated_is_detected_through_context() {
        let err = anyhow::Error::from(ApiError::Unauthenticated).context("Fetch notes");
        assert!(is_unauthenticated(&err));

        let other = anyhow::Error::from(ApiError::Status {
            context: "Fetch notes",
            status: StatusCode::INTERNAL_SERVER_ERROR,
        });
        assert!(!is_unauthenticated(&other));
        assert_eq!(
            other.to_string(),
            "Fetch notes failed: 500 Internal Server Error"
        );
    }

    #[tokio::test]
    async fn client_uses_configured_base_url() {
        let config = GeneralConfig {
            api_base_url: "http://notes.test/".into(),
            ..GeneralConfig::default()
        };
        let client = APIClient::new(&config, Session::default(), None).unwrap();
        assert!(!client.base_url().ends_with('/'));
        assert!(!client.session().is_authenticated());
    }
}
