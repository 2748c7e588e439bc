//! Cookie session against a Sanctum-style backend.
//!
//! The server keeps the login in a session cookie and guards state-changing
//! requests with a CSRF token it hands out as the `XSRF-TOKEN` cookie. The
//! client echoes that token back URL-decoded in the `X-XSRF-TOKEN` header.
//! Cookies and the logged-in user are persisted to `session.json` so the CLI
//! stays logged in between runs.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config;
use crate::models::User;

pub const XSRF_COOKIE: &str = "XSRF-TOKEN";
pub const XSRF_HEADER: &str = "X-XSRF-TOKEN";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Session {
    #[serde(default)]
    cookies: BTreeMap<String, String>,
    #[serde(default)]
    user: Option<User>,
}

pub fn session_path() -> PathBuf {
    config::get_config_dir().join("session.json")
}

impl Session {
    /// Load a saved session, starting empty when the file is missing or
    /// unreadable.
    pub fn load(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            tracing::debug!("No saved session at {}", path.display());
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Ignoring unreadable session file: {}", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self)?;
        config::write_private(path, json.as_bytes())
    }

    pub fn delete(path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn set_user(&mut self, user: Option<User>) {
        self.user = user;
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
        self.user = None;
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Merge `Set-Cookie` header values. Returns whether anything changed.
    pub fn absorb_set_cookies<'a>(&mut self, headers: impl IntoIterator<Item = &'a str>) -> bool {
        let mut changed = false;
        for header in headers {
            let Some((name, value, expired)) = parse_set_cookie(header) else {
                continue;
            };
            if expired {
                changed |= self.cookies.remove(&name).is_some();
            } else if self.cookies.get(&name) != Some(&value) {
                self.cookies.insert(name, value);
                changed = true;
            }
        }
        changed
    }

    /// Value for the `Cookie` request header.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        Some(pairs.join("; "))
    }

    /// CSRF token to echo back in [`XSRF_HEADER`].
    pub fn xsrf_token(&self) -> Option<String> {
        let raw = self.cookie(XSRF_COOKIE)?;
        let decoded = urlencoding::decode(raw)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| raw.to_string());
        Some(decoded)
    }
}

/// Name, value and whether the cookie is being deleted.
fn parse_set_cookie(header: &str) -> Option<(String, String, bool)> {
    let mut parts = header.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let value = value.trim().trim_matches('"').to_string();

    let mut expired = value.is_empty() || value == "deleted";
    for attribute in parts {
        let Some((key, val)) = attribute.split_once('=') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("max-age") {
            if let Ok(age) = val.trim().parse::<i64>() {
                expired |= age <= 0;
            }
        }
    }
    Some((name.to_string(), value, expired))
}
