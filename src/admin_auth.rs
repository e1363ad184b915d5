// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Admin Credentials
//!
//! The admin endpoints live under an unguessable path and additionally
//! require a token. Both are generated fresh on every start. The token is
//! accepted as a bearer header, a `token` query parameter, or the session
//! cookie handed out by the login route.

use axum::http::{header, HeaderMap, Uri};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};

/// Characters in the admin path segment and in the token.
pub const ADMIN_SECRET_LENGTH: usize = 32;

/// Random bytes behind one secret (base64 expands 3 bytes to 4 chars).
const SECRET_BYTES: usize = ADMIN_SECRET_LENGTH / 4 * 3;

/// Name of the admin session cookie.
pub const SESSION_COOKIE_NAME: &str = "spider_trap_admin";

/// Session cookie lifetime: one day.
pub const SESSION_MAX_AGE_SECS: u64 = 24 * 60 * 60;

/// Failure of the system random source.
#[derive(Debug, thiserror::Error)]
#[error("system random source unavailable")]
pub struct RandomUnavailable;

/// Admin path and token.
#[derive(Clone)]
pub struct AdminAuth {
    path: String,
    token: String,
    token_digest: digest::Digest,
    secure_cookie: bool,
}

impl std::fmt::Debug for AdminAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminAuth")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn random_secret(rng: &SystemRandom) -> Result<String, RandomUnavailable> {
    let mut bytes = [0u8; SECRET_BYTES];
    rng.fill(&mut bytes).map_err(|_| RandomUnavailable)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

impl AdminAuth {
    /// Generates a random admin path and token.
    pub fn generate() -> Result<Self, RandomUnavailable> {
        let rng = SystemRandom::new();
        let path = format!("/{}", random_secret(&rng)?);
        let token = random_secret(&rng)?;
        Ok(Self::new(path, token))
    }

    /// Uses a fixed path and token. `path` is given a leading slash if missing.
    pub fn new(path: impl Into<String>, token: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        let token = token.into();
        let token_digest = digest::digest(&digest::SHA256, token.as_bytes());
        AdminAuth {
            path,
            token,
            token_digest,
            secure_cookie: false,
        }
    }

    /// Marks the session cookie `Secure`, for deployments behind HTTPS.
    pub fn with_secure_cookie(mut self, secure: bool) -> Self {
        self.secure_cookie = secure;
        self
    }

    /// Admin base path, starting with `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Checks a presented token.
    ///
    /// Both sides are hashed first so the comparison time does not depend on
    /// how much of the token matched.
    pub fn verify(&self, presented: &str) -> bool {
        let presented = digest::digest(&digest::SHA256, presented.as_bytes());
        presented.as_ref() == self.token_digest.as_ref()
    }

    /// Whether the request carries the admin token as a bearer token, in the
    /// session cookie, or as a `token` query parameter.
    pub fn authorize(&self, headers: &HeaderMap, uri: &Uri) -> bool {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "));
        if bearer.is_some_and(|t| self.verify(t.trim())) {
            return true;
        }

        if cookie_token(headers).is_some_and(|t| self.verify(t)) {
            return true;
        }

        query_token(uri).is_some_and(|t| self.verify(t))
    }

    /// Exchanges a valid `?token=` for a `Set-Cookie` value.
    pub fn login(&self, uri: &Uri) -> Option<String> {
        query_token(uri)
            .filter(|t| self.verify(t))
            .map(|_| self.session_cookie())
    }

    /// `Set-Cookie` value carrying the token for the whole site.
    pub fn session_cookie(&self) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Strict",
            SESSION_COOKIE_NAME, self.token, SESSION_MAX_AGE_SECS
        );
        if self.secure_cookie {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// Login URL to print at startup.
    pub fn login_url(&self, base: &str) -> String {
        format!(
            "{}{}/login?token={}",
            base.trim_end_matches('/'),
            self.path,
            self.token
        )
    }
}

fn query_token(uri: &Uri) -> Option<&str> {
    uri.query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
}

fn cookie_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(';'))
        .find_map(|pair| {
            pair.trim()
                .strip_prefix(SESSION_COOKIE_NAME)
                .and_then(|rest| rest.strip_prefix('='))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_generate_lengths_and_alphabet() {
        let auth = AdminAuth::generate().unwrap();

        assert_eq!(auth.path().len(), ADMIN_SECRET_LENGTH + 1);
        assert!(auth.path().starts_with('/'));
        assert_eq!(auth.token().len(), ADMIN_SECRET_LENGTH);
        assert!(auth
            .token()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_generate_is_random() {
        let a = AdminAuth::generate().unwrap();
        let b = AdminAuth::generate().unwrap();
        assert_ne!(a.path(), b.path());
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn test_new_adds_leading_slash() {
        let auth = AdminAuth::new("secret", "tok");
        assert_eq!(auth.path(), "/secret");
        assert_eq!(AdminAuth::new("/secret", "tok").path(), "/secret");
    }

    #[test]
    fn test_verify() {
        let auth = AdminAuth::new("/a", "right-token");
        assert!(auth.verify("right-token"));
        assert!(!auth.verify("wrong-token"));
        assert!(!auth.verify(""));
    }

    #[test]
    fn test_authorize_bearer_and_query() {
        let auth = AdminAuth::new("/a", "tok123");

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok123"),
        );
        let plain: Uri = "/a".parse().unwrap();
        assert!(auth.authorize(&headers, &plain));

        let with_query: Uri = "/a/data?x=1&token=tok123".parse().unwrap();
        assert!(auth.authorize(&HeaderMap::new(), &with_query));

        let wrong: Uri = "/a?token=nope".parse().unwrap();
        assert!(!auth.authorize(&HeaderMap::new(), &wrong));
        assert!(!auth.authorize(&HeaderMap::new(), &plain));
    }

    #[test]
    fn test_authorize_session_cookie() {
        let auth = AdminAuth::new("/a", "tok123");
        let plain: Uri = "/a/data".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; spider_trap_admin=tok123"),
        );
        assert!(auth.authorize(&headers, &plain));

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("spider_trap_admin=stale"),
        );
        assert!(!auth.authorize(&headers, &plain));

        // A cookie whose name merely starts with ours does not count
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("spider_trap_admin_old=tok123"),
        );
        assert!(!auth.authorize(&headers, &plain));
    }

    #[test]
    fn test_login_issues_session_cookie() {
        let auth = AdminAuth::new("/a", "tok123");

        let cookie = auth.login(&"/a/login?token=tok123".parse().unwrap()).unwrap();
        assert!(cookie.starts_with("spider_trap_admin=tok123;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.contains("Max-Age=86400"));
        assert!(!cookie.contains("Secure"));

        assert!(auth.login(&"/a/login?token=nope".parse().unwrap()).is_none());
        assert!(auth.login(&"/a/login".parse().unwrap()).is_none());
    }

    #[test]
    fn test_secure_cookie_flag() {
        let auth = AdminAuth::new("/a", "t").with_secure_cookie(true);
        assert!(auth.session_cookie().ends_with("; Secure"));
    }

    #[test]
    fn test_debug_hides_token() {
        let auth = AdminAuth::new("/a", "super-secret");
        assert!(!format!("{:?}", auth).contains("super-secret"));
    }

    #[test]
    fn test_login_url() {
        let auth = AdminAuth::new("/adm", "t");
        assert_eq!(
            auth.login_url("http://localhost:8000/"),
            "http://localhost:8000/adm/login?token=t"
        );
    }
}
