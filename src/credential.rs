//! Credentials for HTTP authentication.
//!
//! When a response answers 401 with a Basic challenge, the session describes
//! the server's authentication domain as a [`ProtectionSpace`] and asks its
//! [`CredentialStore`] for something to retry with.

use std::{collections::HashMap, fmt};

use url::Url;

use crate::{
    message::challenge::{Challenge, AUTH_SCHEME_BASIC},
    response::Response,
    sync::Mutex,
};

/// The authentication scheme of a [`ProtectionSpace`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AuthenticationMethod {
    /// RFC 7617 Basic authentication.
    HttpBasic,
}

/// An authentication domain: host, port, scheme, realm and method.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProtectionSpace {
    host: String,
    port: u16,
    protocol: String,
    realm: Option<String>,
    authentication_method: AuthenticationMethod,
}

impl ProtectionSpace {
    /// Creates a protection space.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        protocol: impl Into<String>,
        realm: Option<String>,
        authentication_method: AuthenticationMethod,
    ) -> ProtectionSpace {
        ProtectionSpace {
            host: host.into(),
            port,
            protocol: protocol.into(),
            realm,
            authentication_method,
        }
    }

    /// Derives the protection space of a 401 response from its first Basic
    /// challenge.
    ///
    /// Returns `None` when there is no usable challenge or the response does
    /// not come from an `http` or `https` URL.
    pub(crate) fn from_response(response: &Response) -> Option<ProtectionSpace> {
        let challenge = response.challenges().into_iter().next()?;
        ProtectionSpace::from_challenge(&challenge, response.url())
    }

    fn from_challenge(challenge: &Challenge, url: &Url) -> Option<ProtectionSpace> {
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return None;
        }
        let authentication_method = if challenge.scheme().eq_ignore_ascii_case(AUTH_SCHEME_BASIC) {
            AuthenticationMethod::HttpBasic
        } else {
            return None;
        };
        Some(ProtectionSpace {
            host: url.host_str()?.to_owned(),
            port: url.port_or_known_default()?,
            protocol: scheme.to_owned(),
            realm: challenge.realm().map(str::to_owned),
            authentication_method,
        })
    }

    /// The server host.
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The server port.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The URL scheme, `http` or `https`.
    #[inline]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The realm announced by the challenge.
    #[inline]
    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    /// The authentication scheme.
    #[inline]
    pub fn authentication_method(&self) -> AuthenticationMethod {
        self.authentication_method
    }
}

/// A user name and password.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    user: String,
    password: String,
}

impl Credential {
    /// Creates a credential.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Credential {
        Credential {
            user: user.into(),
            password: password.into(),
        }
    }

    /// The user name.
    #[inline]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The password.
    #[inline]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// A challenge handed to a task delegate.
#[derive(Clone, Debug)]
pub struct AuthenticationChallenge {
    pub(crate) protection_space: ProtectionSpace,
    pub(crate) proposed_credential: Option<Credential>,
    pub(crate) previous_failure_count: usize,
    pub(crate) failure_response: Response,
}

impl AuthenticationChallenge {
    /// The domain asking for credentials.
    pub fn protection_space(&self) -> &ProtectionSpace {
        &self.protection_space
    }

    /// What default handling would retry with, if anything.
    ///
    /// This is `None` when the store has nothing, or when it only has the
    /// credential that was just rejected.
    pub fn proposed_credential(&self) -> Option<&Credential> {
        self.proposed_credential.as_ref()
    }

    /// How many challenges this task has already seen.
    pub fn previous_failure_count(&self) -> usize {
        self.previous_failure_count
    }

    /// The 401 response that raised the challenge.
    pub fn failure_response(&self) -> &Response {
        &self.failure_response
    }
}

/// Credential storage, injected into a session.
pub trait CredentialStore: Send + Sync {
    /// Every credential stored for `space`, keyed by user name.
    fn credentials(&self, space: &ProtectionSpace) -> HashMap<String, Credential>;

    /// The default credential for `space`.
    fn default_credential(&self, space: &ProtectionSpace) -> Option<Credential>;

    /// Stores `credential` for `space`, replacing one with the same user.
    fn set(&self, credential: Credential, space: &ProtectionSpace);

    /// Stores `credential` and makes it the default for `space`.
    fn set_default(&self, credential: Credential, space: &ProtectionSpace);

    /// Removes `credential` from `space`.
    fn remove(&self, credential: &Credential, space: &ProtectionSpace);
}

/// Looks up the credential default handling proposes for `space`.
///
/// The lexicographically first user wins; the default credential is the
/// fallback.
pub(crate) fn lookup(store: &dyn CredentialStore, space: &ProtectionSpace) -> Option<Credential> {
    let mut credentials = store.credentials(space);
    let first = credentials.keys().min().cloned();
    match first {
        Some(user) => credentials.remove(&user),
        None => store.default_credential(space),
    }
}

/// An in-memory [`CredentialStore`].
#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    credentials: HashMap<ProtectionSpace, HashMap<String, Credential>>,
    defaults: HashMap<ProtectionSpace, String>,
}

impl MemoryCredentialStore {
    /// Creates an empty store.
    pub fn new() -> MemoryCredentialStore {
        MemoryCredentialStore::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn credentials(&self, space: &ProtectionSpace) -> HashMap<String, Credential> {
        self.inner
            .lock()
            .credentials
            .get(space)
            .cloned()
            .unwrap_or_default()
    }

    fn default_credential(&self, space: &ProtectionSpace) -> Option<Credential> {
        let inner = self.inner.lock();
        let user = inner.defaults.get(space)?;
        inner.credentials.get(space)?.get(user).cloned()
    }

    fn set(&self, credential: Credential, space: &ProtectionSpace) {
        self.inner
            .lock()
            .credentials
            .entry(space.clone())
            .or_default()
            .insert(credential.user.clone(), credential);
    }

    fn set_default(&self, credential: Credential, space: &ProtectionSpace) {
        let user = credential.user.clone();
        self.set(credential, space);
        self.inner.lock().defaults.insert(space.clone(), user);
    }

    fn remove(&self, credential: &Credential, space: &ProtectionSpace) {
        let mut inner = self.inner.lock();
        if let Some(users) = inner.credentials.get_mut(space) {
            users.remove(&credential.user);
        }
        if inner.defaults.get(space) == Some(&credential.user) {
            inner.defaults.remove(space);
        }
    }
}

impl fmt::Debug for MemoryCredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemoryCredentialStore")
            .field("spaces", &self.inner.lock().credentials.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{header::WWW_AUTHENTICATE, HeaderMap, HeaderValue, StatusCode, Version};

    fn unauthorized(url: &str, challenge: &'static str) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static(challenge));
        Response::http(
            Url::parse(url).unwrap(),
            StatusCode::UNAUTHORIZED,
            Version::HTTP_11,
            headers,
        )
    }

    fn space() -> ProtectionSpace {
        ProtectionSpace::new("example.com", 80, "http", Some("test".into()), AuthenticationMethod::HttpBasic)
    }

    #[test]
    fn protection_space_from_basic_challenge() {
        let res = unauthorized("http://example.com/secret", "Basic realm=\"test\"");
        assert_eq!(ProtectionSpace::from_response(&res), Some(space()));

        let res = unauthorized("https://example.com:8443/", "Basic realm=\"x\"");
        let space = ProtectionSpace::from_response(&res).unwrap();
        assert_eq!(space.port(), 8443);
        assert_eq!(space.protocol(), "https");
    }

    #[test]
    fn no_space_without_basic_challenge() {
        let res = unauthorized("http://example.com/", "Digest realm=\"test\"");
        assert!(ProtectionSpace::from_response(&res).is_none());
    }

    #[test]
    fn lookup_prefers_first_user_then_default() {
        let store = MemoryCredentialStore::new();
        assert!(lookup(&store, &space()).is_none());

        store.set(Credential::new("zed", "1"), &space());
        store.set(Credential::new("amy", "2"), &space());
        assert_eq!(lookup(&store, &space()).unwrap().user(), "amy");

        let other = ProtectionSpace::new("example.com", 80, "http", None, AuthenticationMethod::HttpBasic);
        assert!(lookup(&store, &other).is_none());
    }

    #[test]
    fn default_credential_round_trip() {
        let store = MemoryCredentialStore::new();
        let cred = Credential::new("user", "pass");
        store.set_default(cred.clone(), &space());
        assert_eq!(store.default_credential(&space()), Some(cred.clone()));

        store.remove(&cred, &space());
        assert!(store.default_credential(&space()).is_none());
        assert!(store.credentials(&space()).is_empty());
    }

    #[test]
    fn debug_hides_password() {
        let cred = Credential::new("user", "hunter2");
        assert!(!format!("{cred:?}").contains("hunter2"));
    }
}
