//! Username/password pairs loaded once at startup.
//!
//! The backing file holds one `username:password` pair per line. Everything
//! after the first colon is the password, so passwords may contain colons.

use std::{collections::HashMap, path::Path};

use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone)]
pub struct CredentialStore {
    users: HashMap<String, String>,
}

impl CredentialStore {
    /// Reads the credential file at `path`.
    ///
    /// An unreadable file yields an empty store so the server can still start;
    /// every login attempt will then fail.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let store = Self::parse(&contents);
                info!(path = %path.display(), users = store.len(), "loaded credentials");
                store
            }
            Err(error) => {
                warn!(path = %path.display(), ?error, "failed to read credentials; all logins will fail");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Self {
        let mut users = HashMap::new();
        for (index, line) in contents.lines().enumerate() {
            match parse_line(line) {
                Some((username, password)) => {
                    users.insert(username.to_string(), password.to_string());
                }
                None => debug!(line = index + 1, "skipping malformed credential line"),
            }
        }
        Self { users }
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|expected| expected == password)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl<U, P> FromIterator<(U, P)> for CredentialStore
where
    U: Into<String>,
    P: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (U, P)>>(iter: I) -> Self {
        Self {
            users: iter
                .into_iter()
                .map(|(username, password)| (username.into(), password.into()))
                .collect(),
        }
    }
}

fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches('\r');
    let (username, password) = line.split_once(':')?;
    if username.is_empty() || password.is_empty() {
        return None;
    }
    Some((username, password))
}
