use std::path::Path;

use async_trait::async_trait;
use russh::keys::{PublicKey, PublicKeyBase64, ssh_key::AuthorizedKeys};
use russh::server::Auth;
use russh::{MethodKind, MethodSet};
use tracing::warn;

fn reject_with_publickey() -> Auth {
    Auth::Reject {
        proceed_with_methods: Some(MethodSet::from([MethodKind::PublicKey].as_slice())),
        partial_success: false,
    }
}

/// Decides whether an origin client may connect to the proxy at all.
///
/// This is the proxy's own authentication; nothing the origin presents here
/// is ever replayed to the target.
#[async_trait]
pub trait AuthPolicy: Send + Sync {
    async fn auth_none(&self, user: &str) -> Auth {
        let _ = user;
        reject_with_publickey()
    }

    async fn auth_password(&self, user: &str, password: &str) -> Auth {
        let _ = (user, password);
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    async fn auth_publickey(&self, user: &str, public_key: &PublicKey) -> Auth {
        let _ = (user, public_key);
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }
}

/// Accepts public keys listed in an `authorized_keys`-format file.
pub struct AuthorizedKeysPolicy {
    authorized: Vec<String>,
}

impl AuthorizedKeysPolicy {
    /// Reads the whole file up front. Keys added later require a restart.
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let entries = AuthorizedKeys::read_file(path)?;
        Ok(AuthorizedKeysPolicy {
            authorized: entries
                .iter()
                .map(|entry| entry.public_key().public_key_base64())
                .collect(),
        })
    }
}

#[async_trait]
impl AuthPolicy for AuthorizedKeysPolicy {
    async fn auth_publickey(&self, user: &str, public_key: &PublicKey) -> Auth {
        if self
            .authorized
            .iter()
            .any(|authorized| *authorized == public_key.public_key_base64())
        {
            Auth::Accept
        } else {
            warn!(%user, "Public key not in authorized keys.");
            Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }
        }
    }
}

/// Accepts every client. Only suitable for demos and tests.
pub struct AllowAllPolicy;

#[async_trait]
impl AuthPolicy for AllowAllPolicy {
    async fn auth_none(&self, _user: &str) -> Auth {
        Auth::Accept
    }

    async fn auth_password(&self, _user: &str, _password: &str) -> Auth {
        Auth::Accept
    }

    async fn auth_publickey(&self, _user: &str, _public_key: &PublicKey) -> Auth {
        Auth::Accept
    }
}
