//! Local SIP accounts and their per-account messaging policy.

use std::fmt;

use serde::{Deserialize, Serialize};
use sipchat_crypto_core::KeyOwner;
use sipchat_messaging::{ChatIdentity, SipUri};

/// Messaging switches carried by every account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageSettings {
    pub use_cpim: bool,
    pub enable_imdn: bool,
    pub enable_iscomposing: bool,
    pub enable_pgp: bool,
    pub enable_message_replication: bool,
}

impl Default for MessageSettings {
    fn default() -> Self {
        Self {
            use_cpim: true,
            enable_imdn: true,
            enable_iscomposing: true,
            enable_pgp: true,
            enable_message_replication: true,
        }
    }
}

/// Authentication material handed to the SIP stack untouched.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountIdentity {
    /// `user@host`; names the key files of this account.
    pub id: String,
    pub uri: SipUri,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub outbound_proxy: Option<SipUri>,
    #[serde(default)]
    pub always_use_my_proxy: bool,
    #[serde(default)]
    pub tls_name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub message_settings: MessageSettings,
}

fn enabled_by_default() -> bool {
    true
}

impl AccountIdentity {
    pub fn new(uri: SipUri, display_name: Option<&str>) -> Self {
        Self {
            id: uri.address(),
            uri,
            display_name: display_name.map(str::to_owned),
            credentials: None,
            outbound_proxy: None,
            always_use_my_proxy: false,
            tls_name: None,
            enabled: true,
            message_settings: MessageSettings::default(),
        }
    }

    pub fn identity(&self) -> ChatIdentity {
        ChatIdentity::new(self.uri.bare(), self.display_name.clone())
    }

    pub fn domain(&self) -> &str {
        &self.uri.host
    }

    /// True when `uri` names this account.
    pub fn matches(&self, uri: &SipUri) -> bool {
        uri.address().eq_ignore_ascii_case(&self.id)
    }
}

/// The set of configured accounts.
#[derive(Debug, Default)]
pub struct AccountManager {
    accounts: Vec<AccountIdentity>,
}

impl AccountManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by account id.
    pub fn add(&mut self, account: AccountIdentity) {
        match self.accounts.iter_mut().find(|a| a.id == account.id) {
            Some(existing) => *existing = account,
            None => self.accounts.push(account),
        }
    }

    pub fn remove(&mut self, account_id: &str) -> Option<AccountIdentity> {
        let index = self.accounts.iter().position(|a| a.id == account_id)?;
        Some(self.accounts.remove(index))
    }

    pub fn get(&self, account_id: &str) -> Option<&AccountIdentity> {
        self.accounts.iter().find(|a| a.id == account_id)
    }

    /// The enabled account addressed by an inbound request URI.
    pub fn find_account(&self, request_uri: &SipUri) -> Option<&AccountIdentity> {
        self.accounts
            .iter()
            .find(|a| a.enabled && a.matches(request_uri))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccountIdentity> {
        self.accounts.iter()
    }

    pub fn key_owners(&self) -> Vec<KeyOwner> {
        self.accounts
            .iter()
            .map(|a| KeyOwner::new(a.id.clone(), a.enabled))
            .collect()
    }
}
