//! Local authorization policy.
//!
//! Policy rows map an OIDC identity to a UNIX principal:
//! `<principal> <matcher-kind> <matcher-value> <issuer>` with kinds `email`,
//! `sub`, `oidc:groups`, and the legacy `oidc` (email-or-sub). The system
//! file is consulted first, then the principal's own `~/.ssh/auth_id` via
//! the privilege-separated `readhome` path; the first matching row wins.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

use opkssh_common::{config::Config, error::AuthError, fs::FileSystem};
use opkssh_token::IdClaims;

/// System-wide policy file, mode 640 root:opksshuser.
pub const SYSTEM_POLICY_PATH: &str = "/etc/opk/auth_id";

/// Case-insensitive, NFC-normalized email comparison.
fn emails_equal(a: &str, b: &str) -> bool {
    let normalize = |s: &str| s.nfc().collect::<String>().to_lowercase();
    normalize(a) == normalize(b)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    Email(String),
    Sub(String),
    Group(String),
    /// Legacy `oidc` kind: matches email (case-insensitively) or sub.
    Any(String),
}

#[derive(Debug, Clone)]
pub struct PolicyEntry {
    pub principal: String,
    pub matcher: Matcher,
    pub issuer: String,
}

impl PolicyEntry {
    pub fn parse(line: &str) -> Result<Self, AuthError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let &[principal, kind, value, issuer] = fields.as_slice() else {
            return Err(AuthError::Configuration(format!(
                "expected `<principal> <kind> <value> <issuer>` got {} fields",
                fields.len()
            )));
        };
        let matcher = match kind {
            "email" => Matcher::Email(value.to_string()),
            "sub" => Matcher::Sub(value.to_string()),
            "oidc:groups" => Matcher::Group(value.to_string()),
            "oidc" => Matcher::Any(value.to_string()),
            _ => {
                return Err(AuthError::Configuration(format!(
                    "unknown matcher kind {kind:?}"
                )))
            }
        };
        Ok(Self {
            principal: principal.to_string(),
            matcher,
            issuer: issuer.to_string(),
        })
    }

    fn matches(&self, claims: &IdClaims, principal: &str) -> bool {
        if self.principal != principal {
            return false;
        }
        if self.issuer.trim_end_matches('/') != claims.iss.trim_end_matches('/') {
            return false;
        }
        match &self.matcher {
            Matcher::Email(email) => claims
                .email
                .as_deref()
                .is_some_and(|claimed| emails_equal(claimed, email)),
            Matcher::Sub(sub) => claims.sub == *sub,
            Matcher::Group(group) => claims.groups.iter().any(|g| g == group),
            Matcher::Any(value) => {
                claims.sub == *value
                    || claims
                        .email
                        .as_deref()
                        .is_some_and(|claimed| emails_equal(claimed, value))
            }
        }
    }
}

/// An ordered set of policy rows.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    entries: Vec<PolicyEntry>,
}

impl Policy {
    /// Parse a policy file body. Comment and blank lines are skipped;
    /// malformed rows are logged and skipped rather than failing the lot.
    pub fn parse(source: &str, text: &str) -> Self {
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match PolicyEntry::parse(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(source, line = lineno + 1, %err, "skipping policy row"),
            }
        }
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First matching entry wins.
    pub fn authorize(&self, claims: &IdClaims, principal: &str) -> Option<&PolicyEntry> {
        self.entries
            .iter()
            .find(|entry| entry.matches(claims, principal))
    }
}

/// Loads a principal's own `~/.ssh/auth_id`, however that is reachable from
/// this process (direct read, or the `sudo ... readhome` helper).
#[async_trait]
pub trait UserPolicyLoader: Send + Sync {
    async fn load(&self, principal: &str) -> Result<String, AuthError>;
}

/// Policy evaluation over the system file plus the per-user loader.
pub struct PolicyEngine {
    fs: Arc<dyn FileSystem>,
    user_loader: Box<dyn UserPolicyLoader>,
}

impl PolicyEngine {
    pub fn new(fs: Arc<dyn FileSystem>, user_loader: Box<dyn UserPolicyLoader>) -> Self {
        Self { fs, user_loader }
    }

    fn system_policy(&self) -> Policy {
        let path = Path::new(SYSTEM_POLICY_PATH);
        if !self.fs.exists(path) {
            return Policy::default();
        }
        match self.fs.read(path) {
            Ok(raw) => Policy::parse(SYSTEM_POLICY_PATH, &String::from_utf8_lossy(&raw)),
            Err(err) => {
                warn!(%err, "system policy unreadable, treating as empty");
                Policy::default()
            }
        }
    }

    /// Authorize `principal` for the verified claims.
    ///
    /// A failure to read the user's own policy is fatal only when the system
    /// policy did not already authorize the login.
    pub async fn authorize(
        &self,
        config: &Config,
        claims: &IdClaims,
        principal: &str,
    ) -> Result<(), AuthError> {
        if !config.issuer_allowed(&claims.iss) {
            return Err(AuthError::UnknownIssuer(claims.iss.clone()));
        }

        if let Some(entry) = self.system_policy().authorize(claims, principal) {
            debug!(principal, matcher = ?entry.matcher, "system policy match");
            return Ok(());
        }

        let user_text = match self.user_loader.load(principal).await {
            Ok(text) => text,
            Err(err) => {
                warn!(principal, %err, "user policy unavailable");
                return Err(AuthError::PolicyDenied(format!(
                    "no system policy entry for {principal} and user policy unavailable"
                )));
            }
        };
        let user_policy = Policy::parse("auth_id", &user_text);
        match user_policy.authorize(claims, principal) {
            Some(entry) => {
                debug!(principal, matcher = ?entry.matcher, "user policy match");
                Ok(())
            }
            None => Err(AuthError::PolicyDenied(format!(
                "no policy entry authorizes {principal}"
            ))),
        }
    }

    /// Append a policy row, inferring the matcher kind from the identity
    /// (`@` means email).
    pub fn add_entry(
        &self,
        path: &Path,
        principal: &str,
        identity: &str,
        issuer: &str,
    ) -> Result<(), AuthError> {
        for field in [principal, identity, issuer] {
            if field.is_empty() || field.chars().any(char::is_whitespace) {
                return Err(AuthError::Configuration(format!(
                    "policy fields may not be empty or contain whitespace: {field:?}"
                )));
            }
        }
        let kind = if identity.contains('@') { "email" } else { "sub" };
        let row = format!("{principal} {kind} {identity} {issuer}\n");
        // Validate our own output before persisting it.
        PolicyEntry::parse(row.trim_end())?;
        self.fs.append(path, row.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opkssh_common::{config::ProviderConfig, fs::MemFs};
    use opkssh_token::Audience;

    const ISSUER: &str = "https://op.test/";

    fn claims(sub: &str, email: Option<&str>) -> IdClaims {
        IdClaims {
            iss: ISSUER.to_string(),
            sub: sub.to_string(),
            aud: Audience::Single("cid".to_string()),
            exp: 2_000_000_000,
            iat: 1_700_000_000,
            nonce: None,
            email: email.map(str::to_string),
            groups: vec!["admins".to_string()],
        }
    }

    fn config() -> Config {
        Config::from_providers(vec![
            ProviderConfig::parse(&format!("op,{ISSUER},cid,,"), true).unwrap(),
        ])
    }

    struct NoUserPolicy;

    #[async_trait]
    impl UserPolicyLoader for NoUserPolicy {
        async fn load(&self, _principal: &str) -> Result<String, AuthError> {
            Err(AuthError::Io("no user policy in this test".into()))
        }
    }

    fn engine_with_system(rows: &str) -> PolicyEngine {
        let fs = MemFs::new();
        fs.insert(SYSTEM_POLICY_PATH, rows.as_bytes().to_vec(), 0o640);
        PolicyEngine::new(Arc::new(fs), Box::new(NoUserPolicy))
    }

    #[test]
    fn test_parse_skips_comments_and_garbage() {
        let policy = Policy::parse(
            "test",
            "# a comment\n\nalice email u@test https://op.test/\nnot enough fields\n",
        );
        assert_eq!(policy.entries.len(), 1);
    }

    #[test]
    fn test_email_matching_is_case_insensitive_nfc() {
        let entry = PolicyEntry::parse("alice email U@Test https://op.test/").unwrap();
        assert!(entry.matches(&claims("ignored", Some("u@test")), "alice"));
        assert!(!entry.matches(&claims("ignored", Some("other@test")), "alice"));
    }

    #[test]
    fn test_sub_matching_is_case_sensitive() {
        let entry = PolicyEntry::parse("alice sub User1 https://op.test/").unwrap();
        assert!(entry.matches(&claims("User1", None), "alice"));
        assert!(!entry.matches(&claims("user1", None), "alice"));
    }

    #[test]
    fn test_group_matching() {
        let entry = PolicyEntry::parse("alice oidc:groups admins https://op.test/").unwrap();
        assert!(entry.matches(&claims("u", None), "alice"));
        let entry = PolicyEntry::parse("alice oidc:groups other https://op.test/").unwrap();
        assert!(!entry.matches(&claims("u", None), "alice"));
    }

    #[test]
    fn test_legacy_oidc_kind_matches_email_or_sub() {
        let entry = PolicyEntry::parse("alice oidc u@test https://op.test/").unwrap();
        assert!(entry.matches(&claims("u@test", None), "alice"), "sub path");
        assert!(
            entry.matches(&claims("other", Some("U@TEST")), "alice"),
            "email path"
        );
    }

    #[test]
    fn test_wrong_issuer_never_matches() {
        let entry = PolicyEntry::parse("alice email u@test https://other.test/").unwrap();
        assert!(!entry.matches(&claims("u", Some("u@test")), "alice"));
    }

    #[tokio::test]
    async fn test_no_matching_entry_denies_every_principal() {
        let engine = engine_with_system("alice email someone-else@test https://op.test/\n");
        for principal in ["alice", "bob", "root"] {
            let err = engine
                .authorize(&config(), &claims("u", Some("u@test")), principal)
                .await
                .unwrap_err();
            assert_eq!(err.code(), "policy-denied", "principal {principal}");
        }
    }

    #[tokio::test]
    async fn test_single_entry_authorizes_only_its_principal() {
        let engine = engine_with_system("alice email u@test https://op.test/\n");
        let claims = claims("u", Some("u@test"));
        engine
            .authorize(&config(), &claims, "alice")
            .await
            .expect("alice is authorized");
        let err = engine
            .authorize(&config(), &claims, "bob")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "policy-denied");
    }

    #[tokio::test]
    async fn test_unknown_issuer_rejected_before_policy() {
        let engine = engine_with_system("alice email u@test https://op.test/\n");
        let mut claims = claims("u", Some("u@test"));
        claims.iss = "https://rogue.test/".to_string();
        let err = engine
            .authorize(&config(), &claims, "alice")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unknown-issuer");
    }

    #[tokio::test]
    async fn test_user_policy_consulted_after_system_miss() {
        struct UserRows;
        #[async_trait]
        impl UserPolicyLoader for UserRows {
            async fn load(&self, _principal: &str) -> Result<String, AuthError> {
                Ok("bob email u@test https://op.test/\n".to_string())
            }
        }
        let fs = MemFs::new();
        let engine = PolicyEngine::new(Arc::new(fs), Box::new(UserRows));
        engine
            .authorize(&config(), &claims("u", Some("u@test")), "bob")
            .await
            .expect("user policy must authorize bob");
    }

    #[tokio::test]
    async fn test_user_policy_read_error_is_nonfatal_when_system_matches() {
        let engine = engine_with_system("alice email u@test https://op.test/\n");
        engine
            .authorize(&config(), &claims("u", Some("u@test")), "alice")
            .await
            .expect("system match must not depend on the user loader");
    }

    #[tokio::test]
    async fn test_add_entry_infers_kind() {
        let fs = Arc::new(MemFs::new());
        let engine = PolicyEngine::new(fs.clone(), Box::new(NoUserPolicy));
        let path = Path::new("/etc/opk/auth_id");
        engine
            .add_entry(path, "alice", "u@test", "https://op.test/")
            .unwrap();
        engine
            .add_entry(path, "bob", "subject-123", "https://op.test/")
            .unwrap();
        let text = String::from_utf8(fs.read(path).unwrap()).unwrap();
        assert_eq!(
            text,
            "alice email u@test https://op.test/\nbob sub subject-123 https://op.test/\n"
        );
    }
}
