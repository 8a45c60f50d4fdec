//! Login orchestration.
//!
//! Generate the ephemeral key, commit to it in a CIC header, run the OP
//! flow with that commitment, optionally GQ-sign the returned ID token,
//! assemble the PK Token, wrap it in a self-signed OpenSSH certificate, and
//! persist key + certificate where `ssh` expects them.

use std::path::PathBuf;

use chrono::Utc;
use tracing::{debug, info};

use opkssh_common::{
    config::{Config, ProviderSelection},
    error::AuthError,
    fs::FileSystem,
    jws::ALG_GQ256,
};
use opkssh_token::{
    cic::Cic,
    gq::{GqSignerVerifier, SECURITY_BITS_256},
    pktoken::PkToken,
    signer::{ClientSigner, KeyAlg},
    sshcert,
};

use crate::provider::OpProvider;

#[derive(Debug, Clone)]
pub struct LoginOptions {
    pub provider_alias: Option<String>,
    /// Apply the GQ transform to the ID token before embedding it.
    pub gq_sign: bool,
    pub key_alg: KeyAlg,
    pub open_browser: bool,
    pub print_id_token: bool,
    /// Defaults to `$HOME/.ssh`.
    pub ssh_dir: Option<PathBuf>,
}

impl Default for LoginOptions {
    fn default() -> Self {
        Self {
            provider_alias: None,
            gq_sign: false,
            key_alg: KeyAlg::Ed25519,
            open_browser: true,
            print_id_token: false,
            ssh_dir: None,
        }
    }
}

/// What a completed login left on disk.
#[derive(Debug)]
pub struct LoginArtifacts {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    /// Present when `print_id_token` was requested.
    pub id_token: Option<String>,
}

/// Login either completes or needs the caller (the CLI) to ask the user to
/// pick a provider; the core implements no UI.
pub enum LoginOutcome {
    Complete(LoginArtifacts),
    ChooseProvider(Vec<String>),
}

/// Select a provider from configuration and run the login.
pub async fn login(
    config: &Config,
    fs: &dyn FileSystem,
    options: &LoginOptions,
) -> Result<LoginOutcome, AuthError> {
    let provider = match config.select(options.provider_alias.as_deref())? {
        ProviderSelection::Chosen(provider) => provider,
        ProviderSelection::Choices(aliases) => {
            return Ok(LoginOutcome::ChooseProvider(
                aliases.into_iter().map(str::to_string).collect(),
            ))
        }
    };
    let provider = OpProvider::from_config(provider, options.open_browser);
    login_with_provider(&provider, fs, options)
        .await
        .map(LoginOutcome::Complete)
}

/// Run the login against an already-chosen provider.
pub async fn login_with_provider(
    provider: &OpProvider,
    fs: &dyn FileSystem,
    options: &LoginOptions,
) -> Result<LoginArtifacts, AuthError> {
    let signer = ClientSigner::generate(options.key_alg)?;
    let cic = Cic::new(signer.public_jwk(), signer.jws_alg())?;
    debug!(issuer = provider.issuer(), "starting authorization");

    let mut id_token = provider.authorize(&cic).await?;

    if options.gq_sign || provider.requires_gq() {
        let header = opkssh_common::jws::ProtectedHeader::decode(
            &opkssh_common::jws::CompactJws::parse(&id_token)?.protected,
        )?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::Malformed("ID token header missing kid".into()))?;
        let op_key = provider.op_key(&kid).await?;
        id_token = GqSignerVerifier::new(&op_key, SECURITY_BITS_256)?.sign_jwt(&id_token)?;
        debug!(alg = ALG_GQ256, "ID token GQ-signed");
    }

    let pk_token = PkToken::build(&id_token, &signer, &cic)?;
    let claims = pk_token.claims()?;
    let certificate = sshcert::issue(
        &pk_token,
        &claims,
        &signer,
        &[],
        Utc::now().timestamp(),
    )?;

    let ssh_dir = match &options.ssh_dir {
        Some(dir) => dir.clone(),
        None => {
            let home = std::env::var("HOME")
                .map_err(|_| AuthError::Configuration("HOME not set".into()))?;
            PathBuf::from(home).join(".ssh")
        }
    };
    let stem = options.key_alg.file_stem();
    let key_path = ssh_dir.join(stem);
    let cert_path = ssh_dir.join(format!("{stem}-cert.pub"));

    let private_pem = signer
        .ssh_private()
        .to_openssh(ssh_key::LineEnding::LF)
        .map_err(|e| AuthError::Malformed(format!("private key encoding: {e}")))?;
    fs.write_private(&key_path, private_pem.as_bytes())?;

    let public_line = signer
        .ssh_public()
        .to_openssh()
        .map_err(|e| AuthError::Malformed(format!("public key encoding: {e}")))?;
    fs.write(&ssh_dir.join(format!("{stem}.pub")), format!("{public_line}\n").as_bytes())?;

    let cert_line = certificate
        .to_openssh()
        .map_err(|e| AuthError::Malformed(format!("certificate encoding: {e}")))?;
    fs.write(&cert_path, format!("{cert_line}\n").as_bytes())?;

    info!(
        sub = %claims.sub,
        iss = %claims.iss,
        key = %key_path.display(),
        "login complete"
    );
    Ok(LoginArtifacts {
        key_path,
        cert_path,
        id_token: options.print_id_token.then_some(id_token),
    })
}
