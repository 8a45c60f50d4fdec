use std::{
    fs::OpenOptions,
    io::IsTerminal,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use opkssh_client::{login, login_with_provider, LoginOptions, LoginOutcome, OpProvider};
use opkssh_common::{
    config::{Config, ProviderConfig},
    error::AuthError,
    fs::{FileSystem, RealFs},
};
use opkssh_server::{
    jwks::JwksResolver,
    policy::{PolicyEngine, SYSTEM_POLICY_PATH},
    readhome::{self, SudoReadHome},
    verify::VerifyFlow,
};
use opkssh_token::signer::KeyAlg;

/// Append-only verify log, mode 660 root:opksshuser.
const VERIFY_LOG_PATH: &str = "/var/log/opkssh.log";

#[derive(Parser)]
#[command(name = "opkssh", version, about = "SSH access from OpenID Connect identities")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Authenticate with an OpenID Provider and mint a session SSH key.
    Login {
        /// Provider alias, or a full `alias,issuer,client-id[,secret[,scopes]]` entry.
        #[arg(long)]
        provider: Option<String>,
        /// Write logs to `<dir>/opkssh.log` instead of stderr.
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// Print the authorization URL without launching a browser.
        #[arg(long)]
        disable_browser_open: bool,
        /// Print the (possibly GQ-signed) ID token after login.
        #[arg(long)]
        print_id_token: bool,
        /// Replace the OP's RSA signature with a GQ proof.
        #[arg(long)]
        gq_sign: bool,
        /// Ephemeral key algorithm: ed25519 or ecdsa.
        #[arg(long, default_value = "ed25519")]
        key_alg: String,
    },
    /// AuthorizedKeysCommand entrypoint: `opkssh verify %u %k %t`.
    Verify {
        principal: String,
        key_blob: String,
        key_type: String,
    },
    /// Print a user's `~/.ssh/auth_id`; invoked via a narrow sudoers rule.
    Readhome { user: String },
    /// Append a policy entry mapping an OIDC identity to a principal.
    Add {
        principal: String,
        identity: String,
        issuer: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    match cli.command {
        Command::Login {
            provider,
            log_dir,
            disable_browser_open,
            print_id_token,
            gq_sign,
            key_alg,
        } => {
            let _guard = init_login_logging(log_dir.as_deref());
            match run_login(
                provider,
                disable_browser_open,
                print_id_token,
                gq_sign,
                &key_alg,
            )
            .await
            {
                Ok(code) => code,
                Err(err) => {
                    error!(code = err.code(), %err, "login failed");
                    eprintln!("opkssh: login failed: {err}");
                    1
                }
            }
        }
        Command::Verify {
            principal,
            key_blob,
            key_type,
        } => {
            init_verify_logging();
            match run_verify(&principal, &key_blob, &key_type).await {
                Ok(line) => {
                    // Exactly one line on stdout; sshd matches against it.
                    println!("{line}");
                    0
                }
                Err(err) => {
                    // Empty stdout tells sshd "no match"; detail goes to the log.
                    error!(code = err.code(), %err, %principal, "verification denied");
                    1
                }
            }
        }
        Command::Readhome { user } => match readhome::read_user_policy(&RealFs, &user) {
            Ok(contents) => {
                print!("{contents}");
                0
            }
            Err(err) => {
                eprintln!("opkssh: readhome: {err}");
                1
            }
        },
        Command::Add {
            principal,
            identity,
            issuer,
        } => match run_add(&principal, &identity, &issuer) {
            Ok(path) => {
                println!("added policy entry to {}", path.display());
                0
            }
            Err(err) => {
                eprintln!("opkssh: add: {err}");
                1
            }
        },
    }
}

async fn run_login(
    provider_arg: Option<String>,
    disable_browser_open: bool,
    print_id_token: bool,
    gq_sign: bool,
    key_alg: &str,
) -> Result<i32, AuthError> {
    let fs = RealFs;
    let options = LoginOptions {
        provider_alias: None,
        gq_sign,
        key_alg: KeyAlg::parse(key_alg)?,
        open_browser: !disable_browser_open,
        print_id_token,
        ssh_dir: None,
    };

    // `--provider` accepts either an alias or a full inline entry.
    let outcome = match provider_arg {
        Some(arg) if arg.contains(',') => {
            let entry = ProviderConfig::parse(&arg, true)?;
            let provider = OpProvider::from_config(&entry, options.open_browser);
            LoginOutcome::Complete(login_with_provider(&provider, &fs, &options).await?)
        }
        alias => {
            let config = Config::load(&fs)?;
            let options = LoginOptions {
                provider_alias: alias,
                ..options
            };
            login(&config, &fs, &options).await?
        }
    };

    match outcome {
        LoginOutcome::Complete(artifacts) => {
            if let Some(token) = artifacts.id_token {
                println!("{token}");
            }
            println!("wrote {}", artifacts.key_path.display());
            println!("wrote {}", artifacts.cert_path.display());
            Ok(0)
        }
        LoginOutcome::ChooseProvider(aliases) => {
            eprintln!("multiple providers configured; pick one with --provider:");
            for alias in aliases {
                eprintln!("  {alias}");
            }
            Ok(2)
        }
    }
}

async fn run_verify(
    principal: &str,
    key_blob: &str,
    key_type: &str,
) -> Result<String, AuthError> {
    let fs: Arc<dyn FileSystem> = Arc::new(RealFs);
    let config = Config::load(fs.as_ref())?;
    let resolver = JwksResolver::new()?;
    let helper = std::env::current_exe()
        .map_err(|e| AuthError::Configuration(format!("cannot locate own binary: {e}")))?;
    let policy = PolicyEngine::new(fs, Box::new(SudoReadHome::new(helper)));
    VerifyFlow::new(config, resolver, policy)
        .verify(principal, key_blob, key_type)
        .await
}

fn run_add(principal: &str, identity: &str, issuer: &str) -> Result<PathBuf, AuthError> {
    let fs: Arc<dyn FileSystem> = Arc::new(RealFs);
    let engine = PolicyEngine::new(fs, Box::new(NoUserLoader));

    // Prefer the system policy; fall back to the caller's own file when the
    // system path is not writable.
    let system = Path::new(SYSTEM_POLICY_PATH);
    if engine.add_entry(system, principal, identity, issuer).is_ok() {
        return Ok(system.to_path_buf());
    }
    let home =
        std::env::var("HOME").map_err(|_| AuthError::Configuration("HOME not set".into()))?;
    let user_path = PathBuf::from(home).join(".ssh").join("auth_id");
    engine.add_entry(&user_path, principal, identity, issuer)?;
    Ok(user_path)
}

/// `add` never evaluates per-user policy; satisfy the engine's seam.
struct NoUserLoader;

#[async_trait::async_trait]
impl opkssh_server::policy::UserPolicyLoader for NoUserLoader {
    async fn load(&self, _principal: &str) -> Result<String, AuthError> {
        Err(AuthError::Io("user policy not consulted here".into()))
    }
}

fn init_login_logging(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "opkssh=info".into());
    if let Some(dir) = log_dir {
        let appender = tracing_appender::rolling::never(dir, "opkssh.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .init();
        None
    }
}

/// Verify logs append to the shared log file when it is writable, otherwise
/// to stderr. Stdout stays reserved for the authorized-keys line.
fn init_verify_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "opkssh=info".into());
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(VERIFY_LOG_PATH);
    match file {
        Ok(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .init(),
        Err(_) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .init(),
    }
}
