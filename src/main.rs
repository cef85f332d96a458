use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use oxide_remote::config::{Keychain, KeychainError, Settings, SettingsStorage, StorageError};
use oxide_remote::ssh::{
    init_global_pool, run_command, scan_host_key, test_host, trust_scanned_key, ConnectionConfig,
    HostKeyStatus, KnownHostsStore, SshError, TargetIdentity,
};

#[derive(Parser)]
#[command(
    name = "oxide-remote",
    about = "Run commands on remote hosts over pooled, host-verified SSH",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command on a remote host; exits with the remote exit status
    Exec {
        #[command(flatten)]
        conn: ConnectionArgs,
        /// Command line to run remotely
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Connect, run a liveness probe and report how the host was reached
    TestHost {
        #[command(flatten)]
        conn: ConnectionArgs,
    },
    /// Show the host key a server presents, optionally recording it
    ScanHost {
        #[arg(long)]
        host: String,
        #[arg(short, long, default_value_t = 22)]
        port: u16,
        /// known_hosts file (default: ~/.ssh/known_hosts)
        #[arg(long)]
        known_hosts: Option<PathBuf>,
        #[arg(long)]
        timeout: Option<u64>,
        /// Record the key if the host has none on file
        #[arg(long)]
        trust: bool,
    },
    /// Manage passwords stored in the system keychain
    Password {
        #[command(subcommand)]
        action: PasswordAction,
    },
}

#[derive(Subcommand)]
enum PasswordAction {
    /// Store a password (read from --password-env or stdin)
    Set {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        password_env: Option<String>,
    },
    /// Remove a stored password
    Delete {
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Args)]
struct TargetArgs {
    #[arg(long)]
    host: String,
    #[arg(short, long, default_value_t = 22)]
    port: u16,
    #[arg(short, long)]
    user: String,
}

impl TargetArgs {
    fn identity(&self) -> TargetIdentity {
        TargetIdentity::new(self.user.clone(), self.host.clone(), self.port)
    }
}

#[derive(Args)]
struct ConnectionArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Private key file
    #[arg(short = 'i', long)]
    key: Option<PathBuf>,
    /// Environment variable holding the key passphrase
    #[arg(long)]
    passphrase_env: Option<String>,
    /// Environment variable holding the password (default: keychain lookup)
    #[arg(long)]
    password_env: Option<String>,
    /// Dial / command timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// known_hosts file (default: ~/.ssh/known_hosts)
    #[arg(long)]
    known_hosts: Option<PathBuf>,
    /// Record the key of a host with no known_hosts entry
    #[arg(long)]
    auto_trust: bool,
    /// Skip host key verification if the known_hosts file is unusable
    #[arg(long)]
    allow_insecure_host_key: bool,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Keychain(#[from] KeychainError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Input(String),
}

fn env_secret(var: &str) -> Result<String, CliError> {
    std::env::var(var).map_err(|_| CliError::Input(format!("environment variable {} is not set", var)))
}

fn build_config(settings: &Settings, args: &ConnectionArgs) -> Result<ConnectionConfig, CliError> {
    let target = &args.target;
    let mut config = settings.connection_config(&target.host, target.port, &target.user);

    if let Some(timeout) = args.timeout {
        config.timeout_secs = timeout;
    }
    if let Some(path) = &args.known_hosts {
        config.known_hosts_path = Some(path.clone());
    }
    config.auto_trust_unknown_host |= args.auto_trust;
    config.allow_insecure_host_key |= args.allow_insecure_host_key;

    if let Some(key) = &args.key {
        let passphrase = args.passphrase_env.as_deref().map(env_secret).transpose()?;
        config = config.with_key(key, passphrase);
    }

    config.password = match &args.password_env {
        Some(var) => Some(env_secret(var)?),
        None => match Keychain::new().find_password(&target.identity()) {
            Ok(password) => password,
            Err(e) => {
                warn!("Keychain lookup for {} failed: {}", target.identity(), e);
                None
            }
        },
    };

    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<u8, CliError> {
    let settings = SettingsStorage::new()?.load().await?;

    match cli.command {
        Commands::Exec { conn, command } => {
            let config = build_config(&settings, &conn)?;
            let pool = init_global_pool(settings.pool.clone());
            let output = run_command(&pool, &config, &command.join(" "), config.timeout()).await?;

            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            pool.shutdown().await;

            Ok(match output.exit_status {
                Some(code) => u8::try_from(code).unwrap_or(u8::MAX),
                None => u8::MAX,
            })
        }
        Commands::TestHost { conn } => {
            let config = build_config(&settings, &conn)?;
            let pool = init_global_pool(settings.pool.clone());
            let report = test_host(&pool, &config).await?;

            #[derive(Serialize)]
            struct Output<T> {
                #[serde(flatten)]
                report: T,
                pool: oxide_remote::ssh::PoolStats,
            }
            print_json(&Output {
                report,
                pool: pool.stats(),
            })?;
            pool.shutdown().await;
            Ok(0)
        }
        Commands::ScanHost {
            host,
            port,
            known_hosts,
            timeout,
            trust,
        } => {
            let known_hosts = known_hosts
                .or_else(|| settings.connection.known_hosts_path.clone())
                .unwrap_or_else(KnownHostsStore::default_path);
            let timeout = Duration::from_secs(timeout.unwrap_or(settings.connection.timeout_secs));

            let report = scan_host_key(&host, port, timeout, &known_hosts).await?;
            print_json(&report)?;

            match (&report.status, trust) {
                (HostKeyStatus::Unknown, true) => {
                    trust_scanned_key(&report, &known_hosts)?;
                    info!("Recorded {} in {}", report.fingerprint, known_hosts.display());
                    Ok(0)
                }
                (HostKeyStatus::Verified, _) | (HostKeyStatus::Unknown, false) => Ok(0),
                // Never resolved from here, whatever --trust says
                (HostKeyStatus::Changed { .. } | HostKeyStatus::Revoked, _) => Ok(1),
            }
        }
        Commands::Password { action } => {
            let keychain = Keychain::new();
            match action {
                PasswordAction::Set {
                    target,
                    password_env,
                } => {
                    let password = match password_env {
                        Some(var) => env_secret(&var)?,
                        None => {
                            let mut line = String::new();
                            std::io::stdin()
                                .lock()
                                .read_line(&mut line)
                                .map_err(|e| CliError::Input(e.to_string()))?;
                            line.trim_end_matches(['\r', '\n']).to_string()
                        }
                    };
                    if password.is_empty() {
                        return Err(CliError::Input("empty password".to_string()));
                    }
                    keychain.store_password(&target.identity(), &password)?;
                }
                PasswordAction::Delete { target } => {
                    keychain.delete_password(&target.identity())?;
                }
            }
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    oxide_remote::init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {}", e);
            if let CliError::Ssh(ssh) = &e {
                if let Some(hint) = ssh.remediation() {
                    eprintln!("hint: {}", hint);
                }
            }
            ExitCode::FAILURE
        }
    }
}
