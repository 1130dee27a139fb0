use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Arg, ArgMatches, Command};
use log::debug;
use zeroize::Zeroizing;

use house_keys::auth::password::read_password;
use house_keys::security::{SigningKey, SigningKeyStore};
use house_keys::utils::time::format_timestamp;
use house_keys::utils::{initialize_logging, SystemClock};
use house_keys::{AuthConfig, AuthError, AuthService, FileAccountStore, NewAccount, CONFIG_FILE};

fn build_cli() -> Command {
    Command::new("house-keys")
        .about("Password login and session tokens for a local account file")
        .arg(
            Arg::new("config")
                .long("config")
                .help("Path to the JSON configuration file")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("register")
                .about("Create a new account")
                .arg(Arg::new("email").help("Email address used to log in").required(true))
                .arg(Arg::new("first_name").help("First name").required(true))
                .arg(Arg::new("last_name").help("Last name").required(true))
                .arg(
                    Arg::new("language")
                        .long("language")
                        .help("Preferred language")
                        .default_value("en"),
                ),
        )
        .subcommand(
            Command::new("login")
                .about("Check a password and print a session token")
                .arg(Arg::new("email").help("Email address of the account").required(true)),
        )
        .subcommand(
            Command::new("refresh")
                .about("Exchange an expired token for a new one")
                .arg(Arg::new("token").help("The expired token").required(true)),
        )
        .subcommand(
            Command::new("whoami")
                .about("Show the account behind a token")
                .arg(Arg::new("token").help("A currently valid token").required(true)),
        )
        .subcommand(
            Command::new("passwd")
                .about("Change the password of the account behind a token")
                .arg(Arg::new("token").help("A currently valid token").required(true)),
        )
        .subcommand(
            Command::new("disable")
                .about("Disable an account so its tokens stop working")
                .arg(Arg::new("id").help("Account identifier").required(true)),
        )
        .subcommand(
            Command::new("rotate-key")
                .about("Replace the signing key in the OS keyring, invalidating every token"),
        )
}

fn arg<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a String> {
    matches
        .get_one::<String>(name)
        .ok_or_else(|| anyhow!("missing argument: {}", name))
}

fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    println!("{}", prompt);
    read_password().context("failed to read password")
}

fn prompt_new_password() -> Result<Zeroizing<String>> {
    let password = prompt_password("Enter the new password:")?;
    let confirm = prompt_password("Confirm the new password:")?;
    if *password != *confirm {
        bail!("passwords do not match");
    }
    Ok(password)
}

fn load_signing_key(config: &AuthConfig) -> Result<SigningKey> {
    if let Some(secret) = config.signing_secret_bytes() {
        debug!("Using signing secret from configuration");
        return Ok(SigningKey::new(secret.to_vec())?);
    }
    let store = SigningKeyStore::new()?;
    Ok(store.get_or_initialize()?)
}

fn build_service(config: &AuthConfig) -> Result<AuthService> {
    let key = load_signing_key(config)?;
    let accounts = FileAccountStore::open(&config.users_file).with_context(|| {
        format!("failed to open account file {}", config.users_file.display())
    })?;
    Ok(AuthService::new(
        config,
        key,
        Arc::new(accounts),
        Arc::new(SystemClock),
    )?)
}

fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        match err.downcast_ref::<AuthError>() {
            Some(auth) => eprintln!("Error [{}]: {}", auth.code(), auth),
            None => eprintln!("Error: {:#}", err),
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let matches = build_cli().get_matches();

    let config_path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let config = AuthConfig::load(Some(&config_path))?;

    initialize_logging(&config.log_level, config.log_file.as_deref())
        .map_err(|e| anyhow!("failed to initialize logging: {}", e))?;

    match matches.subcommand() {
        Some(("register", sub)) => {
            let service = build_service(&config)?;
            let password = prompt_new_password()?;
            let id = service
                .register(NewAccount {
                    first_name: arg(sub, "first_name")?.clone(),
                    last_name: arg(sub, "last_name")?.clone(),
                    email: arg(sub, "email")?.clone(),
                    language: arg(sub, "language")?.clone(),
                    password,
                })
                .await?;
            println!("Account created: {}", id);
        }
        Some(("login", sub)) => {
            let service = build_service(&config)?;
            let password = prompt_password("Password:")?;
            let token = service
                .login(arg(sub, "email")?, password.as_bytes())
                .await?;
            println!("{}", token.as_str());
            println!("Expires at {}", format_timestamp(token.expires_at()));
        }
        Some(("refresh", sub)) => {
            let service = build_service(&config)?;
            let token = service.refresh(arg(sub, "token")?).await?;
            println!("{}", token.as_str());
            println!("Expires at {}", format_timestamp(token.expires_at()));
        }
        Some(("whoami", sub)) => {
            let service = build_service(&config)?;
            let header = bearer(arg(sub, "token")?);
            let subject = service.authenticate(Some(&header)).await?;
            println!("Account: {}", subject.subject_id);
            println!("Token expires at {}", format_timestamp(subject.expires_at));
        }
        Some(("passwd", sub)) => {
            let service = build_service(&config)?;
            let header = bearer(arg(sub, "token")?);
            let subject = service.authenticate(Some(&header)).await?;
            let current = prompt_password("Current password:")?;
            let new = prompt_new_password()?;
            service
                .change_password(&subject, current.as_bytes(), new.as_bytes())
                .await?;
            println!("Password changed");
        }
        Some(("disable", sub)) => {
            let service = build_service(&config)?;
            let id = arg(sub, "id")?;
            if service.disable_account(id).await? {
                println!("Account {} disabled", id);
            } else {
                bail!("no account with id {}", id);
            }
        }
        Some(("rotate-key", _)) => {
            if config.signing_secret.is_some() {
                bail!("signing secret is set in configuration; rotate it there instead");
            }
            SigningKeyStore::new()?.rotate()?;
            println!("Signing key rotated; all issued tokens are now invalid");
        }
        _ => unreachable!("subcommand is required"),
    }

    Ok(())
}
