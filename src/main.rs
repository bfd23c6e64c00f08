//! SecREST command line tool
//!
//! Manages a key directory and exercises the protocol end to end.

use chrono::Utc;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use serde_json::Map;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use secrest::config::{DEFAULT_KEY_BASE_NAME, DEFAULT_ROTATION_INTERVAL};
use secrest::crypto::cipher::{public_key_bits, DEFAULT_KEY_BITS};
use secrest::{
    ClientConfig, ClientProtocol, HandlerOutput, HashAlgorithm, KeyManager, KeyManagerConfig,
    LoopbackTransport, SecRestError, SecRestResult, ServerConfig, ServerProtocol, SessionDb,
};

const DEMO_ENDPOINT: &str = "http://localhost/secrest";

/// Confidential RPC over plain HTTP with rotating RSA keys
#[derive(Parser)]
#[command(name = "secrest")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the key files (default: platform data directory)
    #[arg(short = 'd', long, env = "SECREST_KEY_DIR", global = true)]
    key_dir: Option<PathBuf>,

    /// Base name of the key files
    #[arg(long, env = "SECREST_KEY_NAME", default_value = DEFAULT_KEY_BASE_NAME, global = true)]
    base_name: String,

    /// Seconds a key pair lives before it is rotated
    #[arg(short, long, env = "SECREST_ROTATION_INTERVAL", default_value_t = DEFAULT_ROTATION_INTERVAL, global = true)]
    interval: i64,

    /// RSA key size in bits
    #[arg(short, long, env = "SECREST_KEY_BITS", default_value_t = DEFAULT_KEY_BITS, global = true)]
    bits: usize,

    /// Digest used for detached signatures
    #[arg(long, env = "SECREST_HASH", default_value = "sha512", global = true)]
    hash: HashAlgorithm,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current public key, creating a key pair if needed
    Pubkey {
        /// Also print the retiring public key
        #[arg(long)]
        previous: bool,
    },

    /// Retire the current key pair now
    Rotate,

    /// Sign a message with our private key
    Sign {
        message: String,

        /// Seal the whole message instead of signing its digest
        #[arg(long)]
        sealed: bool,

        /// Sign with the retiring pair
        #[arg(long)]
        old: bool,
    },

    /// Check a signature or open a sealed message
    Verify {
        /// Base64 signature or seal
        signature: String,

        /// PEM file with the signer's public key
        #[arg(short, long)]
        public_key: PathBuf,

        /// Message covered by a detached signature
        #[arg(short, long)]
        message: Option<String>,

        #[arg(long)]
        sealed: bool,
    },

    /// Encrypt a message for the holder of a public key
    Encrypt {
        message: String,

        /// PEM file with the recipient's public key
        #[arg(short, long)]
        recipient: PathBuf,
    },

    /// Decrypt a message sent to us
    Decrypt { ciphertext: String },

    /// Run greeting, authentication and one call against an in-process server
    Demo {
        #[arg(long, default_value = "user")]
        login: String,

        #[arg(long, default_value = "secret")]
        password: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("secrest=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let key_dir = cli.key_dir.clone().unwrap_or_else(default_key_dir);
    fs::create_dir_all(&key_dir)?;

    match &cli.command {
        Commands::Pubkey { previous } => cmd_pubkey(&cli, &key_dir, *previous)?,
        Commands::Rotate => cmd_rotate(&cli, &key_dir)?,
        Commands::Sign { message, sealed, old } => cmd_sign(&cli, &key_dir, message, *sealed, *old)?,
        Commands::Verify {
            signature,
            public_key,
            message,
            sealed,
        } => cmd_verify(&cli, signature, public_key, message.as_deref(), *sealed)?,
        Commands::Encrypt { message, recipient } => cmd_encrypt(&cli, message, recipient)?,
        Commands::Decrypt { ciphertext } => cmd_decrypt(&cli, &key_dir, ciphertext)?,
        Commands::Demo { login, password } => cmd_demo(&cli, &key_dir, login, password)?,
    }

    Ok(())
}

/// Load `.env` from the working directory, then from the platform config directory
fn load_env() {
    dotenv::dotenv().ok();
    if let Some(proj_dirs) = ProjectDirs::from("com", "skinait", "secrest") {
        let env_path = proj_dirs.config_dir().join(".env");
        if env_path.exists() {
            let _ = dotenv::from_path(env_path);
        }
    }
}

fn default_key_dir() -> PathBuf {
    ProjectDirs::from("com", "skinait", "secrest")
        .map(|dirs| dirs.data_dir().join("keys"))
        .unwrap_or_else(|| PathBuf::from("keys"))
}

fn keys_config(cli: &Cli, dir: &Path) -> KeyManagerConfig {
    KeyManagerConfig::new(dir, cli.interval)
        .with_base_name(&cli.base_name)
        .with_key_bits(cli.bits)
        .with_hash_algorithm(cli.hash)
}

fn open_keys(cli: &Cli, dir: &Path) -> SecRestResult<KeyManager> {
    let keys = KeyManager::new(&keys_config(cli, dir))?;
    if !keys.is_valid() {
        return Err(SecRestError::InvalidKeyStore);
    }
    Ok(keys)
}

fn cmd_pubkey(cli: &Cli, dir: &Path, previous: bool) -> SecRestResult<()> {
    let keys = open_keys(cli, dir)?;
    print!("{}", keys.public_key().unwrap_or_default());
    if let Some(created_at) = keys.created_at() {
        eprintln!("created {}", created_at.to_rfc3339());
    }

    if previous {
        match keys.previous_public_key() {
            Some(pem) => print!("{}", pem),
            None => eprintln!("no retiring key pair"),
        }
    }
    Ok(())
}

fn cmd_rotate(cli: &Cli, dir: &Path) -> SecRestResult<()> {
    let mut keys = open_keys(cli, dir)?;
    keys.rotate()?;
    print!("{}", keys.public_key().unwrap_or_default());
    Ok(())
}

fn cmd_sign(cli: &Cli, dir: &Path, message: &str, sealed: bool, old: bool) -> SecRestResult<()> {
    let keys = open_keys(cli, dir)?;
    let signed = keys.sign(message.as_bytes(), sealed, old);
    let signature = signed.signature.ok_or_else(|| {
        SecRestError::CryptoError("signing failed (is there a retiring pair?)".to_string())
    })?;

    println!("{}", signature);
    if let Some(algorithm) = signed.hash_algorithm {
        eprintln!("digest: {}", algorithm);
    }
    Ok(())
}

fn cmd_verify(
    cli: &Cli,
    signature: &str,
    public_key: &Path,
    message: Option<&str>,
    sealed: bool,
) -> SecRestResult<()> {
    let pem = fs::read_to_string(public_key)?;
    let bits = public_key_bits(&pem)
        .ok_or_else(|| SecRestError::InvalidPublicKey(public_key.display().to_string()))?;

    let check = if sealed {
        KeyManager::verify(b"", signature, &pem, bits, None)
    } else {
        let message = message.ok_or_else(|| {
            SecRestError::ConfigError("a detached signature needs --message".to_string())
        })?;
        KeyManager::verify(message.as_bytes(), signature, &pem, bits, Some(cli.hash))
    };

    if !check.valid {
        return Err(SecRestError::CryptoError("signature does not verify".to_string()));
    }
    if sealed {
        println!("{}", String::from_utf8_lossy(&check.message));
    } else {
        println!("valid");
    }
    Ok(())
}

fn cmd_encrypt(cli: &Cli, message: &str, recipient: &Path) -> SecRestResult<()> {
    let pem = fs::read_to_string(recipient)?;
    let bits = public_key_bits(&pem).unwrap_or(cli.bits);
    let ciphertext = KeyManager::encrypt(message.as_bytes(), &pem, bits)
        .ok_or_else(|| SecRestError::InvalidPublicKey(recipient.display().to_string()))?;
    println!("{}", ciphertext);
    Ok(())
}

fn cmd_decrypt(cli: &Cli, dir: &Path, ciphertext: &str) -> SecRestResult<()> {
    let keys = open_keys(cli, dir)?;
    let decrypted = keys.decrypt(ciphertext.trim());
    let plaintext = decrypted
        .plaintext
        .ok_or_else(|| SecRestError::CryptoError("message does not decrypt with our keys".to_string()))?;

    println!("{}", String::from_utf8_lossy(&plaintext));
    if decrypted.refresh_needed {
        eprintln!("note: the sender used our retiring public key");
    }
    Ok(())
}

fn cmd_demo(cli: &Cli, dir: &Path, login: &str, password: &str) -> SecRestResult<()> {
    let server_dir = dir.join("demo-server");
    let client_dir = dir.join("demo-client");
    fs::create_dir_all(&server_dir)?;
    fs::create_dir_all(&client_dir)?;

    let password_hash = HashAlgorithm::Sha512.hex_digest(password.as_bytes());
    let server_store = Arc::new(SessionDb::new_in_memory(cli.interval)?);
    server_store.set_credential(login, &password_hash)?;

    let server_config = ServerConfig::new(keys_config(cli, &server_dir));
    server_config.validate()?;
    let transport = LoopbackTransport::new(move |query| {
        let mut server = match ServerProtocol::new(&server_config, server_store.clone(), None) {
            Ok(server) => server,
            Err(e) => {
                warn!(error = %e, "demo server failed to start");
                return None;
            }
        };
        server
            .register("ping", |_| HandlerOutput::ok().with("status", "ok"))
            .ok()?;
        server.establish_whitelist(&["ping"]).ok()?;
        match server.handle_query(query) {
            Ok(body) => Some(body),
            Err(e) => {
                warn!(error = %e, "demo server failed to answer");
                None
            }
        }
    });

    let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let client_config = ClientConfig::new(
        DEMO_ENDPOINT,
        login,
        &password_hash,
        &timestamp,
        keys_config(cli, &client_dir),
    );
    let client_store = Arc::new(SessionDb::new(client_dir.join("sessions.db"), cli.interval)?);
    let mut client = ClientProtocol::connect(&client_config, Box::new(transport), client_store)?;

    println!("state:   {:?}", client.state());
    println!("session: {}", client.session().unwrap_or("-"));
    if !client.is_authenticated() {
        return Err(SecRestError::HandshakeFailed(DEMO_ENDPOINT.to_string()));
    }

    let reply = client.solicit("ping", Map::new())?;
    println!("ping:    {}", serde_json::to_string(&reply)?);
    Ok(())
}
