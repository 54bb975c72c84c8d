// File: testing-framework/src/keystore.rs
//
// Encrypted Account Store
//
// Loads the signing keys of the fixed set of test accounts from a keystore
// directory. Each account lives in its own JSON file; the ed25519 secret is
// encrypted with XChaCha20-Poly1305 under a key derived from the passphrase
// with Argon2id. Decrypted keys only ever live in memory.

use crate::types::Address;
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use ed25519_dalek::{Signer, SigningKey};
use indexmap::IndexMap;
use log::{info, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroizing;

/// Keystore file format version
pub const KEYSTORE_VERSION: u32 = 1;

/// Number of interactive passphrase attempts before giving up
pub const PROMPT_ATTEMPTS: usize = 3;

const SALT_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;
const KEY_SIZE: usize = 32;

/// Errors raised while loading or creating keystore accounts
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// Filesystem access failed
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// A keystore file is not valid JSON or has the wrong shape
    #[error("Malformed keystore file {path}: {reason}")]
    Malformed {
        /// Offending file
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// The directory holds no account files
    #[error("No accounts found in the directory {0}")]
    Empty(PathBuf),

    /// Passphrase did not decrypt an account
    #[error("Wrong passphrase for account {0}")]
    WrongPassphrase(Address),

    /// The interactive prompt was aborted with Ctrl-C or Esc
    #[error("Passphrase prompt cancelled")]
    PromptCancelled,

    /// Every interactive attempt failed
    #[error("Exhausted passphrase unlock attempts for {0}")]
    AttemptsExhausted(PathBuf),

    /// Decrypted key does not derive the address recorded in its file
    #[error("Key in {path} derives {derived}, file claims {claimed}")]
    AddressMismatch {
        /// Offending file
        path: PathBuf,
        /// Address recorded in the file
        claimed: Address,
        /// Address derived from the decrypted key
        derived: Address,
    },

    /// Key derivation rejected its parameters
    #[error("Key derivation failed: {0}")]
    Kdf(String),

    /// Requested account is not in the store
    #[error("Account {0} is not in the keystore")]
    UnknownAccount(Address),
}

/// A loaded test account
///
/// Immutable after loading. The signing key is zeroized on drop and never
/// printed by `Debug`.
pub struct Account {
    name: Option<String>,
    address: Address,
    signing_key: SigningKey,
}

impl Account {
    /// Build an account from a raw 32-byte ed25519 secret
    pub fn from_secret(secret: [u8; KEY_SIZE], name: Option<String>) -> Self {
        let signing_key = SigningKey::from_bytes(&secret);
        let address = Address::from_public_key(signing_key.verifying_key().as_bytes());
        Self {
            name,
            address,
            signing_key,
        }
    }

    /// Generate a fresh random account
    pub fn generate(name: Option<String>) -> Self {
        let mut secret = Zeroizing::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(secret.as_mut());
        Self::from_secret(*secret, name)
    }

    /// Account address
    pub fn address(&self) -> Address {
        self.address
    }

    /// Optional human-readable name
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// ed25519 verifying key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a message with the account key
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("signing_key", &"<redacted>")
            .finish()
    }
}

/// Argon2id cost parameters stored alongside each encrypted key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub m_cost: u32,
    /// Iterations
    pub t_cost: u32,
    /// Parallelism
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: 19 * 1024,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

impl KdfParams {
    /// Cheapest parameters Argon2 accepts; for throwaway test keystores
    pub fn light() -> Self {
        Self {
            m_cost: 8,
            t_cost: 1,
            p_cost: 1,
        }
    }

    fn derive_key(
        &self,
        passphrase: &str,
        salt: &[u8],
    ) -> Result<Zeroizing<[u8; KEY_SIZE]>, KeyStoreError> {
        let params = Params::new(self.m_cost, self.t_cost, self.p_cost, Some(KEY_SIZE))
            .map_err(|e| KeyStoreError::Kdf(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut out = Zeroizing::new([0u8; KEY_SIZE]);
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, out.as_mut())
            .map_err(|e| KeyStoreError::Kdf(e.to_string()))?;
        Ok(out)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CryptoSection {
    kdf: String,
    kdf_params: KdfParams,
    #[serde(with = "hex")]
    salt: Vec<u8>,
    cipher: String,
    #[serde(with = "hex")]
    nonce: Vec<u8>,
    #[serde(with = "hex")]
    ciphertext: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    crypto: CryptoSection,
}

/// Where the keystore passphrase comes from
#[derive(Debug, Clone)]
pub enum Passphrase {
    /// Passphrase given up front
    Preset(String),
    /// First line of a password file
    File(PathBuf),
    /// Ask on the terminal
    Prompt,
}

impl Passphrase {
    /// Passphrase text, reading the file or prompting once as needed
    pub fn resolve(&self) -> Result<String, KeyStoreError> {
        match self {
            Passphrase::Preset(passphrase) => Ok(passphrase.clone()),
            Passphrase::File(path) => Self::read_file(path),
            Passphrase::Prompt => Self::prompt(),
        }
    }

    fn read_file(path: &Path) -> Result<String, KeyStoreError> {
        let content = std::fs::read_to_string(path).map_err(|source| KeyStoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(content.lines().next().unwrap_or_default().trim().to_string())
    }

    /// Read the passphrase from the terminal, echoing `*` per character
    ///
    /// Needs an interactive terminal; piped runs use a password file.
    fn prompt() -> Result<String, KeyStoreError> {
        let io_err = |source| KeyStoreError::Io {
            path: PathBuf::from("<terminal>"),
            source,
        };
        let mut stdout = std::io::stdout();
        write!(stdout, "Enter the password to unlock: ")
            .and_then(|_| stdout.flush())
            .map_err(io_err)?;

        let mut line = Zeroizing::new(String::new());
        let submitted = {
            let _raw = RawMode::enable().map_err(io_err)?;
            loop {
                let Event::Key(key) = event::read().map_err(io_err)? else {
                    continue;
                };
                let echoed = match apply_key(&mut line, key) {
                    MaskedKey::Echo => write!(stdout, "*"),
                    MaskedKey::Erase => write!(stdout, "\x08 \x08"),
                    MaskedKey::Submit => break true,
                    MaskedKey::Cancel => break false,
                    MaskedKey::Ignore => Ok(()),
                };
                echoed.and_then(|_| stdout.flush()).map_err(io_err)?;
            }
        };
        writeln!(stdout).map_err(io_err)?;

        if !submitted {
            return Err(KeyStoreError::PromptCancelled);
        }
        Ok(line.as_str().to_owned())
    }
}

/// Terminal raw mode, left again on drop
struct RawMode;

impl RawMode {
    fn enable() -> std::io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Effect of one key press on a masked input line
#[derive(Debug, PartialEq, Eq)]
enum MaskedKey {
    Echo,
    Erase,
    Submit,
    Cancel,
    Ignore,
}

fn apply_key(line: &mut String, key: KeyEvent) -> MaskedKey {
    if key.kind == KeyEventKind::Release {
        return MaskedKey::Ignore;
    }
    match key.code {
        KeyCode::Enter => MaskedKey::Submit,
        KeyCode::Esc => MaskedKey::Cancel,
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => MaskedKey::Cancel,
        KeyCode::Backspace => {
            if line.pop().is_some() {
                MaskedKey::Erase
            } else {
                MaskedKey::Ignore
            }
        }
        KeyCode::Char(c) => {
            line.push(c);
            MaskedKey::Echo
        }
        _ => MaskedKey::Ignore,
    }
}

/// The set of test accounts, keyed and ordered by address
#[derive(Debug, Default)]
pub struct KeyStore {
    accounts: IndexMap<Address, Arc<Account>>,
}

impl KeyStore {
    /// Build a store from already-decrypted accounts
    pub fn from_accounts(accounts: impl IntoIterator<Item = Account>) -> Self {
        let mut map: IndexMap<Address, Arc<Account>> = accounts
            .into_iter()
            .map(|account| (account.address(), Arc::new(account)))
            .collect();
        map.sort_keys();
        Self { accounts: map }
    }

    /// Decrypt every account in `dir` with `passphrase`
    pub fn open(dir: impl AsRef<Path>, passphrase: &str) -> Result<Self, KeyStoreError> {
        let dir = dir.as_ref();
        let files = Self::list_key_files(dir)?;
        if files.is_empty() {
            return Err(KeyStoreError::Empty(dir.to_path_buf()));
        }

        let mut accounts = Vec::with_capacity(files.len());
        for path in files {
            accounts.push(Self::decrypt_file(&path, passphrase)?);
        }

        let store = Self::from_accounts(accounts);
        info!(
            "Loaded {} accounts from keystore {}",
            store.len(),
            dir.display()
        );
        Ok(store)
    }

    /// Unlock the keystore using the given passphrase source
    ///
    /// Interactive prompts are retried up to [`PROMPT_ATTEMPTS`] times on a wrong
    /// passphrase; preset and file passphrases get a single attempt.
    pub fn unlock(dir: impl AsRef<Path>, source: &Passphrase) -> Result<Self, KeyStoreError> {
        let dir = dir.as_ref();
        match source {
            Passphrase::Preset(passphrase) => Self::open(dir, passphrase),
            Passphrase::File(path) => Self::open(dir, &Passphrase::read_file(path)?),
            Passphrase::Prompt => {
                for attempt in 1..=PROMPT_ATTEMPTS {
                    let passphrase = Passphrase::prompt()?;
                    match Self::open(dir, &passphrase) {
                        Err(KeyStoreError::WrongPassphrase(address)) => {
                            warn!(
                                "Password incorrect for {} ({}/{}), please try again",
                                address, attempt, PROMPT_ATTEMPTS
                            );
                        }
                        other => return other,
                    }
                }
                Err(KeyStoreError::AttemptsExhausted(dir.to_path_buf()))
            }
        }
    }

    /// Create a new random account and write its encrypted file into `dir`
    pub fn create_account(
        dir: impl AsRef<Path>,
        passphrase: &str,
        name: Option<String>,
        params: KdfParams,
    ) -> Result<Address, KeyStoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|source| KeyStoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut secret = Zeroizing::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(secret.as_mut());
        let account = Account::from_secret(*secret, name.clone());

        let mut salt = vec![0u8; SALT_SIZE];
        let mut nonce = vec![0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce);

        let key = params.derive_key(passphrase, &salt)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), secret.as_ref())
            .map_err(|_| KeyStoreError::Kdf("encryption failed".to_string()))?;

        let file = KeyFile {
            version: KEYSTORE_VERSION,
            address: account.address(),
            name,
            crypto: CryptoSection {
                kdf: "argon2id".to_string(),
                kdf_params: params,
                salt,
                cipher: "xchacha20poly1305".to_string(),
                nonce,
                ciphertext,
            },
        };

        let path = dir.join(format!(
            "UTC--{}--{}.json",
            chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S%.fZ"),
            hex::encode(account.address().as_bytes())
        ));
        let json = serde_json::to_string_pretty(&file).map_err(|e| KeyStoreError::Malformed {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        std::fs::write(&path, json).map_err(|source| KeyStoreError::Io {
            path: path.clone(),
            source,
        })?;

        Ok(account.address())
    }

    fn list_key_files(dir: &Path) -> Result<Vec<PathBuf>, KeyStoreError> {
        let io_err = |source| KeyStoreError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn decrypt_file(path: &Path, passphrase: &str) -> Result<Account, KeyStoreError> {
        let malformed = |reason: String| KeyStoreError::Malformed {
            path: path.to_path_buf(),
            reason,
        };

        let content = std::fs::read_to_string(path).map_err(|source| KeyStoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: KeyFile = serde_json::from_str(&content).map_err(|e| malformed(e.to_string()))?;

        if file.version != KEYSTORE_VERSION {
            return Err(malformed(format!("unsupported version {}", file.version)));
        }
        if file.crypto.kdf != "argon2id" || file.crypto.cipher != "xchacha20poly1305" {
            return Err(malformed(format!(
                "unsupported scheme {}/{}",
                file.crypto.kdf, file.crypto.cipher
            )));
        }
        if file.crypto.nonce.len() != NONCE_SIZE {
            return Err(malformed(format!(
                "nonce must be {} bytes, got {}",
                NONCE_SIZE,
                file.crypto.nonce.len()
            )));
        }

        let key = file
            .crypto
            .kdf_params
            .derive_key(passphrase, &file.crypto.salt)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    XNonce::from_slice(&file.crypto.nonce),
                    file.crypto.ciphertext.as_ref(),
                )
                .map_err(|_| KeyStoreError::WrongPassphrase(file.address))?,
        );

        let secret: [u8; KEY_SIZE] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| malformed(format!("secret must be {} bytes", KEY_SIZE)))?;
        let account = Account::from_secret(secret, file.name);

        if account.address() != file.address {
            return Err(KeyStoreError::AddressMismatch {
                path: path.to_path_buf(),
                claimed: file.address,
                derived: account.address(),
            });
        }
        Ok(account)
    }

    /// Look up an account by address
    pub fn get(&self, address: &Address) -> Result<Arc<Account>, KeyStoreError> {
        self.accounts
            .get(address)
            .cloned()
            .ok_or(KeyStoreError::UnknownAccount(*address))
    }

    /// Whether the account is present
    pub fn contains(&self, address: &Address) -> bool {
        self.accounts.contains_key(address)
    }

    /// Account used to deploy contracts and fund node accounts
    ///
    /// The explicitly configured address if any, otherwise the first account
    /// in address order.
    pub fn deployer(&self, preferred: Option<Address>) -> Result<Arc<Account>, KeyStoreError> {
        match preferred {
            Some(address) => self.get(&address),
            None => self
                .accounts
                .values()
                .next()
                .cloned()
                .ok_or_else(|| KeyStoreError::Empty(PathBuf::from("<memory>"))),
        }
    }

    /// All accounts in address order
    pub fn accounts(&self) -> impl Iterator<Item = &Arc<Account>> {
        self.accounts.values()
    }

    /// Number of accounts
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}
