use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as Base64;
use parking_lot::Mutex;
use pbkdf2::pbkdf2_hmac;
use rand_core::OsRng;
use rand_core::TryRngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CipherError;
use crate::model::EncryptedBlob;
use crate::storage::{Database, restrict_permissions};

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;
const PBKDF2_ROUNDS: u32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyspace {
    DatabaseFields,
    Credentials,
}

impl Keyspace {
    pub fn name(self) -> &'static str {
        match self {
            Keyspace::DatabaseFields => "database_fields",
            Keyspace::Credentials => "credentials",
        }
    }
}

#[derive(Clone)]
pub struct EncryptionKey(Zeroizing<[u8; KEY_LEN]>);

impl EncryptionKey {
    pub fn generate() -> Result<Self, CipherError> {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        OsRng
            .try_fill_bytes(bytes.as_mut())
            .map_err(|_| CipherError::Random)?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        if bytes.len() != KEY_LEN {
            return Err(CipherError::KeyStore(format!(
                "expected {KEY_LEN} key bytes, found {}",
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let bytes = Zeroizing::new(
            Base64
                .decode(encoded.trim())
                .map_err(|_| CipherError::KeyStore("key is not valid base64".to_string()))?,
        );
        Self::from_bytes(&bytes)
    }

    fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(Base64.encode(self.0.as_ref()))
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for EncryptionKey {}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<EncryptedBlob, CipherError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|_| CipherError::Random)?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CipherError::Encrypt)?;
    Ok(EncryptedBlob {
        nonce: Base64.encode(nonce_bytes),
        ciphertext: Base64.encode(ciphertext),
    })
}

pub fn decrypt(key: &EncryptionKey, blob: &EncryptedBlob) -> Result<Vec<u8>, CipherError> {
    let nonce_bytes = Base64
        .decode(&blob.nonce)
        .map_err(|_| CipherError::Decryption)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(CipherError::Decryption);
    }
    let ciphertext = Base64
        .decode(&blob.ciphertext)
        .map_err(|_| CipherError::Decryption)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|_| CipherError::Decryption)
}

pub fn encrypt_string(plaintext: &str, key: &EncryptionKey) -> Result<EncryptedBlob, CipherError> {
    encrypt(key, plaintext.as_bytes())
}

pub fn decrypt_string(blob: &EncryptedBlob, key: &EncryptionKey) -> Result<String, CipherError> {
    let plaintext = decrypt(key, blob)?;
    String::from_utf8(plaintext).map_err(|_| CipherError::Decryption)
}

pub fn blob_to_column(blob: &EncryptedBlob) -> Result<String, CipherError> {
    serde_json::to_string(blob).map_err(|_| CipherError::Encrypt)
}

pub fn blob_from_column(column: &str) -> Result<EncryptedBlob, CipherError> {
    serde_json::from_str(column).map_err(|_| CipherError::Decryption)
}

pub trait KeyStore: Send + Sync {
    fn load(&self, keyspace: Keyspace) -> Result<Option<EncryptionKey>, CipherError>;
    fn save(&self, keyspace: Keyspace, key: &EncryptionKey) -> Result<(), CipherError>;
    fn describe(&self) -> &'static str;
}

pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key_path(&self, keyspace: Keyspace) -> PathBuf {
        self.dir.join(format!("{}.key", keyspace.name()))
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self, keyspace: Keyspace) -> Result<Option<EncryptionKey>, CipherError> {
        let path = self.key_path(keyspace);
        let content = match fs::read_to_string(&path) {
            Ok(content) => Zeroizing::new(content),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(key_io_error("read key file", err)),
        };
        EncryptionKey::from_base64(&content).map(Some)
    }

    fn save(&self, keyspace: Keyspace, key: &EncryptionKey) -> Result<(), CipherError> {
        let path = self.key_path(keyspace);
        write_new_secret(&path, key.to_base64().as_bytes())
    }

    fn describe(&self) -> &'static str {
        "key file"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WrappedKey {
    salt_b64: String,
    rounds: u32,
    blob: EncryptedBlob,
}

pub struct PassphraseKeyStore {
    dir: PathBuf,
    passphrase: Zeroizing<String>,
}

impl PassphraseKeyStore {
    pub fn new(dir: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            passphrase: Zeroizing::new(passphrase.into()),
        }
    }

    fn key_path(&self, keyspace: Keyspace) -> PathBuf {
        self.dir.join(format!("{}.key.json", keyspace.name()))
    }
}

pub(crate) fn derive_key(password: &str, salt: &[u8], rounds: u32) -> EncryptionKey {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, key.as_mut());
    EncryptionKey(key)
}

impl KeyStore for PassphraseKeyStore {
    fn load(&self, keyspace: Keyspace) -> Result<Option<EncryptionKey>, CipherError> {
        let path = self.key_path(keyspace);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(key_io_error("read wrapped key", err)),
        };
        let wrapped: WrappedKey = serde_json::from_str(&content)
            .map_err(|_| CipherError::KeyStore("wrapped key file is corrupt".to_string()))?;
        let salt = Base64
            .decode(&wrapped.salt_b64)
            .map_err(|_| CipherError::KeyStore("wrapped key salt is corrupt".to_string()))?;
        let kek = derive_key(&self.passphrase, &salt, wrapped.rounds);
        let raw = Zeroizing::new(decrypt(&kek, &wrapped.blob)?);
        EncryptionKey::from_bytes(&raw).map(Some)
    }

    fn save(&self, keyspace: Keyspace, key: &EncryptionKey) -> Result<(), CipherError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng
            .try_fill_bytes(&mut salt)
            .map_err(|_| CipherError::Random)?;
        let kek = derive_key(&self.passphrase, &salt, PBKDF2_ROUNDS);
        let wrapped = WrappedKey {
            salt_b64: Base64.encode(salt),
            rounds: PBKDF2_ROUNDS,
            blob: encrypt(&kek, key.as_bytes())?,
        };
        let content = serde_json::to_string_pretty(&wrapped)
            .map_err(|err| CipherError::KeyStore(format!("serialize wrapped key: {err}")))?;
        write_new_secret(&self.key_path(keyspace), content.as_bytes())
    }

    fn describe(&self) -> &'static str {
        "passphrase-protected key file"
    }
}

pub struct DatabaseKeyStore {
    db: Arc<Database>,
}

impl DatabaseKeyStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn config_key(keyspace: Keyspace) -> String {
        format!("encryption_key.{}", keyspace.name())
    }
}

impl KeyStore for DatabaseKeyStore {
    fn load(&self, keyspace: Keyspace) -> Result<Option<EncryptionKey>, CipherError> {
        let value = self
            .db
            .config_value(&Self::config_key(keyspace))
            .map_err(|err| CipherError::KeyStore(err.to_string()))?;
        match value {
            Some(encoded) => EncryptionKey::from_base64(&encoded).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, keyspace: Keyspace, key: &EncryptionKey) -> Result<(), CipherError> {
        self.db
            .set_config_value(&Self::config_key(keyspace), &key.to_base64())
            .map_err(|err| CipherError::KeyStore(err.to_string()))
    }

    fn describe(&self) -> &'static str {
        "database table"
    }
}

fn key_io_error(action: &str, err: io::Error) -> CipherError {
    CipherError::KeyStore(format!("{action}: {}", err.kind()))
}

fn write_new_secret(path: &Path, content: &[u8]) -> Result<(), CipherError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| key_io_error("create key dir", err))?;
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|err| key_io_error("create key file", err))?;
    restrict_permissions(path).map_err(|err| key_io_error("restrict key file", err))?;
    file.write_all(content)
        .and_then(|_| file.sync_all())
        .map_err(|err| key_io_error("write key file", err))
}

pub struct CipherProvider {
    store: Box<dyn KeyStore>,
    keys: Mutex<HashMap<Keyspace, EncryptionKey>>,
}

impl CipherProvider {
    pub fn new(store: Box<dyn KeyStore>) -> Self {
        Self {
            store,
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create_key(&self, keyspace: Keyspace) -> Result<EncryptionKey, CipherError> {
        let mut keys = self.keys.lock();
        if let Some(key) = keys.get(&keyspace) {
            return Ok(key.clone());
        }
        let key = match self.store.load(keyspace)? {
            Some(key) => key,
            None => {
                let key = EncryptionKey::generate()?;
                self.store.save(keyspace, &key)?;
                match self.store.load(keyspace)? {
                    Some(persisted) if persisted == key => {
                        tracing::info!(
                            keyspace = keyspace.name(),
                            store = self.store.describe(),
                            "generated new encryption key"
                        );
                        key
                    }
                    _ => return Err(CipherError::KeyNotPersisted),
                }
            }
        };
        keys.insert(keyspace, key.clone());
        Ok(key)
    }

    pub fn existing_key(&self, keyspace: Keyspace) -> Result<Option<EncryptionKey>, CipherError> {
        let mut keys = self.keys.lock();
        if let Some(key) = keys.get(&keyspace) {
            return Ok(Some(key.clone()));
        }
        let loaded = self.store.load(keyspace)?;
        if let Some(key) = &loaded {
            keys.insert(keyspace, key.clone());
        }
        Ok(loaded)
    }

    pub fn encrypt_string(&self, keyspace: Keyspace, plaintext: &str) -> Result<EncryptedBlob, CipherError> {
        let key = self.get_or_create_key(keyspace)?;
        encrypt_string(plaintext, &key)
    }

    /// Never mints a replacement key while `sealed_data_exists`.
    pub fn encrypt_string_checked(
        &self,
        keyspace: Keyspace,
        plaintext: &str,
        sealed_data_exists: bool,
    ) -> Result<EncryptedBlob, CipherError> {
        if sealed_data_exists && self.existing_key(keyspace)?.is_none() {
            tracing::error!(
                keyspace = keyspace.name(),
                store = self.store.describe(),
                "encryption key missing while encrypted data exists"
            );
            return Err(CipherError::MissingKey);
        }
        self.encrypt_string(keyspace, plaintext)
    }

    pub fn decrypt_string(&self, keyspace: Keyspace, blob: &EncryptedBlob) -> Result<String, CipherError> {
        let key = self.existing_key(keyspace)?.ok_or(CipherError::MissingKey)?;
        decrypt_string(blob, &key)
    }
}
