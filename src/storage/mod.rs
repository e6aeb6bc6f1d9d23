//! 暗号化・バージョン管理されたウォレット文書の永続化

pub mod crypto;

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rand::RngCore;
use secp256k1::{PublicKey, SECP256K1};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};

use crate::error::{AppError, Result};

pub const OLD_SEED_VERSION: u32 = 4; // 旧形式 (マスター公開鍵のみ)
pub const NEW_SEED_VERSION: u32 = 11;
pub const FINAL_SEED_VERSION: u32 = 19;

/// このエンジンでアップグレードしたウォレットの印
pub const WALLET_AUTHOR: &str = "ESV";

struct State {
    data: Map<String, Value>,
    modified: bool,
    pubkey: Option<PublicKey>,
    raw: Option<String>,
    /// 暗号化ファイルは decrypt するまで文書が空
    loaded: bool,
    file_exists: bool,
}

/// JSON のキー/値文書。書き込みは開いたスレッドからのみ行う。
pub struct WalletStorage {
    path: PathBuf,
    owner: ThreadId,
    state: Mutex<State>,
}

fn parse_document(path: &Path, text: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(text).map_err(|e| {
        log::error!("ウォレットファイルのパースに失敗しました: {:?}", path);
        AppError::JsonParse { file_path: path.to_path_buf(), source: e }
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(AppError::InputValidation(format!(
            "ウォレットファイルがJSONオブジェクトではありません: {:?}",
            path
        ))),
    }
}

/// キーをソートし4スペースでインデントした JSON。非 ASCII 文字はエスケープしない。
pub fn canonical_json(data: &Map<String, Value>) -> Result<String> {
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    data.serialize(&mut serializer)?;
    String::from_utf8(out).map_err(|e| AppError::InputValidation(format!("UTF-8 変換に失敗: {}", e)))
}

impl WalletStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        log::debug!("wallet path {:?}", path);
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !dir.exists() {
            return Err(AppError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("ディレクトリ {:?} が存在しません", dir),
            )));
        }

        let storage = WalletStorage {
            owner: thread::current().id(),
            state: Mutex::new(State {
                data: Map::new(),
                modified: false,
                pubkey: None,
                raw: None,
                loaded: true,
                file_exists: path.is_file(),
            }),
            path,
        };

        if storage.file_exists() {
            let raw = fs::read_to_string(&storage.path).map_err(|e| {
                log::error!("ウォレットファイルの読み込みに失敗しました: {:?}", storage.path);
                AppError::Io(e)
            })?;
            let encrypted = crypto::is_encrypted_frame(&raw);
            let mut state = storage.lock();
            if !encrypted {
                state.data = parse_document(&storage.path, &raw)?;
            }
            state.loaded = !encrypted;
            state.raw = Some(raw);
        } else {
            // 鍵はウォレット保存と独立して使われるため、作成時点で決めておく
            let mut aes_key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut aes_key);
            storage.put("tx_store_aeskey", hex::encode(aes_key));
            // 新規ウォレットはアップグレード対象にしない
            storage.put("wallet_author", WALLET_AUTHOR);
            storage.put("seed_version", FINAL_SEED_VERSION);
        }
        Ok(storage)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 開いた時点でファイルが存在したか (以後 write で true になる)
    pub fn file_exists(&self) -> bool {
        self.lock().file_exists
    }

    pub fn is_encrypted(&self) -> bool {
        self.lock().raw.as_deref().is_some_and(crypto::is_encrypted_frame)
    }

    /// 暗号化されたまま、まだ decrypt していない
    pub fn needs_decrypt(&self) -> bool {
        !self.lock().loaded
    }

    pub fn is_modified(&self) -> bool {
        self.lock().modified
    }

    pub fn decrypt(&self, password: &str) -> Result<()> {
        let secret = crypto::ec_key_from_password(password)?;
        let mut state = self.lock();
        let raw = state
            .raw
            .as_deref()
            .ok_or_else(|| AppError::Crypto("復号するデータがありません".to_string()))?;
        let compressed = crypto::decrypt_message(&secret, raw)?;
        let mut text = String::new();
        ZlibDecoder::new(compressed.as_slice()).read_to_string(&mut text)?;
        state.data = parse_document(&self.path, &text)?;
        state.pubkey = Some(secret.public_key(SECP256K1));
        state.loaded = true;
        Ok(())
    }

    pub fn set_password(&self, password: Option<&str>, encrypt: bool) -> Result<()> {
        let password = password.filter(|p| !p.is_empty());
        self.put("use_encryption", password.is_some());
        let pubkey = match password {
            Some(password) if encrypt => Some(crypto::ec_key_from_password(password)?.public_key(SECP256K1)),
            _ => None,
        };
        self.lock().pubkey = pubkey;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().data.get(key).filter(|v| !v.is_null()).cloned()
    }

    /// JSON に変換できない値はログを出して無視する。`null` はキーの削除。
    pub fn put<T: Serialize>(&self, key: &str, value: T) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                log::error!("json error: {} を保存できません: {}", key, e);
                return;
            }
        };
        let mut state = self.lock();
        if value.is_null() {
            if state.data.remove(key).is_some() {
                state.modified = true;
            }
        } else if state.data.get(key) != Some(&value) {
            state.data.insert(key.to_string(), value);
            state.modified = true;
        }
    }

    pub fn remove(&self, key: &str) {
        self.put(key, Value::Null);
    }

    /// 文書全体の複製
    pub fn snapshot(&self) -> Map<String, Value> {
        self.lock().data.clone()
    }

    pub fn replace_data(&self, data: Map<String, Value>) {
        let mut state = self.lock();
        state.data = data;
        state.modified = true;
    }

    /// `seed_version` がなければ旧形式のマスター公開鍵の有無で推定する
    pub fn seed_version(&self) -> Result<u32> {
        let seed_version = match self.get("seed_version").and_then(|v| v.as_u64()) {
            Some(version) if version > 0 => version,
            _ => {
                let old_mpk = self
                    .get("master_public_key")
                    .and_then(|v| v.as_str().map(str::len))
                    .is_some_and(|len| len == 128);
                u64::from(if old_mpk { OLD_SEED_VERSION } else { NEW_SEED_VERSION })
            }
        };
        let seed_version = u32::try_from(seed_version).map_err(|_| AppError::WalletTooNew(u32::MAX))?;
        if seed_version > FINAL_SEED_VERSION {
            return Err(AppError::WalletTooNew(seed_version));
        }
        if seed_version >= 12 || seed_version == OLD_SEED_VERSION || seed_version == NEW_SEED_VERSION {
            return Ok(seed_version);
        }
        Err(AppError::UnsupportedSeedVersion { seed_version, path: self.path.clone() })
    }

    fn backup_path(&self) -> PathBuf {
        let mut attempt = 1;
        loop {
            let candidate = PathBuf::from(format!("{}.backup.{}", self.path.display(), attempt));
            if !candidate.exists() {
                return candidate;
            }
            attempt += 1;
        }
    }

    /// ディスク上のファイルを `path.backup.N` (未使用の最小 N) に複製する
    pub fn backup(&self) -> Result<Option<PathBuf>> {
        if !self.file_exists() {
            return Ok(None);
        }
        let backup_path = self.backup_path();
        fs::copy(&self.path, &backup_path).map_err(|e| {
            log::error!("バックアップの作成に失敗しました: {:?}", backup_path);
            AppError::Io(e)
        })?;
        log::info!("ウォレットを {:?} にバックアップしました。", backup_path);
        Ok(Some(backup_path))
    }

    pub fn write(&self) -> Result<()> {
        if thread::current().id() != self.owner {
            log::error!("所有スレッド以外からはウォレットを書き込めません: {:?}", self.path);
            return Ok(());
        }
        let mut state = self.lock();
        if !state.loaded {
            return Err(AppError::NotDecrypted);
        }
        if !state.modified {
            return Ok(());
        }

        let mut text = canonical_json(&state.data)?;
        if let Some(pubkey) = &state.pubkey {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(text.as_bytes())?;
            text = crypto::encrypt_message(pubkey, &encoder.finish()?)?;
        }

        let temp_path = PathBuf::from(format!("{}.tmp.{}", self.path.display(), std::process::id()));
        {
            let mut file = File::create(&temp_path).map_err(|e| {
                log::error!("一時ファイルの作成に失敗しました: {:?}", temp_path);
                AppError::Io(e)
            })?;
            file.write_all(text.as_bytes())?;
            file.flush()?;
            file.sync_all()?;
        }

        let permissions = if state.file_exists {
            Some(fs::metadata(&self.path)?.permissions())
        } else {
            default_permissions()
        };
        if fs::rename(&temp_path, &self.path).is_err() {
            fs::remove_file(&self.path)?;
            fs::rename(&temp_path, &self.path)?;
        }
        if let Some(permissions) = permissions {
            fs::set_permissions(&self.path, permissions)?;
        }

        state.file_exists = true;
        state.raw = Some(text);
        state.modified = false;
        log::debug!("saved {:?}", self.path);
        Ok(())
    }
}

#[cfg(unix)]
fn default_permissions() -> Option<fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn default_permissions() -> Option<fs::Permissions> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn new_wallet_is_seeded() {
        let dir = tempfile::tempdir().unwrap();
        let storage = WalletStorage::open(dir.path().join("wallet")).unwrap();
        assert!(!storage.file_exists());
        assert!(storage.is_modified());
        assert_eq!(storage.get("wallet_author"), Some(json!("ESV")));
        assert_eq!(storage.seed_version().unwrap(), FINAL_SEED_VERSION);
        let key = storage.get("tx_store_aeskey").unwrap();
        assert_eq!(hex::decode(key.as_str().unwrap()).unwrap().len(), 32);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            WalletStorage::open(dir.path().join("nope").join("wallet")),
            Err(AppError::Io(_))
        ));
    }

    #[test]
    fn put_null_deletes_and_get_copies() {
        let dir = tempfile::tempdir().unwrap();
        let storage = WalletStorage::open(dir.path().join("wallet")).unwrap();
        storage.put("labels", json!({ "a": "b" }));
        let mut copy = storage.get("labels").unwrap();
        copy["a"] = json!("changed");
        assert_eq!(storage.get("labels"), Some(json!({ "a": "b" })));

        storage.put("labels", Value::Null);
        assert_eq!(storage.get("labels"), None);
    }

    #[test]
    fn unserializable_values_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let storage = WalletStorage::open(dir.path().join("wallet")).unwrap();
        // 文字列以外のキーを持つマップは JSON にできない
        let bad: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);
        storage.put("bad", bad);
        assert_eq!(storage.get("bad"), None);
    }

    #[test]
    fn seed_version_rules() {
        let dir = tempfile::tempdir().unwrap();
        let storage = WalletStorage::open(dir.path().join("wallet")).unwrap();
        storage.put("seed_version", 20);
        assert!(matches!(storage.seed_version(), Err(AppError::WalletTooNew(20))));
        storage.put("seed_version", 7);
        assert!(matches!(storage.seed_version(), Err(AppError::UnsupportedSeedVersion { seed_version: 7, .. })));
        storage.remove("seed_version");
        assert_eq!(storage.seed_version().unwrap(), NEW_SEED_VERSION);
        storage.put("master_public_key", "ab".repeat(64));
        assert_eq!(storage.seed_version().unwrap(), OLD_SEED_VERSION);
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let mut data = Map::new();
        data.insert("b".to_string(), json!(1));
        data.insert("a".to_string(), json!([1, 2]));
        assert_eq!(
            canonical_json(&data).unwrap(),
            "{\n    \"a\": [\n        1,\n        2\n    ],\n    \"b\": 1\n}"
        );
    }

    #[cfg(unix)]
    #[test]
    fn new_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet");
        let storage = WalletStorage::open(&path).unwrap();
        storage.write().unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!storage.is_modified());
    }

    #[test]
    fn write_from_other_thread_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet");
        let storage = std::sync::Arc::new(WalletStorage::open(&path).unwrap());
        let shared = storage.clone();
        thread::spawn(move || shared.write().unwrap()).join().unwrap();
        assert!(!path.exists());
        assert!(storage.is_modified());
    }
}
