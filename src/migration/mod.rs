//! ウォレット文書のバージョンアップ (seed_version 4/11 → 19)
//!
//! 各ステップは `[min_version, max_version]` の範囲でだけ動き、範囲より新しい文書では何もしない。
//! 範囲より古い文書は異常として扱う。

pub mod repository;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use bitcoin::address::{AddressType, NetworkUnchecked};
use bitcoin::{Address, Network, PublicKey};
use serde_json::{json, Map, Value};

use crate::error::{AppError, Result};
use crate::script::Destination;
use crate::storage::{WalletStorage, FINAL_SEED_VERSION, OLD_SEED_VERSION, WALLET_AUTHOR};

use repository::{TxData, TxFlags, TxInputEntry, TxOutputEntry, WalletRepository};

const HARDWARE_WALLET_TYPES: [&str; 4] = ["trezor", "keepkey", "ledger", "digitalbitbox"];
const SPLITTABLE_WALLET_TYPES: [&str; 6] = ["bip44", "trezor", "keepkey", "ledger", "btchip", "digitalbitbox"];

/// サブウォレットへ移すフィールド
const SUBWALLET_FIELDS: [&str; 8] = [
    "gap_limit",
    "invoices",
    "keystore",
    "labels",
    "multiple_change",
    "payment_requests",
    "stored_height",
    "use_change",
];

/// ステップ実行中に参照する文書・外部リポジトリ・ネットワーク
pub struct MigrationContext<'a> {
    pub storage: &'a WalletStorage,
    pub repository: &'a mut dyn WalletRepository,
    pub network: Network,
}

pub type StepFn = fn(&mut MigrationContext<'_>) -> Result<()>;

pub struct MigrationStep {
    pub name: &'static str,
    pub min_version: u32,
    pub max_version: u32,
    run: StepFn,
}

impl MigrationStep {
    pub fn new(name: &'static str, min_version: u32, max_version: u32, run: StepFn) -> Self {
        MigrationStep { name, min_version, max_version, run }
    }

    pub fn is_needed(&self, storage: &WalletStorage) -> Result<bool> {
        let current = storage.seed_version()?;
        if current > self.max_version {
            return Ok(false);
        }
        if current < self.min_version {
            return Err(AppError::UnexpectedVersion {
                current,
                min: self.min_version,
                max: self.max_version,
            });
        }
        Ok(true)
    }
}

/// 起動時に一度だけ組み立て、ドライバに明示的に渡すステップ列
pub struct MigrationLadder {
    network: Network,
    steps: Vec<MigrationStep>,
}

impl MigrationLadder {
    pub fn new(network: Network, steps: Vec<MigrationStep>) -> Self {
        MigrationLadder { network, steps }
    }

    pub fn standard(network: Network) -> Self {
        Self::new(
            network,
            vec![
                MigrationStep::new("convert_imported", 0, 13, convert_imported),
                MigrationStep::new("convert_wallet_type", 0, 13, convert_wallet_type),
                MigrationStep::new("convert_account", 0, 13, convert_account),
                MigrationStep::new("convert_version_13_b", 0, 13, convert_version_13_b),
                MigrationStep::new("convert_version_14", 13, 13, convert_version_14),
                MigrationStep::new("convert_version_15", 14, 14, convert_version_15),
                MigrationStep::new("convert_version_16", 15, 15, convert_version_16),
                MigrationStep::new("convert_version_17", 16, 16, convert_version_17),
                MigrationStep::new("convert_version_18", 17, 17, convert_version_18),
                MigrationStep::new("convert_version_19", 18, 18, convert_version_19),
            ],
        )
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    /// 分割が必要なら `RequiresSplit`。アップグレードを行った場合は true。
    pub fn run(&self, storage: &WalletStorage, repository: &mut dyn WalletRepository) -> Result<bool> {
        ensure_decrypted(storage)?;
        if requires_split(storage) {
            return Err(AppError::RequiresSplit);
        }
        if !requires_upgrade(storage)? {
            log::debug!("アップグレード不要: {:?}", storage.path());
            return Ok(false);
        }
        self.upgrade(storage, repository)?;
        Ok(true)
    }

    /// バックアップを取ってから全ステップを順に適用し、書き込む
    pub fn upgrade(&self, storage: &WalletStorage, repository: &mut dyn WalletRepository) -> Result<()> {
        ensure_decrypted(storage)?;
        log::debug!("upgrading wallet format");
        storage.backup()?;

        let mut context = MigrationContext { storage, repository, network: self.network };
        for step in &self.steps {
            if !step.is_needed(storage)? {
                continue;
            }
            log::info!("マイグレーション {} を実行します (seed_version {})", step.name, storage.seed_version()?);
            (step.run)(&mut context)?;
        }

        storage.put("seed_version", FINAL_SEED_VERSION);
        storage.write()
    }

    /// 複数アカウントを持つ旧ウォレットをアカウントごとのファイルに分ける。
    /// 新しいファイルはそれぞれアップグレードして書き込む。
    pub fn split_accounts<R, F>(&self, storage: &WalletStorage, mut repository_for: F) -> Result<Vec<PathBuf>>
    where
        R: WalletRepository,
        F: FnMut(&Path) -> R,
    {
        ensure_decrypted(storage)?;
        let accounts = get_object(storage, "accounts")?;
        if accounts.len() < 2 {
            return Ok(Vec::new());
        }
        let wallet_type = get_string(storage, "wallet_type")?.unwrap_or_default();
        let base = storage.path().display().to_string();
        let mut result = Vec::new();

        if wallet_type == "old" {
            if accounts.len() != 2 {
                return Err(AppError::Migration(format!(
                    "old ウォレットのアカウント数が想定外です: {}",
                    accounts.len()
                )));
            }
            let deterministic = account(&accounts, "0")?;
            let imported = account(&accounts, "/x")?;

            let path = PathBuf::from(format!("{}.deterministic", base));
            let target = self.split_target(storage, &path)?;
            target.put("accounts", json!({ "0": deterministic }));
            self.upgrade(&target, &mut repository_for(&path))?;
            result.push(path);

            let path = PathBuf::from(format!("{}.imported", base));
            let target = self.split_target(storage, &path)?;
            target.put("accounts", json!({ "/x": imported }));
            target.remove("seed");
            target.remove("seed_version");
            target.remove("master_public_key");
            target.put("wallet_type", "imported");
            self.upgrade(&target, &mut repository_for(&path))?;
            result.push(path);
        } else if SPLITTABLE_WALLET_TYPES.contains(&wallet_type.as_str()) {
            let master_public_keys = get_object(storage, "master_public_keys")?;
            for (key, entry) in &accounts {
                if entry.get("pending").is_some_and(is_truthy) {
                    continue;
                }
                let index: u32 = key
                    .parse()
                    .map_err(|_| AppError::Migration(format!("アカウント番号が不正です: {}", key)))?;
                let xpub = master_public_keys
                    .get(&format!("x/{}'", index))
                    .cloned()
                    .ok_or_else(|| AppError::Migration(format!("アカウント {} の xpub がありません", index)))?;

                let path = PathBuf::from(format!("{}.{}", base, key));
                let target = self.split_target(storage, &path)?;
                target.put("accounts", json!({ "0": entry }));
                target.put("master_public_keys", json!({ "x/0'": xpub }));
                target.put("derivation", bip44_derivation(self.network, index));
                self.upgrade(&target, &mut repository_for(&path))?;
                result.push(path);
            }
        } else {
            return Err(AppError::RequiresSplit);
        }
        log::info!("ウォレットを {} 個のファイルに分割しました。", result.len());
        Ok(result)
    }

    fn split_target(&self, storage: &WalletStorage, path: &Path) -> Result<WalletStorage> {
        let target = WalletStorage::open(path)?;
        target.replace_data(storage.snapshot());
        Ok(target)
    }
}

/// 暗号化されたままの文書は空なので、バージョン判定に使えない
fn ensure_decrypted(storage: &WalletStorage) -> Result<()> {
    if storage.needs_decrypt() {
        log::error!("復号前のウォレットはアップグレードできません: {:?}", storage.path());
        return Err(AppError::NotDecrypted);
    }
    Ok(())
}

/// ファイルが存在し、古い seed_version を持つ場合に true
pub fn requires_upgrade(storage: &WalletStorage) -> Result<bool> {
    if !storage.file_exists() {
        return Ok(false);
    }
    let seed_version = storage.seed_version()?;
    // 17 までは他のウォレットソフトと共通のバージョン
    if seed_version <= 17 {
        return Ok(true);
    }
    if seed_version < FINAL_SEED_VERSION {
        if storage.get("wallet_author").as_ref().and_then(Value::as_str) == Some(WALLET_AUTHOR) {
            return Ok(true);
        }
        return Err(AppError::IncompatibleWallet);
    }
    Ok(false)
}

pub fn requires_split(storage: &WalletStorage) -> bool {
    storage
        .get("accounts")
        .as_ref()
        .and_then(Value::as_object)
        .is_some_and(|accounts| accounts.len() > 1)
}

fn leading_number(text: &str) -> Option<(u32, &str)> {
    let end = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    if end == 0 {
        return None;
    }
    Some((text[..end].parse().ok()?, &text[end..]))
}

/// `"2of3"` のような m-of-n 形式なら (m, n)
pub fn multisig_type(wallet_type: &str) -> Option<(u32, u32)> {
    let (m, rest) = leading_number(wallet_type)?;
    let (n, _) = leading_number(rest.strip_prefix("of")?)?;
    Some((m, n))
}

pub fn bip44_derivation(network: Network, account_id: u32) -> String {
    let coin = if network == Network::Bitcoin { 236 } else { 1 };
    format!("m/44'/{}'/{}'", coin, account_id)
}

/// P2PKH/P2SH のアドレスとしてネットワークに合っているか
pub fn is_address_valid(text: &str, network: Network) -> bool {
    match text.parse::<Address<NetworkUnchecked>>() {
        Ok(address) if address.is_valid_for_network(network) => matches!(
            address.assume_checked().address_type(),
            Some(AddressType::P2pkh) | Some(AddressType::P2sh)
        ),
        _ => false,
    }
}

fn public_key_address(public_key_hex: &str, network: Network) -> Result<String> {
    let public_key = PublicKey::from_str(public_key_hex)
        .map_err(|e| AppError::Migration(format!("公開鍵が不正です ({}): {}", public_key_hex, e)))?;
    Ok(Destination::for_public_key(&public_key).to_address(network)?.to_string())
}

// --- 文書の値を読むための補助 ---

fn shape_error(what: &str) -> AppError {
    AppError::Migration(format!("{} の形式が不正です", what))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn get_truthy(storage: &WalletStorage, key: &str) -> bool {
    storage.get(key).as_ref().is_some_and(is_truthy)
}

/// キーがなければ空のマップ
fn get_object(storage: &WalletStorage, key: &str) -> Result<Map<String, Value>> {
    match storage.get(key) {
        None => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(shape_error(key)),
    }
}

fn get_string(storage: &WalletStorage, key: &str) -> Result<Option<String>> {
    match storage.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(shape_error(key)),
    }
}

fn as_array<'a>(value: &'a Value, what: &str) -> Result<&'a Vec<Value>> {
    value.as_array().ok_or_else(|| shape_error(what))
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| shape_error(what))
}

fn as_int(value: &Value, what: &str) -> Result<i64> {
    value.as_i64().ok_or_else(|| shape_error(what))
}

fn as_opt_int(value: Option<&Value>, what: &str) -> Result<Option<i64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => as_int(value, what).map(Some),
    }
}

fn account(accounts: &Map<String, Value>, key: &str) -> Result<Value> {
    accounts
        .get(key)
        .cloned()
        .ok_or_else(|| AppError::Migration(format!("アカウント {} がありません", key)))
}

/// `"hash:n"` を (hash, n) に分ける
fn split_outpoint(text: &str) -> Result<(String, u32)> {
    let (hash, index) = text.split_once(':').ok_or_else(|| shape_error(text))?;
    let index = index.parse().map_err(|_| shape_error(text))?;
    Ok((hash.to_string(), index))
}

fn keystore_type(storage: &WalletStorage) -> Option<String> {
    storage
        .get("keystore")?
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn imported_public_keys(storage: &WalletStorage) -> Result<Vec<String>> {
    let keystore = storage.get("keystore").ok_or_else(|| shape_error("keystore"))?;
    let keypairs = keystore.get("keypairs").ok_or_else(|| shape_error("keystore.keypairs"))?;
    Ok(as_object(keypairs, "keystore.keypairs")?.keys().cloned().collect())
}

// --- ステップ ---

fn convert_imported(context: &mut MigrationContext<'_>) -> Result<()> {
    let storage = context.storage;
    // '/x' はインポートアカウントの内部 ID
    let imported = get_object(storage, "accounts")?
        .get("/x")
        .and_then(|account| account.get("imported"))
        .cloned()
        .unwrap_or(Value::Null);
    if !is_truthy(&imported) {
        return Ok(());
    }

    let mut addresses = Vec::new();
    let mut keypairs = Map::new();
    for (address, entry) in as_object(&imported, "accounts./x.imported")? {
        let pair = as_array(entry, address)?;
        let (Some(public_key), Some(private_key)) = (pair.first(), pair.get(1)) else {
            return Err(shape_error(address));
        };
        if is_truthy(private_key) {
            let public_key = public_key.as_str().ok_or_else(|| shape_error(address))?;
            keypairs.insert(public_key.to_string(), private_key.clone());
        } else {
            addresses.push(address.clone());
        }
    }

    match (addresses.is_empty(), keypairs.is_empty()) {
        (false, false) => Err(AppError::MixedImportedEntries),
        (false, true) => {
            storage.put("addresses", addresses);
            storage.remove("accounts");
            Ok(())
        }
        (true, false) => {
            storage.put("wallet_type", "standard");
            storage.put("key_type", "imported");
            storage.put("keypairs", keypairs);
            storage.remove("accounts");
            Ok(())
        }
        (true, true) => Err(AppError::Migration("no addresses or privkeys".to_string())),
    }
}

fn convert_wallet_type(context: &mut MigrationContext<'_>) -> Result<()> {
    let storage = context.storage;
    let mut wallet_type = get_string(storage, "wallet_type")?.unwrap_or_default();
    if wallet_type == "btchip" {
        wallet_type = "ledger".to_string();
    }
    if get_truthy(storage, "keystore") || get_truthy(storage, "x1/") || wallet_type == "imported" {
        return Ok(());
    }
    if requires_split(storage) {
        return Err(AppError::RequiresSplit);
    }

    let seed_version = storage.seed_version()?;
    let seed = storage.get("seed").unwrap_or(Value::Null);
    let xpubs = get_object(storage, "master_public_keys")?;
    let xprvs = get_object(storage, "master_private_keys")?;
    let xpub = |key: &str| {
        xpubs
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::Migration(format!("master_public_keys に {} がありません", key)))
    };
    let xprv = |key: &str| xprvs.get(key).cloned().unwrap_or(Value::Null);

    let keystore = if seed_version == OLD_SEED_VERSION || wallet_type == "old" {
        Some(json!({
            "type": "old",
            "seed": seed,
            "mpk": storage.get("master_public_key"),
        }))
    } else if get_string(storage, "key_type")?.as_deref() == Some("imported") {
        Some(json!({
            "type": "imported",
            "keypairs": storage.get("keypairs"),
        }))
    } else if wallet_type == "xpub" || wallet_type == "standard" {
        Some(json!({
            "type": "bip32",
            "xpub": xpub("x/")?,
            "xprv": xprv("x/"),
            "seed": seed,
        }))
    } else if wallet_type == "bip44" {
        Some(json!({
            "type": "bip32",
            "xpub": xpub("x/0'")?,
            "xprv": xprv("x/0'"),
        }))
    } else if HARDWARE_WALLET_TYPES.contains(&wallet_type.as_str()) {
        let derivation = storage
            .get("derivation")
            .unwrap_or_else(|| Value::String(bip44_derivation(context.network, 0)));
        Some(json!({
            "type": "hardware",
            "hw_type": wallet_type,
            "xpub": xpub("x/0'")?,
            "derivation": derivation,
        }))
    } else if multisig_type(&wallet_type).is_some() {
        // 共同署名者ごとのキーストア (x1/, x2/, ...)
        for (key, value) in &xpubs {
            let mut cosigner = json!({
                "type": "bip32",
                "xpub": value,
                "xprv": xprv(key),
            });
            if key == "x1/" && is_truthy(&seed) {
                cosigner["seed"] = seed.clone();
            }
            storage.put(key, cosigner);
        }
        None
    } else {
        return Err(AppError::UnknownWalletType(wallet_type));
    };

    if let Some(keystore) = keystore {
        storage.put("wallet_type", "standard");
        storage.put("keystore", keystore);
    }
    for key in [
        "master_public_key",
        "master_public_keys",
        "master_private_keys",
        "derivation",
        "seed",
        "keypairs",
        "key_type",
    ] {
        storage.remove(key);
    }
    Ok(())
}

fn convert_account(context: &mut MigrationContext<'_>) -> Result<()> {
    context.storage.remove("accounts");
    Ok(())
}

// バージョン 13 には新旧2つの構造がある
fn convert_version_13_b(context: &mut MigrationContext<'_>) -> Result<()> {
    let storage = context.storage;
    if get_string(storage, "wallet_type")?.as_deref() == Some("standard")
        && keystore_type(storage).as_deref() == Some("imported")
    {
        let receiving = imported_public_keys(storage)?
            .iter()
            .map(|public_key| public_key_address(public_key, context.network))
            .collect::<Result<Vec<String>>>()?;
        storage.put("addresses", json!({ "change": [], "receiving": receiving }));
        storage.remove("pubkeys");
    }
    storage.put("seed_version", 13);
    Ok(())
}

fn convert_version_14(context: &mut MigrationContext<'_>) -> Result<()> {
    let storage = context.storage;
    match get_string(storage, "wallet_type")?.as_deref() {
        Some("imported") => {
            if let Some(Value::Array(addresses)) = storage.get("addresses") {
                let addresses: Map<String, Value> = addresses
                    .iter()
                    .map(|address| -> Result<(String, Value)> {
                        let address = address.as_str().ok_or_else(|| shape_error("addresses"))?;
                        Ok((address.to_string(), Value::Null))
                    })
                    .collect::<Result<_>>()?;
                storage.put("addresses", addresses);
            }
        }
        Some("standard") if keystore_type(storage).as_deref() == Some("imported") => {
            let receiving: Vec<String> = storage
                .get("addresses")
                .and_then(|addresses| addresses.get("receiving").cloned())
                .and_then(|receiving| serde_json::from_value(receiving).ok())
                .ok_or_else(|| shape_error("addresses.receiving"))?;
            let public_keys = imported_public_keys(storage)?;
            let mut unique = receiving.clone();
            unique.sort();
            unique.dedup();
            if unique.len() != public_keys.len() {
                return Err(AppError::Migration(format!(
                    "アドレス数 {} と公開鍵数 {} が一致しません",
                    unique.len(),
                    public_keys.len()
                )));
            }

            let mut addresses = Map::new();
            for public_key in public_keys {
                let address = public_key_address(&public_key, context.network)?;
                if !unique.contains(&address) {
                    return Err(AppError::Migration(format!("公開鍵 {} のアドレスがありません", public_key)));
                }
                addresses.insert(
                    address,
                    json!({ "pubkey": public_key, "redeem_script": null, "type": "p2pkh" }),
                );
            }
            storage.put("addresses", addresses);
            storage.remove("pubkeys");
            storage.put("wallet_type", "imported");
        }
        _ => {}
    }
    storage.put("seed_version", 14);
    Ok(())
}

fn convert_version_15(context: &mut MigrationContext<'_>) -> Result<()> {
    context.storage.put("seed_version", 15);
    Ok(())
}

/// 不正なアドレスを、それを参照する履歴やラベルごと取り除く
fn remove_address(storage: &WalletStorage, address: &str) {
    for name in ["addr_history", "labels", "payment_requests"] {
        if let Some(Value::Object(mut entries)) = storage.get(name) {
            entries.remove(address);
            storage.put(name, entries);
        }
    }
    if let Some(Value::Array(mut frozen)) = storage.get("frozen_addresses") {
        frozen.retain(|entry| entry.as_str() != Some(address));
        storage.put("frozen_addresses", frozen);
    }
}

fn convert_version_16(context: &mut MigrationContext<'_>) -> Result<()> {
    let storage = context.storage;
    if get_string(storage, "wallet_type")?.as_deref() == Some("imported") {
        let addresses = storage.get("addresses").unwrap_or(Value::Null);
        let addresses = as_object(&addresses, "addresses")?;
        let mut repaired = Map::new();
        for (address, details) in addresses {
            if !is_address_valid(address, context.network) {
                log::warn!("不正なアドレスを削除します: {}", address);
                remove_address(storage, address);
                continue;
            }
            let details = if details.is_null() { json!({}) } else { details.clone() };
            repaired.insert(address.clone(), details);
        }
        storage.put("addresses", repaired);
    }
    storage.put("seed_version", 16);
    Ok(())
}

fn convert_version_17(context: &mut MigrationContext<'_>) -> Result<()> {
    let storage = context.storage;
    if get_string(storage, "wallet_type")?.as_deref() == Some("imported") {
        let addresses = get_object(storage, "addresses")?;
        let wallet_type = if addresses.values().all(is_truthy) { "imported_privkey" } else { "imported_addr" };
        storage.put("wallet_type", wallet_type);
    }
    storage.put("seed_version", 17);
    Ok(())
}

/// トランザクション関連の大量データを外部リポジトリへ移す
fn convert_version_18(context: &mut MigrationContext<'_>) -> Result<()> {
    let storage = context.storage;
    let wallet_type = get_string(storage, "wallet_type")?;

    match get_string(storage, "tx_store_aeskey")? {
        Some(key) => {
            if hex::decode(&key)?.len() != 32 {
                return Err(shape_error("tx_store_aeskey"));
            }
        }
        None => {
            let mut key = [0u8; 32];
            rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut key);
            storage.put("tx_store_aeskey", hex::encode(key));
        }
    }

    let transactions = get_object(storage, "transactions")?;
    let fees = get_object(storage, "fees")?;
    let verified = get_object(storage, "verified_tx3")?;
    let history = get_object(storage, "addr_history")?;

    let mut history_heights: Map<String, Value> = Map::new();
    for entries in history.values() {
        for entry in as_array(entries, "addr_history")? {
            let pair = as_array(entry, "addr_history")?;
            if let (Some(Value::String(tx_hash)), Some(height)) = (pair.first(), pair.get(1)) {
                history_heights.insert(tx_hash.clone(), height.clone());
            } else {
                return Err(shape_error("addr_history"));
            }
        }
    }

    let mut to_add = Vec::new();
    for (tx_id, payload) in &transactions {
        let payload = hex::decode(payload.as_str().ok_or_else(|| shape_error("transactions"))?)?;
        let fee = as_opt_int(fees.get(tx_id), "fees")?;
        let (data, flags) = match verified.get(tx_id) {
            Some(entry) => {
                let entry = as_array(entry, "verified_tx3")?;
                if entry.len() != 3 {
                    return Err(shape_error("verified_tx3"));
                }
                let data = TxData {
                    height: as_opt_int(entry.first(), "verified_tx3")?,
                    fee,
                    position: as_opt_int(entry.get(2), "verified_tx3")?,
                    timestamp: as_opt_int(entry.get(1), "verified_tx3")?,
                };
                (data, TxFlags::STATE_CLEARED)
            }
            None => {
                let height = as_opt_int(history_heights.get(tx_id), "addr_history")?;
                (TxData { height, fee, position: None, timestamp: None }, TxFlags::STATE_SETTLED)
            }
        };
        to_add.push((tx_id.clone(), data, payload, flags));
    }
    if !to_add.is_empty() {
        context.repository.add_transactions(to_add)?;
    }

    let mut spent = Vec::new();
    for (tx_hash, entries) in &get_object(storage, "txi")? {
        for (address, values) in as_object(entries, "txi")? {
            for value in as_array(values, "txi")? {
                let pair = as_array(value, "txi")?;
                let (Some(Value::String(prevout)), Some(amount)) = (pair.first(), pair.get(1)) else {
                    return Err(shape_error("txi"));
                };
                let (prevout_tx_hash, prev_idx) = split_outpoint(prevout)?;
                let entry = TxInputEntry {
                    address: address.clone(),
                    prevout_tx_hash,
                    prev_idx,
                    amount: as_int(amount, "txi")?,
                };
                spent.push((tx_hash.clone(), entry));
            }
        }
    }
    if !spent.is_empty() {
        context.repository.add_spent_outputs(spent)?;
    }

    let mut created = Vec::new();
    for (tx_hash, entries) in &get_object(storage, "txo")? {
        for (address, values) in as_object(entries, "txo")? {
            for value in as_array(values, "txo")? {
                let triple = as_array(value, "txo")?;
                let [out_index, amount, is_coinbase] = triple.as_slice() else {
                    return Err(shape_error("txo"));
                };
                let out_index = u32::try_from(as_int(out_index, "txo")?).map_err(|_| shape_error("txo"))?;
                let entry = TxOutputEntry {
                    address: address.clone(),
                    out_index,
                    amount: as_int(amount, "txo")?,
                    is_coinbase: is_truthy(is_coinbase),
                };
                created.push((tx_hash.clone(), entry));
            }
        }
    }
    if !created.is_empty() {
        context.repository.add_created_outputs(created)?;
    }

    if let Some(addresses) = storage.get("addresses") {
        let addresses = match addresses {
            Value::Object(map) if wallet_type.as_deref() == Some("imported_addr") => {
                Value::Array(map.keys().cloned().map(Value::String).collect())
            }
            other => other,
        };
        context.repository.add_misc("addresses", addresses)?;
    }
    context.repository.add_misc("addr_history", storage.get("addr_history").unwrap_or(Value::Null))?;
    context
        .repository
        .add_misc("frozen_addresses", storage.get("frozen_addresses").unwrap_or(Value::Null))?;

    let frozen_coins = match storage.get("frozen_coins") {
        Some(value) => as_array(&value, "frozen_coins")?
            .iter()
            .map(|coin| -> Result<Value> {
                let (hash, index) = split_outpoint(coin.as_str().ok_or_else(|| shape_error("frozen_coins"))?)?;
                Ok(json!([hash, index]))
            })
            .collect::<Result<Vec<Value>>>()?,
        None => Vec::new(),
    };
    context.repository.add_misc("frozen_coins", Value::Array(frozen_coins))?;

    // キーが (hash, n) の組になるため [[hash, n], value] の列にする
    let pruned_txo = get_object(storage, "pruned_txo")?
        .iter()
        .map(|(key, value)| -> Result<Value> {
            let (hash, index) = split_outpoint(key)?;
            Ok(json!([[hash, index], value]))
        })
        .collect::<Result<Vec<Value>>>()?;
    context.repository.add_misc("pruned_txo", Value::Array(pruned_txo))?;

    for key in [
        "addresses",
        "addr_history",
        "frozen_addresses",
        "frozen_coins",
        "pruned_txo",
        "transactions",
        "txi",
        "txo",
        "fees",
        "tx_fees",
        "verified_tx3",
    ] {
        storage.remove(key);
    }
    storage.put("wallet_author", WALLET_AUTHOR);
    storage.put("seed_version", 18);
    Ok(())
}

/// 文書を1つ以上のサブウォレットの入れ物にする
fn convert_version_19(context: &mut MigrationContext<'_>) -> Result<()> {
    let storage = context.storage;
    let wallet_type = get_string(storage, "wallet_type")?
        .ok_or_else(|| AppError::Migration("Wallet has no type".to_string()))?;
    let multisig = multisig_type(&wallet_type);
    let known = matches!(wallet_type.as_str(), "standard" | "imported_privkey" | "imported_addr");
    if !known && multisig.is_none() {
        return Err(AppError::UnknownWalletType(wallet_type));
    }

    let mut wallet_data = Map::new();
    wallet_data.insert("wallet_type".to_string(), Value::String(wallet_type));
    for field in SUBWALLET_FIELDS {
        if let Some(value) = storage.get(field) {
            wallet_data.insert(field.to_string(), value);
            storage.remove(field);
        }
    }
    if let Some((_, n)) = multisig {
        for i in 1..=n {
            let name = format!("x{}/", i);
            wallet_data.insert(name.clone(), storage.get(&name).unwrap_or(Value::Null));
            storage.remove(&name);
        }
    }
    // 外部リポジトリのグループ ID
    wallet_data.insert("id".to_string(), json!(0));

    storage.put("subwallets", vec![Value::Object(wallet_data)]);
    context.repository.designate_subwallets(18, 19)?;
    storage.put("seed_version", 19);
    Ok(())
}
