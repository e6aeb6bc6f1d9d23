use std::path::PathBuf;
use bitcoin::consensus::encode::Error as BitcoinEncodeError;
use bitcoin::address::ParseError as BitcoinAddressError;
use bitcoin::bip32::Error as BitcoinBip32Error;
use bitcoin::key::FromWifError as BitcoinKeyError; // WIFデコードエラー用
use secp256k1::Error as SecpError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSONパースエラー ファイル: {file_path:?}, 詳細: {source}")]
    JsonParse {
        file_path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSONエラー: {0}")]
    Json(#[from] serde_json::Error),

    // --- デコードエラー (不正・途中で切れたバイナリ) ---
    #[error("Bitcoinコンセンサスエンコードエラー: {0}")]
    BitcoinConsensus(#[from] BitcoinEncodeError),

    #[error("デコードエラー: {0}")]
    Decode(String),

    #[error("16進数デコードエラー: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("不正な拡張公開鍵: {0}")]
    InvalidKey(String),

    #[error("Bitcoinアドレスエラー: {0}")]
    BitcoinAddress(#[from] BitcoinAddressError),

    #[error("Bitcoin秘密鍵(WIF)処理エラー: {0}")]
    BitcoinKey(#[from] BitcoinKeyError),

    #[error("BIP32導出エラー: {0}")]
    Bip32(#[from] BitcoinBip32Error),

    #[error("secp256k1エラー: {0}")]
    Secp256k1(#[from] SecpError),

    // --- 署名関連 ---
    #[error("入力 {input_index} の金額が不明なため署名ハッシュを計算できません")]
    InputValueMissing { input_index: usize },

    #[error("入力 {input_index} の署名ハッシュ用スクリプトがありません")]
    ScriptCodeMissing { input_index: usize },

    #[error("署名数が一致しません: 入力数 {expected}, 署名数 {actual}")]
    SignatureCountMismatch { expected: usize, actual: usize },

    #[error("入力 {input_index} の署名スロット数 {slots} が公開鍵数 {keys} と一致しません")]
    SignatureSlotMismatch { input_index: usize, slots: usize, keys: usize },

    #[error("マルチシグの閾値が範囲外です: {threshold} / {keys}")]
    InvalidThreshold { threshold: usize, keys: usize },

    // --- ウォレットのバージョン互換性 ---
    #[error("このウォレットは新しいバージョンで作成されたため開けません (seed_version {0})")]
    WalletTooNew(u32),

    #[error("サポートされていないseed_versionです: {seed_version} ({path:?})")]
    UnsupportedSeedVersion { seed_version: u32, path: PathBuf },

    #[error("他のウォレットソフトでアップグレードされたファイルです")]
    IncompatibleWallet,

    // --- マイグレーション構造エラー ---
    #[error("storage upgrade: 想定外のバージョン {current} (期待値 {min}-{max})")]
    UnexpectedVersion { current: u32, min: u32, max: u32 },

    #[error("ウォレットタイプを判別できません: {0}")]
    UnknownWalletType(String),

    #[error("インポートアカウントにアドレスと秘密鍵が混在しています (mixed addresses and privkeys)")]
    MixedImportedEntries,

    #[error("複数アカウントを持つウォレットは分割が必要です")]
    RequiresSplit,

    #[error("マイグレーションエラー: {0}")]
    Migration(String),

    // --- 暗号化 ---
    #[error("暗号処理エラー: {0}")]
    Crypto(String),

    #[error("パスワードが正しくありません")]
    InvalidPassword,

    #[error("暗号化されたウォレットがまだ復号されていません")]
    NotDecrypted,

    // --- トランザクション構築 ---
    #[error("入力検証エラー: {0}")]
    InputValidation(String),

    #[error("資金不足: 利用可能な総額 {available} sats, 要求額 {required} sats (手数料 {fee} sats を含む)")]
    InsufficientFunds {
        available: u64,
        required: u64,
        fee: u64,
    },

    #[error("ネットワーク不整合: CLI指定 ({cli_network}) vs WIF/アドレス ({inferred_network})")]
    NetworkMismatch {
        cli_network: String,
        inferred_network: String,
    },

    #[error("不明なスクリプトタイプ: {script_hex}")]
    UnknownScriptType { script_hex: String },

    #[error("トランザクション構築エラー: {0}")]
    TransactionBuild(String),
}
