//! ウォレット文書から追い出した大量データの受け皿

use std::collections::BTreeMap;
use std::ops::BitOr;

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// トランザクション状態フラグ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TxFlags(pub u32);

impl TxFlags {
    pub const UNSET: TxFlags = TxFlags(0);
    /// ブロックに取り込まれ、検証済み
    pub const STATE_CLEARED: TxFlags = TxFlags(1 << 20);
    /// ブロックに取り込まれたが未検証
    pub const STATE_SETTLED: TxFlags = TxFlags(1 << 21);

    pub fn contains(self, other: TxFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TxFlags {
    type Output = TxFlags;

    fn bitor(self, rhs: TxFlags) -> TxFlags {
        TxFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TxData {
    pub height: Option<i64>,
    pub fee: Option<i64>,
    pub position: Option<i64>,
    pub timestamp: Option<i64>,
}

/// このトランザクションの入力が消費した出力
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxInputEntry {
    pub address: String,
    pub prevout_tx_hash: String,
    pub prev_idx: u32,
    pub amount: i64,
}

/// このトランザクションが作った出力
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxOutputEntry {
    pub address: String,
    pub out_index: u32,
    pub amount: i64,
    pub is_coinbase: bool,
}

/// バージョン 18/19 のマイグレーションがデータを渡す先
pub trait WalletRepository {
    fn add_transactions(&mut self, entries: Vec<(String, TxData, Vec<u8>, TxFlags)>) -> Result<()>;

    fn add_spent_outputs(&mut self, entries: Vec<(String, TxInputEntry)>) -> Result<()>;

    fn add_created_outputs(&mut self, entries: Vec<(String, TxOutputEntry)>) -> Result<()>;

    fn add_misc(&mut self, key: &str, value: Value) -> Result<()>;

    /// 既存データを最初のサブウォレットに割り当てる
    fn designate_subwallets(&mut self, from_version: u32, to_version: u32) -> Result<()>;
}

/// メモリ上の実装。CLI の確認用とテストで使う。
#[derive(Debug, Default)]
pub struct MemoryRepository {
    pub transactions: BTreeMap<String, (TxData, Vec<u8>, TxFlags)>,
    pub spent_outputs: Vec<(String, TxInputEntry)>,
    pub created_outputs: Vec<(String, TxOutputEntry)>,
    pub misc: BTreeMap<String, Value>,
    pub migrations: Vec<(u32, u32)>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WalletRepository for MemoryRepository {
    fn add_transactions(&mut self, entries: Vec<(String, TxData, Vec<u8>, TxFlags)>) -> Result<()> {
        log::debug!("add_transactions: {} 件", entries.len());
        for (tx_id, data, payload, flags) in entries {
            self.transactions.insert(tx_id, (data, payload, flags));
        }
        Ok(())
    }

    fn add_spent_outputs(&mut self, entries: Vec<(String, TxInputEntry)>) -> Result<()> {
        log::debug!("add_spent_outputs: {} 件", entries.len());
        self.spent_outputs.extend(entries);
        Ok(())
    }

    fn add_created_outputs(&mut self, entries: Vec<(String, TxOutputEntry)>) -> Result<()> {
        log::debug!("add_created_outputs: {} 件", entries.len());
        self.created_outputs.extend(entries);
        Ok(())
    }

    fn add_misc(&mut self, key: &str, value: Value) -> Result<()> {
        self.misc.insert(key.to_string(), value);
        Ok(())
    }

    fn designate_subwallets(&mut self, from_version: u32, to_version: u32) -> Result<()> {
        self.migrations.push((from_version, to_version));
        Ok(())
    }
}
