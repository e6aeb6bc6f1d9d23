use bitcoin::script::ScriptBuf;
use bitcoin::Txid;

use crate::keys::XPublicKey;
use crate::script::Destination;

pub use bitcoin::TxOut;

/// 未署名スロットを表すセンチネル
pub const NO_SIGNATURE: [u8; 1] = [0xff];

/// 新規入力のデフォルトシーケンス
pub const DEFAULT_SEQUENCE: u32 = 0xffff_fffe;

/// 入力の scriptSig の種類。
/// 署名者集合が分からない種類だけが元の scriptSig を保持する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptKind {
    Coinbase { script_sig: ScriptBuf },
    P2pk,
    P2pkh,
    P2shMultisig,
    Unknown {
        script_sig: ScriptBuf,
        /// 署名ハッシュ計算用に外部から与えるスクリプト
        script_code: Option<ScriptBuf>,
    },
}

impl ScriptKind {
    pub fn name(&self) -> &'static str {
        match self {
            ScriptKind::Coinbase { .. } => "coinbase",
            ScriptKind::P2pk => "p2pk",
            ScriptKind::P2pkh => "p2pkh",
            ScriptKind::P2shMultisig => "p2sh",
            ScriptKind::Unknown { .. } => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TxInput {
    pub prev_txid: Txid,
    pub prev_index: u32,
    pub sequence: u32,
    pub kind: ScriptKind,
    pub x_pubkeys: Vec<XPublicKey>,
    pub signatures: Vec<Option<Vec<u8>>>,
    pub threshold: usize,
    pub address: Option<Destination>,
    pub value: Option<u64>,
}

impl TxInput {
    fn signer(prev_txid: Txid, prev_index: u32, kind: ScriptKind, x_pubkeys: Vec<XPublicKey>, threshold: usize) -> Self {
        TxInput {
            prev_txid,
            prev_index,
            sequence: DEFAULT_SEQUENCE,
            kind,
            signatures: vec![None; x_pubkeys.len()],
            x_pubkeys,
            threshold,
            address: None,
            value: None,
        }
    }

    pub fn p2pkh(prev_txid: Txid, prev_index: u32, x_pubkey: XPublicKey, value: u64) -> Self {
        let address = x_pubkey.to_address().ok();
        let mut input = Self::signer(prev_txid, prev_index, ScriptKind::P2pkh, vec![x_pubkey], 1);
        input.address = address;
        input.value = Some(value);
        input
    }

    pub fn p2pk(prev_txid: Txid, prev_index: u32, x_pubkey: XPublicKey, value: u64) -> Self {
        let mut input = Self::signer(prev_txid, prev_index, ScriptKind::P2pk, vec![x_pubkey], 1);
        input.value = Some(value);
        input
    }

    /// m-of-n の P2SH マルチシグ入力。アドレスはリディームスクリプトから決まる。
    pub fn multisig(
        prev_txid: Txid,
        prev_index: u32,
        x_pubkeys: Vec<XPublicKey>,
        threshold: usize,
        value: u64,
    ) -> crate::error::Result<Self> {
        let keys: Vec<Vec<u8>> = x_pubkeys.iter().map(XPublicKey::to_bytes).collect();
        let redeem = crate::script::multisig_script(&keys, threshold)?;
        let mut input = Self::signer(prev_txid, prev_index, ScriptKind::P2shMultisig, x_pubkeys, threshold);
        input.address = Some(Destination::for_redeem_script(&redeem));
        input.value = Some(value);
        Ok(input)
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self.kind, ScriptKind::Coinbase { .. })
    }

    pub fn present_signatures(&self) -> impl Iterator<Item = &[u8]> {
        self.signatures.iter().filter_map(|sig| sig.as_deref())
    }

    pub fn signature_count(&self) -> usize {
        self.present_signatures().count()
    }

    pub fn is_complete(&self) -> bool {
        match self.kind {
            ScriptKind::Coinbase { .. } => true,
            _ => self.signature_count() == self.threshold,
        }
    }
}

/// 配線上で区別できる内容で比較する。
/// 署名済み入力は金額も鍵の元の表現もシリアライズされないため、
/// 鍵は解決後の公開鍵、署名は存在するものを順に比べる。
impl PartialEq for TxInput {
    fn eq(&self, other: &Self) -> bool {
        if self.prev_txid != other.prev_txid
            || self.prev_index != other.prev_index
            || self.sequence != other.sequence
            || self.kind != other.kind
            || self.threshold != other.threshold
            || self.is_complete() != other.is_complete()
        {
            return false;
        }
        if !self.present_signatures().eq(other.present_signatures()) {
            return false;
        }
        // P2PK の scriptSig は鍵を含まない
        let keys_equal = if self.kind == ScriptKind::P2pk {
            true
        } else if self.is_complete() {
            let mine: Vec<_> = self.x_pubkeys.iter().map(|k| k.resolve().ok()).collect();
            let theirs: Vec<_> = other.x_pubkeys.iter().map(|k| k.resolve().ok()).collect();
            mine == theirs
        } else {
            self.x_pubkeys == other.x_pubkeys
        };
        if self.is_complete() {
            keys_equal
        } else {
            keys_equal && self.signatures.len() == other.signatures.len() && self.value == other.value
        }
    }
}

impl Eq for TxInput {}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn key() -> XPublicKey {
        XPublicKey::from_hex("02d0de0aaeaefad02b8bdc8a01a1b8b11c696bd3d66a2c5f10780d95b7df42645c").unwrap()
    }

    #[test]
    fn coinbase_is_always_complete() {
        let input = TxInput {
            prev_txid: Txid::all_zeros(),
            prev_index: 0xffff_ffff,
            sequence: 0xffff_ffff,
            kind: ScriptKind::Coinbase { script_sig: ScriptBuf::from_bytes(vec![0x03, 1, 2, 3]) },
            x_pubkeys: Vec::new(),
            signatures: Vec::new(),
            threshold: 0,
            address: None,
            value: None,
        };
        assert!(input.is_complete());
        assert!(input.is_coinbase());
    }

    #[test]
    fn completeness_tracks_signature_count() {
        let mut input = TxInput::p2pkh(Txid::all_zeros(), 0, key(), 1000);
        assert_eq!(input.sequence, DEFAULT_SEQUENCE);
        assert!(!input.is_complete());
        input.signatures[0] = Some(vec![0x30, 0x01]);
        assert!(input.is_complete());
        assert_eq!(input.signature_count(), 1);
    }

    #[test]
    fn multisig_needs_threshold_signatures() {
        let other =
            XPublicKey::from_hex("03d0de0aaeaefad02b8bdc8a01a1b8b11c696bd3d66a2c5f10780d95b7df42645c").unwrap();
        let keys = vec![key(), other];
        let mut input = TxInput::multisig(Txid::all_zeros(), 1, keys, 2, 5000).unwrap();
        assert!(matches!(input.address, Some(Destination::ScriptHash(_))));
        input.signatures[1] = Some(vec![1]);
        assert!(!input.is_complete());
        input.signatures[0] = Some(vec![2]);
        assert!(input.is_complete());
    }
}
