use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::hashes::{sha256d, Hash as _};
use bitcoin::script::{Script, ScriptBuf};
use bitcoin::PublicKey;
use secp256k1::{Scalar, SECP256K1};

use crate::error::{AppError, Result};
use crate::script::{classify, Destination, ScriptClass};

const BIP32_KEY_LEN: usize = 1 + 78 + 2 + 2;
const OLD_KEYSTORE_KEY_LEN: usize = 1 + 64 + 2 + 2;

/// 署名者の参照。先頭バイトで種類が決まる。
///
/// | 先頭 | 内容 |
/// |------|------|
/// | `0x02`/`0x03`/`0x04` | 公開鍵そのもの |
/// | `0xff` | BIP32 拡張公開鍵 (78 バイト) + 導出インデックス 2 つ |
/// | `0xfe` | 旧形式キーストアのマスター公開鍵 (64 バイト) + 導出インデックス 2 つ |
/// | `0xfd` | アドレスに分類される出力スクリプト |
///
/// 等価性とハッシュは `to_bytes()` の生バイトで定義する。
#[derive(Clone)]
pub enum XPublicKey {
    PublicKey(PublicKey),
    Bip32 { xpub: Xpub, path: [u16; 2] },
    OldKeystore { mpk: [u8; 64], path: [u16; 2] },
    ScriptHash { script: ScriptBuf, destination: Destination },
}

/// `resolve()` の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedKey {
    PublicKey(PublicKey),
    Address(Destination),
}

fn read_path(raw: &[u8]) -> [u16; 2] {
    [
        u16::from_le_bytes([raw[0], raw[1]]),
        u16::from_le_bytes([raw[2], raw[3]]),
    ]
}

impl XPublicKey {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let kind = *raw
            .first()
            .ok_or_else(|| AppError::InvalidKey("空のバイト列".to_string()))?;
        let key = match kind {
            0x02 | 0x03 | 0x04 => XPublicKey::PublicKey(
                PublicKey::from_slice(raw).map_err(|e| AppError::InvalidKey(e.to_string()))?,
            ),
            0xff => {
                if raw.len() != BIP32_KEY_LEN {
                    return Err(AppError::InvalidKey(format!("BIP32参照の長さが不正: {}", raw.len())));
                }
                XPublicKey::Bip32 {
                    xpub: Xpub::decode(&raw[1..79])?,
                    path: read_path(&raw[79..83]),
                }
            }
            0xfe => {
                if raw.len() != OLD_KEYSTORE_KEY_LEN {
                    return Err(AppError::InvalidKey(format!("旧キーストア参照の長さが不正: {}", raw.len())));
                }
                let mut mpk = [0u8; 64];
                mpk.copy_from_slice(&raw[1..65]);
                XPublicKey::OldKeystore { mpk, path: read_path(&raw[65..69]) }
            }
            0xfd => XPublicKey::script_hash(ScriptBuf::from_bytes(raw[1..].to_vec()))?,
            other => {
                return Err(AppError::InvalidKey(format!("不明な種類: {:#04x}", other)));
            }
        };
        // 導出できない参照は構築時点で弾く
        key.resolve()?;
        Ok(key)
    }

    pub fn from_hex(text: &str) -> Result<Self> {
        Self::from_bytes(&hex::decode(text)?)
    }

    /// アドレスに分類される出力スクリプトから 0xfd 参照を作る
    pub fn script_hash(script: ScriptBuf) -> Result<Self> {
        match classify(&script) {
            ScriptClass::Address(destination) => Ok(XPublicKey::ScriptHash { script, destination }),
            _ => Err(AppError::InvalidKey(format!(
                "アドレスに分類できないスクリプト: {}",
                script.to_hex_string()
            ))),
        }
    }

    pub fn kind(&self) -> u8 {
        match self {
            XPublicKey::PublicKey(pk) => pk.to_bytes()[0],
            XPublicKey::Bip32 { .. } => 0xff,
            XPublicKey::OldKeystore { .. } => 0xfe,
            XPublicKey::ScriptHash { .. } => 0xfd,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            XPublicKey::PublicKey(pk) => pk.to_bytes(),
            XPublicKey::Bip32 { xpub, path } => {
                let mut raw = Vec::with_capacity(BIP32_KEY_LEN);
                raw.push(0xff);
                raw.extend_from_slice(&xpub.encode());
                raw.extend_from_slice(&path[0].to_le_bytes());
                raw.extend_from_slice(&path[1].to_le_bytes());
                raw
            }
            XPublicKey::OldKeystore { mpk, path } => {
                let mut raw = Vec::with_capacity(OLD_KEYSTORE_KEY_LEN);
                raw.push(0xfe);
                raw.extend_from_slice(mpk);
                raw.extend_from_slice(&path[0].to_le_bytes());
                raw.extend_from_slice(&path[1].to_le_bytes());
                raw
            }
            // 長さは付けず、スクリプトが末尾まで続く
            XPublicKey::ScriptHash { script, .. } => {
                let mut raw = Vec::with_capacity(1 + script.len());
                raw.push(0xfd);
                raw.extend_from_slice(script.as_bytes());
                raw
            }
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn bip32_extended_key_and_path(&self) -> Option<(String, [u16; 2])> {
        match self {
            XPublicKey::Bip32 { xpub, path } => Some((xpub.to_string(), *path)),
            _ => None,
        }
    }

    pub fn old_keystore_mpk_and_path(&self) -> Option<(&[u8; 64], [u16; 2])> {
        match self {
            XPublicKey::OldKeystore { mpk, path } => Some((mpk, *path)),
            _ => None,
        }
    }

    pub fn resolve(&self) -> Result<ResolvedKey> {
        match self {
            XPublicKey::PublicKey(pk) => Ok(ResolvedKey::PublicKey(*pk)),
            XPublicKey::Bip32 { xpub, path } => {
                let children = [
                    ChildNumber::from_normal_idx(path[0] as u32)?,
                    ChildNumber::from_normal_idx(path[1] as u32)?,
                ];
                let child = xpub.derive_pub(SECP256K1, &children)?;
                Ok(ResolvedKey::PublicKey(PublicKey::new(child.public_key)))
            }
            XPublicKey::OldKeystore { mpk, path } => {
                let mut uncompressed = [0u8; 65];
                uncompressed[0] = 0x04;
                uncompressed[1..].copy_from_slice(mpk);
                let master = secp256k1::PublicKey::from_slice(&uncompressed)?;

                // delta = sha256d("n1:n0:" || mpk)
                let mut preimage = format!("{}:{}:", path[1], path[0]).into_bytes();
                preimage.extend_from_slice(mpk);
                let delta = <sha256d::Hash as bitcoin::hashes::Hash>::hash(&preimage).to_byte_array();
                let tweak = Scalar::from_be_bytes(delta)
                    .map_err(|_| AppError::InvalidKey("旧キーストアの導出値が範囲外".to_string()))?;
                let child = master.add_exp_tweak(SECP256K1, &tweak)?;
                Ok(ResolvedKey::PublicKey(PublicKey { compressed: false, inner: child }))
            }
            XPublicKey::ScriptHash { destination, .. } => Ok(ResolvedKey::Address(*destination)),
        }
    }

    /// 公開鍵ならアドレスに変換する。元からアドレスならそのまま。
    pub fn to_address(&self) -> Result<Destination> {
        Ok(match self.resolve()? {
            ResolvedKey::PublicKey(pk) => Destination::for_public_key(&pk),
            ResolvedKey::Address(destination) => destination,
        })
    }

    pub fn to_public_key_hex(&self) -> Result<String> {
        Ok(match self.resolve()? {
            ResolvedKey::PublicKey(pk) => hex::encode(pk.to_bytes()),
            ResolvedKey::Address(destination) => destination.script_pubkey().to_hex_string(),
        })
    }

    pub fn is_compressed(&self) -> bool {
        match self {
            XPublicKey::PublicKey(pk) => pk.compressed,
            XPublicKey::OldKeystore { .. } => false,
            _ => true,
        }
    }

    pub fn script(&self) -> Option<&Script> {
        match self {
            XPublicKey::ScriptHash { script, .. } => Some(script),
            _ => None,
        }
    }
}

impl PartialEq for XPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for XPublicKey {}

impl Hash for XPublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl From<PublicKey> for XPublicKey {
    fn from(public_key: PublicKey) -> Self {
        XPublicKey::PublicKey(public_key)
    }
}

impl FromStr for XPublicKey {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl fmt::Display for XPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for XPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "XPublicKey('{}')", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Network;
    use std::collections::HashSet;

    const COMPRESSED: &str = "02d0de0aaeaefad02b8bdc8a01a1b8b11c696bd3d66a2c5f10780d95b7df42645c";
    const UNCOMPRESSED: &str = "04d0de0aaeaefad02b8bdc8a01a1b8b11c696bd3d66a2c5f10780d95b7df42645cd85228a6fb29940e858e7e55842ae2bd115d1ed7cc0e82d934e929c97648cb0a";
    const XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

    fn bip32_raw(path: [u16; 2]) -> Vec<u8> {
        let xpub: Xpub = XPUB.parse().unwrap();
        let mut raw = vec![0xff];
        raw.extend_from_slice(&xpub.encode());
        raw.extend_from_slice(&path[0].to_le_bytes());
        raw.extend_from_slice(&path[1].to_le_bytes());
        raw
    }

    #[test]
    fn plain_keys_resolve_to_themselves() {
        let compressed = XPublicKey::from_hex(COMPRESSED).unwrap();
        let uncompressed = XPublicKey::from_hex(UNCOMPRESSED).unwrap();
        assert!(compressed.is_compressed());
        assert!(!uncompressed.is_compressed());
        assert_eq!(compressed.to_hex(), COMPRESSED);
        assert_eq!(
            compressed.to_address().unwrap().to_address(Network::Bitcoin).unwrap().to_string(),
            "1LoVGDgRs9hTfTNJNuXKSpywcbdvwRXpmK"
        );
    }

    #[test]
    fn script_hash_kind_resolves_to_address() {
        let key = XPublicKey::from_hex("fd76a914d9351dcbad5b8f3b8bfa2f2cdc85c28118ca932688ac").unwrap();
        assert_eq!(key.kind(), 0xfd);
        let compressed = XPublicKey::from_hex(COMPRESSED).unwrap();
        assert_eq!(key.to_address().unwrap(), compressed.to_address().unwrap());
        assert!(matches!(key.resolve().unwrap(), ResolvedKey::Address(_)));
        assert_eq!(
            key.to_public_key_hex().unwrap(),
            "76a914d9351dcbad5b8f3b8bfa2f2cdc85c28118ca932688ac"
        );
    }

    #[test]
    fn script_hash_kind_rejects_non_address_scripts() {
        assert!(matches!(XPublicKey::from_hex("fd6a"), Err(AppError::InvalidKey(_))));
    }

    #[test]
    fn bip32_reference_derives_child() {
        let raw = bip32_raw([0, 5]);
        let key = XPublicKey::from_bytes(&raw).unwrap();
        assert_eq!(key.to_bytes(), raw);
        assert!(key.is_compressed());

        let xpub: Xpub = XPUB.parse().unwrap();
        let expected = xpub
            .derive_pub(
                SECP256K1,
                &[ChildNumber::from_normal_idx(0).unwrap(), ChildNumber::from_normal_idx(5).unwrap()],
            )
            .unwrap();
        assert_eq!(
            key.resolve().unwrap(),
            ResolvedKey::PublicKey(PublicKey::new(expected.public_key))
        );
        let (text, path) = key.bip32_extended_key_and_path().unwrap();
        assert_eq!(text, XPUB);
        assert_eq!(path, [0, 5]);
    }

    #[test]
    fn old_keystore_reference_adds_delta() {
        let master = hex::decode(&UNCOMPRESSED[2..]).unwrap();
        let mut raw = vec![0xfe];
        raw.extend_from_slice(&master);
        raw.extend_from_slice(&1u16.to_le_bytes());
        raw.extend_from_slice(&7u16.to_le_bytes());
        let key = XPublicKey::from_bytes(&raw).unwrap();
        assert!(!key.is_compressed());

        let mut preimage = b"7:1:".to_vec();
        preimage.extend_from_slice(&master);
        let delta = <sha256d::Hash as bitcoin::hashes::Hash>::hash(&preimage).to_byte_array();
        let base = secp256k1::PublicKey::from_slice(&hex::decode(UNCOMPRESSED).unwrap()).unwrap();
        let expected = base
            .add_exp_tweak(SECP256K1, &Scalar::from_be_bytes(delta).unwrap())
            .unwrap();
        match key.resolve().unwrap() {
            ResolvedKey::PublicKey(pk) => {
                assert!(!pk.compressed);
                assert_eq!(pk.inner, expected);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn wrong_lengths_are_rejected() {
        let mut raw = bip32_raw([0, 0]);
        raw.pop();
        assert!(matches!(XPublicKey::from_bytes(&raw), Err(AppError::InvalidKey(_))));
        assert!(XPublicKey::from_bytes(&[0xfe; 10]).is_err());
        assert!(XPublicKey::from_bytes(&[0x02; 10]).is_err());
        assert!(XPublicKey::from_bytes(&[]).is_err());
        assert!(XPublicKey::from_bytes(&[0x05; 33]).is_err());
    }

    #[test]
    fn equality_and_hash_follow_raw_bytes() {
        let a = XPublicKey::from_hex(COMPRESSED).unwrap();
        let b: XPublicKey = COMPRESSED.parse().unwrap();
        let c = XPublicKey::from_hex(UNCOMPRESSED).unwrap();
        let set: HashSet<XPublicKey> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
    }
}
