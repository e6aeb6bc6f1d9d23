use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_CHECKSIG, OP_PUSHNUM_1, OP_PUSHNUM_16};
use bitcoin::script::{Builder, Instruction, PushBytesBuf, Script, ScriptBuf};
use bitcoin::{Address, Network, PubkeyHash, PublicKey, ScriptHash};

use crate::error::{AppError, Result};

/// ネットワークに依存しない支払先 (P2PKH / P2SH)。
/// アドレス文字列が必要になった時点で `to_address` にネットワークを渡す。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    PubkeyHash(PubkeyHash),
    ScriptHash(ScriptHash),
}

impl Destination {
    pub fn script_pubkey(&self) -> ScriptBuf {
        match self {
            Destination::PubkeyHash(hash) => ScriptBuf::new_p2pkh(hash),
            Destination::ScriptHash(hash) => ScriptBuf::new_p2sh(hash),
        }
    }

    pub fn to_address(&self, network: Network) -> Result<Address> {
        Address::from_script(&self.script_pubkey(), network)
            .map_err(|e| AppError::InputValidation(format!("アドレス変換に失敗: {}", e)))
    }

    pub fn for_public_key(public_key: &PublicKey) -> Self {
        Destination::PubkeyHash(public_key.pubkey_hash())
    }

    pub fn for_redeem_script(redeem_script: &Script) -> Self {
        Destination::ScriptHash(redeem_script.script_hash())
    }
}

/// 出力スクリプトの分類結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptClass {
    Address(Destination),
    P2pk(PublicKey),
    Unknown,
}

pub fn classify(script: &Script) -> ScriptClass {
    let bytes = script.as_bytes();
    if script.is_p2pkh() {
        // OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes[3..23]);
        return ScriptClass::Address(Destination::PubkeyHash(PubkeyHash::from_byte_array(hash)));
    }
    if script.is_p2sh() {
        // OP_HASH160 <20> OP_EQUAL
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes[2..22]);
        return ScriptClass::Address(Destination::ScriptHash(ScriptHash::from_byte_array(hash)));
    }
    match p2pk_public_key(script) {
        Some(public_key) => ScriptClass::P2pk(public_key),
        None => ScriptClass::Unknown,
    }
}

fn p2pk_public_key(script: &Script) -> Option<PublicKey> {
    let ops = script.instructions().collect::<std::result::Result<Vec<_>, _>>().ok()?;
    match ops.as_slice() {
        [Instruction::PushBytes(key), Instruction::Op(op)] if *op == OP_CHECKSIG => {
            PublicKey::from_slice(key.as_bytes()).ok()
        }
        _ => None,
    }
}

pub fn p2pk_script(public_key: &PublicKey) -> ScriptBuf {
    Builder::new()
        .push_key(public_key)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

pub fn to_push_bytes(data: &[u8]) -> Result<PushBytesBuf> {
    PushBytesBuf::try_from(data.to_vec())
        .map_err(|_| AppError::TransactionBuild(format!("プッシュできないデータ長です: {}", data.len())))
}

/// スクリプトにデータプッシュを追加する (長さに応じた最小のプッシュ命令)
pub fn push_data(script: &mut ScriptBuf, data: &[u8]) -> Result<()> {
    script.push_slice(to_push_bytes(data)?);
    Ok(())
}

/// OP_m <key>... OP_n OP_CHECKMULTISIG
pub fn multisig_script<K: AsRef<[u8]>>(keys: &[K], threshold: usize) -> Result<ScriptBuf> {
    if threshold < 1 || threshold > keys.len() {
        return Err(AppError::InvalidThreshold { threshold, keys: keys.len() });
    }
    let mut builder = Builder::new().push_int(threshold as i64);
    for key in keys {
        builder = builder.push_slice(to_push_bytes(key.as_ref())?);
    }
    Ok(builder
        .push_int(keys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script())
}

fn small_int(instruction: &Instruction<'_>) -> Option<usize> {
    match instruction {
        Instruction::Op(op) => {
            let code = op.to_u8();
            if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&code) {
                Some((code - OP_PUSHNUM_1.to_u8() + 1) as usize)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// 空でないデータプッシュならその中身を返す (OP_0 は含まない)
pub(crate) fn data_push<'a>(instruction: Instruction<'a>) -> Option<&'a [u8]> {
    match instruction {
        Instruction::PushBytes(bytes) if !bytes.is_empty() => Some(bytes.as_bytes()),
        _ => None,
    }
}

/// m-of-n のリディームスクリプトなら (m, 公開鍵バイト列) を返す
pub fn parse_multisig_redeem(script: &Script) -> Option<(usize, Vec<Vec<u8>>)> {
    let ops = script.instructions().collect::<std::result::Result<Vec<_>, _>>().ok()?;
    if ops.len() < 4 {
        return None;
    }
    let m = small_int(&ops[0])?;
    let n = small_int(&ops[ops.len() - 2])?;
    match ops[ops.len() - 1] {
        Instruction::Op(op) if op == OP_CHECKMULTISIG => {}
        _ => return None,
    }
    let keys = ops[1..ops.len() - 2]
        .iter()
        .map(|op| data_push(*op).map(<[u8]>::to_vec))
        .collect::<Option<Vec<_>>>()?;
    if keys.len() != n || m > n {
        return None;
    }
    Some((m, keys))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: u8) -> Vec<u8> {
        let mut k = vec![0x02];
        k.extend(std::iter::repeat(i).take(32));
        k
    }

    #[test]
    fn multisig_round_trip_for_all_thresholds() {
        for n in 1..=15usize {
            let keys: Vec<Vec<u8>> = (0..n as u8).map(key).collect();
            for m in 1..=n {
                let script = multisig_script(&keys, m).unwrap();
                let (parsed_m, parsed_keys) = parse_multisig_redeem(&script).unwrap();
                assert_eq!(parsed_m, m);
                assert_eq!(parsed_keys, keys);
            }
        }
    }

    #[test]
    fn multisig_threshold_out_of_range() {
        let keys = vec![key(1), key(2)];
        assert!(matches!(multisig_script(&keys, 0), Err(AppError::InvalidThreshold { .. })));
        assert!(matches!(multisig_script(&keys, 3), Err(AppError::InvalidThreshold { .. })));
    }

    #[test]
    fn classify_standard_scripts() {
        let p2pkh = ScriptBuf::from_bytes(
            hex::decode("76a914d9351dcbad5b8f3b8bfa2f2cdc85c28118ca932688ac").unwrap(),
        );
        match classify(&p2pkh) {
            ScriptClass::Address(dest @ Destination::PubkeyHash(_)) => {
                assert_eq!(
                    dest.to_address(Network::Bitcoin).unwrap().to_string(),
                    "1LoVGDgRs9hTfTNJNuXKSpywcbdvwRXpmK"
                );
                assert_eq!(dest.script_pubkey(), p2pkh);
            }
            other => panic!("unexpected class {:?}", other),
        }

        let pk = PublicKey::from_slice(
            &hex::decode("02d0de0aaeaefad02b8bdc8a01a1b8b11c696bd3d66a2c5f10780d95b7df42645c").unwrap(),
        )
        .unwrap();
        assert_eq!(classify(&p2pk_script(&pk)), ScriptClass::P2pk(pk));

        let redeem = multisig_script(&[key(1), key(2)], 1).unwrap();
        let p2sh = Destination::for_redeem_script(&redeem).script_pubkey();
        assert!(matches!(classify(&p2sh), ScriptClass::Address(Destination::ScriptHash(_))));

        assert_eq!(classify(&redeem), ScriptClass::Unknown);
    }

    #[test]
    fn redeem_parse_rejects_other_scripts() {
        let not_multisig = ScriptBuf::from_bytes(vec![0x51, 0x51, 0xae]);
        assert!(parse_multisig_redeem(&not_multisig).is_none());
    }
}
