use std::collections::HashMap;

use bitcoin::consensus::encode::{serialize, VarInt};
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::script::ScriptBuf;
use bitcoin::PublicKey;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId, Signature};
use secp256k1::{All, Message, Secp256k1, SecretKey};

use crate::error::{AppError, Result};
use crate::keys::{ResolvedKey, XPublicKey};
use crate::script::{multisig_script, p2pk_script};
use crate::transaction::Transaction;
use crate::types::{ScriptKind, TxInput};

const SIGHASH_ALL: u8 = 0x01;
const SIGHASH_FORKID: u8 = 0x40;

/// 署名者参照 -> (秘密鍵, 圧縮公開鍵を使うか)
pub type KeyPairs = HashMap<XPublicKey, (SecretKey, bool)>;

pub fn n_hash_type() -> u8 {
    SIGHASH_ALL | SIGHASH_FORKID
}

fn resolved_public_key(x_pubkey: &XPublicKey) -> Result<PublicKey> {
    match x_pubkey.resolve()? {
        ResolvedKey::PublicKey(public_key) => Ok(public_key),
        ResolvedKey::Address(_) => Err(AppError::InvalidKey(format!(
            "公開鍵に解決できない参照です: {}",
            x_pubkey
        ))),
    }
}

/// 署名ハッシュに含めるスクリプト
pub fn preimage_script(input: &TxInput, input_index: usize) -> Result<ScriptBuf> {
    let missing = || AppError::ScriptCodeMissing { input_index };
    match &input.kind {
        ScriptKind::P2pkh => {
            let destination = match input.address {
                Some(destination) => destination,
                None => input.x_pubkeys.first().ok_or_else(missing)?.to_address()?,
            };
            Ok(destination.script_pubkey())
        }
        ScriptKind::P2shMultisig => {
            let keys = input
                .x_pubkeys
                .iter()
                .map(|x_pubkey| -> Result<Vec<u8>> { Ok(resolved_public_key(x_pubkey)?.to_bytes()) })
                .collect::<Result<Vec<_>>>()?;
            multisig_script(&keys, input.threshold)
        }
        ScriptKind::P2pk => {
            let x_pubkey = input.x_pubkeys.first().ok_or_else(missing)?;
            Ok(p2pk_script(&resolved_public_key(x_pubkey)?))
        }
        ScriptKind::Unknown { script_code, .. } => script_code.clone().ok_or_else(missing),
        ScriptKind::Coinbase { .. } => Err(missing()),
    }
}

fn hash_concat(parts: impl Iterator<Item = Vec<u8>>) -> [u8; 32] {
    let joined: Vec<u8> = parts.flatten().collect();
    sha256d::Hash::hash(&joined).to_byte_array()
}

fn outpoint_bytes(input: &TxInput) -> Vec<u8> {
    let mut out = serialize(&input.prev_txid);
    out.extend_from_slice(&input.prev_index.to_le_bytes());
    out
}

/// 入力 `input_index` の署名対象バイト列。
/// 他の入力の署名状態には依存しない。
pub fn serialize_preimage(tx: &Transaction, input_index: usize) -> Result<Vec<u8>> {
    let input = tx
        .inputs
        .get(input_index)
        .ok_or_else(|| AppError::InputValidation(format!("入力 {} は存在しません", input_index)))?;

    let hash_prevouts = hash_concat(tx.inputs.iter().map(outpoint_bytes));
    let hash_sequence = hash_concat(tx.inputs.iter().map(|i| i.sequence.to_le_bytes().to_vec()));
    let hash_outputs = hash_concat(tx.outputs.iter().map(serialize));
    let script_code = preimage_script(input, input_index)?;
    let value = input.value.ok_or(AppError::InputValueMissing { input_index })?;

    let mut preimage = Vec::with_capacity(156 + script_code.len());
    preimage.extend_from_slice(&tx.version.to_le_bytes());
    preimage.extend_from_slice(&hash_prevouts);
    preimage.extend_from_slice(&hash_sequence);
    preimage.extend_from_slice(&outpoint_bytes(input));
    preimage.extend_from_slice(&serialize(&VarInt(script_code.len() as u64)));
    preimage.extend_from_slice(script_code.as_bytes());
    preimage.extend_from_slice(&value.to_le_bytes());
    preimage.extend_from_slice(&input.sequence.to_le_bytes());
    preimage.extend_from_slice(&hash_outputs);
    preimage.extend_from_slice(&tx.locktime.to_le_bytes());
    preimage.extend_from_slice(&(n_hash_type() as u32).to_le_bytes());
    Ok(preimage)
}

pub fn preimage_hash(tx: &Transaction, input_index: usize) -> Result<[u8; 32]> {
    let preimage = serialize_preimage(tx, input_index)?;
    Ok(sha256d::Hash::hash(&preimage).to_byte_array())
}

fn sign_input(tx: &Transaction, input_index: usize, secret: &SecretKey, secp: &Secp256k1<All>) -> Result<Vec<u8>> {
    let message = Message::from_digest(preimage_hash(tx, input_index)?);
    let signature = secp.sign_ecdsa(&message, secret);
    let mut bytes = signature.serialize_der().to_vec();
    bytes.push(n_hash_type());
    Ok(bytes)
}

/// 署名スロットは宣言済みの公開鍵と同じ数だけ必要
fn check_slots(input: &TxInput, input_index: usize) -> Result<()> {
    if input.signatures.len() < input.x_pubkeys.len() {
        return Err(AppError::SignatureSlotMismatch {
            input_index,
            slots: input.signatures.len(),
            keys: input.x_pubkeys.len(),
        });
    }
    Ok(())
}

/// 手元の秘密鍵で空いている署名スロットを埋める。
/// 旧キーストア参照やスクリプト参照で署名した場合は、その位置の鍵を解決済みの公開鍵に置き換える。
pub fn sign(tx: &mut Transaction, keypairs: &KeyPairs, secp: &Secp256k1<All>) -> Result<()> {
    log::info!("トランザクション署名処理を開始します。");
    for input_index in 0..tx.inputs.len() {
        for slot in 0..tx.inputs[input_index].x_pubkeys.len() {
            let input = &tx.inputs[input_index];
            if input.is_complete() {
                break;
            }
            if input.signatures.get(slot).is_some_and(Option::is_some) {
                continue;
            }
            let x_pubkey = &input.x_pubkeys[slot];
            let Some((secret, compressed)) = keypairs.get(x_pubkey).copied() else {
                continue;
            };
            check_slots(input, input_index)?;
            log::debug!("入力 {} のスロット {} に署名します: {}", input_index, slot, x_pubkey);
            let replace_key = matches!(x_pubkey, XPublicKey::OldKeystore { .. } | XPublicKey::ScriptHash { .. });

            let signature = sign_input(tx, input_index, &secret, secp)?;
            let input = &mut tx.inputs[input_index];
            if let Some(target) = input.signatures.get_mut(slot) {
                *target = Some(signature);
            }
            if replace_key {
                let public_key = PublicKey { compressed, inner: secret.public_key(secp) };
                input.x_pubkeys[slot] = XPublicKey::PublicKey(public_key);
            }
        }
    }
    log::debug!("is_complete {}", tx.is_complete());
    tx.refresh_raw()
}

/// 秘密鍵を持たない署名者 (ハードウェア等) が返した DER 署名を取り込む。
/// `signatures[i]` は入力 i 向けで、sighash バイトは付かない。
/// 照合は low-S に正規化した署名で行い、保存するのは渡された DER そのもの。
/// どの宣言済み公開鍵にも一致しなかった入力は署名せずに残し、その数を返す。
pub fn update_signatures(tx: &mut Transaction, signatures: &[Vec<u8>], secp: &Secp256k1<All>) -> Result<usize> {
    if tx.is_complete() {
        return Ok(0);
    }
    if tx.inputs.len() != signatures.len() {
        return Err(AppError::SignatureCountMismatch {
            expected: tx.inputs.len(),
            actual: signatures.len(),
        });
    }

    let mut unmatched = 0;
    for (input_index, der) in signatures.iter().enumerate() {
        let mut signature = match Signature::from_der(der) {
            Ok(signature) => signature,
            Err(e) => {
                log::warn!("入力 {} の署名をDERとして解釈できません: {}", input_index, e);
                unmatched += 1;
                continue;
            }
        };
        signature.normalize_s();
        let mut sig_bytes = der.clone();
        sig_bytes.push(n_hash_type());
        if tx.inputs[input_index].present_signatures().any(|sig| sig == sig_bytes.as_slice()) {
            continue;
        }
        check_slots(&tx.inputs[input_index], input_index)?;

        let public_keys: Vec<Option<secp256k1::PublicKey>> = tx.inputs[input_index]
            .x_pubkeys
            .iter()
            .map(|x_pubkey| resolved_public_key(x_pubkey).ok().map(|pk| pk.inner))
            .collect();
        let message = Message::from_digest(preimage_hash(tx, input_index)?);
        let compact = signature.serialize_compact();

        let mut matched = None;
        for recid in 0..4 {
            // recid によっては曲線上の点にならない
            let Ok(id) = RecoveryId::from_i32(recid) else { continue };
            let Ok(recoverable) = RecoverableSignature::from_compact(&compact, id) else { continue };
            let Ok(candidate) = secp.recover_ecdsa(&message, &recoverable) else { continue };
            let Some(slot) = public_keys.iter().position(|pk| *pk == Some(candidate)) else {
                continue;
            };
            if secp.verify_ecdsa(&message, &signature, &candidate).is_ok() {
                matched = Some(slot);
                break;
            }
        }

        match matched {
            Some(slot) => {
                log::debug!("入力 {} のスロット {} に署名を追加します", input_index, slot);
                if let Some(target) = tx.inputs[input_index].signatures.get_mut(slot) {
                    *target = Some(sig_bytes);
                }
            }
            None => {
                log::warn!("入力 {} の署名に一致する公開鍵がありません", input_index);
                unmatched += 1;
            }
        }
    }
    tx.refresh_raw()?;
    Ok(unmatched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{Amount, Txid};
    use secp256k1::SECP256K1;

    use crate::types::TxOut;

    const SECRET: &str = "0c28fca386c7a227600b2fe50b7cae11ec86d3bf1fbe471be89827e19d72aa1d";
    const PUBKEY: &str = "02d0de0aaeaefad02b8bdc8a01a1b8b11c696bd3d66a2c5f10780d95b7df42645c";
    const SIGNATURE: &str = "3044022013586abc2c66896d53929fabc4a014755d3bfaf896d8b2410da5dad4a993cef802207e87e55cedfa78e00ac470de5609335ef8e336ae9e1a9a251b6d01546b6e314341";

    fn secp() -> Secp256k1<All> {
        Secp256k1::new()
    }

    fn secret() -> SecretKey {
        SecretKey::from_slice(&hex::decode(SECRET).unwrap()).unwrap()
    }

    fn prev_txid() -> Txid {
        "bcf7ae875b585e00a61055372c1e99046b20f5fbfcd8659959afb6f428326bfa".parse().unwrap()
    }

    fn output(value: u64) -> TxOut {
        TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::from_bytes(
                hex::decode("76a914cb3e86e38ce37d5add87d3da753adc04a04bf60c88ac").unwrap(),
            ),
        }
    }

    fn sweep_tx(x_pubkey: XPublicKey) -> Transaction {
        let input = TxInput::p2pkh(prev_txid(), 1, x_pubkey, 18_043_706).with_sequence(0xffff_ffff);
        Transaction::from_io(vec![input], vec![output(18_043_206)], 0)
    }

    #[test]
    fn hash_type_has_forkid() {
        assert_eq!(n_hash_type(), 0x41);
    }

    #[test]
    fn preimage_hash_matches_fixture() {
        let tx = sweep_tx(XPublicKey::from_hex(PUBKEY).unwrap());
        assert_eq!(
            hex::encode(preimage_hash(&tx, 0).unwrap()),
            "425fbca0f5a83604bf8189976a778c189f5d42e764622fe91bf07f0c53f21527"
        );
    }

    #[test]
    fn preimage_requires_value() {
        let mut tx = sweep_tx(XPublicKey::from_hex(PUBKEY).unwrap());
        tx.inputs[0].value = None;
        assert!(matches!(preimage_hash(&tx, 0), Err(AppError::InputValueMissing { input_index: 0 })));
    }

    #[test]
    fn preimage_is_independent_of_other_inputs_signatures() {
        let key = XPublicKey::from_hex(PUBKEY).unwrap();
        let mut tx = Transaction::from_io(
            vec![
                TxInput::p2pkh(prev_txid(), 0, key.clone(), 1000),
                TxInput::p2pkh(prev_txid(), 1, key, 2000),
            ],
            vec![output(2500)],
            0,
        );
        let before = preimage_hash(&tx, 1).unwrap();
        tx.add_signature(0, 0, vec![0x30, 0x41]).unwrap();
        assert_eq!(preimage_hash(&tx, 1).unwrap(), before);

        tx.outputs[0].value = Amount::from_sat(2400);
        assert_ne!(preimage_hash(&tx, 1).unwrap(), before);
    }

    #[test]
    fn sign_fills_slot_deterministically() {
        let mut tx = sweep_tx(XPublicKey::from_hex(PUBKEY).unwrap());
        let mut keypairs = KeyPairs::new();
        keypairs.insert(XPublicKey::from_hex(PUBKEY).unwrap(), (secret(), true));
        sign(&mut tx, &keypairs, &secp()).unwrap();

        assert!(tx.is_complete());
        assert_eq!(tx.inputs()[0].signatures[0].as_deref(), Some(hex::decode(SIGNATURE).unwrap().as_slice()));
        assert_eq!(
            tx.txid().unwrap().unwrap().to_string(),
            "a8c0d64270b0c4438a76d35bf022abae9d8a116746cefd741940e7b48aed98bd"
        );
        assert_eq!(tx.raw(), Some(tx.serialize(false).unwrap().as_str()));
    }

    #[test]
    fn signing_script_reference_replaces_key() {
        let reference = XPublicKey::from_hex("fd76a914d9351dcbad5b8f3b8bfa2f2cdc85c28118ca932688ac").unwrap();
        let mut tx = sweep_tx(reference.clone());
        let mut keypairs = KeyPairs::new();
        keypairs.insert(reference, (secret(), true));
        sign(&mut tx, &keypairs, &secp()).unwrap();

        assert_eq!(tx.inputs()[0].x_pubkeys[0].to_hex(), PUBKEY);
        assert_eq!(
            tx.txid().unwrap().unwrap().to_string(),
            "a8c0d64270b0c4438a76d35bf022abae9d8a116746cefd741940e7b48aed98bd"
        );
    }

    #[test]
    fn signing_old_keystore_reference_realises_key() {
        let master = SecretKey::from_slice(&[0x33; 32]).unwrap();
        let mut mpk = [0u8; 64];
        mpk.copy_from_slice(&master.public_key(SECP256K1).serialize_uncompressed()[1..]);
        let mut raw = vec![0xfe];
        raw.extend_from_slice(&mpk);
        raw.extend_from_slice(&0u16.to_le_bytes());
        raw.extend_from_slice(&4u16.to_le_bytes());
        let reference = XPublicKey::from_bytes(&raw).unwrap();

        let mut preimage = b"4:0:".to_vec();
        preimage.extend_from_slice(&mpk);
        let delta = sha256d::Hash::hash(&preimage).to_byte_array();
        let child = master.add_tweak(&secp256k1::Scalar::from_be_bytes(delta).unwrap()).unwrap();

        let unsigned = sweep_tx(reference.clone());
        let mut tx = Transaction::from_hex(&unsigned.to_hex().unwrap()).unwrap();
        assert_eq!(tx.inputs()[0].x_pubkeys[0].kind(), 0xfe);
        assert_eq!(tx, unsigned);

        sign(&mut tx, &KeyPairs::from([(reference.clone(), (child, false))]), &secp()).unwrap();
        let signed_key = &tx.inputs()[0].x_pubkeys[0];
        assert_eq!(signed_key.kind(), 0x04);
        assert_eq!(signed_key.resolve().unwrap(), reference.resolve().unwrap());

        let parsed = Transaction::from_hex(&tx.to_hex().unwrap()).unwrap();
        assert!(parsed.is_complete());
        assert_eq!(parsed.inputs()[0].x_pubkeys[0].kind(), 0x04);
        assert_eq!(parsed.txid().unwrap(), tx.txid().unwrap());
    }

    #[test]
    fn missing_signature_slot_is_an_error() {
        let mut tx = sweep_tx(XPublicKey::from_hex(PUBKEY).unwrap());
        tx.inputs[0].signatures.clear();
        let keypairs = KeyPairs::from([(XPublicKey::from_hex(PUBKEY).unwrap(), (secret(), true))]);
        assert!(matches!(
            sign(&mut tx, &keypairs, &secp()),
            Err(AppError::SignatureSlotMismatch { input_index: 0, slots: 0, keys: 1 })
        ));

        let mut tx = multisig_tx();
        let (_, b) = multisig_secrets();
        let der = external_signature(&tx, &b);
        tx.inputs[0].signatures.truncate(1);
        assert!(matches!(
            update_signatures(&mut tx, &[der], &secp()),
            Err(AppError::SignatureSlotMismatch { input_index: 0, slots: 1, keys: 2 })
        ));
    }

    #[test]
    fn unknown_signer_leaves_input_unsigned() {
        let mut tx = sweep_tx(XPublicKey::from_hex(PUBKEY).unwrap());
        sign(&mut tx, &KeyPairs::new(), &secp()).unwrap();
        assert!(!tx.is_complete());
        assert_eq!(tx.signature_count(), (0, 1));
    }

    fn multisig_secrets() -> (SecretKey, SecretKey) {
        (
            SecretKey::from_slice(&[0x11; 32]).unwrap(),
            SecretKey::from_slice(&[0x22; 32]).unwrap(),
        )
    }

    fn multisig_tx() -> Transaction {
        let (a, b) = multisig_secrets();
        let keys = vec![
            XPublicKey::PublicKey(PublicKey::new(a.public_key(SECP256K1))),
            XPublicKey::PublicKey(PublicKey::new(b.public_key(SECP256K1))),
        ];
        let input = TxInput::multisig(prev_txid(), 0, keys, 2, 50_000).unwrap();
        Transaction::from_io(vec![input], vec![output(49_000)], 0)
    }

    #[test]
    fn multisig_collects_signatures_from_two_signers() {
        let (a, b) = multisig_secrets();
        let mut tx = multisig_tx();
        let key_b = tx.inputs()[0].x_pubkeys[1].clone();
        let key_a = tx.inputs()[0].x_pubkeys[0].clone();

        sign(&mut tx, &KeyPairs::from([(key_b, (b, true))]), &secp()).unwrap();
        assert_eq!(tx.signature_count(), (1, 2));
        assert!(tx.inputs()[0].signatures[0].is_none());

        // 部分署名のまま受け渡して、もう一方が署名する
        let mut relayed = Transaction::from_hex(&tx.to_hex().unwrap()).unwrap();
        assert_eq!(relayed, tx);
        sign(&mut relayed, &KeyPairs::from([(key_a, (a, true))]), &secp()).unwrap();
        assert!(relayed.is_complete());

        let parsed = Transaction::from_hex(&relayed.to_hex().unwrap()).unwrap();
        assert!(parsed.is_complete());
        assert_eq!(parsed, relayed);
        assert_eq!(parsed.txid().unwrap(), relayed.txid().unwrap());
    }

    fn external_signature(tx: &Transaction, secret: &SecretKey) -> Vec<u8> {
        let message = Message::from_digest(preimage_hash(tx, 0).unwrap());
        secp().sign_ecdsa(&message, secret).serialize_der().to_vec()
    }

    #[test]
    fn update_signatures_recovers_signer_slot() {
        let (_, b) = multisig_secrets();
        let mut tx = multisig_tx();
        let der = external_signature(&tx, &b);
        assert_eq!(update_signatures(&mut tx, &[der.clone()], &secp()).unwrap(), 0);
        assert!(tx.inputs()[0].signatures[0].is_none());
        let mut expected = der;
        expected.push(0x41);
        assert_eq!(tx.inputs()[0].signatures[1], Some(expected));
    }

    #[test]
    fn update_signatures_keeps_supplied_encoding() {
        let (_, b) = multisig_secrets();
        let mut tx = multisig_tx();
        let low = Signature::from_der(&external_signature(&tx, &b)).unwrap().serialize_compact();
        // s を n - s にして high-S 版を作る
        let high_s = SecretKey::from_slice(&low[32..]).unwrap().negate();
        let mut compact = low;
        compact[32..].copy_from_slice(&high_s.secret_bytes());
        let der = Signature::from_compact(&compact).unwrap().serialize_der().to_vec();

        assert_eq!(update_signatures(&mut tx, &[der.clone()], &secp()).unwrap(), 0);
        let mut expected = der;
        expected.push(0x41);
        assert_eq!(tx.inputs()[0].signatures[1], Some(expected));
    }

    #[test]
    fn update_signatures_skips_foreign_signatures() {
        let mut tx = multisig_tx();
        let der = external_signature(&tx, &secret());
        assert_eq!(update_signatures(&mut tx, &[der], &secp()).unwrap(), 1);
        assert_eq!(tx.signature_count(), (0, 2));
        assert_eq!(update_signatures(&mut tx, &[vec![0x30, 0x00]], &secp()).unwrap(), 1);
    }

    #[test]
    fn update_signatures_checks_count_and_completion() {
        let mut tx = multisig_tx();
        assert!(matches!(
            update_signatures(&mut tx, &[], &secp()),
            Err(AppError::SignatureCountMismatch { expected: 1, actual: 0 })
        ));

        let mut signed = sweep_tx(XPublicKey::from_hex(PUBKEY).unwrap());
        sign(&mut signed, &KeyPairs::from([(XPublicKey::from_hex(PUBKEY).unwrap(), (secret(), true))]), &secp())
            .unwrap();
        let before = signed.clone();
        assert_eq!(update_signatures(&mut signed, &[], &secp()).unwrap(), 0);
        assert_eq!(signed.inputs()[0].signatures, before.inputs()[0].signatures);
    }
}
