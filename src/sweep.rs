use std::str::FromStr;

use bitcoin::{Address, Amount, Network as BitcoinNetwork, PrivateKey, PublicKey, ScriptBuf, TxOut, Txid};
use secp256k1::{All, Secp256k1};

use crate::config::InputConfig;
use crate::error::{AppError, Result};
use crate::keys::XPublicKey;
use crate::script::{classify, Destination, ScriptClass};
use crate::signing::{self, KeyPairs};
use crate::transaction::Transaction;
use crate::types::TxInput;

// Bitcoin Coreのデフォルトダスト閾値 (P2PKH出力に対して)
const DUST_THRESHOLD_SATS: u64 = 546;

/// 秘密鍵1つに対応しうる署名者参照をすべて列挙する。
/// 非圧縮/圧縮の公開鍵と、それぞれの P2PKH スクリプト参照 (0xfd)。
pub fn keypairs_for_private_key(private_key: &PrivateKey, secp: &Secp256k1<All>) -> Result<KeyPairs> {
    let secret = private_key.inner;
    let inner = secret.public_key(secp);
    let mut keypairs = KeyPairs::new();
    for compressed in [false, true] {
        let public_key = PublicKey { compressed, inner };
        keypairs.insert(XPublicKey::PublicKey(public_key), (secret, compressed));
        let script = Destination::for_public_key(&public_key).script_pubkey();
        keypairs.insert(XPublicKey::script_hash(script)?, (secret, compressed));
    }
    Ok(keypairs)
}

fn parse_address(text: &str, network: BitcoinNetwork) -> Result<Address> {
    Address::from_str(text)
        .and_then(|addr| addr.require_network(network))
        .map_err(|e| AppError::InputValidation(format!("アドレス形式エラーまたはネットワーク不整合 ({}): {}", text, e)))
}

/// 送金リクエストから P2PKH/P2PK の UTXO を使うトランザクションを組み立てて署名する
pub fn create_and_sign_transaction(
    config: InputConfig,
    cli_network: BitcoinNetwork,
    secp: &Secp256k1<All>,
) -> Result<Transaction> {
    log::info!("トランザクション構築処理を開始します。");

    // 1. UTXO の検証と入力への変換
    let mut keypairs = KeyPairs::new();
    let mut inputs = Vec::new();
    let mut total_input_value_sats = 0;

    for utxo_input in config.utxos.iter() {
        let private_key = PrivateKey::from_wif(&utxo_input.private_key_wif)?;
        if private_key.network != cli_network.into() {
            return Err(AppError::NetworkMismatch {
                cli_network: format!("{:?}", cli_network),
                inferred_network: format!("{:?}", private_key.network),
            });
        }
        let utxo_keypairs = keypairs_for_private_key(&private_key, secp)?;

        let txid = Txid::from_str(&utxo_input.txid)
            .map_err(|e| AppError::InputValidation(format!("無効なTXID形式 ({}): {}", utxo_input.txid, e)))?;
        let script_pubkey_bytes = hex::decode(&utxo_input.script_pubkey_hex)
            .map_err(|e| AppError::InputValidation(format!("scriptPubKeyHexのデコード失敗: {}", e)))?;
        let script_pubkey = ScriptBuf::from_bytes(script_pubkey_bytes);

        let input = match classify(&script_pubkey) {
            ScriptClass::Address(Destination::PubkeyHash(_)) => {
                let x_pubkey = XPublicKey::script_hash(script_pubkey.clone())?;
                TxInput::p2pkh(txid, utxo_input.vout, x_pubkey, utxo_input.value_sats)
            }
            ScriptClass::P2pk(public_key) => {
                TxInput::p2pk(txid, utxo_input.vout, XPublicKey::PublicKey(public_key), utxo_input.value_sats)
            }
            _ => {
                return Err(AppError::UnknownScriptType { script_hex: script_pubkey.to_hex_string() });
            }
        };
        if !utxo_keypairs.contains_key(&input.x_pubkeys[0]) {
            return Err(AppError::InputValidation(format!(
                "秘密鍵が scriptPubKey と一致しません (txid={}, vout={})",
                utxo_input.txid, utxo_input.vout
            )));
        }

        let sequence = utxo_input.sequence.or(config.default_sequence).unwrap_or(u32::MAX);
        inputs.push(input.with_sequence(sequence));
        keypairs.extend(utxo_keypairs);
        total_input_value_sats += utxo_input.value_sats;
        log::debug!(
            "処理済みUTXO追加: txid={}, vout={}, value={}",
            utxo_input.txid, utxo_input.vout, utxo_input.value_sats
        );
    }

    // 2. 受信者出力の作成
    let mut outputs: Vec<TxOut> = Vec::new();
    let mut total_recipient_output_value_sats = 0;
    for output_def in config.outputs.iter() {
        let address = parse_address(&output_def.address, cli_network)?;
        outputs.push(TxOut {
            value: Amount::from_sat(output_def.value_sats),
            script_pubkey: address.script_pubkey(),
        });
        total_recipient_output_value_sats += output_def.value_sats;
        log::debug!("受信者出力追加: address={}, value={}", output_def.address, output_def.value_sats);
    }

    // 3. 手数料計算とおつり処理 (おつり出力込みで見積もる)
    let change_address = parse_address(&config.change_address, cli_network)?;
    let locktime = config.locktime.unwrap_or(0);
    let mut sizing_outputs = outputs.clone();
    sizing_outputs.push(TxOut { value: Amount::ZERO, script_pubkey: change_address.script_pubkey() });
    let sizing_tx = Transaction::from_io(inputs.clone(), sizing_outputs, locktime);

    let estimated_size = sizing_tx.estimated_size()? as u64;
    let total_fee_sats = estimated_size * config.fee_rate_sats_per_byte;
    log::debug!(
        "推定サイズ: {} bytes, 手数料率: {} sats/byte, 計算された手数料: {} sats",
        estimated_size, config.fee_rate_sats_per_byte, total_fee_sats
    );

    let required = total_recipient_output_value_sats + total_fee_sats;
    if total_input_value_sats < required {
        return Err(AppError::InsufficientFunds {
            available: total_input_value_sats,
            required,
            fee: total_fee_sats,
        });
    }

    let change_value_sats = total_input_value_sats - required;
    if change_value_sats >= DUST_THRESHOLD_SATS {
        log::debug!("おつり発生: {} sats, おつりアドレス: {}", change_value_sats, change_address);
        outputs.push(TxOut {
            value: Amount::from_sat(change_value_sats),
            script_pubkey: change_address.script_pubkey(),
        });
    } else if change_value_sats > 0 {
        log::warn!(
            "おつり {} sats はダスト閾値 {} sats 未満のため手数料に含めます。",
            change_value_sats, DUST_THRESHOLD_SATS
        );
    }

    // 4. 署名
    let mut transaction = Transaction::from_io(inputs, outputs, locktime);
    signing::sign(&mut transaction, &keypairs, secp)?;
    if !transaction.is_complete() {
        let (present, required) = transaction.signature_count();
        return Err(AppError::TransactionBuild(format!(
            "署名が揃っていません ({} / {})",
            present, required
        )));
    }
    log::info!("全ての入力の署名が完了しました。");
    Ok(transaction)
}
