use bitcoin::consensus::encode::{serialize, Decodable, VarInt};
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::opcodes::OP_0;
use bitcoin::script::{Instruction, Script, ScriptBuf};
use bitcoin::{Network, PublicKey, Txid};
use serde_json::{json, Value};

use crate::error::{AppError, Result};
use crate::keys::{ResolvedKey, XPublicKey};
use crate::script::{self, classify, data_push, parse_multisig_redeem, Destination, ScriptClass};
use crate::types::{ScriptKind, TxInput, TxOut, DEFAULT_SEQUENCE, NO_SIGNATURE};

// 手数料見積もり用の署名長 (DER 最大長 + sighash バイト)
const ESTIMATED_SIGNATURE_LEN: usize = 0x48;

// 見積もり用のダミー公開鍵 (バイト列 0x03..=0x23 は曲線上の点)
fn dummy_public_key(compressed: bool) -> Result<PublicKey> {
    let raw: Vec<u8> = (3u8..36).collect();
    let inner = secp256k1::PublicKey::from_slice(&raw)?;
    Ok(PublicKey { compressed, inner })
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub version: i32,
    pub locktime: u32,
    pub(crate) inputs: Vec<TxInput>,
    pub(crate) outputs: Vec<TxOut>,
    /// シリアライズ結果のキャッシュ。署名・入出力の変更で破棄する。
    pub(crate) raw: Option<String>,
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.locktime == other.locktime
            && self.inputs == other.inputs
            && self.outputs == other.outputs
    }
}

impl Eq for Transaction {}

impl Transaction {
    pub fn from_io(inputs: Vec<TxInput>, outputs: Vec<TxOut>, locktime: u32) -> Self {
        Transaction { version: 1, locktime, inputs, outputs, raw: None }
    }

    pub fn inputs(&self) -> &[TxInput] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TxOut] {
        &self.outputs
    }

    pub fn raw(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    pub fn add_inputs(&mut self, inputs: impl IntoIterator<Item = TxInput>) {
        self.inputs.extend(inputs);
        self.raw = None;
    }

    pub fn add_outputs(&mut self, outputs: impl IntoIterator<Item = TxOut>) {
        self.outputs.extend(outputs);
        self.raw = None;
    }

    pub fn add_signature(&mut self, input_index: usize, slot: usize, signature: Vec<u8>) -> Result<()> {
        let input = self
            .inputs
            .get_mut(input_index)
            .ok_or_else(|| AppError::InputValidation(format!("入力 {} は存在しません", input_index)))?;
        let entry = input.signatures.get_mut(slot).ok_or_else(|| {
            AppError::InputValidation(format!("入力 {} に署名スロット {} はありません", input_index, slot))
        })?;
        *entry = Some(signature);
        self.raw = None;
        Ok(())
    }

    /// 署名ハッシュ用スクリプトを外部から与える (unknown 入力のみ)
    pub fn set_script_code(&mut self, input_index: usize, code: ScriptBuf) -> Result<()> {
        match self.inputs.get_mut(input_index).map(|input| &mut input.kind) {
            Some(ScriptKind::Unknown { script_code, .. }) => {
                *script_code = Some(code);
                Ok(())
            }
            _ => Err(AppError::InputValidation(format!("入力 {} は unknown ではありません", input_index))),
        }
    }

    pub fn from_hex(text: &str) -> Result<Self> {
        let text = text.trim();
        let bytes = hex::decode(text)?;
        let mut tx = deserialize(&bytes)?;
        tx.raw = Some(text.to_lowercase());
        Ok(tx)
    }

    pub fn serialize_bytes(&self, estimate_size: bool) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&serialize(&VarInt(self.inputs.len() as u64)));
        for input in &self.inputs {
            let script_sig = input_script(input, estimate_size)?;
            serialize_input(&mut out, input, &script_sig, estimate_size);
        }
        out.extend_from_slice(&serialize(&VarInt(self.outputs.len() as u64)));
        for output in &self.outputs {
            out.extend_from_slice(&serialize(output));
        }
        out.extend_from_slice(&self.locktime.to_le_bytes());
        Ok(out)
    }

    pub fn serialize(&self, estimate_size: bool) -> Result<String> {
        Ok(hex::encode(self.serialize_bytes(estimate_size)?))
    }

    /// キャッシュがあればそれを、なければ新たにシリアライズした16進文字列を返す
    pub fn to_hex(&self) -> Result<String> {
        match &self.raw {
            Some(raw) => Ok(raw.clone()),
            None => self.serialize(false),
        }
    }

    pub(crate) fn refresh_raw(&mut self) -> Result<()> {
        self.raw = Some(self.serialize(false)?);
        Ok(())
    }

    /// 署名が揃っていなければ None
    pub fn txid(&self) -> Result<Option<Txid>> {
        if !self.is_complete() {
            return Ok(None);
        }
        let bytes = self.serialize_bytes(false)?;
        Ok(Some(Txid::from_raw_hash(sha256d::Hash::hash(&bytes))))
    }

    pub fn signature_count(&self) -> (usize, usize) {
        self.inputs
            .iter()
            .filter(|input| !input.is_coinbase())
            .fold((0, 0), |(present, required), input| {
                (present + input.signature_count(), required + input.threshold)
            })
    }

    pub fn is_complete(&self) -> bool {
        self.inputs.iter().all(TxInput::is_complete)
    }

    pub fn is_final(&self) -> bool {
        !self.inputs.iter().any(|input| input.sequence < DEFAULT_SEQUENCE)
    }

    pub fn estimated_size(&self) -> Result<usize> {
        match (&self.raw, self.is_complete()) {
            (Some(raw), true) => Ok(raw.len() / 2),
            _ => Ok(self.serialize_bytes(true)?.len()),
        }
    }

    pub fn estimated_input_size(input: &TxInput) -> Result<usize> {
        let script_sig = input_script(input, true)?;
        let mut out = Vec::new();
        serialize_input(&mut out, input, &script_sig, true);
        Ok(out.len())
    }

    pub fn input_value(&self) -> Result<u64> {
        self.inputs
            .iter()
            .enumerate()
            .map(|(input_index, input)| input.value.ok_or(AppError::InputValueMissing { input_index }))
            .sum()
    }

    pub fn output_value(&self) -> u64 {
        self.outputs.iter().map(|output| output.value.to_sat()).sum()
    }

    pub fn fee(&self) -> Result<i64> {
        Ok(self.input_value()? as i64 - self.output_value() as i64)
    }

    /// BIP LI01 の決定的な入出力順
    pub fn bip_li01_sort(&mut self) {
        self.inputs
            .sort_by(|a, b| (a.prev_txid.to_string(), a.prev_index).cmp(&(b.prev_txid.to_string(), b.prev_index)));
        self.outputs.sort_by(|a, b| {
            (a.value, a.script_pubkey.as_bytes()).cmp(&(b.value, b.script_pubkey.as_bytes()))
        });
        self.raw = None;
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(json!({
            "hex": self.to_hex()?,
            "complete": self.is_complete(),
            "final": self.is_final(),
        }))
    }

    /// 入出力の内訳まで含めた表示用 JSON
    pub fn describe(&self, network: Network) -> Result<Value> {
        let inputs = self
            .inputs
            .iter()
            .map(|input| -> Result<Value> {
                let address = match &input.address {
                    Some(destination) => Some(destination.to_address(network)?.to_string()),
                    None => None,
                };
                Ok(json!({
                    "prevout_hash": input.prev_txid.to_string(),
                    "prevout_n": input.prev_index,
                    "sequence": input.sequence,
                    "type": input.kind.name(),
                    "num_sig": input.threshold,
                    "x_pubkeys": input.x_pubkeys.iter().map(XPublicKey::to_hex).collect::<Vec<_>>(),
                    "signatures": input.signatures.iter().map(|sig| sig.as_ref().map(hex::encode)).collect::<Vec<_>>(),
                    "address": address,
                    "value": input.value,
                }))
            })
            .collect::<Result<Vec<_>>>()?;
        let outputs = self
            .outputs
            .iter()
            .map(|output| -> Result<Value> {
                let address = match classify(&output.script_pubkey) {
                    ScriptClass::Address(destination) => Some(destination.to_address(network)?.to_string()),
                    _ => None,
                };
                Ok(json!({
                    "value": output.value.to_sat(),
                    "script": output.script_pubkey.to_hex_string(),
                    "address": address,
                }))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(json!({
            "txid": self.txid()?.map(|txid| txid.to_string()),
            "version": self.version,
            "locktime": self.locktime,
            "complete": self.is_complete(),
            "final": self.is_final(),
            "inputs": inputs,
            "outputs": outputs,
        }))
    }
}

/// 16進文字列、または `hex` フィールドを持つ JSON から16進文字列を取り出す
pub fn tx_from_str(text: &str) -> Result<String> {
    let text = text.trim();
    if text.is_empty() {
        return Err(AppError::InputValidation("空の文字列です".to_string()));
    }
    if hex::decode(text).is_ok() {
        return Ok(text.to_string());
    }
    let value: Value = serde_json::from_str(text)?;
    value
        .get("hex")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AppError::InputValidation("JSONに hex フィールドがありません".to_string()))
}

fn serialize_input(out: &mut Vec<u8>, input: &TxInput, script_sig: &Script, estimate_size: bool) {
    out.extend_from_slice(&serialize(&input.prev_txid));
    out.extend_from_slice(&input.prev_index.to_le_bytes());
    out.extend_from_slice(&serialize(&VarInt(script_sig.len() as u64)));
    out.extend_from_slice(script_sig.as_bytes());
    out.extend_from_slice(&input.sequence.to_le_bytes());
    // オフライン署名側が金額を知るため、未完成の入力には金額を付ける
    if let Some(value) = input.value {
        if !(estimate_size || input.is_complete()) {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

fn realised_key_bytes(x_pubkey: &XPublicKey) -> Result<Vec<u8>> {
    Ok(match x_pubkey.resolve()? {
        ResolvedKey::PublicKey(public_key) => public_key.to_bytes(),
        ResolvedKey::Address(_) => x_pubkey.to_bytes(),
    })
}

/// scriptSig に載せる (鍵, 署名) の並び
fn sig_list(input: &TxInput, estimate_size: bool) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
    if estimate_size {
        let compressed = input.x_pubkeys.first().map_or(true, XPublicKey::is_compressed);
        let dummy = dummy_public_key(compressed)?.to_bytes();
        let keys = vec![dummy; input.x_pubkeys.len()];
        let signatures = vec![vec![0u8; ESTIMATED_SIGNATURE_LEN]; input.threshold];
        return Ok((keys, signatures));
    }
    if input.is_complete() {
        let keys = input
            .x_pubkeys
            .iter()
            .map(realised_key_bytes)
            .collect::<Result<Vec<_>>>()?;
        let signatures = input.present_signatures().map(<[u8]>::to_vec).collect();
        Ok((keys, signatures))
    } else {
        let keys = input.x_pubkeys.iter().map(XPublicKey::to_bytes).collect();
        let signatures = input
            .signatures
            .iter()
            .map(|sig| sig.clone().unwrap_or_else(|| NO_SIGNATURE.to_vec()))
            .collect();
        Ok((keys, signatures))
    }
}

pub(crate) fn input_script(input: &TxInput, estimate_size: bool) -> Result<ScriptBuf> {
    match &input.kind {
        ScriptKind::Coinbase { script_sig } | ScriptKind::Unknown { script_sig, .. } => {
            return Ok(script_sig.clone());
        }
        _ => {}
    }
    let (keys, signatures) = sig_list(input, estimate_size)?;
    let mut script_sig = ScriptBuf::new();
    if input.kind == ScriptKind::P2shMultisig {
        script_sig.push_opcode(OP_0);
    }
    for signature in &signatures {
        script::push_data(&mut script_sig, signature)?;
    }
    match input.kind {
        ScriptKind::P2pkh => {
            let key = keys
                .first()
                .ok_or_else(|| AppError::TransactionBuild("P2PKH入力に公開鍵がありません".to_string()))?;
            script::push_data(&mut script_sig, key)?;
        }
        ScriptKind::P2shMultisig => {
            let redeem = script::multisig_script(&keys, input.threshold)?;
            script::push_data(&mut script_sig, redeem.as_bytes())?;
        }
        _ => {}
    }
    Ok(script_sig)
}

fn parse_signature(sig: &[u8]) -> Option<Vec<u8>> {
    if sig == NO_SIGNATURE {
        None
    } else {
        Some(sig.to_vec())
    }
}

fn unknown_input(prev_txid: Txid, prev_index: u32, sequence: u32, script_sig: ScriptBuf) -> TxInput {
    TxInput {
        prev_txid,
        prev_index,
        sequence,
        kind: ScriptKind::Unknown { script_sig, script_code: None },
        x_pubkeys: Vec::new(),
        signatures: Vec::new(),
        threshold: 0,
        address: None,
        value: None,
    }
}

/// scriptSig を既知の3つのテンプレートに当てはめる。
/// どれにも一致しなければ unknown として元の scriptSig を保持する。
fn parse_script_sig(prev_txid: Txid, prev_index: u32, sequence: u32, script_sig: ScriptBuf) -> TxInput {
    let base = TxInput {
        prev_txid,
        prev_index,
        sequence,
        kind: ScriptKind::P2pk,
        x_pubkeys: Vec::new(),
        signatures: Vec::new(),
        threshold: 1,
        address: None,
        value: None,
    };
    let ops = match script_sig.instructions().collect::<std::result::Result<Vec<_>, _>>() {
        Ok(ops) => ops,
        Err(e) => {
            log::debug!("scriptSig を命令列に分解できません ({}): {}", e, script_sig.to_hex_string());
            return unknown_input(prev_txid, prev_index, sequence, script_sig);
        }
    };
    let pushes: Vec<Option<&[u8]>> = ops.iter().map(|op| data_push(*op)).collect();

    match pushes.as_slice() {
        // (a) 署名のみ: P2PK
        [Some(sig)] => {
            return TxInput { signatures: vec![parse_signature(sig)], ..base };
        }
        // (b) 署名 + 公開鍵: P2PKH
        [Some(sig), Some(key)] => match XPublicKey::from_bytes(key).and_then(|x| Ok((x.to_address()?, x))) {
            Ok((address, x_pubkey)) => {
                return TxInput {
                    kind: ScriptKind::P2pkh,
                    x_pubkeys: vec![x_pubkey],
                    signatures: vec![parse_signature(sig)],
                    address: Some(address),
                    ..base
                };
            }
            Err(e) => {
                log::warn!("scriptSig の公開鍵を解釈できません ({}): {}", e, script_sig.to_hex_string());
                return unknown_input(prev_txid, prev_index, sequence, script_sig);
            }
        },
        _ => {}
    }

    // (c) OP_0 <署名>... <リディームスクリプト>: P2SH マルチシグ
    let starts_with_op0 = matches!(ops.first(), Some(Instruction::PushBytes(bytes)) if bytes.is_empty());
    if starts_with_op0 && pushes.len() >= 2 && pushes[1..].iter().all(Option::is_some) {
        let items: Vec<&[u8]> = pushes[1..].iter().flatten().copied().collect();
        let (redeem, sigs) = match items.split_last() {
            Some(split) => split,
            None => return unknown_input(prev_txid, prev_index, sequence, script_sig),
        };
        let parsed = parse_multisig_redeem(Script::from_bytes(redeem)).and_then(|(m, keys)| {
            let x_pubkeys = keys
                .iter()
                .map(|key| XPublicKey::from_bytes(key))
                .collect::<Result<Vec<_>>>()
                .ok()?;
            Some((m, x_pubkeys))
        });
        if let Some((threshold, x_pubkeys)) = parsed {
            if sigs.len() <= x_pubkeys.len() {
                let keys: Vec<Vec<u8>> = x_pubkeys.iter().map(XPublicKey::to_bytes).collect();
                let address = script::multisig_script(&keys, threshold)
                    .ok()
                    .map(|redeem| Destination::for_redeem_script(&redeem));
                let mut signatures: Vec<Option<Vec<u8>>> = sigs.iter().map(|sig| parse_signature(sig)).collect();
                // 署名済みの場合は存在する署名だけが並ぶので残りを空スロットで埋める
                signatures.resize(x_pubkeys.len(), None);
                return TxInput {
                    kind: ScriptKind::P2shMultisig,
                    x_pubkeys,
                    signatures,
                    threshold,
                    address,
                    ..base
                };
            }
        }
    }

    log::debug!("scriptSig のテンプレートが見つかりません: {}", script_sig.to_hex_string());
    unknown_input(prev_txid, prev_index, sequence, script_sig)
}

fn parse_input(cursor: &mut &[u8]) -> Result<TxInput> {
    let prev_txid = Txid::consensus_decode(cursor)?;
    let prev_index = u32::consensus_decode(cursor)?;
    let script_sig = ScriptBuf::from_bytes(Vec::<u8>::consensus_decode(cursor)?);
    let sequence = u32::consensus_decode(cursor)?;

    if prev_txid == Txid::all_zeros() {
        return Ok(TxInput {
            prev_txid,
            prev_index,
            sequence,
            kind: ScriptKind::Coinbase { script_sig },
            x_pubkeys: Vec::new(),
            signatures: Vec::new(),
            threshold: 0,
            address: None,
            value: None,
        });
    }

    let mut input = parse_script_sig(prev_txid, prev_index, sequence, script_sig);
    if !input.is_complete() {
        input.value = Some(u64::consensus_decode(cursor)?);
    }
    Ok(input)
}

pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
    let mut cursor = bytes;
    let version = i32::consensus_decode(&mut cursor)?;
    let input_count = VarInt::consensus_decode(&mut cursor)?.0;
    if input_count == 0 {
        return Err(AppError::Decode("入力数が0です".to_string()));
    }
    let mut inputs = Vec::new();
    for _ in 0..input_count {
        inputs.push(parse_input(&mut cursor)?);
    }
    let outputs = Vec::<TxOut>::consensus_decode(&mut cursor)?;
    let locktime = u32::consensus_decode(&mut cursor)?;
    if !cursor.is_empty() {
        log::warn!("トランザクション末尾に {} バイトの余分なデータがあります", cursor.len());
    }
    Ok(Transaction { version, locktime, inputs, outputs, raw: None })
}
