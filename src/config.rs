use serde::Deserialize;

/// `sign` サブコマンドに渡す送金リクエスト
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InputConfig {
    pub network: String, // "bitcoin", "testnet", "regtest"
    pub utxos: Vec<UtxoInput>,
    pub outputs: Vec<TransactionOutputDef>,
    pub fee_rate_sats_per_byte: u64,
    pub change_address: String,
    #[serde(default)]
    pub default_sequence: Option<u32>,
    #[serde(default)]
    pub locktime: Option<u32>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UtxoInput {
    pub txid: String,
    pub vout: u32,
    pub script_pubkey_hex: String, // P2PKH または P2PK
    pub value_sats: u64,
    pub private_key_wif: String,
    #[serde(default)]
    pub sequence: Option<u32>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOutputDef {
    pub address: String,
    pub value_sats: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_case_request() {
        let config: InputConfig = serde_json::from_str(
            r#"{
                "network": "testnet",
                "utxos": [{
                    "txid": "bcf7ae875b585e00a61055372c1e99046b20f5fbfcd8659959afb6f428326bfa",
                    "vout": 1,
                    "scriptPubkeyHex": "76a914d9351dcbad5b8f3b8bfa2f2cdc85c28118ca932688ac",
                    "valueSats": 1000,
                    "privateKeyWif": "cVt4o7BGAig1UXywgGSmARhxMdzP5qvQsxKkSsc1XEkw3tDTQFpy"
                }],
                "outputs": [{ "address": "mipcBbFg9gMiCh81Kj8tqqdgoZub1ZJRfn", "valueSats": 500 }],
                "feeRateSatsPerByte": 1,
                "changeAddress": "mipcBbFg9gMiCh81Kj8tqqdgoZub1ZJRfn"
            }"#,
        )
        .unwrap();
        assert_eq!(config.utxos[0].vout, 1);
        assert_eq!(config.utxos[0].sequence, None);
        assert_eq!(config.default_sequence, None);
        assert_eq!(config.locktime, None);
        assert_eq!(config.outputs[0].value_sats, 500);
    }
}
