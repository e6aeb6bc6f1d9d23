use clap::{Parser, Subcommand};
use std::path::PathBuf;
use bitcoin::Network as BitcoinNetwork;
use esv_wallet_core::AppError;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// 使用するネットワーク ("bitcoin", "testnet", "regtest")
    #[clap(short, long, value_parser, default_value = "testnet", global = true)]
    pub network: String,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// raw transaction (16進数、または hex フィールドを持つJSON) を解析して表示する
    Decode {
        /// トランザクション文字列
        #[clap(value_parser)]
        tx: String,
    },

    /// JSONの送金リクエストからトランザクションを構築して署名する
    Sign {
        /// トランザクション情報を記述したJSONファイルへのパス
        #[clap(short, long, value_parser)]
        input_file: PathBuf,

        /// 生成されたraw transaction hexを保存するファイルへのパス
        #[clap(short, long, value_parser)]
        output_file: PathBuf,
    },

    /// ウォレットファイルを最新の seed_version にアップグレードする
    Upgrade {
        /// ウォレットファイルへのパス
        #[clap(value_parser)]
        wallet: PathBuf,

        /// 暗号化されたウォレットのパスワード
        #[clap(short, long, value_parser)]
        password: Option<String>,
    },
}

pub fn parse_network(network_str: &str) -> Result<BitcoinNetwork, AppError> {
    match network_str.to_lowercase().as_str() {
        "bitcoin" | "mainnet" => Ok(BitcoinNetwork::Bitcoin),
        "testnet" => Ok(BitcoinNetwork::Testnet),
        "regtest" => Ok(BitcoinNetwork::Regtest),
        s => Err(AppError::InputValidation(format!("無効なネットワークが指定されました: {}", s))),
    }
}
