use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use bitcoin::Network as BitcoinNetwork;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::secp256k1::All as AllContext;
use clap::Parser;

use esv_wallet_core::config::InputConfig;
use esv_wallet_core::migration::repository::MemoryRepository;
use esv_wallet_core::migration::{self, MigrationLadder};
use esv_wallet_core::storage::WalletStorage;
use esv_wallet_core::transaction::{tx_from_str, Transaction};
use esv_wallet_core::{sweep, AppError};

mod cli;

use cli::{CliArgs, Command, parse_network};

fn main() -> Result<(), AppError> {
    env_logger::init();

    let args = CliArgs::parse();
    log::info!("アプリケーションを開始します。引数: {:?}", args);

    let cli_network = parse_network(&args.network)?;
    log::info!("指定されたネットワーク: {:?}", cli_network);

    match &args.command {
        Command::Decode { tx } => decode(tx, cli_network)?,
        Command::Sign { input_file, output_file } => sign(input_file, output_file, cli_network)?,
        Command::Upgrade { wallet, password } => upgrade(wallet, password.as_deref(), cli_network)?,
    }

    log::info!("処理が正常に完了しました。");
    Ok(())
}

fn decode(text: &str, network: BitcoinNetwork) -> Result<(), AppError> {
    let tx = Transaction::from_hex(&tx_from_str(text)?)?;
    let description = tx.describe(network)?;
    println!("{}", serde_json::to_string_pretty(&description)?);
    Ok(())
}

fn sign(input_file: &Path, output_file: &Path, cli_network: BitcoinNetwork) -> Result<(), AppError> {
    let input_file_content = fs::read_to_string(input_file).map_err(|e| {
        log::error!("入力ファイルの読み込みに失敗しました: {:?}", input_file);
        AppError::Io(e)
    })?;

    let config: InputConfig = serde_json::from_str(&input_file_content).map_err(|e| {
        log::error!("入力JSONのパースに失敗しました。");
        AppError::JsonParse {
            file_path: input_file.to_path_buf(),
            source: e,
        }
    })?;
    log::debug!("入力設定ファイルのパース成功: {:?}", config);
    if parse_network(&config.network)? != cli_network {
        log::warn!("入力ファイルのネットワーク {} は CLI 指定と異なります。CLI 指定を使います。", config.network);
    }

    let secp: Secp256k1<AllContext> = Secp256k1::new();

    let signed_tx = sweep::create_and_sign_transaction(config, cli_network, &secp)?;
    log::info!("署名済みトランザクションの生成に成功しました。");

    let serialized_tx = signed_tx.to_hex()?;
    log::info!("Raw transaction hex: {}", serialized_tx);
    if let Some(txid) = signed_tx.txid()? {
        log::info!("txid: {}", txid);
    }

    println!("{}", serialized_tx);

    let mut output_file_handle = File::create(output_file).map_err(|e| {
        log::error!("出力ファイルの作成に失敗しました: {:?}", output_file);
        AppError::Io(e)
    })?;
    output_file_handle.write_all(serialized_tx.as_bytes()).map_err(|e| {
        log::error!("出力ファイルへの書き込みに失敗しました。");
        AppError::Io(e)
    })?;
    log::info!("Raw transactionを {:?} に保存しました。", output_file);
    Ok(())
}

fn upgrade(wallet: &Path, password: Option<&str>, network: BitcoinNetwork) -> Result<(), AppError> {
    let storage = WalletStorage::open(wallet)?;
    if !storage.file_exists() {
        return Err(AppError::InputValidation(format!("ウォレットファイルがありません: {:?}", wallet)));
    }
    if storage.is_encrypted() {
        let password = password
            .ok_or_else(|| AppError::InputValidation("暗号化されたウォレットにはパスワードが必要です".to_string()))?;
        storage.decrypt(password)?;
    }

    let ladder = MigrationLadder::standard(network);
    if migration::requires_split(&storage) {
        let paths = ladder.split_accounts(&storage, |_| MemoryRepository::new())?;
        for path in paths {
            println!("{}", path.display());
        }
        return Ok(());
    }

    let mut repository = MemoryRepository::new();
    if ladder.run(&storage, &mut repository)? {
        log::info!(
            "アップグレード完了: トランザクション {} 件, 消費出力 {} 件, 作成出力 {} 件を移しました。",
            repository.transactions.len(),
            repository.spent_outputs.len(),
            repository.created_outputs.len()
        );
    } else {
        log::info!("ウォレットは最新です。");
    }
    println!("seed_version {}", storage.seed_version()?);
    Ok(())
}
