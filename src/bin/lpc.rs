use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use lpc_tm::aggregator::AggregationReport;
use lpc_tm::pipeline::{convert_packet, csv_path_for, process_directory, reaggregate};
use lpc_tm::LpcConfig;

/// LPCテレメトリ・パケットの変換と集計
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// RON形式の設定ファイル
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 1つのパケットをCSVに変換する
    Decode {
        /// gzip圧縮されたパケット
        input: PathBuf,
        /// 出力するCSV（省略時は設定のCSVディレクトリ）
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 新しいパケットを変換して、データセットを集計し直す
    Process,
    /// 既存のCSVだけを集計し直す
    Aggregate,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => LpcConfig::from_file(path)?,
        None => LpcConfig::default(),
    };
    let bins = config.bin_layout()?;

    match args.command {
        Command::Decode { input, output } => {
            let output = output.unwrap_or_else(|| csv_path_for(&config.csv_dir, &input));
            let rows = convert_packet(&input, &output, &config, &bins)
                .with_context(|| format!("`{}`を変換できませんでした。", input.display()))?;
            info!("{rows}行を`{}`に出力しました。", output.display());
        }
        Command::Process => {
            let report = process_directory(&config, &bins)?;
            for (job, e) in report.batch.failures() {
                error!("`{}`: {e}", job.input.display());
            }
            info!(
                "{}/{}件のパケットを変換しました。",
                report.batch.converted(),
                report.batch.outcomes.len()
            );
            match report.aggregation {
                Some(result) => summarize(&result?),
                None => info!("新しいパケットはありません。"),
            }
        }
        Command::Aggregate => {
            info!("CSVを集計し直しています。");
            summarize(&reaggregate(&config)?);
        }
    }

    Ok(())
}

fn summarize(report: &AggregationReport) {
    for (path, e) in report.failures() {
        warn!("`{}`: {e}", path.display());
    }
    info!(
        "マスター{}行、平均{}行を追記しました。",
        report.master_rows(),
        report.mean_rows()
    );
}
