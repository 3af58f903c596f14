//! パケットの復号からデータセットの集計までの一連の処理
//!
//! ```text
//!  *.gz ─ read_packet ─ extract_payload ─ decode_rows ─ write_packet_csv ─ *.csv
//!                                                                          │
//!                                                aggregate ◀───────────────┘
//!                                                   │
//!                                     LPC_Mean.csv / LPC_Master.csv
//! ```
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::aggregator::{aggregate, list_matching, AggregationReport};
use crate::config::LpcConfig;
use crate::decoder::decode_rows;
use crate::error::{LpcError, LpcResult};
use crate::frame::{extract_payload, payload_start_time, read_packet};
use crate::layout::BinLayout;
use crate::state_log::{append_state_log, extract_state_message};
use crate::writer::{write_packet_csv, PacketHeader};

/// パケットのファイル名から2つの拡張子を取り除き、`.csv`を付けたパスを返す。
///
/// `TM_03-Dec-20_14-58-02.LPC.dat.gz`は`TM_03-Dec-20_14-58-02.LPC.csv`になる。
pub fn csv_path_for(csv_dir: &Path, input: &Path) -> PathBuf {
    let name = Path::new(input.file_stem().unwrap_or_default());
    let mut stem = name.file_stem().unwrap_or_default().to_os_string();
    stem.push(".csv");
    csv_dir.join(stem)
}

/// パケットを復号してCSVファイルに出力する。
///
/// 出力ファイルは復号の前に作成する。復号または書き込みに失敗した場合は、
/// 出力ファイルを0バイトにして、集計の対象から外れるようにする。
///
/// # 引数
///
/// * `input` - gzip圧縮されたパケットのパス
/// * `output` - 出力するCSVのパス
/// * `config` - 設定
/// * `bins` - 粒径ビンの定義
///
/// # 戻り値
///
/// 出力したデータ行の数
pub fn convert_packet(
    input: &Path,
    output: &Path,
    config: &LpcConfig,
    bins: &BinLayout,
) -> LpcResult<usize> {
    let file = File::create(output).map_err(|e| LpcError::io(output, "作成", e))?;
    match write_packet(input, &file, config, bins) {
        Ok(rows) => Ok(rows),
        Err(e) => {
            if let Err(truncate_err) = file.set_len(0) {
                warn!(
                    "`{}`を0バイトにできませんでした。{truncate_err}",
                    output.display()
                );
            }
            Err(e)
        }
    }
}

fn write_packet(
    input: &Path,
    file: &File,
    config: &LpcConfig,
    bins: &BinLayout,
) -> LpcResult<usize> {
    let packet = read_packet(input)?;
    let payload = extract_payload(&packet)?;
    let rows = decode_rows(payload, config.packet_layout())?;
    // 空のバイナリ部は0行のパケットとして扱い、時刻は0とする
    let reference_time = match rows.first() {
        Some(row) => row.timestamp(),
        None if payload.is_empty() => 0,
        None => i64::from(payload_start_time(payload)?),
    };
    let header = PacketHeader {
        instrument_id: config.instrument_id.clone(),
        description: config.instrument_description.clone(),
        reference_time,
    };
    info!(
        "`{}`を処理しています（{}行）。",
        input.display(),
        rows.len()
    );

    write_packet_csv(BufWriter::new(file), &header, bins, &rows)
}

/// 変換するパケットと出力先の組
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketJob {
    pub input: PathBuf,
    pub output: PathBuf,
}

/// パケットの変換結果
#[derive(Debug, Clone)]
pub enum PacketStatus {
    /// 変換した
    Converted { rows: usize },
    /// 変換に失敗した
    Failed(LpcError),
}

/// パケットごとの変換結果
#[derive(Debug, Clone)]
pub struct PacketOutcome {
    pub job: PacketJob,
    pub status: PacketStatus,
}

/// 複数パケットの変換結果
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: Vec<PacketOutcome>,
}

impl BatchReport {
    /// 変換に成功したパケットの数を返す。
    pub fn converted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, PacketStatus::Converted { .. }))
            .count()
    }

    /// 失敗したパケットとエラーを返す。
    pub fn failures(&self) -> impl Iterator<Item = (&PacketJob, &LpcError)> {
        self.outcomes.iter().filter_map(|o| match &o.status {
            PacketStatus::Failed(e) => Some((&o.job, e)),
            _ => None,
        })
    }
}

/// 複数のパケットを順に変換する。
///
/// 1つのパケットの失敗は記録するだけで、残りのパケットの変換を続ける。
pub fn convert_packets(jobs: &[PacketJob], config: &LpcConfig, bins: &BinLayout) -> BatchReport {
    let mut report = BatchReport::default();
    for job in jobs {
        let status = match convert_packet(&job.input, &job.output, config, bins) {
            Ok(rows) => PacketStatus::Converted { rows },
            Err(e) => {
                warn!("`{}`のデータを処理できませんでした。{e}", job.input.display());
                PacketStatus::Failed(e)
            }
        };
        report.outcomes.push(PacketOutcome {
            job: job.clone(),
            status,
        });
    }
    report
}

/// ファイル名が設定の接頭辞で始まるパケットの状態メッセージをログに記録する。
///
/// # 戻り値
///
/// 記録した場合は`true`
pub fn record_state_message(input: &Path, config: &LpcConfig) -> LpcResult<bool> {
    let file_name = input
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !file_name.starts_with(&config.state_log_prefix) {
        return Ok(false);
    }
    let packet = read_packet(input)?;
    match extract_state_message(&packet) {
        Some(message) => {
            append_state_log(&config.state_log_file, &file_name, &message)?;
            Ok(true)
        }
        None => {
            warn!("`{file_name}`に状態メッセージがありません。");
            Ok(false)
        }
    }
}

/// ディレクトリ処理の結果
#[derive(Debug)]
pub struct RunReport {
    /// パケットの変換結果
    pub batch: BatchReport,
    /// 集計の結果（新しいパケットがなかった場合は`None`）
    pub aggregation: Option<LpcResult<AggregationReport>>,
}

/// `raw_dir`のパケットのうち、まだCSVがないものを変換し、データセットを集計し直す。
pub fn process_directory(config: &LpcConfig, bins: &BinLayout) -> LpcResult<RunReport> {
    let pattern = config.raw_dir.join("*.gz");
    let packets = list_matching(&pattern.to_string_lossy())?;
    fs::create_dir_all(&config.csv_dir).map_err(|e| LpcError::io(&config.csv_dir, "作成", e))?;

    let jobs: Vec<PacketJob> = packets
        .into_iter()
        .map(|input| PacketJob {
            output: csv_path_for(&config.csv_dir, &input),
            input,
        })
        .filter(|job| !job.output.exists())
        .collect();
    info!("{}件の新しいパケットがあります。", jobs.len());

    for job in &jobs {
        if let Err(e) = record_state_message(&job.input, config) {
            warn!(
                "`{}`の状態メッセージを記録できませんでした。{e}",
                job.input.display()
            );
        }
    }
    let batch = convert_packets(&jobs, config, bins);

    let aggregation = if jobs.is_empty() {
        None
    } else {
        Some(reaggregate(config))
    };

    Ok(RunReport { batch, aggregation })
}

/// CSVディレクトリのすべてのファイルを集計する。
pub fn reaggregate(config: &LpcConfig) -> LpcResult<AggregationReport> {
    aggregate(
        &config.csv_glob(),
        &config.mean_file,
        &config.master_file,
        &config.aggregation,
    )
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::*;

    #[test]
    fn csv_name_drops_two_extensions() {
        let dir = Path::new("LPC/csv");
        assert_eq!(
            csv_path_for(dir, Path::new("raw/TM_03-Dec-20_14-58-02.LPC.dat.gz")),
            PathBuf::from("LPC/csv/TM_03-Dec-20_14-58-02.LPC.csv")
        );
        assert_eq!(
            csv_path_for(dir, Path::new("ST2_packet.gz")),
            PathBuf::from("LPC/csv/ST2_packet.csv")
        );
    }

    #[test]
    fn failed_conversion_leaves_empty_csv() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("bad.dat.gz");
        fs::write(&input, b"not gzip").unwrap();
        let output = dir.path().join("bad.csv");
        let err = convert_packet(&input, &output, &LpcConfig::default(), &BinLayout::default())
            .unwrap_err();
        assert!(matches!(err, LpcError::Io(_)));
        assert_eq!(fs::metadata(&output).unwrap().len(), 0);
    }

    #[test]
    fn end_before_start_writes_header_only_csv() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("empty.dat.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"<Msg>END</Msg>START").unwrap();
        fs::write(&input, encoder.finish().unwrap()).unwrap();
        let output = dir.path().join("empty.csv");

        let rows =
            convert_packet(&input, &output, &LpcConfig::default(), &BinLayout::default()).unwrap();
        assert_eq!(rows, 0);
        let text = fs::read_to_string(&output).unwrap();
        assert_eq!(text.lines().count(), 6);
        assert!(text.contains("01/01/1970, 00:00:00"));
    }

    #[test]
    fn state_message_only_for_prefixed_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = LpcConfig {
            state_log_file: dir.path().join("log.txt"),
            ..LpcConfig::default()
        };
        // 接頭辞が一致しないファイルは読み込みもしない
        assert!(!record_state_message(&dir.path().join("TM_missing.gz"), &config).unwrap());
        assert!(record_state_message(&dir.path().join("ST2_missing.gz"), &config).is_err());
    }
}
