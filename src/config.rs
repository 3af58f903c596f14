use std::fs;
use std::path::{Path, PathBuf};

use ron::extensions::Extensions;
use ron::Options;
use serde::{Deserialize, Serialize};

use crate::error::{LpcError, LpcResult};
use crate::layout::{BinLayout, Field, PacketLayout, DEFAULT_BIN_DIAMETERS};

/// 処理全体の設定
///
/// すべての項目に既定値があるため、設定ファイルには変更したい項目だけを記述すればよい。
///
/// ```ron
/// (
///     raw_dir: "LPC_Test/ST2_C0_03_TTL3/LPC",
///     csv_dir: "LPC/csv",
///     aggregation: (min_flow: 1.0),
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LpcConfig {
    /// 装置の識別子
    pub instrument_id: String,
    /// 装置の説明
    pub instrument_description: String,
    /// gzip圧縮されたパケットを格納したディレクトリ
    pub raw_dir: PathBuf,
    /// パケットごとのCSVを出力するディレクトリ
    pub csv_dir: PathBuf,
    /// 集計するCSVのファイル名パターン
    pub csv_pattern: String,
    /// 平均データセットのパス
    pub mean_file: PathBuf,
    /// マスター・データセットのパス
    pub master_file: PathBuf,
    /// 状態メッセージを追記するログ・ファイルのパス
    pub state_log_file: PathBuf,
    /// 状態メッセージを記録するパケットのファイル名の接頭辞
    pub state_log_prefix: String,
    /// 時刻の上位ワードを65536倍するかどうか
    ///
    /// `false`の場合は、これまでのCSVと同じく65535倍する。
    pub correct_timestamp_rollover: bool,
    /// 粒径ビンの下端直径（nm、高ゲイン16個、低ゲイン16個の順）
    pub bin_diameters: Vec<u32>,
    /// 集計の設定
    pub aggregation: AggregationConfig,
}

impl Default for LpcConfig {
    fn default() -> Self {
        Self {
            instrument_id: "LPC-0002".to_string(),
            instrument_description:
                "LASP Optical Particle Counter on Strateole 2 Super Pressure Balloons".to_string(),
            raw_dir: PathBuf::from("LPC_Test"),
            csv_dir: PathBuf::from("LPC/csv"),
            csv_pattern: "*.csv".to_string(),
            mean_file: PathBuf::from("LPC/LPC_Mean.csv"),
            master_file: PathBuf::from("LPC/LPC_Master.csv"),
            state_log_file: PathBuf::from("LPC/LPC_Log.txt"),
            state_log_prefix: "ST2".to_string(),
            correct_timestamp_rollover: false,
            bin_diameters: DEFAULT_BIN_DIAMETERS.to_vec(),
            aggregation: AggregationConfig::default(),
        }
    }
}

impl LpcConfig {
    /// RON形式の設定ファイルを読み込む。
    pub fn from_file<P>(path: P) -> LpcResult<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| LpcError::io(path, "読み込み", e))?;
        parse_ron(&text).map_err(|e| LpcError::Config(format!("`{}`: {e}", path.display())))
    }

    /// RON形式の文字列から設定を構築する。
    pub fn from_ron(text: &str) -> LpcResult<Self> {
        parse_ron(text).map_err(|e| LpcError::Config(format!("{e}")))
    }

    /// 復号に使用するレイアウトを返す。
    pub fn packet_layout(&self) -> PacketLayout {
        PacketLayout::from_rollover_flag(self.correct_timestamp_rollover)
    }

    /// 粒径ビンの定義を検証して返す。
    pub fn bin_layout(&self) -> LpcResult<BinLayout> {
        BinLayout::new(self.bin_diameters.clone())
    }

    /// 集計対象のCSVを表すパターン（ディレクトリを含む）を返す。
    pub fn csv_glob(&self) -> String {
        self.csv_dir
            .join(&self.csv_pattern)
            .to_string_lossy()
            .into_owned()
    }
}

fn parse_ron(text: &str) -> ron::error::SpannedResult<LpcConfig> {
    Options::default()
        .with_default_extension(Extensions::IMPLICIT_SOME)
        .from_str(text)
}

/// 集計の設定
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// 平均に含める最小の流量（SLPM）
    pub min_flow: f64,
    /// 平均を出力するのに必要な有効行の数
    pub min_valid_rows: usize,
    /// この値より小さい値を欠測とみなす
    pub missing_below: f64,
    /// 平均の時刻に加える秒数（MSTからUTCへの補正）
    pub utc_offset_seconds: f64,
    /// CSVの先頭で読み飛ばす行数
    pub skip_lines: usize,
    /// ヘッダーを複写するCSVの位置（ファイル名順）
    pub header_source_index: usize,
    /// 流量の列
    pub flow_column: usize,
    /// 集計の開始時にデータセットを作り直すかどうか
    ///
    /// `false`の場合は、ヘッダーとデータを既存のデータセットに追記する。
    pub truncate_sinks: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            min_flow: 0.5,
            min_valid_rows: 4,
            missing_below: -273.0,
            utc_offset_seconds: 25_200.0,
            skip_lines: 6,
            header_source_index: 1,
            flow_column: Field::Flow.index(),
            truncate_sinks: false,
        }
    }
}
