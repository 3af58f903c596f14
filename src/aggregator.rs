//! パケットごとのCSVを集計して、マスターと平均の2つのデータセットを作成する。
//!
//! マスター・データセットには、すべての行をそのまま追記する。
//! 平均データセットには、流量が基準を満たす行の列ごとの平均を、ファイルごとに1行追記する。
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use globset::GlobBuilder;
use log::{info, warn};

use crate::config::AggregationConfig;
use crate::error::{LpcError, LpcResult};
use crate::layout::COLUMNS;
use crate::writer::{format_real, format_scientific};

/// 欠測を明示した値
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// 値あり
    Present(f64),
    /// 欠測
    Missing,
}

impl Reading {
    /// `missing_below`より小さい値と`nan`を欠測として分類する。
    pub fn classify(value: f64, missing_below: f64) -> Self {
        if value.is_nan() || value < missing_below {
            Self::Missing
        } else {
            Self::Present(value)
        }
    }

    /// 値を返す。欠測の場合は`None`を返す。
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Present(v) => Some(v),
            Self::Missing => None,
        }
    }

    pub fn is_missing(self) -> bool {
        matches!(self, Self::Missing)
    }

    fn to_text(self) -> String {
        match self {
            Self::Present(v) => format_real(v),
            Self::Missing => "nan".to_string(),
        }
    }
}

/// 1ファイル分の集計結果
#[derive(Debug, Clone, PartialEq)]
pub struct PacketSummary {
    /// データ行の数
    pub rows: usize,
    /// 流量が基準を満たした行の数
    pub valid_rows: usize,
    /// 欠測とした値の数（流量による選別の前に数える）
    pub missing_count: usize,
    /// 列ごとの平均（時刻はUTCに補正済み）
    ///
    /// 有効行が足りない場合は`None`となる。
    pub means: Option<Vec<Reading>>,
}

/// データ行を集計する。
///
/// # 引数
///
/// * `rows` - CSVから読み込んだデータ行
/// * `config` - 集計の設定
///
/// # 戻り値
///
/// `PacketSummary`
pub fn summarize(rows: &[Vec<f64>], config: &AggregationConfig) -> PacketSummary {
    let readings: Vec<Vec<Reading>> = rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|&v| Reading::classify(v, config.missing_below))
                .collect()
        })
        .collect();
    let missing_count = readings
        .iter()
        .flat_map(|row| row.iter())
        .filter(|r| r.is_missing())
        .count();

    // 流量が欠測の行は除外しない
    let valid: Vec<&Vec<Reading>> = readings
        .iter()
        .filter(|row| {
            !matches!(
                row.get(config.flow_column),
                Some(Reading::Present(flow)) if *flow < config.min_flow
            )
        })
        .collect();
    let valid_rows = valid.len();

    let means = if valid_rows < config.min_valid_rows {
        None
    } else {
        let mut means = column_means(&valid);
        if let Some(Reading::Present(t)) = means.first_mut() {
            *t += config.utc_offset_seconds;
        }
        Some(means)
    };

    PacketSummary {
        rows: rows.len(),
        valid_rows,
        missing_count,
        means,
    }
}

/// 欠測を除いて列ごとの平均を計算する。
///
/// 列のすべてが欠測の場合、その列の平均は欠測となる。
pub fn column_means(rows: &[&Vec<Reading>]) -> Vec<Reading> {
    let width = rows.iter().map(|row| row.len()).max().unwrap_or(0);
    (0..width)
        .map(|col| {
            let (sum, n) = rows
                .iter()
                .filter_map(|row| row.get(col).and_then(|r| r.value()))
                .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
            if n == 0 {
                Reading::Missing
            } else {
                Reading::Present(sum / n as f64)
            }
        })
        .collect()
}

/// CSVの先頭`skip_lines`行を読み飛ばし、残りのデータ行を数値として読み込む。
///
/// 空行は無視する。列数が`COLUMNS`と異なる行や、数値に変換できない値を含む行があれば、
/// そのファイル全体を`MalformedRow`とする。
pub fn read_data_rows<R>(mut reader: R, skip_lines: usize) -> LpcResult<Vec<Vec<f64>>>
where
    R: BufRead,
{
    let mut discard = Vec::new();
    for _ in 0..skip_lines {
        discard.clear();
        let n = reader
            .read_until(b'\n', &mut discard)
            .map_err(|e| LpcError::Io(format!("ヘッダーの読み込みに失敗しました。{e}")))?;
        if n == 0 {
            return Ok(Vec::new());
        }
    }

    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);
    let mut rows = Vec::new();
    for result in csv_reader.records() {
        let record = result.map_err(|e| {
            let line = e
                .position()
                .map_or(0, |p| p.line() as usize + skip_lines);
            LpcError::MalformedRow {
                line,
                reason: format!("{e}"),
            }
        })?;
        let line = record
            .position()
            .map_or(0, |p| p.line() as usize + skip_lines);
        if record.len() == 1 && record[0].trim().is_empty() {
            continue;
        }
        if record.len() != COLUMNS {
            return Err(LpcError::MalformedRow {
                line,
                reason: format!("列数が{}ではなく{}です。", COLUMNS, record.len()),
            });
        }
        let row = record
            .iter()
            .map(|field| {
                field.trim().parse::<f64>().map_err(|e| LpcError::MalformedRow {
                    line,
                    reason: format!("`{field}`を数値に変換できません。{e}"),
                })
            })
            .collect::<LpcResult<Vec<f64>>>()?;
        rows.push(row);
    }

    Ok(rows)
}

/// パターンに一致するファイルを、ファイル名の昇順で返す。
///
/// ワイルドカードはファイル名の部分にだけ使用できる（`LPC/csv/*.csv`）。
pub fn list_matching(pattern: &str) -> LpcResult<Vec<PathBuf>> {
    let pattern_path = Path::new(pattern);
    let file_pattern = pattern_path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| LpcError::Pattern(format!("`{pattern}`にファイル名がありません。")))?;
    let dir = match pattern_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let matcher = GlobBuilder::new(file_pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| LpcError::Pattern(format!("`{pattern}`: {e}")))?
        .compile_matcher();

    let entries = fs::read_dir(dir).map_err(|e| LpcError::io(dir, "一覧の取得", e))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LpcError::io(dir, "一覧の取得", e))?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if is_file && matcher.is_match(entry.file_name()) {
            paths.push(entry.path());
        }
    }
    paths.sort();

    Ok(paths)
}

/// 集計におけるファイルの扱い
#[derive(Debug, Clone)]
pub enum FileStatus {
    /// 0バイトのため読み飛ばした
    Skipped,
    /// データセットに追記した
    Contributed(PacketSummary),
    /// 読み込みまたは書き込みに失敗した
    Failed(LpcError),
}

/// ファイルごとの集計結果
#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub status: FileStatus,
}

/// 集計全体の結果
#[derive(Debug, Clone, Default)]
pub struct AggregationReport {
    pub files: Vec<FileOutcome>,
}

impl AggregationReport {
    /// マスター・データセットに追記した行数を返す。
    pub fn master_rows(&self) -> usize {
        self.summaries().map(|s| s.rows).sum()
    }

    /// 平均データセットに追記した行数を返す。
    pub fn mean_rows(&self) -> usize {
        self.summaries().filter(|s| s.means.is_some()).count()
    }

    /// 失敗したファイルとエラーを返す。
    pub fn failures(&self) -> impl Iterator<Item = (&Path, &LpcError)> {
        self.files.iter().filter_map(|f| match &f.status {
            FileStatus::Failed(e) => Some((f.path.as_path(), e)),
            _ => None,
        })
    }

    fn summaries(&self) -> impl Iterator<Item = &PacketSummary> {
        self.files.iter().filter_map(|f| match &f.status {
            FileStatus::Contributed(s) => Some(s),
            _ => None,
        })
    }
}

/// 平均データセットとマスター・データセットの書き込み先
struct DatasetSinks {
    mean_path: PathBuf,
    mean: BufWriter<File>,
    master_path: PathBuf,
    master: BufWriter<File>,
}

impl DatasetSinks {
    /// データセットを開き、空のデータセットには列名と単位の2行を書き込む。
    fn open(
        mean_path: &Path,
        master_path: &Path,
        header: &[u8],
        truncate: bool,
    ) -> LpcResult<Self> {
        Ok(Self {
            mean_path: mean_path.to_owned(),
            mean: open_dataset(mean_path, header, truncate)?,
            master_path: master_path.to_owned(),
            master: open_dataset(master_path, header, truncate)?,
        })
    }

    fn append_master(&mut self, rows: &[Vec<f64>]) -> LpcResult<()> {
        for row in rows {
            let line = row
                .iter()
                .map(|&v| format_scientific(v))
                .collect::<Vec<_>>()
                .join(",");
            writeln!(self.master, "{line}")
                .map_err(|e| LpcError::io(&self.master_path, "書き込み", e))?;
        }
        Ok(())
    }

    fn append_mean(&mut self, means: &[Reading], missing_count: usize) -> LpcResult<()> {
        let mut fields: Vec<String> = means.iter().map(|r| r.to_text()).collect();
        fields.push(format_real(missing_count as f64));
        write!(self.mean, "{}\r\n", fields.join(","))
            .map_err(|e| LpcError::io(&self.mean_path, "書き込み", e))
    }

    fn flush(&mut self) -> LpcResult<()> {
        self.mean
            .flush()
            .map_err(|e| LpcError::io(&self.mean_path, "書き込み", e))?;
        self.master
            .flush()
            .map_err(|e| LpcError::io(&self.master_path, "書き込み", e))
    }
}

fn open_sink(path: &Path, truncate: bool) -> LpcResult<File> {
    let mut options = OpenOptions::new();
    options.create(true);
    if truncate {
        options.write(true).truncate(true);
    } else {
        options.append(true);
    }
    options.open(path).map_err(|e| LpcError::io(path, "オープン", e))
}

/// データセットを開く。既にデータがある場合は、ヘッダーを書かずに追記する。
fn open_dataset(path: &Path, header: &[u8], truncate: bool) -> LpcResult<BufWriter<File>> {
    let file = open_sink(path, truncate)?;
    let size = file
        .metadata()
        .map_err(|e| LpcError::io(path, "属性の取得", e))?
        .len();
    let mut writer = BufWriter::new(file);
    if size == 0 {
        writer
            .write_all(header)
            .map_err(|e| LpcError::io(path, "書き込み", e))?;
    }

    Ok(writer)
}

/// ヘッダーの2行目と3行目を、改行を含めてそのまま読み込む。
fn read_header_lines(path: &Path) -> LpcResult<Vec<u8>> {
    let file = File::open(path).map_err(|e| LpcError::io(path, "オープン", e))?;
    let mut reader = BufReader::new(file);
    let mut header = Vec::new();
    for i in 0..3 {
        let mut line = Vec::new();
        reader
            .read_until(b'\n', &mut line)
            .map_err(|e| LpcError::io(path, "ヘッダーの読み込み", e))?;
        if 0 < i {
            header.extend_from_slice(&line);
        }
    }

    Ok(header)
}

/// CSVファイルを集計してデータセットを作成する。
///
/// ファイル名順で`header_source_index`番目のファイルから列名と単位を複写し、
/// 続けて0バイトでないすべてのファイルの行を追記する。
/// 1つのファイルの失敗は、他のファイルの処理を妨げない。
///
/// # 引数
///
/// * `pattern` - 集計するCSVのパターン（`LPC/csv/*.csv`）
/// * `mean_path` - 平均データセットのパス
/// * `master_path` - マスター・データセットのパス
/// * `config` - 集計の設定
///
/// # 戻り値
///
/// ファイルごとの結果を格納した`AggregationReport`
pub fn aggregate<P, Q>(
    pattern: &str,
    mean_path: P,
    master_path: Q,
    config: &AggregationConfig,
) -> LpcResult<AggregationReport>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let files = list_matching(pattern)?;
    if files.len() <= config.header_source_index {
        return Err(LpcError::InsufficientInputFiles(files.len()));
    }
    info!("平均データセット: {}", mean_path.as_ref().display());

    let header = read_header_lines(&files[config.header_source_index])?;
    let mut sinks = DatasetSinks::open(
        mean_path.as_ref(),
        master_path.as_ref(),
        &header,
        config.truncate_sinks,
    )?;

    let mut report = AggregationReport::default();
    for path in files {
        let status = match contribute(&path, &mut sinks, config) {
            Ok(Some(summary)) => {
                info!(
                    "{}件の有効なレコード: {}",
                    summary.valid_rows,
                    path.display()
                );
                FileStatus::Contributed(summary)
            }
            Ok(None) => FileStatus::Skipped,
            Err(e) => {
                warn!("`{}`を集計できませんでした。{e}", path.display());
                FileStatus::Failed(e)
            }
        };
        report.files.push(FileOutcome { path, status });
    }
    sinks.flush()?;

    Ok(report)
}

/// 1つのファイルをデータセットに追記する。0バイトのファイルは`None`を返す。
fn contribute(
    path: &Path,
    sinks: &mut DatasetSinks,
    config: &AggregationConfig,
) -> LpcResult<Option<PacketSummary>> {
    let size = fs::metadata(path)
        .map_err(|e| LpcError::io(path, "属性の取得", e))?
        .len();
    if size == 0 {
        return Ok(None);
    }

    let file = File::open(path).map_err(|e| LpcError::io(path, "オープン", e))?;
    let rows = read_data_rows(BufReader::new(file), config.skip_lines)?;
    sinks.append_master(&rows)?;

    let summary = summarize(&rows, config);
    if let Some(means) = &summary.means {
        sinks.append_mean(means, summary.missing_count)?;
    }

    Ok(Some(summary))
}
