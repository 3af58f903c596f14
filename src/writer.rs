use std::io::Write;

use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::decoder::DecodedRow;
use crate::error::{LpcError, LpcResult};
use crate::layout::{BinLayout, HOUSEKEEPING_TABLE};

/// ヘッダーに記録する計測時刻の書式
const HEADER_TIME_FMT: &[FormatItem<'_>] =
    format_description!("[month]/[day]/[year], [hour]:[minute]:[second]");

/// パケットCSVの1行目に記録する情報
#[derive(Debug, Clone)]
pub struct PacketHeader {
    /// 装置の識別子
    pub instrument_id: String,
    /// 装置の説明
    pub description: String,
    /// 計測時刻（Unix時刻）
    pub reference_time: i64,
}

/// Unix時刻をヘッダー用のUTC日時文字列に変換する。
pub fn format_reference_time(timestamp: i64) -> LpcResult<String> {
    let dt = OffsetDateTime::from_unix_timestamp(timestamp).map_err(|e| {
        LpcError::Unexpected(format!("Unix時刻`{timestamp}`を日時に変換できません。{e}"))
    })?;
    dt.format(HEADER_TIME_FMT).map_err(|e| {
        LpcError::Unexpected(format!("日時`{dt}`を文字列に変換できません。{e}"))
    })
}

/// ヘッダーとデータ行を区切る空行
const SEPARATOR_LINES: &[u8] = b"\r\n\r\n\r\n";

/// 復号した行を、3行のヘッダーと3行の空行に続けてCSV形式で出力する。
///
/// 集計ではこの6行を読み飛ばす。
///
/// # 引数
///
/// * `writer` - 出力先
/// * `header` - 1行目に記録する装置の情報
/// * `bins` - 列名に使用する粒径ビンの定義
/// * `rows` - 復号した行
///
/// # 戻り値
///
/// 出力したデータ行の数
pub fn write_packet_csv<'r, W, I>(
    mut writer: W,
    header: &PacketHeader,
    bins: &BinLayout,
    rows: I,
) -> LpcResult<usize>
where
    W: Write,
    I: IntoIterator<Item = &'r DecodedRow>,
{
    let reference_time = format_reference_time(header.reference_time)?;
    let mut header_writer = csv_writer(&mut writer);
    header_writer
        .write_record([
            "Instrument: ",
            header.instrument_id.as_str(),
            "Measurement End Time: ",
            reference_time.as_str(),
            header.description.as_str(),
        ])
        .map_err(csv_error)?;
    header_writer
        .write_record(bins.column_names())
        .map_err(csv_error)?;
    header_writer
        .write_record(bins.column_units())
        .map_err(csv_error)?;
    header_writer.flush().map_err(write_error)?;
    drop(header_writer);
    writer.write_all(SEPARATOR_LINES).map_err(write_error)?;

    let mut row_writer = csv_writer(writer);
    let mut written = 0;
    for row in rows {
        row_writer.write_record(row_fields(row)).map_err(csv_error)?;
        written += 1;
    }
    row_writer.flush().map_err(write_error)?;

    Ok(written)
}

fn csv_writer<W: Write>(writer: W) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .flexible(true)
        .terminator(csv::Terminator::CRLF)
        .from_writer(writer)
}

/// 行の各列を文字列に変換する。
fn row_fields(row: &DecodedRow) -> Vec<String> {
    let housekeeping = row
        .housekeeping
        .values()
        .iter()
        .zip(HOUSEKEEPING_TABLE.iter())
        .map(|(&v, spec)| {
            if spec.calibration.is_integral() {
                format!("{}", v as i64)
            } else {
                format_real(v)
            }
        });
    let counts = row
        .bins
        .high_gain
        .iter()
        .chain(row.bins.low_gain.iter())
        .map(|c| c.to_string());

    housekeeping.chain(counts).collect()
}

fn csv_error(e: csv::Error) -> LpcError {
    LpcError::Io(format!("CSVの書き込みに失敗しました。{e}"))
}

fn write_error(e: std::io::Error) -> LpcError {
    LpcError::Io(format!("CSVの書き込みに失敗しました。{e}"))
}

/// 実数を、往復変換できる最短の10進表記に変換する。
///
/// 整数値でも小数点以下を1桁付ける（`20.0`）。欠測値は`nan`とする。
pub fn format_real(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    let s = format!("{value:?}");
    if s.contains('e') {
        signed_exponent(&s)
    } else {
        s
    }
}

/// 実数を仮数部18桁の指数表記（`1.500000000000000000e+00`）に変換する。
pub fn format_scientific(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    signed_exponent(&format!("{value:.18e}"))
}

/// `1.5e3`形式の指数部を、符号付き2桁以上（`1.5e+03`）に整える。
fn signed_exponent(s: &str) -> String {
    match s.split_once('e') {
        Some((mantissa, exponent)) => match exponent.parse::<i32>() {
            Ok(exp) => {
                let sign = if exp < 0 { '-' } else { '+' };
                format!("{mantissa}e{sign}{:02}", exp.abs())
            }
            Err(_) => s.to_string(),
        },
        None => s.to_string(),
    }
}
