use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use log::debug;

use crate::error::{LpcError, LpcResult};

/// バイナリ部の開始マーカー
pub const START_MARKER: &[u8] = b"START";

/// バイナリ部の終了マーカー
pub const END_MARKER: &[u8] = b"END";

/// gzip圧縮されたパケット・ファイルを読み込み、展開したバイト列を返す。
///
/// # 引数
///
/// * `path` - パケット・ファイルのパス
///
/// # 戻り値
///
/// 展開後のバイト列
pub fn read_packet<P>(path: P) -> LpcResult<Vec<u8>>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| LpcError::io(path, "オープン", e))?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    let mut buf = Vec::new();
    decoder
        .read_to_end(&mut buf)
        .map_err(|e| LpcError::io(path, "展開", e))?;

    Ok(buf)
}

/// 展開したパケットから、`START`と`END`で囲まれたバイナリ部を取り出す。
///
/// バイナリ部は最初の`START`の直後から、最初の`END`の直前までである。
/// `END`が`START`の直後より前にある場合は、空のスライスを返す。
///
/// # 引数
///
/// * `packet` - 展開したパケット
///
/// # 戻り値
///
/// バイナリ部
pub fn extract_payload(packet: &[u8]) -> LpcResult<&[u8]> {
    let start = find(packet, START_MARKER)
        .ok_or(LpcError::FrameNotFound("START"))?
        + START_MARKER.len();
    let end = find(packet, END_MARKER).ok_or(LpcError::FrameNotFound("END"))?;
    debug!("バイナリ部: START={start}, END={end}");
    if end <= start {
        return Ok(&packet[start..start]);
    }

    Ok(&packet[start..end])
}

/// バイナリ部の先頭に記録されている計測開始時刻（Unix時刻）を返す。
pub fn payload_start_time(payload: &[u8]) -> LpcResult<u32> {
    read_u32_be(payload, 0)
}

/// `haystack`の中で`needle`が最初に現れる位置を返す。
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

macro_rules! read_number_be {
    ($func_name:ident, $type: ty) => {
        pub(crate) fn $func_name(data: &[u8], offset: usize) -> LpcResult<$type> {
            const BYTES: usize = std::mem::size_of::<$type>();
            let bytes: [u8; BYTES] = offset
                .checked_add(BYTES)
                .and_then(|end| data.get(offset..end))
                .and_then(|s| s.try_into().ok())
                .ok_or(LpcError::TruncatedPayload {
                    offset,
                    needed: BYTES,
                    len: data.len(),
                })?;

            Ok(<$type>::from_be_bytes(bytes))
        }
    };
}

read_number_be!(read_u16_be, u16);
read_number_be!(read_u32_be, u32);
