use crate::error::{LpcError, LpcResult};
use crate::frame::read_u16_be;
use crate::layout::{
    Field, PacketLayout, BINS_PER_CHANNEL, CHUNK_BYTES, COLUMNS, HIGH_GAIN_OFFSET,
    HOUSEKEEPING_FIELDS, HOUSEKEEPING_OFFSET, HOUSEKEEPING_TABLE, HOUSEKEEPING_WORDS,
    LOW_GAIN_OFFSET,
};

/// 校正後のハウスキーピング・データ
///
/// 値は`HOUSEKEEPING_TABLE`の順に並んでいる。
#[derive(Debug, Clone, PartialEq)]
pub struct HousekeepingRecord {
    values: [f64; HOUSEKEEPING_FIELDS],
}

impl HousekeepingRecord {
    /// ハウスキーピングの生値を校正する。
    ///
    /// # 引数
    ///
    /// * `words` - チャンクに記録されている16個の生値
    /// * `layout` - 時刻の組み立て方を含むレイアウト
    ///
    /// # 戻り値
    ///
    /// `HousekeepingRecord`
    pub fn from_words(words: &[u16; HOUSEKEEPING_WORDS], layout: &PacketLayout) -> Self {
        let mut values = [0.0; HOUSEKEEPING_FIELDS];
        for (value, spec) in values.iter_mut().zip(HOUSEKEEPING_TABLE.iter()) {
            *value = spec
                .calibration
                .apply(words, spec.word, layout.timestamp_high_multiplier);
        }

        Self { values }
    }

    /// 項目の値を返す。
    pub fn get(&self, field: Field) -> f64 {
        self.values[field.index()]
    }

    /// Unix時刻（秒）を返す。
    pub fn timestamp(&self) -> i64 {
        self.get(Field::Time) as i64
    }

    /// 流量（SLPM）を返す。
    pub fn flow(&self) -> f64 {
        self.get(Field::Flow)
    }

    /// すべての項目の値を返す。
    pub fn values(&self) -> &[f64; HOUSEKEEPING_FIELDS] {
        &self.values
    }
}

/// 高ゲインと低ゲインのビンごとのカウント
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinCounts {
    pub high_gain: [u16; BINS_PER_CHANNEL],
    pub low_gain: [u16; BINS_PER_CHANNEL],
}

/// 1サンプル分の行
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRow {
    pub housekeeping: HousekeepingRecord,
    pub bins: BinCounts,
}

impl DecodedRow {
    /// Unix時刻（秒）を返す。
    pub fn timestamp(&self) -> i64 {
        self.housekeeping.timestamp()
    }

    /// ハウスキーピング、高ゲイン、低ゲインの順に並べた47列の値を返す。
    pub fn to_values(&self) -> Vec<f64> {
        let mut values = Vec::with_capacity(COLUMNS);
        values.extend_from_slice(self.housekeeping.values());
        values.extend(self.bins.high_gain.iter().map(|&c| c as f64));
        values.extend(self.bins.low_gain.iter().map(|&c| c as f64));
        values
    }
}

/// バイナリ部をサンプル単位で復号するデコーダー
///
/// `rows`を呼ぶたびに先頭から走査し直すイテレーターを返す。
#[derive(Debug, Clone, Copy)]
pub struct RecordDecoder<'a> {
    payload: &'a [u8],
    layout: PacketLayout,
}

impl<'a> RecordDecoder<'a> {
    pub fn new(payload: &'a [u8], layout: PacketLayout) -> Self {
        Self { payload, layout }
    }

    /// 復号される行数を返す。
    pub fn row_count(&self) -> usize {
        self.layout.chunk_count(self.payload.len())
    }

    /// 先頭のチャンクから順に行を返すイテレーターを構築する。
    pub fn rows(&self) -> RowIterator<'a> {
        RowIterator {
            payload: self.payload,
            layout: self.layout,
            index: 0,
            count: self.row_count(),
        }
    }
}

/// チャンクを昇順に復号して返すイテレーター
///
/// ライフタイム`'a`は、バイナリ部を保持するバッファのライフタイムを示す。
/// チャンクがバイナリ部に収まらない場合、その要素は`TruncatedPayload`になる。
#[derive(Debug, Clone)]
pub struct RowIterator<'a> {
    /// バイナリ部
    payload: &'a [u8],
    /// レイアウト
    layout: PacketLayout,
    /// 次に復号するチャンクの番号
    index: usize,
    /// 復号するチャンクの数
    count: usize,
}

impl<'a> Iterator for RowIterator<'a> {
    type Item = LpcResult<DecodedRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.count <= self.index {
            return None;
        }
        let offset = self.layout.chunk_offset(self.index);
        self.index += 1;

        Some(decode_chunk(self.payload, offset, &self.layout))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.count - self.index;
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for RowIterator<'a> {}

/// バイナリ部のすべての行を復号する。
///
/// 途中のチャンクが不完全な場合は、部分的な結果を返さずにエラーとする。
pub fn decode_rows(payload: &[u8], layout: PacketLayout) -> LpcResult<Vec<DecodedRow>> {
    RecordDecoder::new(payload, layout).rows().collect()
}

/// `offset`から始まる1チャンクを復号する。
fn decode_chunk(payload: &[u8], offset: usize, layout: &PacketLayout) -> LpcResult<DecodedRow> {
    if payload.len() < offset + CHUNK_BYTES {
        return Err(LpcError::TruncatedPayload {
            offset,
            needed: CHUNK_BYTES,
            len: payload.len(),
        });
    }

    let mut high_gain = [0u16; BINS_PER_CHANNEL];
    let mut low_gain = [0u16; BINS_PER_CHANNEL];
    let mut words = [0u16; HOUSEKEEPING_WORDS];
    for x in 0..BINS_PER_CHANNEL {
        high_gain[x] = read_u16_be(payload, offset + HIGH_GAIN_OFFSET + x * 2)?;
        low_gain[x] = read_u16_be(payload, offset + LOW_GAIN_OFFSET + x * 2)?;
        words[x] = read_u16_be(payload, offset + HOUSEKEEPING_OFFSET + x * 2)?;
    }

    Ok(DecodedRow {
        housekeeping: HousekeepingRecord::from_words(&words, layout),
        bins: BinCounts {
            high_gain,
            low_gain,
        },
    })
}
