//! LPCテレメトリのバイナリ部のレイアウト
//!
//! バイナリ部は36バイトのプリアンブルに続いて、96バイトのチャンクが並ぶ。
//! 最初のチャンクは開始ブロックで、サンプルとしては扱わない。
//!
//! ```text
//!  チャンク内オフセット
//!   0 ─ 31  高ゲイン・ビンのカウント (u16 BE x 16)
//!  32 ─ 63  低ゲイン・ビンのカウント (u16 BE x 16)
//!  64 ─ 95  ハウスキーピングの生値   (u16 BE x 16)
//! ```
use crate::error::{LpcError, LpcResult};

/// チャンクのバイト数
pub const CHUNK_BYTES: usize = 96;

/// バイナリ部の先頭から開始ブロックまでのバイト数
pub const PREAMBLE_BYTES: usize = 36;

/// 1チャンネルあたりのビン数
pub const BINS_PER_CHANNEL: usize = 16;

/// チャンク内の高ゲイン・ビンの開始位置
pub const HIGH_GAIN_OFFSET: usize = 0;

/// チャンク内の低ゲイン・ビンの開始位置
pub const LOW_GAIN_OFFSET: usize = 32;

/// チャンク内のハウスキーピング生値の開始位置
pub const HOUSEKEEPING_OFFSET: usize = 64;

/// ハウスキーピング生値のワード数
pub const HOUSEKEEPING_WORDS: usize = 16;

/// 校正後のハウスキーピング項目数
pub const HOUSEKEEPING_FIELDS: usize = 15;

/// 1行の列数（ハウスキーピング + 高ゲイン・ビン + 低ゲイン・ビン）
pub const COLUMNS: usize = HOUSEKEEPING_FIELDS + 2 * BINS_PER_CHANNEL;

/// 時刻の上位ワードに掛ける係数（装置の出力どおりの値）
///
/// 16ビットの桁上がりであれば65536が正しいはずだが、これまでに作成されたCSVと
/// 一致させるため、既定ではこの値を使用する。
pub const LEGACY_TIMESTAMP_HIGH_MULTIPLIER: u64 = 65_535;

/// 時刻の上位ワードに掛ける係数（16ビットの桁上がり）
pub const TIMESTAMP_HIGH_MULTIPLIER: u64 = 65_536;

/// 摂氏に変換するときの絶対零度のオフセット
const KELVIN_OFFSET: f64 = 273.15;

/// 粒径ビンの下端直径（nm）
///
/// 前半16個が高ゲイン、後半16個が低ゲインのビンに対応する。
/// 最後の値は列ラベルをそろえるために重複させている。
pub const DEFAULT_BIN_DIAMETERS: [u32; 2 * BINS_PER_CHANNEL] = [
    275, 300, 325, 350, 375, 400, 450, 500, 550, 600, 650, 700, 750, 800, 900, 1000, 1200, 1400,
    1600, 1800, 2000, 2500, 3000, 3500, 4000, 6000, 8000, 10000, 13000, 16000, 24000, 24000,
];

/// ビン列の単位
const BIN_UNIT: &str = "[diam >nm]";

/// 生値から物理量への変換方法
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Calibration {
    /// 下位ワードと上位ワード（`high_word`）から組み立てるUnix時刻（秒）
    Timestamp { high_word: usize },
    /// 生値をそのまま使用
    Raw,
    /// 生値を除数で割る
    Scaled(f64),
    /// 0.01K単位の生値を摂氏に変換
    CentiKelvin,
}

impl Calibration {
    /// 生値のワード列から物理量を計算する。
    ///
    /// # 引数
    ///
    /// * `words` - チャンクのハウスキーピング生値
    /// * `word` - 項目に対応するワードの位置
    /// * `multiplier` - 時刻の上位ワードに掛ける係数
    ///
    /// # 戻り値
    ///
    /// 校正後の値
    pub fn apply(&self, words: &[u16; HOUSEKEEPING_WORDS], word: usize, multiplier: u64) -> f64 {
        let raw = words[word];
        match *self {
            Self::Timestamp { high_word } => {
                (raw as u64 + words[high_word] as u64 * multiplier) as f64
            }
            Self::Raw => raw as f64,
            Self::Scaled(divisor) => raw as f64 / divisor,
            Self::CentiKelvin => raw as f64 / 100.0 - KELVIN_OFFSET,
        }
    }

    /// 校正後の値が常に整数かどうかを返す。
    pub fn is_integral(&self) -> bool {
        matches!(self, Self::Timestamp { .. } | Self::Raw)
    }
}

/// ハウスキーピング項目
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Time,
    Pump1Current,
    Pump2Current,
    HeaterCurrent,
    DetectorCurrent,
    DetectorVoltage,
    InputVoltage,
    SecondaryInputVoltage,
    Flow,
    MotorVoltage,
    Pump1Temperature,
    Pump2Temperature,
    LaserTemperature,
    DcDcTemperature,
    InletTemperature,
}

impl Field {
    /// 行の中での列位置を返す。
    pub fn index(self) -> usize {
        self as usize
    }
}

/// ハウスキーピング項目の定義
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    /// 項目
    pub field: Field,
    /// 列名
    pub name: &'static str,
    /// 単位
    pub unit: &'static str,
    /// 生値のワード位置
    pub word: usize,
    /// 校正方法
    pub calibration: Calibration,
}

const fn spec(
    field: Field,
    name: &'static str,
    unit: &'static str,
    word: usize,
    calibration: Calibration,
) -> FieldSpec {
    FieldSpec {
        field,
        name,
        unit,
        word,
        calibration,
    }
}

/// ハウスキーピング項目の表
///
/// 並び順がそのままCSVの列順になる。
pub const HOUSEKEEPING_TABLE: [FieldSpec; HOUSEKEEPING_FIELDS] = [
    spec(Field::Time, "Time", "[Unix Time]", 0, Calibration::Timestamp { high_word: 1 }),
    spec(Field::Pump1Current, "Pump1_I", "[mA]", 2, Calibration::Raw),
    spec(Field::Pump2Current, "Pump2_I", "[mA]", 3, Calibration::Raw),
    spec(Field::HeaterCurrent, "Heater_I", "[mA]", 4, Calibration::Raw),
    spec(Field::DetectorCurrent, "PHA_I", "[mA]", 5, Calibration::Raw),
    spec(Field::DetectorVoltage, "PHA_12V", "[V]", 6, Calibration::Scaled(1000.0)),
    spec(Field::InputVoltage, "PHA_3V3", "[V]", 7, Calibration::Scaled(1000.0)),
    spec(Field::SecondaryInputVoltage, "Input_V", "[V]", 8, Calibration::Scaled(1000.0)),
    spec(Field::Flow, "Flow", "[SLPM]", 9, Calibration::Scaled(1000.0)),
    spec(Field::MotorVoltage, "Motor_V", "[V]", 10, Calibration::Scaled(1000.0)),
    spec(Field::Pump1Temperature, "Pump1_T", "[C]", 11, Calibration::CentiKelvin),
    spec(Field::Pump2Temperature, "Pump2_T", "[C]", 12, Calibration::CentiKelvin),
    spec(Field::LaserTemperature, "Laser_T", "[C]", 13, Calibration::CentiKelvin),
    spec(Field::DcDcTemperature, "DC-DC_T", "[C]", 14, Calibration::CentiKelvin),
    spec(Field::InletTemperature, "Inlet_T", "[C]", 15, Calibration::CentiKelvin),
];

/// チャンクの配置と時刻の組み立て方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLayout {
    /// 時刻の上位ワードに掛ける係数
    pub timestamp_high_multiplier: u64,
}

impl Default for PacketLayout {
    fn default() -> Self {
        Self {
            timestamp_high_multiplier: LEGACY_TIMESTAMP_HIGH_MULTIPLIER,
        }
    }
}

impl PacketLayout {
    /// 時刻の上位ワードを16ビットの桁上がりとして扱うレイアウトを返す。
    pub fn corrected() -> Self {
        Self {
            timestamp_high_multiplier: TIMESTAMP_HIGH_MULTIPLIER,
        }
    }

    /// 設定のフラグからレイアウトを構築する。
    pub fn from_rollover_flag(correct_timestamp_rollover: bool) -> Self {
        if correct_timestamp_rollover {
            Self::corrected()
        } else {
            Self::default()
        }
    }

    /// バイナリ部のバイト数から、サンプルとして扱うチャンクの数を返す。
    ///
    /// 開始ブロックの分を差し引くため、192バイト未満では0になる。
    pub fn chunk_count(&self, payload_len: usize) -> usize {
        (payload_len / CHUNK_BYTES).saturating_sub(1)
    }

    /// `index`番目のサンプルのチャンクが始まるバイト位置を返す。
    pub fn chunk_offset(&self, index: usize) -> usize {
        PREAMBLE_BYTES + (index + 1) * CHUNK_BYTES
    }
}

/// 粒径ビンの下端直径の並び
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinLayout {
    diameters: Vec<u32>,
}

impl Default for BinLayout {
    fn default() -> Self {
        Self {
            diameters: DEFAULT_BIN_DIAMETERS.to_vec(),
        }
    }
}

impl BinLayout {
    /// 粒径ビンの定義を構築する。
    ///
    /// # 引数
    ///
    /// * `diameters` - 高ゲイン16個、低ゲイン16個の順に並べた下端直径（nm）
    ///
    /// # 戻り値
    ///
    /// `BinLayout`
    pub fn new(diameters: Vec<u32>) -> LpcResult<Self> {
        if diameters.len() != 2 * BINS_PER_CHANNEL {
            return Err(LpcError::InvalidBinLayout(format!(
                "直径は{}個必要ですが、{}個指定されました。",
                2 * BINS_PER_CHANNEL,
                diameters.len()
            )));
        }
        if let Some(pos) = diameters.windows(2).position(|w| w[1] < w[0]) {
            return Err(LpcError::InvalidBinLayout(format!(
                "{}番目の直径`{}`が直前の値`{}`より小さくなっています。",
                pos + 1,
                diameters[pos + 1],
                diameters[pos]
            )));
        }

        Ok(Self { diameters })
    }

    /// CSVの列名を返す。
    pub fn column_names(&self) -> Vec<String> {
        HOUSEKEEPING_TABLE
            .iter()
            .map(|s| s.name.to_string())
            .chain(self.diameters.iter().map(|d| d.to_string()))
            .collect()
    }

    /// CSVの列の単位を返す。
    pub fn column_units(&self) -> Vec<String> {
        HOUSEKEEPING_TABLE
            .iter()
            .map(|s| s.unit.to_string())
            .chain(self.diameters.iter().map(|_| BIN_UNIT.to_string()))
            .collect()
    }
}
