//! 光学式粒子計数器（LPC）のテレメトリ・パケットを復号し、集計する。
//!
//! パケットはgzip圧縮されたファイルで、XMLのメタデータに続いて`START`と`END`で囲まれた
//! バイナリ部を持つ。バイナリ部は96バイトのチャンクの列で、各チャンクにハウスキーピング
//! 16ワードと、高ゲイン・低ゲインそれぞれ16ビンの粒子カウントが記録されている。
//!
//! パケットはパケットごとのCSVに変換され、その後すべてのCSVを集計して、全サンプルを
//! 含むマスター・データセットと、パケットごとの平均データセットを作成する。
pub mod aggregator;
pub mod config;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod layout;
pub mod pipeline;
pub mod state_log;
pub mod writer;

pub use config::{AggregationConfig, LpcConfig};
pub use decoder::{decode_rows, BinCounts, DecodedRow, HousekeepingRecord, RecordDecoder};
pub use error::{LpcError, LpcResult};
pub use layout::{BinLayout, Field, PacketLayout};
