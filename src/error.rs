use std::path::Path;

/// LPCテレメトリ処理のエラー型
#[derive(Debug, Clone, thiserror::Error)]
pub enum LpcError {
    /// 予期しない例外
    #[error("{0}")]
    Unexpected(String),

    /// バイナリ部を囲むマーカーが見つからない
    #[error("バイナリ部のマーカー`{0}`が見つかりません。")]
    FrameNotFound(&'static str),

    /// バイナリ部のバイト数が不足している
    #[error(
        "バイナリ部が途中で終わっています。オフセット{offset}から{needed}バイトが必要ですが、バイナリ部は{len}バイトです。"
    )]
    TruncatedPayload {
        offset: usize,
        needed: usize,
        len: usize,
    },

    /// CSVのデータ行を数値として解釈できない
    #[error("{line}行目のデータを解釈できません。{reason}")]
    MalformedRow { line: usize, reason: String },

    /// ヘッダーの取得元となるCSVファイルが足りない
    #[error("集計には少なくとも2つのCSVファイルが必要ですが、{0}ファイルしか見つかりません。")]
    InsufficientInputFiles(usize),

    /// ファイルの読み書きエラー
    #[error("{0}")]
    Io(String),

    /// 粒径ビンの定義が不正
    #[error("粒径ビンの定義が不正です。{0}")]
    InvalidBinLayout(String),

    /// 設定ファイルのエラー
    #[error("設定ファイルを読み込めません。{0}")]
    Config(String),

    /// ファイル名パターンのエラー
    #[error("ファイル名のパターンが不正です。{0}")]
    Pattern(String),
}

impl LpcError {
    /// パスと操作の説明を付けて、入出力エラーを`LpcError::Io`に変換する。
    pub(crate) fn io<P>(path: P, action: &str, e: std::io::Error) -> Self
    where
        P: AsRef<Path>,
    {
        Self::Io(format!(
            "`{}`の{action}に失敗しました。{e}",
            path.as_ref().display()
        ))
    }
}

/// LPCテレメトリ処理の結果型
pub type LpcResult<T> = Result<T, LpcError>;
