use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::error::{LpcError, LpcResult};
use crate::frame::find;

/// パケットのXML部に記録されている状態メッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMessage {
    /// `<Msg>`に記録されているメッセージ番号
    pub msg_id: String,
    /// `<StateMess1>`に記録されているメッセージ
    pub text: String,
}

/// `open`と`close`で囲まれた部分を文字列として取り出す。
fn tag_text(packet: &[u8], open: &[u8], close: &[u8]) -> Option<String> {
    let start = find(packet, open)? + open.len();
    let end = find(packet, close)?;
    let bytes = packet.get(start..end)?;

    Some(String::from_utf8_lossy(bytes).into_owned())
}

/// 展開したパケットから状態メッセージを取り出す。
///
/// `<StateMess1>`または`<Msg>`のいずれかが見つからない場合は`None`を返す。
pub fn extract_state_message(packet: &[u8]) -> Option<StateMessage> {
    let text = tag_text(packet, b"<StateMess1>", b"</StateMess1>")?;
    let msg_id = tag_text(packet, b"<Msg>", b"</Msg>")?;

    Some(StateMessage { msg_id, text })
}

/// 状態メッセージをログ・ファイルに1行追記する。
///
/// # 引数
///
/// * `log_path` - ログ・ファイルのパス
/// * `file_name` - メッセージを取り出したパケットのファイル名
/// * `message` - 状態メッセージ
pub fn append_state_log<P>(log_path: P, file_name: &str, message: &StateMessage) -> LpcResult<()>
where
    P: AsRef<Path>,
{
    let log_path = log_path.as_ref();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| LpcError::io(log_path, "オープン", e))?;
    writeln!(file, "{file_name}: {} {}", message.msg_id, message.text)
        .map_err(|e| LpcError::io(log_path, "書き込み", e))
}
