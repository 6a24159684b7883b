//! デコードエラー
//!
//! `thiserror` でエラー型を定義します。
//! どのエラーも、発生したユニットまたはエントリにだけ影響します。
//! ドライバーは次の既知のオフセットから解析を続行できます。

use thiserror::Error;

/// エラーの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 形式エラー（未知のフォーム・オペコード、長さの不整合、参照先の欠落など）
    Format,
    /// バッファの終端を越えて読もうとした
    Bounds,
    /// ハンドラーが処理の中断を要求した
    Aborted,
}

/// DWARFデコードエラー
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// カーソルがバッファ（またはユニット・エントリの宣言長）の終端を越えた
    #[error("Unexpected end of data")]
    OutOfBounds,

    /// 必要なセクションがセクションマップに存在しない
    #[error("Missing section {0}")]
    MissingSection(String),

    /// 対応していないDWARFバージョン
    #[error("Unsupported DWARF version {0}")]
    UnsupportedVersion(u16),

    /// アブリビエーションテーブルに存在しないコード
    #[error("Unknown abbreviation code {code} for DIE at offset 0x{offset:x}")]
    UnknownAbbreviation { code: u64, offset: u64 },

    /// 同じコードのアブリビエーションが2回定義された
    #[error("Duplicate abbreviation code {0}")]
    DuplicateAbbreviation(u64),

    /// 未知の属性フォーム
    #[error("Unknown attribute form 0x{0:x}")]
    UnknownForm(u64),

    /// 不正な行番号プログラムヘッダー
    #[error("Invalid line program header: {0}")]
    InvalidLineHeader(&'static str),

    /// 拡張オペコードが宣言長を超えてデータを消費した
    #[error("Extended line opcode 0x{opcode:x} overran its declared length {length}")]
    ExtendedOpcodeOverrun { opcode: u8, length: u64 },

    /// 未知のコールフレーム命令
    #[error("Unknown call frame instruction 0x{0:x}")]
    UnknownCfaInstruction(u8),

    /// FDEが参照するCIEが存在しない
    #[error("FDE at offset 0x{fde:x} refers to missing CIE at offset 0x{cie:x}")]
    MissingCie { fde: u64, cie: u64 },

    /// 解釈できないCIE拡張文字列
    #[error("Unsupported CIE augmentation \"{0}\"")]
    BadAugmentation(String),

    /// 対応していないポインタエンコーディング
    #[error("Unsupported pointer encoding 0x{0:x}")]
    UnsupportedPointerEncoding(u8),

    /// 後置記法に変換できないDWARF式の演算
    #[error("Unsupported expression operation 0x{0:x}")]
    UnsupportedExpression(u8),

    /// 値が不足する演算、または結果が1つに定まらない式
    #[error("Unbalanced expression (stack depth {0})")]
    UnbalancedExpression(usize),

    /// レジスタオフセット以外のCFAに対するオフセット・レジスタ変更
    #[error("CFA rule is not register-relative")]
    CfaNotRegisterRelative,

    /// remember_state されていない状態を restore_state しようとした
    #[error("restore_state without matching remember_state")]
    RestoreStateUnderflow,

    /// ハンドラーが処理の中断を要求した
    #[error("Handler aborted processing at offset 0x{0:x}")]
    HandlerAborted(u64),

    /// gimli が報告したその他の不正データ
    #[error("Malformed DWARF data: {0}")]
    Malformed(gimli::Error),
}

impl Error {
    /// エラーの分類を取得
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OutOfBounds => ErrorKind::Bounds,
            Error::HandlerAborted(_) => ErrorKind::Aborted,
            _ => ErrorKind::Format,
        }
    }
}

impl From<gimli::Error> for Error {
    fn from(err: gimli::Error) -> Self {
        match err {
            gimli::Error::UnexpectedEof(_) => Error::OutOfBounds,
            other => Error::Malformed(other),
        }
    }
}
