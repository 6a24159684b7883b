//! DWARF2/3 デバッグ情報リーダー
//!
//! このクレートは、オブジェクトファイルに含まれるDWARFセクションを読み取り、
//! 結果をハンドラーへのコールバックとして通知します。
//! コンパイルユニット（DIEツリー）、行番号プログラム、コールフレーム情報の
//! 3つのデコーダーはそれぞれ独立して動作します。

pub mod error;
pub mod reader;
pub mod sections;
pub mod abbrev;
pub mod form;
pub mod unit;
pub mod line;
pub mod cfi;
pub mod postfix;
pub mod registers;
pub mod loader;
pub mod driver;

pub use error::{Error, ErrorKind};
pub use reader::{ByteReader, Slice};
pub use sections::SectionMap;
pub use abbrev::{Abbreviation, AbbreviationTable, AttributeList};
pub use form::{FormReader, FormValue};
pub use unit::{CompilationUnit, CompilationUnitHeader, Dwarf2Handler};
pub use line::{LineInfo, LineInfoHandler, LineInfoHeader, LineStateMachine, OpcodeStep};
pub use cfi::{CallFrameInfo, CallFrameInfoHandler, Column};
pub use registers::RegisterNames;
pub use loader::DwarfLoader;
pub use driver::{Driver, DriverOptions, WalkSummary};

/// DWARF解析の結果型
pub type Result<T> = std::result::Result<T, Error>;
