//! セクション全体をたどるドライバー
//!
//! 各デコーダーは1つのユニット・1つの行番号プログラム・1つのセクションを
//! 処理するだけなので、ユニットのループやエラー後の再開はここで行います。

use crate::abbrev::AttributeList;
use crate::cfi::{CallFrameInfo, CallFrameInfoHandler};
use crate::line::{LineInfo, LineInfoHandler};
use crate::reader::ByteReader;
use crate::sections::{self, SectionMap};
use crate::unit::{CompilationUnit, Dwarf2Handler};
use crate::{Error, ErrorKind, Result};
use tracing::{debug, warn};

/// ドライバーの設定
#[derive(Debug, Clone, Default)]
pub struct DriverOptions {
    /// ユニットの解析に失敗しても、長さが分かっていれば次のユニットへ進む
    pub continue_on_error: bool,
    /// 処理するユニット数の上限
    pub max_units: Option<usize>,
}

/// `walk_units` の結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    /// 訪れたユニット数（失敗したものを含む）
    pub units: usize,
    /// 解析に失敗したユニット数
    pub failed: usize,
}

/// DWARFセクションのドライバー
pub struct Driver<'a> {
    sections: &'a SectionMap<'a>,
    reader: ByteReader,
    options: DriverOptions,
    frame_address: u64,
}

impl<'a> Driver<'a> {
    pub fn new(sections: &'a SectionMap<'a>, reader: ByteReader, options: DriverOptions) -> Self {
        Self {
            sections,
            reader,
            options,
            frame_address: 0,
        }
    }

    /// `.debug_frame` のロードアドレスを設定する
    pub fn set_frame_address(&mut self, address: u64) {
        self.frame_address = address;
    }

    /// `.debug_info` のすべてのコンパイルユニットを処理する
    pub fn walk_units(&self, handler: &mut dyn Dwarf2Handler) -> Result<WalkSummary> {
        let debug_info = self.sections.require(sections::DEBUG_INFO)?;
        let mut summary = WalkSummary::default();
        let mut offset = 0u64;

        while offset < debug_info.len() as u64 {
            if self.options.max_units.is_some_and(|max| summary.units >= max) {
                debug!("Stopping after {} units", summary.units);
                break;
            }
            summary.units += 1;

            let mut unit = CompilationUnit::new(self.sections, offset, self.reader, &mut *handler);
            match unit.start() {
                Ok(length) => offset = offset.checked_add(length).ok_or(Error::OutOfBounds)?,
                Err(err) => {
                    // ヘッダーから次のユニットの位置が分かる場合だけ続行できる
                    let next = unit
                        .header()
                        .and_then(|header| header.total_length())
                        .and_then(|length| offset.checked_add(length));
                    match next {
                        Some(next) if self.options.continue_on_error && err.kind() != ErrorKind::Aborted => {
                            warn!("Skipping compilation unit at 0x{:x}: {}", offset, err);
                            summary.failed += 1;
                            offset = next;
                        }
                        _ => return Err(err),
                    }
                }
            }
        }

        Ok(summary)
    }

    /// 各ユニットのルートDIEの `DW_AT_stmt_list`（`.debug_line` 内のオフセット）を集める
    pub fn line_program_offsets(&self) -> Result<Vec<u64>> {
        let mut collector = StmtListCollector::default();
        self.walk_units(&mut collector)?;
        Ok(collector.offsets)
    }

    /// `.debug_line` の `offset` にある行番号プログラムを1つ処理する
    ///
    /// # Returns
    /// 消費したバイト数
    pub fn walk_lines(&self, offset: u64, handler: &mut dyn LineInfoHandler) -> Result<u64> {
        let debug_line = self.sections.require(sections::DEBUG_LINE)?;
        let buffer = usize::try_from(offset)
            .ok()
            .and_then(|start| debug_line.get(start..))
            .ok_or(Error::OutOfBounds)?;
        LineInfo::new(buffer, self.reader, handler).start()
    }

    /// `.debug_frame` のすべてのCIE/FDEを処理する
    pub fn walk_frames(&self, register_names: &[String], handler: &mut dyn CallFrameInfoHandler) -> Result<()> {
        let debug_frame = self.sections.require(sections::DEBUG_FRAME)?;
        let mut cfi = CallFrameInfo::new(debug_frame, self.reader, register_names, handler);
        cfi.set_section_address(self.frame_address);
        cfi.start()
    }
}

/// ルートDIEだけを受け入れて `DW_AT_stmt_list` を記録するハンドラー
#[derive(Default)]
struct StmtListCollector {
    offsets: Vec<u64>,
    at_root: bool,
}

impl Dwarf2Handler for StmtListCollector {
    fn start_compilation_unit(&mut self, _: u64, _: u8, _: u8, _: u64, _: u16) -> bool {
        self.at_root = true;
        true
    }

    fn start_die(&mut self, _: u64, _: gimli::DwTag, _: &AttributeList) -> bool {
        std::mem::replace(&mut self.at_root, false)
    }

    fn process_attribute_unsigned(&mut self, _: u64, attr: gimli::DwAt, _: gimli::DwForm, data: u64) {
        if attr == gimli::DW_AT_stmt_list {
            self.offsets.push(data);
        }
    }

    fn process_attribute_signed(&mut self, _: u64, _: gimli::DwAt, _: gimli::DwForm, _: i64) {}

    fn process_attribute_buffer(&mut self, _: u64, _: gimli::DwAt, _: gimli::DwForm, _: &[u8]) {}

    fn process_attribute_string(&mut self, _: u64, _: gimli::DwAt, _: gimli::DwForm, _: &str) {}

    fn end_die(&mut self, _: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_sections() {
        let sections = SectionMap::new();
        let driver = Driver::new(
            &sections,
            ByteReader::new(gimli::RunTimeEndian::Little),
            DriverOptions::default(),
        );
        assert_eq!(
            driver.line_program_offsets(),
            Err(Error::MissingSection(".debug_info".to_string()))
        );

        struct Nothing;
        impl CallFrameInfoHandler for Nothing {
            fn entry(&mut self, _: u64, _: u64, _: u8, _: &str, _: u64) -> bool {
                true
            }
            fn rule(&mut self, _: u64, _: crate::Column, _: &str) -> bool {
                true
            }
        }
        assert_eq!(
            driver.walk_frames(&[], &mut Nothing),
            Err(Error::MissingSection(".debug_frame".to_string()))
        );
    }
}
