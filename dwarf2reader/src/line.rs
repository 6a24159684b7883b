//! 行番号プログラムの解釈（.debug_line）
//!
//! ヘッダーからディレクトリ・ファイルテーブルを読み取った後、
//! 行番号ステートマシンでバイトコードを実行し、アドレスとソース行の
//! 対応表を行ごとにハンドラーへ通知します。

use crate::reader::{ByteReader, Slice};
use crate::{Error, Result};
use gimli::Reader;
use tracing::{debug, trace};

/// 行番号情報の通知を受け取るハンドラー
pub trait LineInfoHandler {
    /// ディレクトリの定義。番号は1から始まる
    fn define_dir(&mut self, name: &str, dir_num: u32);

    /// ファイルの定義
    ///
    /// `file_num` はヘッダーのテーブルでは1から始まる番号です。
    /// プログラム中で `DW_LNE_define_file` により定義された場合は -1 で、
    /// 「次の空き番号」を意味します。
    fn define_file(&mut self, name: &str, file_num: i32, dir_num: u32, mod_time: u64, length: u64);

    /// アドレスと行の組（行テーブルの1行）
    fn add_line(&mut self, address: u64, file_num: u32, line_num: u32, column_num: u32);

    /// シーケンスの終わり。`address` は最後の命令の直後のアドレス
    ///
    /// 1つのプログラムに複数回現れることがあります。
    fn end_sequence(&mut self, address: u64);
}

/// 行番号プログラムヘッダー
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfoHeader {
    /// 長さフィールド自体を含まない長さ
    pub total_length: u64,
    pub version: u16,
    /// ヘッダー長フィールドの直後からプログラム先頭までのバイト数
    pub prologue_length: u64,
    pub min_insn_length: u8,
    /// DWARF4 以降のみ。それ以前は1
    pub max_ops_per_insn: u8,
    pub default_is_stmt: bool,
    pub line_base: i8,
    pub line_range: u8,
    pub opcode_base: u8,
    /// 標準オペコードごとのオペランド数（添字はオペコード、0番は未使用）
    pub std_opcode_lengths: Vec<u8>,
}

/// 行番号ステートマシンのレジスタ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineStateMachine {
    pub address: u64,
    pub file_num: u32,
    pub line_num: u32,
    pub column_num: u32,
    pub is_stmt: bool,
    pub basic_block: bool,
    pub end_sequence: bool,
    pub prologue_end: bool,
    pub epilogue_begin: bool,
    pub isa: u64,
    pub discriminator: u64,
}

impl LineStateMachine {
    pub fn new(default_is_stmt: bool) -> Self {
        Self {
            address: 0,
            file_num: 1,
            line_num: 1,
            column_num: 0,
            is_stmt: default_is_stmt,
            basic_block: false,
            end_sequence: false,
            prologue_end: false,
            epilogue_begin: false,
            isa: 0,
            discriminator: 0,
        }
    }

    /// シーケンス開始時の初期値に戻す
    pub fn reset(&mut self, default_is_stmt: bool) {
        *self = Self::new(default_is_stmt);
    }
}

/// 1オペコード分の処理結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeStep {
    /// 現在の状態で行（またはシーケンス終端）を出力すべきか
    pub add_line: bool,
    /// 旧アドレス < pc <= 新アドレス が成り立ったか
    pub passes_pc: bool,
    /// オペコードのバイト数
    pub length: usize,
}

/// 1つのコンパイルユニット分の行番号プログラムのデコーダー
pub struct LineInfo<'a, 'h> {
    buffer: &'a [u8],
    reader: ByteReader,
    handler: &'h mut dyn LineInfoHandler,
    header: Option<LineInfoHeader>,
}

impl<'a, 'h> LineInfo<'a, 'h> {
    /// `buffer` は行番号プログラムの先頭から始まるバッファ
    pub fn new(buffer: &'a [u8], reader: ByteReader, handler: &'h mut dyn LineInfoHandler) -> Self {
        Self {
            buffer,
            reader,
            handler,
            header: None,
        }
    }

    pub fn header(&self) -> Option<&LineInfoHeader> {
        self.header.as_ref()
    }

    /// ヘッダーとプログラムを処理し、消費したバイト数を返す
    pub fn start(&mut self) -> Result<u64> {
        let (header, program, total) = self.read_header()?;
        debug!(
            "Line program: version {}, length 0x{:x}, opcode_base {}, line_base {}, line_range {}",
            header.version, header.total_length, header.opcode_base, header.line_base, header.line_range
        );
        self.read_lines(&header, program)?;
        self.header = Some(header);
        Ok(total)
    }

    fn read_header(&mut self) -> Result<(LineInfoHeader, &'a [u8], u64)> {
        let mut cursor = self.reader.slice(self.buffer);
        let (total_length, initial_length_size) = self.reader.read_initial_length(&mut cursor)?;
        let total = total_length
            .checked_add(initial_length_size as u64)
            .ok_or(Error::OutOfBounds)?;
        let total_len = usize::try_from(total).map_err(|_| Error::OutOfBounds)?;
        let unit = self.buffer.get(..total_len).ok_or(Error::OutOfBounds)?;

        let base = self.reader.slice(unit);
        let mut cursor = base;
        cursor.skip(initial_length_size)?;

        let version = cursor.read_u16()?;
        if !(2..=4).contains(&version) {
            return Err(Error::UnsupportedVersion(version));
        }
        let prologue_length = self.reader.read_offset(&mut cursor)?;
        let prologue_start = ByteReader::position(&base, &cursor);
        let after_header = prologue_start
            .checked_add(prologue_length)
            .and_then(|end| usize::try_from(end).ok())
            .ok_or(Error::OutOfBounds)?;
        let program = unit.get(after_header..).ok_or(Error::OutOfBounds)?;

        // ヘッダーのフィールドとテーブルは prologue_length の範囲内で読む
        let prologue_bytes = unit
            .get(unit.len() - cursor.len()..after_header)
            .ok_or(Error::OutOfBounds)?;
        let mut cursor = self.reader.slice(prologue_bytes);

        let min_insn_length = cursor.read_u8()?;
        let max_ops_per_insn = if version >= 4 { cursor.read_u8()? } else { 1 };
        let default_is_stmt = cursor.read_u8()? != 0;
        let line_base = cursor.read_i8()?;
        let line_range = cursor.read_u8()?;
        let opcode_base = cursor.read_u8()?;
        if line_range == 0 {
            return Err(Error::InvalidLineHeader("line_range is zero"));
        }
        if opcode_base == 0 {
            return Err(Error::InvalidLineHeader("opcode_base is zero"));
        }

        let mut std_opcode_lengths = vec![0u8; usize::from(opcode_base)];
        for length in std_opcode_lengths.iter_mut().skip(1) {
            *length = cursor.read_u8()?;
        }

        let mut dir_num = 1u32;
        loop {
            let name = self.reader.read_cstr(&mut cursor)?;
            if name.is_empty() {
                break;
            }
            self.handler.define_dir(&name.to_string_lossy(), dir_num);
            dir_num += 1;
        }

        let mut file_num = 1i32;
        loop {
            let name = self.reader.read_cstr(&mut cursor)?;
            if name.is_empty() {
                break;
            }
            let dir = saturate(cursor.read_uleb128()?);
            let mod_time = cursor.read_uleb128()?;
            let length = cursor.read_uleb128()?;
            self.handler
                .define_file(&name.to_string_lossy(), file_num, dir, mod_time, length);
            file_num += 1;
        }

        let header = LineInfoHeader {
            total_length,
            version,
            prologue_length,
            min_insn_length,
            max_ops_per_insn,
            default_is_stmt,
            line_base,
            line_range,
            opcode_base,
            std_opcode_lengths,
        };
        Ok((header, program, total))
    }

    fn read_lines(&mut self, header: &LineInfoHeader, program: &'a [u8]) -> Result<()> {
        let mut cursor = self.reader.slice(program);
        let mut lsm = LineStateMachine::new(header.default_is_stmt);
        let mut last_row_address: Option<u64> = None;

        while !cursor.is_empty() {
            let step = Self::process_one_opcode(&self.reader, &mut *self.handler, header, &mut cursor, &mut lsm, None)?;
            if !step.add_line {
                continue;
            }
            if lsm.end_sequence {
                last_row_address = None;
            } else {
                if last_row_address.is_some_and(|last| lsm.address < last) {
                    trace!("Line table address went backwards to 0x{:x}", lsm.address);
                }
                last_row_address = Some(lsm.address);
            }
            Self::emit_row(&mut *self.handler, header, &mut lsm);
        }
        Ok(())
    }

    /// `process_one_opcode` が行の出力を求めた時の処理
    ///
    /// シーケンス終端なら `end_sequence` を通知してステートマシンをリセットし、
    /// そうでなければ `add_line` を通知して行ごとのフラグをクリアします。
    pub fn emit_row(handler: &mut dyn LineInfoHandler, header: &LineInfoHeader, lsm: &mut LineStateMachine) {
        if lsm.end_sequence {
            handler.end_sequence(lsm.address);
            lsm.reset(header.default_is_stmt);
        } else {
            handler.add_line(lsm.address, lsm.file_num, lsm.line_num, lsm.column_num);
            lsm.basic_block = false;
            lsm.prologue_end = false;
            lsm.epilogue_begin = false;
            lsm.discriminator = 0;
        }
    }

    /// 1つのオペコードを処理する
    ///
    /// `pc` を指定すると、このオペコードで ステートマシンの旧アドレス < pc <= 新アドレス
    /// が成り立ったかどうかを `passes_pc` で返します。プログラム全体を再実行せずに
    /// アドレスを探すのに使えます。行の出力は呼び出し側（`emit_row`）が行います。
    pub fn process_one_opcode(
        reader: &ByteReader,
        handler: &mut dyn LineInfoHandler,
        header: &LineInfoHeader,
        cursor: &mut Slice<'_>,
        lsm: &mut LineStateMachine,
        pc: Option<u64>,
    ) -> Result<OpcodeStep> {
        let start_len = cursor.len();
        let old_address = lsm.address;
        let min_insn_length = u64::from(header.min_insn_length);
        let mut add_line = false;

        let opcode = cursor.read_u8()?;
        if opcode == 0 {
            add_line = Self::process_extended(reader, handler, cursor, lsm)?;
        } else if opcode >= header.opcode_base {
            // 特殊オペコード: アドレスと行を同時に進める
            let adjusted = opcode - header.opcode_base;
            let address_advance = u64::from(adjusted / header.line_range) * min_insn_length;
            let line_advance = i64::from(header.line_base) + i64::from(adjusted % header.line_range);
            lsm.address = lsm.address.wrapping_add(address_advance);
            lsm.line_num = advance_line(lsm.line_num, line_advance);
            add_line = true;
        } else {
            match gimli::DwLns(opcode) {
                gimli::DW_LNS_copy => add_line = true,
                gimli::DW_LNS_advance_pc => {
                    let advance = cursor.read_uleb128()?;
                    lsm.address = lsm.address.wrapping_add(advance.wrapping_mul(min_insn_length));
                }
                gimli::DW_LNS_advance_line => {
                    let advance = cursor.read_sleb128()?;
                    lsm.line_num = advance_line(lsm.line_num, advance);
                }
                gimli::DW_LNS_set_file => lsm.file_num = saturate(cursor.read_uleb128()?),
                gimli::DW_LNS_set_column => lsm.column_num = saturate(cursor.read_uleb128()?),
                gimli::DW_LNS_negate_stmt => lsm.is_stmt = !lsm.is_stmt,
                gimli::DW_LNS_set_basic_block => lsm.basic_block = true,
                gimli::DW_LNS_const_add_pc => {
                    let adjusted = 255 - header.opcode_base;
                    let advance = u64::from(adjusted / header.line_range) * min_insn_length;
                    lsm.address = lsm.address.wrapping_add(advance);
                }
                gimli::DW_LNS_fixed_advance_pc => {
                    let advance = cursor.read_u16()?;
                    lsm.address = lsm.address.wrapping_add(u64::from(advance));
                }
                gimli::DW_LNS_set_prologue_end => lsm.prologue_end = true,
                gimli::DW_LNS_set_epilogue_begin => lsm.epilogue_begin = true,
                gimli::DW_LNS_set_isa => lsm.isa = cursor.read_uleb128()?,
                _ => {
                    // 未知の標準オペコードはオペランド数だけ読み飛ばす
                    let operands = header
                        .std_opcode_lengths
                        .get(usize::from(opcode))
                        .copied()
                        .unwrap_or(0);
                    for _ in 0..operands {
                        cursor.read_uleb128()?;
                    }
                }
            }
        }

        let passes_pc = pc.is_some_and(|pc| old_address < pc && pc <= lsm.address);
        Ok(OpcodeStep {
            add_line,
            passes_pc,
            length: start_len - cursor.len(),
        })
    }

    /// 拡張オペコード（0, ULEB128長さ, サブオペコード, オペランド）
    fn process_extended(
        reader: &ByteReader,
        handler: &mut dyn LineInfoHandler,
        cursor: &mut Slice<'_>,
        lsm: &mut LineStateMachine,
    ) -> Result<bool> {
        let length = cursor.read_uleb128()?;
        if length == 0 {
            return Ok(false);
        }
        let before = cursor.len();
        let sub_opcode = cursor.read_u8()?;
        let mut add_line = false;

        match gimli::DwLne(sub_opcode) {
            gimli::DW_LNE_end_sequence => {
                lsm.end_sequence = true;
                add_line = true;
            }
            gimli::DW_LNE_set_address => {
                let size = u8::try_from(length - 1).map_err(|_| Error::ExtendedOpcodeOverrun {
                    opcode: sub_opcode,
                    length,
                })?;
                lsm.address = cursor.read_address(size)?;
            }
            gimli::DW_LNE_define_file => {
                let name = reader.read_cstr(cursor)?;
                let dir = saturate(cursor.read_uleb128()?);
                let mod_time = cursor.read_uleb128()?;
                let file_length = cursor.read_uleb128()?;
                handler.define_file(&name.to_string_lossy(), -1, dir, mod_time, file_length);
            }
            gimli::DW_LNE_set_discriminator => lsm.discriminator = cursor.read_uleb128()?,
            _ => trace!("Skipping unknown extended line opcode 0x{:x}", sub_opcode),
        }

        let consumed = (before - cursor.len()) as u64;
        if consumed > length {
            return Err(Error::ExtendedOpcodeOverrun {
                opcode: sub_opcode,
                length,
            });
        }
        let remaining = usize::try_from(length - consumed).map_err(|_| Error::OutOfBounds)?;
        cursor.skip(remaining)?;
        Ok(add_line)
    }
}

fn advance_line(line: u32, delta: i64) -> u32 {
    i64::from(line).wrapping_add(delta) as u32
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Rows {
        rows: Vec<(u64, u32, u32, u32)>,
        ends: Vec<u64>,
        files: Vec<(String, i32)>,
    }

    impl LineInfoHandler for Rows {
        fn define_dir(&mut self, _: &str, _: u32) {}
        fn define_file(&mut self, name: &str, file_num: i32, _: u32, _: u64, _: u64) {
            self.files.push((name.to_string(), file_num));
        }
        fn add_line(&mut self, address: u64, file_num: u32, line_num: u32, column_num: u32) {
            self.rows.push((address, file_num, line_num, column_num));
        }
        fn end_sequence(&mut self, address: u64) {
            self.ends.push(address);
        }
    }

    fn header(opcode_base: u8, line_base: i8, line_range: u8, min_insn_length: u8) -> LineInfoHeader {
        let mut std_opcode_lengths = vec![0, 0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1];
        std_opcode_lengths.resize(usize::from(opcode_base), 0);
        LineInfoHeader {
            total_length: 0,
            version: 2,
            prologue_length: 0,
            min_insn_length,
            max_ops_per_insn: 1,
            default_is_stmt: true,
            line_base,
            line_range,
            opcode_base,
            std_opcode_lengths,
        }
    }

    fn step(header: &LineInfoHeader, bytes: &[u8], lsm: &mut LineStateMachine) -> OpcodeStep {
        let reader = ByteReader::new(gimli::RunTimeEndian::Little);
        let mut handler = Rows::default();
        let mut cursor = reader.slice(bytes);
        LineInfo::process_one_opcode(&reader, &mut handler, header, &mut cursor, lsm, None).unwrap()
    }

    #[test]
    fn test_special_opcode_arithmetic() {
        // adjusted = 32 - 13 = 19, アドレス += (19 / 14) * 4, 行 += -5 + (19 % 14)
        let header = header(13, -5, 14, 4);
        let mut lsm = LineStateMachine::new(true);
        let result = step(&header, &[0x20], &mut lsm);
        assert!(result.add_line);
        assert_eq!(result.length, 1);
        assert_eq!(lsm.address, 4);
        assert_eq!(lsm.line_num, 1);
    }

    #[test]
    fn test_small_opcode_base_makes_standard_opcodes_special() {
        // opcode_base = 10 では 10 以上はすべて特殊オペコード
        let header = header(10, -1, 4, 1);
        let mut lsm = LineStateMachine::new(true);
        let result = step(&header, &[11], &mut lsm);
        assert!(result.add_line);
        assert_eq!(lsm.address, 0);
        assert_eq!(lsm.line_num, 1);
        assert!(!lsm.epilogue_begin);
    }

    #[test]
    fn test_const_add_pc_and_fixed_advance() {
        let header = header(13, -5, 14, 1);
        let mut lsm = LineStateMachine::new(true);
        // (255 - 13) / 14 = 17
        step(&header, &[gimli::DW_LNS_const_add_pc.0], &mut lsm);
        assert_eq!(lsm.address, 17);
        step(&header, &[gimli::DW_LNS_fixed_advance_pc.0, 0x00, 0x01], &mut lsm);
        assert_eq!(lsm.address, 17 + 0x100);
    }

    #[test]
    fn test_unknown_standard_opcode_skips_operands() {
        let mut header = header(14, -5, 14, 1);
        header.std_opcode_lengths[13] = 2;
        let mut lsm = LineStateMachine::new(true);
        let result = step(&header, &[13, 0x80, 0x01, 0x05, 0x01], &mut lsm);
        assert!(!result.add_line);
        assert_eq!(result.length, 4);
        assert_eq!(lsm, LineStateMachine::new(true));
    }

    #[test]
    fn test_extended_opcode_length_is_enforced() {
        let header = header(13, -5, 14, 1);
        let reader = ByteReader::new(gimli::RunTimeEndian::Little);
        let mut handler = Rows::default();
        let mut lsm = LineStateMachine::new(true);

        // 未知の拡張オペコードは宣言長だけ読み飛ばす
        let bytes = [0x00, 0x03, 0x80, 0xaa, 0xbb, 0x01];
        let mut cursor = reader.slice(&bytes);
        let result =
            LineInfo::process_one_opcode(&reader, &mut handler, &header, &mut cursor, &mut lsm, None).unwrap();
        assert_eq!(result.length, 5);

        // set_discriminator が宣言長より多く読む
        let bytes = [0x00, 0x01, 0x04, 0x05];
        let mut cursor = reader.slice(&bytes);
        let err = LineInfo::process_one_opcode(&reader, &mut handler, &header, &mut cursor, &mut lsm, None)
            .unwrap_err();
        assert_eq!(
            err,
            Error::ExtendedOpcodeOverrun {
                opcode: 0x04,
                length: 1
            }
        );
    }

    #[test]
    fn test_define_file_reports_next_index() {
        let header = header(13, -5, 14, 1);
        let reader = ByteReader::new(gimli::RunTimeEndian::Little);
        let mut handler = Rows::default();
        let mut lsm = LineStateMachine::new(true);
        let bytes = [0x00, 0x08, 0x03, b'a', b'.', b'c', 0x00, 0x01, 0x00, 0x00];
        let mut cursor = reader.slice(&bytes);
        LineInfo::process_one_opcode(&reader, &mut handler, &header, &mut cursor, &mut lsm, None).unwrap();
        assert_eq!(handler.files, vec![("a.c".to_string(), -1)]);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_emit_row_resets_after_end_sequence() {
        let header = header(13, -5, 14, 1);
        let mut handler = Rows::default();
        let mut lsm = LineStateMachine::new(true);
        lsm.address = 0x40;
        lsm.line_num = 9;
        lsm.basic_block = true;

        LineInfo::emit_row(&mut handler, &header, &mut lsm);
        assert_eq!(handler.rows, vec![(0x40, 1, 9, 0)]);
        assert!(!lsm.basic_block);

        lsm.end_sequence = true;
        LineInfo::emit_row(&mut handler, &header, &mut lsm);
        assert_eq!(handler.ends, vec![0x40]);
        assert_eq!(lsm, LineStateMachine::new(true));
    }
}
