//! コンパイルユニットとDIEツリーのデコード（.debug_info）
//!
//! DIEはノードとして実体化されず、`.debug_info` 先頭からの絶対オフセットが
//! そのまま識別子になります。DIEツリーを深さ優先でたどり、ハンドラーに
//! `start_die` / 属性 / `end_die` を通知します。

use crate::abbrev::{Abbreviation, AbbreviationTable, AttributeList};
use crate::form::{FormReader, FormValue};
use crate::reader::{ByteReader, Slice};
use crate::sections::{self, SectionMap};
use crate::{Error, Result};
use gimli::Reader;
use tracing::{debug, warn};

/// DIEツリーの通知を受け取るハンドラー
///
/// オフセットはすべて `.debug_info` 先頭からの絶対オフセットです。
/// バッファ・文字列はコールバックの間だけ有効なので、保持する場合はコピーしてください。
pub trait Dwarf2Handler {
    /// コンパイルユニットの開始。`false` を返すとユニット全体を読み飛ばす
    fn start_compilation_unit(
        &mut self,
        offset: u64,
        address_size: u8,
        offset_size: u8,
        cu_length: u64,
        dwarf_version: u16,
    ) -> bool;

    /// DIEの開始。`false` を返すとこのDIEの属性と子孫は通知されない
    fn start_die(&mut self, offset: u64, tag: gimli::DwTag, attributes: &AttributeList) -> bool;

    fn process_attribute_unsigned(&mut self, offset: u64, attr: gimli::DwAt, form: gimli::DwForm, data: u64);

    fn process_attribute_signed(&mut self, offset: u64, attr: gimli::DwAt, form: gimli::DwForm, data: i64);

    fn process_attribute_buffer(&mut self, offset: u64, attr: gimli::DwAt, form: gimli::DwForm, data: &[u8]);

    fn process_attribute_string(&mut self, offset: u64, attr: gimli::DwAt, form: gimli::DwForm, data: &str);

    /// DIEの終了。子を持つDIEでは、すべての子孫の `end_die` の後に呼ばれる
    fn end_die(&mut self, offset: u64);
}

/// コンパイルユニットヘッダー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilationUnitHeader {
    /// 長さフィールド自体を含まないユニットの長さ
    pub length: u64,
    pub version: u16,
    /// `.debug_abbrev` 内のアブリビエーションテーブルのオフセット
    pub abbrev_offset: u64,
    pub address_size: u8,
    /// 4（32ビットDWARF）または8（64ビットDWARF）
    pub offset_size: u8,
}

impl CompilationUnitHeader {
    /// ヘッダーを含むユニット全体の長さ
    ///
    /// 宣言された長さが `u64` に収まらない場合は `None`。
    pub fn total_length(&self) -> Option<u64> {
        let initial_length_size = if self.offset_size == 8 { 12 } else { 4 };
        self.length.checked_add(initial_length_size)
    }
}

/// 1つのコンパイルユニットのデコーダー
pub struct CompilationUnit<'a, 'h> {
    debug_info: Option<&'a [u8]>,
    debug_abbrev: Option<&'a [u8]>,
    debug_str: Option<&'a [u8]>,
    /// `.debug_info` 先頭からのユニットのオフセット
    offset: u64,
    reader: ByteReader,
    handler: &'h mut dyn Dwarf2Handler,
    header: Option<CompilationUnitHeader>,
}

impl<'a, 'h> CompilationUnit<'a, 'h> {
    /// コンパイルユニットのデコーダーを作成する
    ///
    /// # Arguments
    /// * `sections` - セクションマップ
    /// * `offset` - `.debug_info` 内のユニットのオフセット
    /// * `reader` - エンディアンが設定されたバイトリーダー
    /// * `handler` - 通知先のハンドラー
    pub fn new(
        sections: &SectionMap<'a>,
        offset: u64,
        reader: ByteReader,
        handler: &'h mut dyn Dwarf2Handler,
    ) -> Self {
        Self {
            debug_info: sections.get(sections::DEBUG_INFO),
            debug_abbrev: sections.get(sections::DEBUG_ABBREV),
            debug_str: sections.get(sections::DEBUG_STR),
            offset,
            reader,
            handler,
            header: None,
        }
    }

    /// 読み取ったヘッダー（ヘッダーの読み取りに成功していれば）
    ///
    /// `start` が失敗した場合でも、ヘッダーが読めていれば次のユニットへ進むのに使えます。
    pub fn header(&self) -> Option<&CompilationUnitHeader> {
        self.header.as_ref()
    }

    /// ユニットを1つ解析し、ヘッダーを含むユニット全体の長さを返す
    pub fn start(&mut self) -> Result<u64> {
        let debug_info = self
            .debug_info
            .ok_or_else(|| Error::MissingSection(sections::DEBUG_INFO.to_string()))?;
        let start = usize::try_from(self.offset).map_err(|_| Error::OutOfBounds)?;
        let rest = debug_info.get(start..).ok_or(Error::OutOfBounds)?;

        let mut cursor = self.reader.slice(rest);
        let header = self.read_header(&mut cursor)?;
        self.header = Some(header);
        let total = header.total_length().ok_or(Error::OutOfBounds)?;

        debug!(
            "Compilation unit at 0x{:x}: version {}, length 0x{:x}, address size {}, offset size {}",
            self.offset, header.version, header.length, header.address_size, header.offset_size
        );

        // 宣言された長さがセクションに収まっていること
        let total_len = usize::try_from(total).map_err(|_| Error::OutOfBounds)?;
        let unit_bytes = rest.get(..total_len).ok_or(Error::OutOfBounds)?;
        let header_len = rest.len() - cursor.len();
        let body = unit_bytes.get(header_len..).ok_or(Error::OutOfBounds)?;

        if !self.handler.start_compilation_unit(
            self.offset,
            header.address_size,
            header.offset_size,
            header.length,
            header.version,
        ) {
            debug!("Handler skipped compilation unit at 0x{:x}", self.offset);
            return Ok(total);
        }

        let debug_abbrev = self
            .debug_abbrev
            .ok_or_else(|| Error::MissingSection(sections::DEBUG_ABBREV.to_string()))?;
        let abbrevs = AbbreviationTable::parse(&self.reader, debug_abbrev, header.abbrev_offset)?;

        let forms = FormReader::new(self.reader, header.version, self.offset, self.debug_str);
        self.process_dies(&abbrevs, &forms, body, self.offset + header_len as u64)?;

        Ok(total)
    }

    fn read_header(&mut self, cursor: &mut Slice<'a>) -> Result<CompilationUnitHeader> {
        let (length, _) = self.reader.read_initial_length(cursor)?;
        let version = cursor.read_u16()?;
        if !(2..=4).contains(&version) {
            // 長さは分かっているので、呼び出し側は次のユニットへ進める
            self.header = Some(CompilationUnitHeader {
                length,
                version,
                abbrev_offset: 0,
                address_size: 0,
                offset_size: self.reader.offset_size(),
            });
            return Err(Error::UnsupportedVersion(version));
        }
        let abbrev_offset = self.reader.read_offset(cursor)?;
        let address_size = cursor.read_u8()?;
        self.reader.set_address_size(address_size);

        Ok(CompilationUnitHeader {
            length,
            version,
            abbrev_offset,
            address_size,
            offset_size: self.reader.offset_size(),
        })
    }

    /// ユニット本体のDIEをすべて処理する
    ///
    /// `body_offset` は本体先頭の `.debug_info` 内オフセット。
    fn process_dies(
        &mut self,
        abbrevs: &AbbreviationTable,
        forms: &FormReader<'a>,
        body: &'a [u8],
        body_offset: u64,
    ) -> Result<()> {
        let base = self.reader.slice(body);
        let mut cursor = base;
        let mut parents: Vec<u64> = Vec::new();

        while !cursor.is_empty() {
            let die_offset = body_offset + ByteReader::position(&base, &cursor);
            let code = cursor.read_uleb128()?;
            if code == 0 {
                // 兄弟の終わり。ルートレベルならユニットの終わり
                match parents.pop() {
                    Some(parent) => self.handler.end_die(parent),
                    None => break,
                }
                continue;
            }

            let abbrev = lookup(abbrevs, code, die_offset)?;
            if self.handler.start_die(die_offset, abbrev.tag, &abbrev.attributes) {
                self.process_attributes(die_offset, abbrev, forms, &mut cursor)?;
                if abbrev.has_children {
                    parents.push(die_offset);
                } else {
                    self.handler.end_die(die_offset);
                }
            } else {
                skip_attributes(abbrev, forms, &mut cursor)?;
                if abbrev.has_children {
                    skip_subtree(abbrevs, forms, &base, body_offset, &mut cursor)?;
                }
                self.handler.end_die(die_offset);
            }
        }

        if !parents.is_empty() {
            warn!(
                "Compilation unit at 0x{:x} ended with {} open DIEs",
                self.offset,
                parents.len()
            );
        }
        while let Some(parent) = parents.pop() {
            self.handler.end_die(parent);
        }
        Ok(())
    }

    fn process_attributes(
        &mut self,
        die_offset: u64,
        abbrev: &Abbreviation,
        forms: &FormReader<'a>,
        cursor: &mut Slice<'a>,
    ) -> Result<()> {
        for &(attr, form) in &abbrev.attributes {
            let (form, value) = forms.read(form, cursor)?;
            match value {
                FormValue::Unsigned(data) => {
                    self.handler.process_attribute_unsigned(die_offset, attr, form, data)
                }
                FormValue::Signed(data) => {
                    self.handler.process_attribute_signed(die_offset, attr, form, data)
                }
                FormValue::Buffer(data) => {
                    self.handler.process_attribute_buffer(die_offset, attr, form, data)
                }
                FormValue::String(data) => {
                    self.handler.process_attribute_string(die_offset, attr, form, &data)
                }
            }
        }
        Ok(())
    }
}

fn lookup(abbrevs: &AbbreviationTable, code: u64, offset: u64) -> Result<&Abbreviation> {
    abbrevs
        .get(code)
        .ok_or(Error::UnknownAbbreviation { code, offset })
}

fn skip_attributes<'a>(abbrev: &Abbreviation, forms: &FormReader<'a>, cursor: &mut Slice<'a>) -> Result<()> {
    for &(_, form) in &abbrev.attributes {
        forms.skip(form, cursor)?;
    }
    Ok(())
}

/// 子孫をハンドラーに通知せずに読み飛ばす
fn skip_subtree<'a>(
    abbrevs: &AbbreviationTable,
    forms: &FormReader<'a>,
    base: &Slice<'a>,
    body_offset: u64,
    cursor: &mut Slice<'a>,
) -> Result<()> {
    let mut depth = 1usize;
    while depth > 0 && !cursor.is_empty() {
        let die_offset = body_offset + ByteReader::position(base, cursor);
        let code = cursor.read_uleb128()?;
        if code == 0 {
            depth -= 1;
            continue;
        }
        let abbrev = lookup(abbrevs, code, die_offset)?;
        skip_attributes(abbrev, forms, cursor)?;
        if abbrev.has_children {
            depth += 1;
        }
    }
    Ok(())
}
