//! 属性フォームのデコード
//!
//! フォームは属性の意味とは独立した値のエンコーディングです。
//! 値を取り出す `read` と、値を作らずに読み飛ばす `skip` の2つの経路があり、
//! どのフォームでも両者が消費するバイト数は一致しなければなりません。

use crate::reader::{ByteReader, Slice};
use crate::{Error, Result};
use gimli::Reader;
use std::borrow::Cow;

/// デコードされた属性値
///
/// どの変種になるかはフォームの種類で決まり、属性の意味には依存しません。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormValue<'a> {
    Unsigned(u64),
    Signed(i64),
    /// セクションバッファへのビュー（コピーしない）
    Buffer(&'a [u8]),
    String(Cow<'a, str>),
}

/// 1つのコンパイルユニット内でフォームを読むためのコンテキスト
#[derive(Debug, Clone, Copy)]
pub struct FormReader<'a> {
    reader: ByteReader,
    version: u16,
    /// `.debug_info` 先頭からのユニットのオフセット（ユニット相対参照の基点）
    unit_offset: u64,
    debug_str: Option<&'a [u8]>,
}

impl<'a> FormReader<'a> {
    pub fn new(reader: ByteReader, version: u16, unit_offset: u64, debug_str: Option<&'a [u8]>) -> Self {
        Self {
            reader,
            version,
            unit_offset,
            debug_str,
        }
    }

    /// フォームに従って値を1つ読み取る
    ///
    /// `DW_FORM_indirect` の場合は実際のフォームを読み取ってから再帰します。
    /// 戻り値のフォームは解決後のものです。ユニット相対参照は
    /// `.debug_info` 先頭からの絶対オフセットに正規化されます。
    pub fn read(&self, form: gimli::DwForm, cursor: &mut Slice<'a>) -> Result<(gimli::DwForm, FormValue<'a>)> {
        let value = match form {
            gimli::DW_FORM_indirect => {
                let actual = gimli::DwForm(cursor.read_uleb128_u16()?);
                return self.read(actual, cursor);
            }
            gimli::DW_FORM_addr => FormValue::Unsigned(self.reader.read_address(cursor)?),
            gimli::DW_FORM_data1 | gimli::DW_FORM_flag => {
                FormValue::Unsigned(u64::from(cursor.read_u8()?))
            }
            gimli::DW_FORM_data2 => FormValue::Unsigned(u64::from(cursor.read_u16()?)),
            gimli::DW_FORM_data4 => FormValue::Unsigned(u64::from(cursor.read_u32()?)),
            gimli::DW_FORM_data8 | gimli::DW_FORM_ref_sig8 => FormValue::Unsigned(cursor.read_u64()?),
            gimli::DW_FORM_flag_present => FormValue::Unsigned(1),
            gimli::DW_FORM_udata => FormValue::Unsigned(cursor.read_uleb128()?),
            gimli::DW_FORM_sdata => FormValue::Signed(cursor.read_sleb128()?),
            gimli::DW_FORM_ref1 => self.unit_ref(u64::from(cursor.read_u8()?)),
            gimli::DW_FORM_ref2 => self.unit_ref(u64::from(cursor.read_u16()?)),
            gimli::DW_FORM_ref4 => self.unit_ref(u64::from(cursor.read_u32()?)),
            gimli::DW_FORM_ref8 => self.unit_ref(cursor.read_u64()?),
            gimli::DW_FORM_ref_udata => self.unit_ref(cursor.read_uleb128()?),
            gimli::DW_FORM_ref_addr => FormValue::Unsigned(self.read_ref_addr(cursor)?),
            gimli::DW_FORM_sec_offset => FormValue::Unsigned(self.reader.read_offset(cursor)?),
            gimli::DW_FORM_string => {
                FormValue::String(self.reader.read_cstr(cursor)?.to_string_lossy())
            }
            gimli::DW_FORM_strp => {
                let offset = self.reader.read_offset(cursor)?;
                FormValue::String(self.string_at(offset)?)
            }
            gimli::DW_FORM_block1 => {
                let len = u64::from(cursor.read_u8()?);
                FormValue::Buffer(self.reader.read_block(cursor, len)?)
            }
            gimli::DW_FORM_block2 => {
                let len = u64::from(cursor.read_u16()?);
                FormValue::Buffer(self.reader.read_block(cursor, len)?)
            }
            gimli::DW_FORM_block4 => {
                let len = u64::from(cursor.read_u32()?);
                FormValue::Buffer(self.reader.read_block(cursor, len)?)
            }
            gimli::DW_FORM_block | gimli::DW_FORM_exprloc => {
                let len = cursor.read_uleb128()?;
                FormValue::Buffer(self.reader.read_block(cursor, len)?)
            }
            other => return Err(Error::UnknownForm(u64::from(other.0))),
        };
        Ok((form, value))
    }

    /// 値を作らずにフォームを読み飛ばす
    pub fn skip(&self, form: gimli::DwForm, cursor: &mut Slice<'a>) -> Result<()> {
        match form {
            gimli::DW_FORM_indirect => {
                let actual = gimli::DwForm(cursor.read_uleb128_u16()?);
                return self.skip(actual, cursor);
            }
            gimli::DW_FORM_flag_present => {}
            gimli::DW_FORM_addr => self.skip_bytes(cursor, u64::from(self.reader.address_size()))?,
            gimli::DW_FORM_data1 | gimli::DW_FORM_flag | gimli::DW_FORM_ref1 => {
                self.skip_bytes(cursor, 1)?
            }
            gimli::DW_FORM_data2 | gimli::DW_FORM_ref2 => self.skip_bytes(cursor, 2)?,
            gimli::DW_FORM_data4 | gimli::DW_FORM_ref4 => self.skip_bytes(cursor, 4)?,
            gimli::DW_FORM_data8 | gimli::DW_FORM_ref8 | gimli::DW_FORM_ref_sig8 => {
                self.skip_bytes(cursor, 8)?
            }
            gimli::DW_FORM_udata | gimli::DW_FORM_ref_udata => {
                cursor.read_uleb128()?;
            }
            gimli::DW_FORM_sdata => {
                cursor.read_sleb128()?;
            }
            gimli::DW_FORM_ref_addr => self.skip_bytes(cursor, u64::from(self.ref_addr_size()))?,
            gimli::DW_FORM_sec_offset | gimli::DW_FORM_strp => {
                self.skip_bytes(cursor, u64::from(self.reader.offset_size()))?
            }
            gimli::DW_FORM_string => {
                self.reader.read_cstr(cursor)?;
            }
            gimli::DW_FORM_block1 => {
                let len = u64::from(cursor.read_u8()?);
                self.skip_bytes(cursor, len)?
            }
            gimli::DW_FORM_block2 => {
                let len = u64::from(cursor.read_u16()?);
                self.skip_bytes(cursor, len)?
            }
            gimli::DW_FORM_block4 => {
                let len = u64::from(cursor.read_u32()?);
                self.skip_bytes(cursor, len)?
            }
            gimli::DW_FORM_block | gimli::DW_FORM_exprloc => {
                let len = cursor.read_uleb128()?;
                self.skip_bytes(cursor, len)?
            }
            other => return Err(Error::UnknownForm(u64::from(other.0))),
        }
        Ok(())
    }

    fn skip_bytes(&self, cursor: &mut Slice<'a>, len: u64) -> Result<()> {
        let len = usize::try_from(len).map_err(|_| Error::OutOfBounds)?;
        cursor.skip(len)?;
        Ok(())
    }

    fn unit_ref(&self, relative: u64) -> FormValue<'a> {
        FormValue::Unsigned(self.unit_offset.wrapping_add(relative))
    }

    /// DWARF2 ではアドレスサイズ、DWARF3以降はオフセットサイズ
    fn ref_addr_size(&self) -> u8 {
        if self.version <= 2 {
            self.reader.address_size()
        } else {
            self.reader.offset_size()
        }
    }

    fn read_ref_addr(&self, cursor: &mut Slice<'a>) -> Result<u64> {
        if self.version <= 2 {
            self.reader.read_address(cursor)
        } else {
            self.reader.read_offset(cursor)
        }
    }

    fn string_at(&self, offset: u64) -> Result<Cow<'a, str>> {
        let debug_str = self
            .debug_str
            .ok_or_else(|| Error::MissingSection(crate::sections::DEBUG_STR.to_string()))?;
        let start = usize::try_from(offset).map_err(|_| Error::OutOfBounds)?;
        let bytes = debug_str.get(start..).ok_or(Error::OutOfBounds)?;
        let mut cursor = self.reader.slice(bytes);
        Ok(self.reader.read_cstr(&mut cursor)?.to_string_lossy())
    }
}
