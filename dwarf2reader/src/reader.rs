//! エンディアンとアドレスサイズを考慮したプリミティブ読み取り
//!
//! カーソルは `gimli::EndianSlice` で表現し、整数・LEB128・文字列の
//! 読み取りは `gimli::Reader` に任せます。このモジュールはその上に
//! アドレスサイズ・オフセットサイズ（32/64ビットDWARF）の設定と、
//! CFIのポインタエンコーディングを追加します。

use crate::{Error, Result};
use gimli::{Reader, RunTimeEndian};

/// セクションバッファ上のカーソル
pub type Slice<'a> = gimli::EndianSlice<'a, RunTimeEndian>;

/// バイトリーダー
///
/// デコーダーごとにコピーを保持するため、設定の変更が他のデコーダーに
/// 影響することはありません。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteReader {
    endian: RunTimeEndian,
    address_size: u8,
    offset_size: u8,
}

impl ByteReader {
    /// 指定したエンディアンのリーダーを作成する
    ///
    /// アドレスサイズは8バイト、オフセットサイズは4バイト（32ビットDWARF）で初期化されます。
    pub fn new(endian: RunTimeEndian) -> Self {
        Self {
            endian,
            address_size: 8,
            offset_size: 4,
        }
    }

    pub fn endian(&self) -> RunTimeEndian {
        self.endian
    }

    pub fn set_address_size(&mut self, size: u8) {
        self.address_size = size;
    }

    pub fn address_size(&self) -> u8 {
        self.address_size
    }

    pub fn set_offset_size(&mut self, size: u8) {
        self.offset_size = size;
    }

    pub fn offset_size(&self) -> u8 {
        self.offset_size
    }

    /// 現在のオフセットサイズに対応する gimli のフォーマット
    pub fn format(&self) -> gimli::Format {
        if self.offset_size == 8 {
            gimli::Format::Dwarf64
        } else {
            gimli::Format::Dwarf32
        }
    }

    /// バイト列からカーソルを作成する
    pub fn slice<'a>(&self, bytes: &'a [u8]) -> Slice<'a> {
        gimli::EndianSlice::new(bytes, self.endian)
    }

    /// 初期長フィールドを読み取る
    ///
    /// 0xffffffff の場合は64ビットDWARFとして続く8バイトを長さとし、
    /// オフセットサイズを8に設定します。
    ///
    /// # Returns
    /// (宣言された長さ, 長さフィールド自体のバイト数)
    pub fn read_initial_length(&mut self, cursor: &mut Slice<'_>) -> Result<(u64, usize)> {
        let (length, format) = cursor.read_initial_length()?;
        self.offset_size = format.word_size();
        Ok((length as u64, usize::from(format.initial_length_size())))
    }

    /// セクションオフセットを読み取る（4または8バイト）
    pub fn read_offset(&self, cursor: &mut Slice<'_>) -> Result<u64> {
        match self.offset_size {
            8 => Ok(cursor.read_u64()?),
            _ => Ok(u64::from(cursor.read_u32()?)),
        }
    }

    /// アドレスサイズ分のアドレスを読み取る
    pub fn read_address(&self, cursor: &mut Slice<'_>) -> Result<u64> {
        Ok(cursor.read_address(self.address_size)?)
    }

    /// NUL終端文字列を読み取る（NULは含まない）
    pub fn read_cstr<'a>(&self, cursor: &mut Slice<'a>) -> Result<Slice<'a>> {
        Ok(cursor.read_null_terminated_slice()?)
    }

    /// 長さ `len` のブロックを切り出す
    pub fn read_block<'a>(&self, cursor: &mut Slice<'a>, len: u64) -> Result<&'a [u8]> {
        let len = usize::try_from(len).map_err(|_| Error::OutOfBounds)?;
        Ok(cursor.split(len)?.slice())
    }

    /// `base` の先頭から `cursor` の現在位置までのバイト数
    pub fn position(base: &Slice<'_>, cursor: &Slice<'_>) -> u64 {
        cursor.offset_from(*base) as u64
    }

    /// DW_EH_PE 形式でエンコードされたポインタを読み取る
    ///
    /// `field_address` はポインタフィールド自体のアドレスで、pc相対の場合に加算されます。
    /// `DW_EH_PE_omit` の場合は何も読まずに `None` を返します。
    pub fn read_encoded_pointer(
        &self,
        cursor: &mut Slice<'_>,
        encoding: u8,
        field_address: u64,
    ) -> Result<Option<u64>> {
        if gimli::DwEhPe(encoding) == gimli::DW_EH_PE_omit {
            return Ok(None);
        }
        if encoding & gimli::DW_EH_PE_indirect.0 != 0 {
            return Err(Error::UnsupportedPointerEncoding(encoding));
        }

        let value = match gimli::DwEhPe(encoding & 0x0f) {
            gimli::DW_EH_PE_absptr => self.read_address(cursor)?,
            gimli::DW_EH_PE_uleb128 => cursor.read_uleb128()?,
            gimli::DW_EH_PE_udata2 => u64::from(cursor.read_u16()?),
            gimli::DW_EH_PE_udata4 => u64::from(cursor.read_u32()?),
            gimli::DW_EH_PE_udata8 => cursor.read_u64()?,
            gimli::DW_EH_PE_sleb128 => cursor.read_sleb128()? as u64,
            gimli::DW_EH_PE_sdata2 => i64::from(cursor.read_i16()?) as u64,
            gimli::DW_EH_PE_sdata4 => i64::from(cursor.read_i32()?) as u64,
            gimli::DW_EH_PE_sdata8 => cursor.read_i64()? as u64,
            _ => return Err(Error::UnsupportedPointerEncoding(encoding)),
        };

        match gimli::DwEhPe(encoding & 0x70) {
            gimli::DW_EH_PE_absptr => Ok(Some(value)),
            gimli::DW_EH_PE_pcrel => Ok(Some(field_address.wrapping_add(value))),
            _ => Err(Error::UnsupportedPointerEncoding(encoding)),
        }
    }
}
