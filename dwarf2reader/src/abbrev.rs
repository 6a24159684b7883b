//! アブリビエーションテーブル（.debug_abbrev）
//!
//! DIEの形式（タグ、子の有無、属性とフォームの並び）はアブリビエーションとして
//! 別セクションにまとめられ、DIEはそのコードだけを持ちます。
//! テーブルはコンパイルユニットごとに作成され、ユニットの解析が終わると破棄されます。

use crate::reader::{ByteReader, Slice};
use crate::{Error, Result};
use gimli::Reader;
use std::collections::HashMap;
use tracing::trace;

/// 属性とフォームの並び
pub type AttributeList = Vec<(gimli::DwAt, gimli::DwForm)>;

/// 1つのアブリビエーション
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abbreviation {
    /// アブリビエーションコード（0以外）
    pub code: u64,
    pub tag: gimli::DwTag,
    pub has_children: bool,
    pub attributes: AttributeList,
}

/// コードをキーとするアブリビエーションテーブル
#[derive(Debug, Clone, Default)]
pub struct AbbreviationTable {
    abbrevs: HashMap<u64, Abbreviation>,
}

impl AbbreviationTable {
    /// `.debug_abbrev` の `offset` からテーブルを読み取る
    ///
    /// コード0でリストが終了します。
    pub fn parse(reader: &ByteReader, debug_abbrev: &[u8], offset: u64) -> Result<Self> {
        let start = usize::try_from(offset).map_err(|_| Error::OutOfBounds)?;
        let bytes = debug_abbrev.get(start..).ok_or(Error::OutOfBounds)?;
        let mut cursor = reader.slice(bytes);

        let mut abbrevs = HashMap::new();
        loop {
            let code = cursor.read_uleb128()?;
            if code == 0 {
                break;
            }
            let abbrev = Self::parse_one(&mut cursor, code)?;
            if abbrevs.insert(code, abbrev).is_some() {
                return Err(Error::DuplicateAbbreviation(code));
            }
        }

        trace!("Read {} abbreviations at offset 0x{:x}", abbrevs.len(), offset);
        Ok(Self { abbrevs })
    }

    fn parse_one(cursor: &mut Slice<'_>, code: u64) -> Result<Abbreviation> {
        let tag = gimli::DwTag(cursor.read_uleb128_u16()?);
        let has_children = gimli::DwChildren(cursor.read_u8()?) == gimli::DW_CHILDREN_yes;

        let mut attributes = Vec::new();
        loop {
            let name = cursor.read_uleb128_u16()?;
            let form = cursor.read_uleb128_u16()?;
            if name == 0 && form == 0 {
                break;
            }
            attributes.push((gimli::DwAt(name), gimli::DwForm(form)));
        }

        Ok(Abbreviation {
            code,
            tag,
            has_children,
            attributes,
        })
    }

    pub fn get(&self, code: u64) -> Option<&Abbreviation> {
        self.abbrevs.get(&code)
    }

    pub fn len(&self) -> usize {
        self.abbrevs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.abbrevs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader() -> ByteReader {
        ByteReader::new(gimli::RunTimeEndian::Little)
    }

    #[test]
    fn test_parse_table() {
        let bytes = [
            // code 1: compile_unit, children, name/string, stmt_list/data4
            0x01, 0x11, 0x01, 0x03, 0x08, 0x10, 0x06, 0x00, 0x00,
            // code 2: base_type, no children, byte_size/data1
            0x02, 0x24, 0x00, 0x0b, 0x0b, 0x00, 0x00,
            0x00,
        ];
        let table = AbbreviationTable::parse(&reader(), &bytes, 0).unwrap();
        assert_eq!(table.len(), 2);

        let cu = table.get(1).unwrap();
        assert_eq!(cu.tag, gimli::DW_TAG_compile_unit);
        assert!(cu.has_children);
        assert_eq!(
            cu.attributes,
            vec![
                (gimli::DW_AT_name, gimli::DW_FORM_string),
                (gimli::DW_AT_stmt_list, gimli::DW_FORM_data4),
            ]
        );

        let base = table.get(2).unwrap();
        assert_eq!(base.tag, gimli::DW_TAG_base_type);
        assert!(!base.has_children);
        assert!(table.get(3).is_none());
    }

    #[test]
    fn test_parse_at_offset() {
        let bytes = [0xee, 0xee, 0x05, 0x34, 0x00, 0x00, 0x00, 0x00];
        let table = AbbreviationTable::parse(&reader(), &bytes, 2).unwrap();
        assert_eq!(table.get(5).unwrap().tag, gimli::DW_TAG_variable);
        assert!(table.get(5).unwrap().attributes.is_empty());
    }

    #[test]
    fn test_duplicate_code() {
        let bytes = [0x01, 0x34, 0x00, 0x00, 0x00, 0x01, 0x34, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(
            AbbreviationTable::parse(&reader(), &bytes, 0).unwrap_err(),
            Error::DuplicateAbbreviation(1)
        );
    }

    #[test]
    fn test_truncated_table() {
        let bytes = [0x01, 0x34, 0x00, 0x03];
        assert_eq!(
            AbbreviationTable::parse(&reader(), &bytes, 0).unwrap_err(),
            Error::OutOfBounds
        );
        assert_eq!(
            AbbreviationTable::parse(&reader(), &bytes, 10).unwrap_err(),
            Error::OutOfBounds
        );
    }
}
