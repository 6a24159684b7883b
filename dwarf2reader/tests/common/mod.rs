//! 統合テスト用のDWARFバイト列ビルダー

#![allow(dead_code)]

/// リトルエンディアンのバイト列ビルダー
#[derive(Default, Clone)]
pub struct Bytes(pub Vec<u8>);

impl Bytes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u64 {
        self.0.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.0.push(value);
        self
    }

    pub fn u16(mut self, value: u16) -> Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u64(mut self, value: u64) -> Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn uleb(mut self, value: u64) -> Self {
        gimli::leb128::write::unsigned(&mut self.0, value).expect("Writing to a Vec should not fail");
        self
    }

    pub fn sleb(mut self, value: i64) -> Self {
        gimli::leb128::write::signed(&mut self.0, value).expect("Writing to a Vec should not fail");
        self
    }

    pub fn cstr(mut self, value: &str) -> Self {
        self.0.extend_from_slice(value.as_bytes());
        self.0.push(0);
        self
    }

    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.0.extend_from_slice(value);
        self
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

/// 32ビットDWARFのユニットヘッダー長（長さ・バージョン・アブリビエーションオフセット・アドレスサイズ）
pub const UNIT_HEADER_32: u64 = 11;

/// 64ビットDWARFのユニットヘッダー長
pub const UNIT_HEADER_64: u64 = 23;

/// 32ビットDWARFのコンパイルユニットを組み立てる（アドレスサイズ8）
pub fn unit32(version: u16, abbrev_offset: u32, body: &[u8]) -> Vec<u8> {
    Bytes::new()
        .u32((2 + 4 + 1 + body.len()) as u32)
        .u16(version)
        .u32(abbrev_offset)
        .u8(8)
        .bytes(body)
        .into_vec()
}

/// 64ビットDWARFのコンパイルユニットを組み立てる（アドレスサイズ8）
pub fn unit64(version: u16, abbrev_offset: u64, body: &[u8]) -> Vec<u8> {
    Bytes::new()
        .u32(0xffff_ffff)
        .u64((2 + 8 + 1 + body.len()) as u64)
        .u16(version)
        .u64(abbrev_offset)
        .u8(8)
        .bytes(body)
        .into_vec()
}

/// 長さフィールドを付けて32ビットDWARFのエントリにする
pub fn with_length32(body: &[u8]) -> Vec<u8> {
    Bytes::new().u32(body.len() as u32).bytes(body).into_vec()
}
