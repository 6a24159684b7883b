//! セクション名からバッファへのマップ

use crate::{Error, Result};
use std::collections::HashMap;

pub const DEBUG_INFO: &str = ".debug_info";
pub const DEBUG_ABBREV: &str = ".debug_abbrev";
pub const DEBUG_LINE: &str = ".debug_line";
pub const DEBUG_FRAME: &str = ".debug_frame";
pub const DEBUG_STR: &str = ".debug_str";

/// セクションマップ
///
/// バッファはドライバーが所有し、デコーダーは読み取り専用で借用します。
#[derive(Debug, Clone, Default)]
pub struct SectionMap<'a> {
    sections: HashMap<String, &'a [u8]>,
}

impl<'a> SectionMap<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// セクションを登録する（同名のセクションは置き換える）
    pub fn insert(&mut self, name: impl Into<String>, data: &'a [u8]) {
        self.sections.insert(name.into(), data);
    }

    pub fn get(&self, name: &str) -> Option<&'a [u8]> {
        self.sections.get(name).copied()
    }

    /// セクションを取得し、存在しなければエラーを返す
    pub fn require(&self, name: &str) -> Result<&'a [u8]> {
        self.get(name)
            .ok_or_else(|| Error::MissingSection(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    /// 登録されているセクション名（ソート済み）
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sections.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
