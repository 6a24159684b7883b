//! DWARF式から後置記法への変換
//!
//! CFIのレジスタ規則は `$cfa` とレジスタ名を参照する後置記法の文字列で
//! ハンドラーに渡します。ここではスタックマシンの範囲で表現できる演算だけを扱います。
//! 変換結果は必ずちょうど1つの値を計算する式になります。

use crate::reader::ByteReader;
use crate::registers::RegisterNames;
use crate::{Error, Result};
use gimli::Reader;

/// 暗黙にスタックへ積まれるCFAの名前
const CFA: &str = "$cfa";

/// DWARF式のバイト列を後置記法のトークン列（空白区切り）に変換する
///
/// スタックは空の状態から評価されます（`DW_CFA_def_cfa_expression` 用）。
pub fn translate(reader: &ByteReader, names: &[String], expr: &[u8]) -> Result<String> {
    Translator::new(false).run(reader, names, expr)
}

/// CFAが積まれた状態から評価される式を変換する
///
/// `DW_CFA_expression` / `DW_CFA_val_expression` 用。式がCFAを消費する場合だけ
/// 先頭に `$cfa` が付きます。
pub fn translate_with_cfa(reader: &ByteReader, names: &[String], expr: &[u8]) -> Result<String> {
    Translator::new(true).run(reader, names, expr)
}

struct Translator {
    tokens: Vec<String>,
    /// 式自身が積んだ値の数（暗黙のCFAを除く）
    depth: usize,
    /// 評価前にCFAが積まれている
    implicit_cfa: bool,
    cfa_used: bool,
}

impl Translator {
    fn new(implicit_cfa: bool) -> Self {
        Self {
            tokens: Vec::new(),
            depth: 0,
            implicit_cfa,
            cfa_used: false,
        }
    }

    fn run(mut self, reader: &ByteReader, names: &[String], expr: &[u8]) -> Result<String> {
        let mut cursor = reader.slice(expr);

        while !cursor.is_empty() {
            let op = cursor.read_u8()?;
            match op {
                // DW_OP_lit0 .. DW_OP_lit31
                0x30..=0x4f => self.push((op - 0x30).to_string()),
                // DW_OP_breg0 .. DW_OP_breg31
                0x70..=0x8f => {
                    let offset = cursor.read_sleb128()?;
                    self.register_offset(names, u64::from(op - 0x70), offset);
                }
                _ => match gimli::DwOp(op) {
                    gimli::DW_OP_addr => self.push(reader.read_address(&mut cursor)?.to_string()),
                    gimli::DW_OP_const1u => self.push(cursor.read_u8()?.to_string()),
                    gimli::DW_OP_const1s => self.push(cursor.read_i8()?.to_string()),
                    gimli::DW_OP_const2u => self.push(cursor.read_u16()?.to_string()),
                    gimli::DW_OP_const2s => self.push(cursor.read_i16()?.to_string()),
                    gimli::DW_OP_const4u => self.push(cursor.read_u32()?.to_string()),
                    gimli::DW_OP_const4s => self.push(cursor.read_i32()?.to_string()),
                    gimli::DW_OP_const8u => self.push(cursor.read_u64()?.to_string()),
                    gimli::DW_OP_const8s => self.push(cursor.read_i64()?.to_string()),
                    gimli::DW_OP_constu => self.push(cursor.read_uleb128()?.to_string()),
                    gimli::DW_OP_consts => self.push(cursor.read_sleb128()?.to_string()),
                    gimli::DW_OP_bregx => {
                        let register = cursor.read_uleb128()?;
                        let offset = cursor.read_sleb128()?;
                        self.register_offset(names, register, offset);
                    }
                    gimli::DW_OP_plus_uconst => {
                        let addend = cursor.read_uleb128()?.to_string();
                        self.operate(1, &[addend.as_str(), "+"])?;
                    }
                    gimli::DW_OP_deref => self.operate(1, &["^"])?,
                    gimli::DW_OP_neg => self.operate(1, &["-1", "*"])?,
                    gimli::DW_OP_plus => self.operate(2, &["+"])?,
                    gimli::DW_OP_minus => self.operate(2, &["-"])?,
                    gimli::DW_OP_mul => self.operate(2, &["*"])?,
                    gimli::DW_OP_div => self.operate(2, &["/"])?,
                    gimli::DW_OP_mod => self.operate(2, &["%"])?,
                    gimli::DW_OP_nop => {}
                    _ => return Err(Error::UnsupportedExpression(op)),
                },
            }
        }

        // 何も積まない式の値は暗黙のCFAそのもの
        if self.depth == 0 {
            self.take_cfa()?;
        }
        if self.depth != 1 {
            return Err(Error::UnbalancedExpression(self.depth));
        }

        let mut tokens = self.tokens;
        if self.cfa_used {
            tokens.insert(0, CFA.to_string());
        }
        Ok(tokens.join(" "))
    }

    fn push(&mut self, token: String) {
        self.tokens.push(token);
        self.depth += 1;
    }

    fn register_offset(&mut self, names: &[String], register: u64, offset: i64) {
        self.push(RegisterNames::name(names, register));
        self.tokens.push(offset.to_string());
        self.tokens.push("+".to_string());
    }

    /// `operands` 個の値を取り出し、結果を1つ積む演算
    fn operate(&mut self, operands: usize, tokens: &[&str]) -> Result<()> {
        // CFAはスタックの底にあるので、式自身の値をすべて使い切ったときだけ届く
        if self.depth + 1 == operands {
            self.take_cfa()?;
        }
        if self.depth < operands {
            return Err(Error::UnbalancedExpression(self.depth));
        }
        self.depth = self.depth - operands + 1;
        self.tokens.extend(tokens.iter().map(|t| t.to_string()));
        Ok(())
    }

    fn take_cfa(&mut self) -> Result<()> {
        if !self.implicit_cfa || self.cfa_used {
            return Err(Error::UnbalancedExpression(self.depth));
        }
        self.cfa_used = true;
        self.depth += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translate_le(expr: &[u8]) -> Result<String> {
        let reader = ByteReader::new(gimli::RunTimeEndian::Little);
        translate(&reader, &RegisterNames::x86_64(), expr)
    }

    fn translate_cfa_le(expr: &[u8]) -> Result<String> {
        let reader = ByteReader::new(gimli::RunTimeEndian::Little);
        translate_with_cfa(&reader, &RegisterNames::x86_64(), expr)
    }

    #[test]
    fn test_breg_plus_deref() {
        // DW_OP_breg7 8, DW_OP_deref
        assert_eq!(translate_le(&[0x77, 0x08, 0x06]).unwrap(), "$rsp 8 + ^");
    }

    #[test]
    fn test_literals_and_arithmetic() {
        // DW_OP_lit3, DW_OP_consts -2, DW_OP_mul, DW_OP_plus_uconst 16
        assert_eq!(
            translate_le(&[0x33, 0x11, 0x7e, 0x1e, 0x23, 0x10]).unwrap(),
            "3 -2 * 16 +"
        );
    }

    #[test]
    fn test_unsupported_operation() {
        // DW_OP_dup
        assert_eq!(
            translate_le(&[0x12]).unwrap_err(),
            Error::UnsupportedExpression(0x12)
        );
    }

    #[test]
    fn test_truncated_expression() {
        assert_eq!(translate_le(&[0x0a, 0x01]).unwrap_err(), Error::OutOfBounds);
    }

    #[test]
    fn test_implicit_cfa_only_when_consumed() {
        // DW_OP_breg7 8 はCFAを使わない
        assert_eq!(translate_cfa_le(&[0x77, 0x08]).unwrap(), "$rsp 8 +");
        // DW_OP_plus_uconst 16 はCFAに加算する
        assert_eq!(translate_cfa_le(&[0x23, 0x10]).unwrap(), "$cfa 16 +");
        // DW_OP_lit8, DW_OP_minus はCFAから引く
        assert_eq!(translate_cfa_le(&[0x38, 0x1c]).unwrap(), "$cfa 8 -");
        // 空の式の値はCFA
        assert_eq!(translate_cfa_le(&[]).unwrap(), "$cfa");
    }

    #[test]
    fn test_unbalanced_expressions_are_rejected() {
        // 2つの値が残る
        assert_eq!(
            translate_le(&[0x30, 0x31]).unwrap_err(),
            Error::UnbalancedExpression(2)
        );
        assert_eq!(
            translate_cfa_le(&[0x30, 0x31]).unwrap_err(),
            Error::UnbalancedExpression(2)
        );
        // 暗黙の値がないのに加算する
        assert_eq!(
            translate_le(&[0x23, 0x10]).unwrap_err(),
            Error::UnbalancedExpression(0)
        );
        // CFAを使っても DW_OP_plus の被演算子が足りない
        assert_eq!(
            translate_cfa_le(&[0x22]).unwrap_err(),
            Error::UnbalancedExpression(0)
        );
        assert_eq!(translate_le(&[]).unwrap_err(), Error::UnbalancedExpression(0));
    }
}
