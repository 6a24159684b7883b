//! コールフレーム情報のデコード（.debug_frame）
//!
//! CFIは、各命令アドレスについてCFA（Call Frame Address）の求め方と
//! 呼び出し元レジスタの復元方法を表す表を、変化点だけで圧縮したものです。
//! CIEは複数のFDEが共有する初期規則とエンコーディング情報のテンプレートで、
//! FDEは1つのコード範囲にそれを適用し、命令列で規則を変化させます。
//!
//! 規則はハンドラーに文字列で渡します:
//! - `undefined`: 呼び出し元の値は復元できない
//! - `same`: 呼び出し先で値が変更されていない
//! - それ以外: 値を計算する後置記法の式（`$cfa` とレジスタ名を参照できる）

use crate::postfix;
use crate::reader::{ByteReader, Slice};
use crate::registers::RegisterNames;
use crate::{Error, Result};
use gimli::Reader;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, warn};

/// 規則の対象となる列
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Column {
    /// フレームのCFA
    Cfa,
    /// DWARFレジスタ番号
    Register(u64),
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Column::Cfa => write!(f, ".cfa"),
            Column::Register(reg) => write!(f, "{}", reg),
        }
    }
}

/// CFIの通知を受け取るハンドラー
pub trait CallFrameInfoHandler {
    /// FDEを見つけた。`address` から `length` バイトのコードを対象とする
    ///
    /// `true` を返すとこのFDEの規則が `rule` で通知されます。CIEは個別には通知されず、
    /// 受け入れたFDEの先頭でCIEの初期規則が改めて通知されます。
    /// `entry` の直後は、すべてのレジスタの規則は `undefined` とみなしてください。
    fn entry(&mut self, address: u64, length: u64, version: u8, augmentation: &str, return_address: u64) -> bool;

    /// `address` 以降、`column` を `rule` で復元する
    ///
    /// `false` を返すと解析を中断します。
    fn rule(&mut self, address: u64, column: Column, rule: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CfaRule<'a> {
    RegisterOffset { register: u64, offset: i64 },
    Expression(&'a [u8]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RegisterRule<'a> {
    Undefined,
    SameValue,
    /// CFA + N に保存されている
    Offset(i64),
    /// 値そのものが CFA + N
    ValOffset(i64),
    /// 別のレジスタに保存されている
    Register(u64),
    /// 式が保存先のアドレスを計算する
    Expression(&'a [u8]),
    /// 式が値そのものを計算する
    ValExpression(&'a [u8]),
}

/// 1行分の規則（CFAと各レジスタ）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RuleSet<'a> {
    cfa: Option<CfaRule<'a>>,
    registers: BTreeMap<u64, RegisterRule<'a>>,
}

/// Common Information Entry
#[derive(Debug, Clone)]
struct Cie<'a> {
    version: u8,
    augmentation: String,
    address_size: u8,
    code_alignment: u64,
    data_alignment: i64,
    return_address_register: u64,
    /// 'z' 拡張の場合、FDEにも拡張データ長が付く
    has_augmentation_data: bool,
    fde_encoding: u8,
    lsda_encoding: u8,
    personality: Option<u64>,
    signal_frame: bool,
    initial_rules: RuleSet<'a>,
}

/// CFIデコーダー
pub struct CallFrameInfo<'a, 'h> {
    buffer: &'a [u8],
    reader: ByteReader,
    register_names: &'a [String],
    handler: &'h mut dyn CallFrameInfoHandler,
    /// pc相対ポインタの基点となるセクションのアドレス
    section_address: u64,
    /// セクションオフセットをキーとする解析済みCIE
    cies: HashMap<u64, Cie<'a>>,
}

impl<'a, 'h> CallFrameInfo<'a, 'h> {
    /// CFIデコーダーを作成する
    ///
    /// # Arguments
    /// * `buffer` - `.debug_frame` セクション全体
    /// * `reader` - エンディアンとアドレスサイズが設定されたバイトリーダー
    /// * `register_names` - 後置記法で使うレジスタ名（添字がレジスタ番号）
    /// * `handler` - 通知先のハンドラー
    pub fn new(
        buffer: &'a [u8],
        reader: ByteReader,
        register_names: &'a [String],
        handler: &'h mut dyn CallFrameInfoHandler,
    ) -> Self {
        Self {
            buffer,
            reader,
            register_names,
            handler,
            section_address: 0,
            cies: HashMap::new(),
        }
    }

    pub fn set_section_address(&mut self, address: u64) {
        self.section_address = address;
    }

    /// セクション内のすべてのCIE/FDEを処理する
    ///
    /// 1つのエントリのエラーは記録して次のエントリへ進み、最後に最初のエラーを返します。
    /// エントリ長がセクションを超える場合と、ハンドラーが中断を求めた場合は直ちに終了します。
    pub fn start(&mut self) -> Result<()> {
        let base = self.reader.slice(self.buffer);
        let mut cursor = base;
        let mut first_error: Option<Error> = None;

        while !cursor.is_empty() {
            let entry_offset = ByteReader::position(&base, &cursor);
            let mut reader = self.reader;
            let (length, _) = reader.read_initial_length(&mut cursor)?;
            let length = usize::try_from(length).map_err(|_| Error::OutOfBounds)?;
            let body = cursor.split(length)?;
            if length == 0 {
                continue;
            }

            match self.process_entry(reader, entry_offset, body) {
                Ok(()) => {}
                Err(err @ Error::HandlerAborted(_)) => return Err(err),
                Err(err) => {
                    warn!("Skipping CFI entry at 0x{:x}: {}", entry_offset, err);
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn process_entry(&mut self, reader: ByteReader, offset: u64, body: Slice<'a>) -> Result<()> {
        let mut cursor = body;
        let id = reader.read_offset(&mut cursor)?;
        if is_cie_id(id, reader.offset_size()) {
            if !self.cies.contains_key(&offset) {
                let cie = self.parse_cie(reader, cursor)?;
                self.cies.insert(offset, cie);
            }
            Ok(())
        } else {
            self.process_fde(reader, offset, id, cursor)
        }
    }

    /// `offset` のCIEを取得する（未解析ならその場で解析する）
    fn cie_at(&mut self, fde_offset: u64, cie_offset: u64) -> Result<Cie<'a>> {
        if let Some(cie) = self.cies.get(&cie_offset) {
            return Ok(cie.clone());
        }

        let missing = Error::MissingCie {
            fde: fde_offset,
            cie: cie_offset,
        };
        let bytes = usize::try_from(cie_offset)
            .ok()
            .and_then(|start| self.buffer.get(start..))
            .ok_or_else(|| missing.clone())?;

        let mut reader = self.reader;
        let mut cursor = reader.slice(bytes);
        let (length, _) = reader
            .read_initial_length(&mut cursor)
            .map_err(|_| missing.clone())?;
        let length = usize::try_from(length).map_err(|_| missing.clone())?;
        let mut body = cursor.split(length).map_err(|_| missing.clone())?;
        let id = reader.read_offset(&mut body).map_err(|_| missing.clone())?;
        if !is_cie_id(id, reader.offset_size()) {
            return Err(missing);
        }

        let cie = self.parse_cie(reader, body)?;
        self.cies.insert(cie_offset, cie.clone());
        Ok(cie)
    }

    /// CIE本体（IDの直後から）を解析し、初期命令を実行して初期規則を求める
    fn parse_cie(&self, mut reader: ByteReader, mut cursor: Slice<'a>) -> Result<Cie<'a>> {
        let version = cursor.read_u8()?;
        if !matches!(version, 1 | 3 | 4) {
            return Err(Error::UnsupportedVersion(u16::from(version)));
        }
        let augmentation = reader.read_cstr(&mut cursor)?.to_string_lossy().into_owned();

        let mut address_size = reader.address_size();
        if version >= 4 {
            address_size = cursor.read_u8()?;
            let _segment_size = cursor.read_u8()?;
        }
        reader.set_address_size(address_size);
        let code_alignment = cursor.read_uleb128()?;
        let data_alignment = cursor.read_sleb128()?;
        let return_address_register = if version == 1 {
            u64::from(cursor.read_u8()?)
        } else {
            cursor.read_uleb128()?
        };

        let mut cie = Cie {
            version,
            augmentation,
            address_size,
            code_alignment,
            data_alignment,
            return_address_register,
            has_augmentation_data: false,
            fde_encoding: gimli::DW_EH_PE_absptr.0,
            lsda_encoding: gimli::DW_EH_PE_omit.0,
            personality: None,
            signal_frame: false,
            initial_rules: RuleSet::default(),
        };

        if cie.augmentation.starts_with('z') {
            let data_length = usize::try_from(cursor.read_uleb128()?).map_err(|_| Error::OutOfBounds)?;
            let mut data = cursor.split(data_length)?;
            for letter in cie.augmentation.chars().skip(1) {
                match letter {
                    'L' => cie.lsda_encoding = data.read_u8()?,
                    'P' => {
                        let encoding = data.read_u8()?;
                        let field = self.field_address(&data);
                        cie.personality = reader.read_encoded_pointer(&mut data, encoding, field)?;
                    }
                    'R' => cie.fde_encoding = data.read_u8()?,
                    'S' => cie.signal_frame = true,
                    // 残りの拡張データは長さが分かっているので読み飛ばせる
                    _ => break,
                }
            }
            cie.has_augmentation_data = true;
        } else if !cie.augmentation.is_empty() {
            return Err(Error::BadAugmentation(cie.augmentation));
        }

        let initial_rules = {
            let mut interpreter = RuleInterpreter {
                reader,
                cie: &cie,
                names: self.register_names,
                section_base: self.reader.slice(self.buffer),
                section_address: self.section_address,
                entry_offset: 0,
                address: 0,
                rules: RuleSet::default(),
                initial: RuleSet::default(),
                stack: Vec::new(),
            };
            interpreter.run(cursor, &mut Silent)?;
            interpreter.rules
        };
        cie.initial_rules = initial_rules;

        debug!(
            "CIE: version {}, augmentation \"{}\", code alignment {}, data alignment {}, return address r{}",
            cie.version, cie.augmentation, cie.code_alignment, cie.data_alignment, cie.return_address_register
        );
        if cie.has_augmentation_data {
            debug!(
                "CIE augmentation: lsda encoding 0x{:x}, personality {:?}, signal frame {}",
                cie.lsda_encoding, cie.personality, cie.signal_frame
            );
        }
        Ok(cie)
    }

    fn process_fde(&mut self, reader: ByteReader, offset: u64, cie_offset: u64, mut cursor: Slice<'a>) -> Result<()> {
        let cie = self.cie_at(offset, cie_offset)?;
        let mut reader = reader;
        reader.set_address_size(cie.address_size);

        let field = self.field_address(&cursor);
        let address = reader
            .read_encoded_pointer(&mut cursor, cie.fde_encoding, field)?
            .unwrap_or(0);
        let length = reader
            .read_encoded_pointer(&mut cursor, cie.fde_encoding & 0x0f, 0)?
            .unwrap_or(0);
        if cie.has_augmentation_data {
            let data_length = usize::try_from(cursor.read_uleb128()?).map_err(|_| Error::OutOfBounds)?;
            cursor.skip(data_length)?;
        }

        debug!("FDE at 0x{:x}: [0x{:x}, 0x{:x})", offset, address, address.wrapping_add(length));
        if !self.handler.entry(
            address,
            length,
            cie.version,
            &cie.augmentation,
            cie.return_address_register,
        ) {
            return Ok(());
        }

        // CIEの初期規則のコピーから始める（CIEや他のFDEとは共有しない）
        let mut interpreter = RuleInterpreter {
            reader,
            cie: &cie,
            names: self.register_names,
            section_base: self.reader.slice(self.buffer),
            section_address: self.section_address,
            entry_offset: offset,
            address,
            rules: cie.initial_rules.clone(),
            initial: cie.initial_rules.clone(),
            stack: Vec::new(),
        };
        interpreter.report_all(&mut *self.handler)?;
        interpreter.run(cursor, &mut *self.handler)
    }

    fn field_address(&self, cursor: &Slice<'a>) -> u64 {
        let base = self.reader.slice(self.buffer);
        self.section_address
            .wrapping_add(ByteReader::position(&base, cursor))
    }
}

fn is_cie_id(id: u64, offset_size: u8) -> bool {
    if offset_size == 8 {
        id == u64::MAX
    } else {
        id == u64::from(u32::MAX)
    }
}

/// CIEの初期命令の実行時に使う、何も通知しないハンドラー
struct Silent;

impl CallFrameInfoHandler for Silent {
    fn entry(&mut self, _: u64, _: u64, _: u8, _: &str, _: u64) -> bool {
        true
    }

    fn rule(&mut self, _: u64, _: Column, _: &str) -> bool {
        true
    }
}

/// コールフレーム命令の実行器
struct RuleInterpreter<'a, 'c> {
    reader: ByteReader,
    cie: &'c Cie<'a>,
    names: &'c [String],
    section_base: Slice<'a>,
    section_address: u64,
    entry_offset: u64,
    address: u64,
    rules: RuleSet<'a>,
    /// DW_CFA_restore で戻す規則
    initial: RuleSet<'a>,
    /// remember_state / restore_state のスタック
    stack: Vec<RuleSet<'a>>,
}

impl<'a, 'c> RuleInterpreter<'a, 'c> {
    fn run(&mut self, instructions: Slice<'a>, handler: &mut dyn CallFrameInfoHandler) -> Result<()> {
        let mut cursor = instructions;
        while !cursor.is_empty() {
            let op = cursor.read_u8()?;
            let low = op & 0x3f;
            match op & 0xc0 {
                0x40 => {
                    self.advance(u64::from(low));
                    continue;
                }
                0x80 => {
                    let offset = self.factored(cursor.read_uleb128()? as i64);
                    self.set_register(u64::from(low), RegisterRule::Offset(offset), handler)?;
                    continue;
                }
                0xc0 => {
                    self.restore(u64::from(low), handler)?;
                    continue;
                }
                _ => {}
            }

            match gimli::DwCfa(op) {
                gimli::DW_CFA_nop => {}
                gimli::DW_CFA_set_loc => {
                    let field = self
                        .section_address
                        .wrapping_add(ByteReader::position(&self.section_base, &cursor));
                    if let Some(address) = self
                        .reader
                        .read_encoded_pointer(&mut cursor, self.cie.fde_encoding, field)?
                    {
                        self.address = address;
                    }
                }
                gimli::DW_CFA_advance_loc1 => self.advance(u64::from(cursor.read_u8()?)),
                gimli::DW_CFA_advance_loc2 => self.advance(u64::from(cursor.read_u16()?)),
                gimli::DW_CFA_advance_loc4 => self.advance(u64::from(cursor.read_u32()?)),
                gimli::DW_CFA_offset_extended => {
                    let register = cursor.read_uleb128()?;
                    let offset = self.factored(cursor.read_uleb128()? as i64);
                    self.set_register(register, RegisterRule::Offset(offset), handler)?;
                }
                gimli::DW_CFA_offset_extended_sf => {
                    let register = cursor.read_uleb128()?;
                    let offset = self.factored(cursor.read_sleb128()?);
                    self.set_register(register, RegisterRule::Offset(offset), handler)?;
                }
                gimli::DW_CFA_GNU_negative_offset_extended => {
                    let register = cursor.read_uleb128()?;
                    let offset = self.factored(cursor.read_uleb128()? as i64).wrapping_neg();
                    self.set_register(register, RegisterRule::Offset(offset), handler)?;
                }
                gimli::DW_CFA_val_offset => {
                    let register = cursor.read_uleb128()?;
                    let offset = self.factored(cursor.read_uleb128()? as i64);
                    self.set_register(register, RegisterRule::ValOffset(offset), handler)?;
                }
                gimli::DW_CFA_val_offset_sf => {
                    let register = cursor.read_uleb128()?;
                    let offset = self.factored(cursor.read_sleb128()?);
                    self.set_register(register, RegisterRule::ValOffset(offset), handler)?;
                }
                gimli::DW_CFA_restore_extended => {
                    let register = cursor.read_uleb128()?;
                    self.restore(register, handler)?;
                }
                gimli::DW_CFA_undefined => {
                    let register = cursor.read_uleb128()?;
                    self.set_register(register, RegisterRule::Undefined, handler)?;
                }
                gimli::DW_CFA_same_value => {
                    let register = cursor.read_uleb128()?;
                    self.set_register(register, RegisterRule::SameValue, handler)?;
                }
                gimli::DW_CFA_register => {
                    let register = cursor.read_uleb128()?;
                    let other = cursor.read_uleb128()?;
                    self.set_register(register, RegisterRule::Register(other), handler)?;
                }
                gimli::DW_CFA_expression => {
                    let register = cursor.read_uleb128()?;
                    let expr = read_expression(&self.reader, &mut cursor)?;
                    self.set_register(register, RegisterRule::Expression(expr), handler)?;
                }
                gimli::DW_CFA_val_expression => {
                    let register = cursor.read_uleb128()?;
                    let expr = read_expression(&self.reader, &mut cursor)?;
                    self.set_register(register, RegisterRule::ValExpression(expr), handler)?;
                }
                gimli::DW_CFA_remember_state => self.stack.push(self.rules.clone()),
                gimli::DW_CFA_restore_state => {
                    let saved = self.stack.pop().ok_or(Error::RestoreStateUnderflow)?;
                    self.replace_rules(saved, handler)?;
                }
                gimli::DW_CFA_def_cfa => {
                    let register = cursor.read_uleb128()?;
                    let offset = cursor.read_uleb128()? as i64;
                    self.set_cfa(CfaRule::RegisterOffset { register, offset }, handler)?;
                }
                gimli::DW_CFA_def_cfa_sf => {
                    let register = cursor.read_uleb128()?;
                    let offset = self.factored(cursor.read_sleb128()?);
                    self.set_cfa(CfaRule::RegisterOffset { register, offset }, handler)?;
                }
                gimli::DW_CFA_def_cfa_register => {
                    let register = cursor.read_uleb128()?;
                    let offset = match self.rules.cfa {
                        Some(CfaRule::RegisterOffset { offset, .. }) => offset,
                        None => 0,
                        Some(CfaRule::Expression(_)) => return Err(Error::CfaNotRegisterRelative),
                    };
                    self.set_cfa(CfaRule::RegisterOffset { register, offset }, handler)?;
                }
                gimli::DW_CFA_def_cfa_offset => {
                    let offset = cursor.read_uleb128()? as i64;
                    self.set_cfa_offset(offset, handler)?;
                }
                gimli::DW_CFA_def_cfa_offset_sf => {
                    let offset = self.factored(cursor.read_sleb128()?);
                    self.set_cfa_offset(offset, handler)?;
                }
                gimli::DW_CFA_def_cfa_expression => {
                    let expr = read_expression(&self.reader, &mut cursor)?;
                    self.set_cfa(CfaRule::Expression(expr), handler)?;
                }
                gimli::DW_CFA_GNU_args_size => {
                    cursor.read_uleb128()?;
                }
                _ => return Err(Error::UnknownCfaInstruction(op)),
            }
        }
        Ok(())
    }

    fn advance(&mut self, delta: u64) {
        self.address = self
            .address
            .wrapping_add(delta.wrapping_mul(self.cie.code_alignment));
    }

    fn factored(&self, offset: i64) -> i64 {
        offset.wrapping_mul(self.cie.data_alignment)
    }

    fn set_register(
        &mut self,
        register: u64,
        rule: RegisterRule<'a>,
        handler: &mut dyn CallFrameInfoHandler,
    ) -> Result<()> {
        self.rules.registers.insert(register, rule);
        self.report(Column::Register(register), handler)
    }

    fn set_cfa(&mut self, rule: CfaRule<'a>, handler: &mut dyn CallFrameInfoHandler) -> Result<()> {
        self.rules.cfa = Some(rule);
        self.report(Column::Cfa, handler)
    }

    fn set_cfa_offset(&mut self, offset: i64, handler: &mut dyn CallFrameInfoHandler) -> Result<()> {
        match self.rules.cfa {
            Some(CfaRule::RegisterOffset { register, .. }) => {
                self.set_cfa(CfaRule::RegisterOffset { register, offset }, handler)
            }
            _ => Err(Error::CfaNotRegisterRelative),
        }
    }

    /// CIEの初期規則に戻す
    fn restore(&mut self, register: u64, handler: &mut dyn CallFrameInfoHandler) -> Result<()> {
        let rule = self
            .initial
            .registers
            .get(&register)
            .cloned()
            .unwrap_or(RegisterRule::Undefined);
        self.set_register(register, rule, handler)
    }

    /// restore_state: 規則を丸ごと置き換え、変化した列を通知する
    fn replace_rules(&mut self, saved: RuleSet<'a>, handler: &mut dyn CallFrameInfoHandler) -> Result<()> {
        let old = std::mem::replace(&mut self.rules, saved);
        if old.cfa != self.rules.cfa {
            self.report(Column::Cfa, handler)?;
        }
        let registers: BTreeSet<u64> = old
            .registers
            .keys()
            .chain(self.rules.registers.keys())
            .copied()
            .collect();
        for register in registers {
            if old.registers.get(&register) != self.rules.registers.get(&register) {
                self.report(Column::Register(register), handler)?;
            }
        }
        Ok(())
    }

    /// 現在のすべての規則を通知する（FDEの先頭でCIEの内容を繰り返すため）
    fn report_all(&mut self, handler: &mut dyn CallFrameInfoHandler) -> Result<()> {
        if self.rules.cfa.is_some() {
            self.report(Column::Cfa, handler)?;
        }
        let registers: Vec<u64> = self.rules.registers.keys().copied().collect();
        for register in registers {
            self.report(Column::Register(register), handler)?;
        }
        Ok(())
    }

    fn report(&self, column: Column, handler: &mut dyn CallFrameInfoHandler) -> Result<()> {
        let rule = self.rule_string(column)?;
        if handler.rule(self.address, column, &rule) {
            Ok(())
        } else {
            Err(Error::HandlerAborted(self.entry_offset))
        }
    }

    fn rule_string(&self, column: Column) -> Result<String> {
        match column {
            Column::Cfa => match &self.rules.cfa {
                None => Ok("undefined".to_string()),
                Some(CfaRule::RegisterOffset { register, offset }) => Ok(format!(
                    "{} {} +",
                    RegisterNames::name(self.names, *register),
                    offset
                )),
                Some(CfaRule::Expression(expr)) => postfix::translate(&self.reader, self.names, expr),
            },
            Column::Register(register) => match self.rules.registers.get(&register) {
                None | Some(RegisterRule::Undefined) => Ok("undefined".to_string()),
                Some(RegisterRule::SameValue) => Ok("same".to_string()),
                Some(RegisterRule::Offset(offset)) => Ok(format!("$cfa {} + ^", offset)),
                Some(RegisterRule::ValOffset(offset)) => Ok(format!("$cfa {} +", offset)),
                Some(RegisterRule::Register(other)) => Ok(RegisterNames::name(self.names, *other)),
                Some(RegisterRule::Expression(expr)) => Ok(format!(
                    "{} ^",
                    postfix::translate_with_cfa(&self.reader, self.names, expr)?
                )),
                Some(RegisterRule::ValExpression(expr)) => {
                    postfix::translate_with_cfa(&self.reader, self.names, expr)
                }
            },
        }
    }
}

fn read_expression<'a>(reader: &ByteReader, cursor: &mut Slice<'a>) -> Result<&'a [u8]> {
    let length = cursor.read_uleb128()?;
    reader.read_block(cursor, length)
}
