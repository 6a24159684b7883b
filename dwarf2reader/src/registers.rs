//! 後置記法で使うレジスタ名テーブル
//!
//! DWARFレジスタ番号から名前への対応は gimli のアーキテクチャ定義を使います。

use gimli::Register;

/// レジスタ名テーブルの作成
pub struct RegisterNames;

impl RegisterNames {
    pub fn i386() -> Vec<String> {
        table(64, gimli::X86::register_name)
    }

    pub fn x86_64() -> Vec<String> {
        table(128, gimli::X86_64::register_name)
    }

    pub fn arm() -> Vec<String> {
        table(288, gimli::Arm::register_name)
    }

    pub fn aarch64() -> Vec<String> {
        table(128, gimli::AArch64::register_name)
    }

    /// アーキテクチャに対応するテーブル。未対応なら空（すべて `$rN` 表記になる）
    pub fn for_architecture(arch: object::Architecture) -> Vec<String> {
        match arch {
            object::Architecture::I386 => Self::i386(),
            object::Architecture::X86_64 => Self::x86_64(),
            object::Architecture::Arm => Self::arm(),
            object::Architecture::Aarch64 => Self::aarch64(),
            _ => Vec::new(),
        }
    }

    /// アーキテクチャ名（CLIの `--arch` 用）からテーブルを選ぶ
    pub fn by_name(name: &str) -> Option<Vec<String>> {
        match name {
            "x86" | "i386" => Some(Self::i386()),
            "x86_64" | "amd64" => Some(Self::x86_64()),
            "arm" => Some(Self::arm()),
            "aarch64" | "arm64" => Some(Self::aarch64()),
            _ => None,
        }
    }

    /// レジスタ番号の名前。テーブルにない番号は `$rN`
    pub fn name(names: &[String], register: u64) -> String {
        usize::try_from(register)
            .ok()
            .and_then(|index| names.get(index))
            .cloned()
            .unwrap_or_else(|| format!("$r{}", register))
    }
}

fn table(count: u16, lookup: fn(Register) -> Option<&'static str>) -> Vec<String> {
    (0..count)
        .map(|reg| match lookup(Register(reg)) {
            Some(name) => format!("${}", name),
            None => format!("$r{}", reg),
        })
        .collect()
}
