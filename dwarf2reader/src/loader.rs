//! オブジェクトファイルからDWARFセクションを読み込む

use crate::reader::ByteReader;
use crate::registers::RegisterNames;
use crate::sections::{self, SectionMap};
use object::{CompressionFormat, Object, ObjectSection};
use tracing::{debug, warn};

/// 読み込み対象のセクション
const DEBUG_SECTIONS: [&str; 5] = [
    sections::DEBUG_INFO,
    sections::DEBUG_ABBREV,
    sections::DEBUG_LINE,
    sections::DEBUG_FRAME,
    sections::DEBUG_STR,
];

/// DWARFローダー
///
/// セクションのバッファはファイルのバイト列を借用します。
pub struct DwarfLoader<'data> {
    sections: SectionMap<'data>,
    endian: gimli::RunTimeEndian,
    address_size: u8,
    architecture: object::Architecture,
    /// `.debug_frame` のロードアドレス（pc相対エンコーディング用）
    frame_address: u64,
}

impl<'data> DwarfLoader<'data> {
    /// ELF/Mach-O/PEのバイト列からDWARFセクションを集める
    pub fn parse(data: &'data [u8]) -> anyhow::Result<Self> {
        let object_file = object::File::parse(data)
            .map_err(|e| anyhow::anyhow!("Failed to parse object file: {}", e))?;

        let endian = if object_file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };
        let address_size = if object_file.is_64() { 8 } else { 4 };

        let mut sections = SectionMap::new();
        let mut frame_address = 0;
        for name in DEBUG_SECTIONS {
            // Mach-Oの "__debug_info" などへの対応は object が行う
            let Some(section) = object_file.section_by_name(name) else {
                continue;
            };

            let compressed = section
                .compressed_file_range()
                .map(|range| range.format != CompressionFormat::None)
                .unwrap_or(false);
            if compressed {
                warn!("Skipping compressed section {}", name);
                continue;
            }

            let bytes = section
                .data()
                .map_err(|e| anyhow::anyhow!("Failed to read section {}: {}", name, e))?;
            debug!("Loaded {} ({} bytes)", name, bytes.len());
            if name == sections::DEBUG_FRAME {
                frame_address = section.address();
            }
            sections.insert(name, bytes);
        }

        Ok(Self {
            sections,
            endian,
            address_size,
            architecture: object_file.architecture(),
            frame_address,
        })
    }

    pub fn sections(&self) -> &SectionMap<'data> {
        &self.sections
    }

    pub fn endian(&self) -> gimli::RunTimeEndian {
        self.endian
    }

    pub fn address_size(&self) -> u8 {
        self.address_size
    }

    pub fn architecture(&self) -> object::Architecture {
        self.architecture
    }

    pub fn frame_address(&self) -> u64 {
        self.frame_address
    }

    /// ファイルのエンディアンとアドレスサイズを設定したバイトリーダー
    pub fn byte_reader(&self) -> ByteReader {
        let mut reader = ByteReader::new(self.endian);
        reader.set_address_size(self.address_size);
        reader
    }

    /// アーキテクチャに対応するレジスタ名テーブル
    pub fn register_names(&self) -> Vec<String> {
        RegisterNames::for_architecture(self.architecture)
    }
}
