//! dwarf2dump - DWARFデバッグ情報のダンプツール
//!
//! オブジェクトファイルのDIEツリー、行番号表、コールフレーム情報を表示します。

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dwarf2reader::{
    AttributeList, CallFrameInfoHandler, Column, Driver, DriverOptions, DwarfLoader, Dwarf2Handler,
    LineInfoHandler, RegisterNames,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// dwarf2dump - DWARF 2/3 debug information dumper
#[derive(Parser)]
#[command(name = "dwarf2dump")]
#[command(version = "0.1.0")]
#[command(about = "Dump DWARF debugging information from an object file", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: DumpCommand,

    /// Keep going after a malformed compilation unit or line program
    #[arg(short, long, global = true)]
    keep_going: bool,

    /// Maximum number of compilation units to visit
    #[arg(long, global = true)]
    max_units: Option<usize>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum DumpCommand {
    /// Print the DIE tree of every compilation unit
    Info {
        /// Path to the object file
        binary: PathBuf,
    },

    /// Print the line number programs referenced by compilation units
    Lines {
        /// Path to the object file
        binary: PathBuf,
    },

    /// Print call frame information as STACK CFI records
    Frames {
        /// Path to the object file
        binary: PathBuf,

        /// Register naming (x86, x86_64, arm, aarch64). Defaults to the file's architecture
        #[arg(long)]
        arch: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let options = DriverOptions {
        continue_on_error: cli.keep_going,
        max_units: cli.max_units,
    };

    match &cli.command {
        DumpCommand::Info { binary } => {
            let data = read_binary(binary)?;
            let loader = DwarfLoader::parse(&data)?;
            let driver = Driver::new(loader.sections(), loader.byte_reader(), options);

            let mut printer = InfoPrinter::default();
            let summary = driver.walk_units(&mut printer)?;
            println!();
            println!("{} compilation units, {} failed", summary.units, summary.failed);
        }
        DumpCommand::Lines { binary } => {
            let data = read_binary(binary)?;
            let loader = DwarfLoader::parse(&data)?;
            let driver = Driver::new(loader.sections(), loader.byte_reader(), options.clone());

            for offset in driver.line_program_offsets()? {
                println!("Line program at 0x{:x}", offset);
                let mut printer = LinePrinter;
                if let Err(e) = driver.walk_lines(offset, &mut printer) {
                    if !options.continue_on_error {
                        return Err(e).with_context(|| format!("Line program at 0x{:x}", offset));
                    }
                    tracing::warn!("Line program at 0x{:x} failed: {}", offset, e);
                }
                println!();
            }
        }
        DumpCommand::Frames { binary, arch } => {
            let data = read_binary(binary)?;
            let loader = DwarfLoader::parse(&data)?;
            let names = match arch {
                Some(arch) => RegisterNames::by_name(arch)
                    .ok_or_else(|| anyhow::anyhow!("Unknown architecture: {}", arch))?,
                None => loader.register_names(),
            };
            let mut driver = Driver::new(loader.sections(), loader.byte_reader(), options);
            driver.set_frame_address(loader.frame_address());

            let mut printer = FramePrinter::new(&names);
            let result = driver.walk_frames(&names, &mut printer);
            printer.flush();
            result?;
        }
    }

    Ok(())
}

fn read_binary(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", path, e))
}

/// DIEツリーを深さに応じて字下げして表示する
#[derive(Default)]
struct InfoPrinter {
    depth: usize,
}

impl InfoPrinter {
    fn attribute(&self, attr: gimli::DwAt, form: gimli::DwForm, value: &str) {
        println!("{:indent$}  {} ({}): {}", "", attr, form, value, indent = self.depth * 2);
    }
}

impl Dwarf2Handler for InfoPrinter {
    fn start_compilation_unit(
        &mut self,
        offset: u64,
        address_size: u8,
        offset_size: u8,
        cu_length: u64,
        dwarf_version: u16,
    ) -> bool {
        println!(
            "Compilation unit at 0x{:x}: version {}, length 0x{:x}, address size {}, offset size {}",
            offset, dwarf_version, cu_length, address_size, offset_size
        );
        self.depth = 0;
        true
    }

    fn start_die(&mut self, offset: u64, tag: gimli::DwTag, _: &AttributeList) -> bool {
        println!("{:indent$}<0x{:x}> {}", "", offset, tag, indent = self.depth * 2);
        self.depth += 1;
        true
    }

    fn process_attribute_unsigned(&mut self, _: u64, attr: gimli::DwAt, form: gimli::DwForm, data: u64) {
        self.attribute(attr, form, &format!("0x{:x}", data));
    }

    fn process_attribute_signed(&mut self, _: u64, attr: gimli::DwAt, form: gimli::DwForm, data: i64) {
        self.attribute(attr, form, &data.to_string());
    }

    fn process_attribute_buffer(&mut self, _: u64, attr: gimli::DwAt, form: gimli::DwForm, data: &[u8]) {
        let bytes: Vec<String> = data.iter().map(|b| format!("{:02x}", b)).collect();
        self.attribute(attr, form, &format!("[{}]", bytes.join(" ")));
    }

    fn process_attribute_string(&mut self, _: u64, attr: gimli::DwAt, form: gimli::DwForm, data: &str) {
        if attr == gimli::DW_AT_linkage_name || attr == gimli::DW_AT_MIPS_linkage_name {
            let demangled = format!("{:#}", rustc_demangle::demangle(data));
            self.attribute(attr, form, &format!("\"{}\" ({})", data, demangled));
        } else {
            self.attribute(attr, form, &format!("\"{}\"", data));
        }
    }

    fn end_die(&mut self, _: u64) {
        self.depth = self.depth.saturating_sub(1);
    }
}

/// 行番号表を表示する
struct LinePrinter;

impl LineInfoHandler for LinePrinter {
    fn define_dir(&mut self, name: &str, dir_num: u32) {
        println!("  dir  {:>3} {}", dir_num, name);
    }

    fn define_file(&mut self, name: &str, file_num: i32, dir_num: u32, _mod_time: u64, _length: u64) {
        println!("  file {:>3} {} (dir {})", file_num, name, dir_num);
    }

    fn add_line(&mut self, address: u64, file_num: u32, line_num: u32, column_num: u32) {
        println!("  0x{:016x} file {} line {} column {}", address, file_num, line_num, column_num);
    }

    fn end_sequence(&mut self, address: u64) {
        println!("  0x{:016x} end_sequence", address);
    }
}

/// CFIを STACK CFI 形式で表示する
///
/// 同じアドレスの規則は1行にまとめます。
struct FramePrinter<'n> {
    names: &'n [String],
    return_address: u64,
    line: Option<(u64, String)>,
}

impl<'n> FramePrinter<'n> {
    fn new(names: &'n [String]) -> Self {
        Self {
            names,
            return_address: 0,
            line: None,
        }
    }

    fn flush(&mut self) {
        if let Some((_, line)) = self.line.take() {
            println!("{}", line);
        }
    }

    fn column_name(&self, column: Column) -> String {
        match column {
            Column::Cfa => ".cfa".to_string(),
            Column::Register(reg) if reg == self.return_address => ".ra".to_string(),
            Column::Register(reg) => RegisterNames::name(self.names, reg),
        }
    }
}

impl CallFrameInfoHandler for FramePrinter<'_> {
    fn entry(&mut self, address: u64, length: u64, _version: u8, _augmentation: &str, return_address: u64) -> bool {
        self.flush();
        self.return_address = return_address;
        self.line = Some((address, format!("STACK CFI INIT {:x} {:x}", address, length)));
        true
    }

    fn rule(&mut self, address: u64, column: Column, rule: &str) -> bool {
        if self.line.as_ref().map(|(at, _)| *at) != Some(address) {
            self.flush();
            self.line = Some((address, format!("STACK CFI {:x}", address)));
        }
        let name = self.column_name(column);
        if let Some((_, line)) = self.line.as_mut() {
            line.push_str(&format!(" {}: {}", name, rule));
        }
        true
    }
}
