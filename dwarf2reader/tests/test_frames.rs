//! コールフレーム情報の統合テスト

mod common;

use common::{with_length32, Bytes};
use dwarf2reader::{ByteReader, CallFrameInfo, CallFrameInfoHandler, Column, Error, RegisterNames};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Entry { address: u64, length: u64, return_address: u64 },
    Rule(u64, Column, String),
}

#[derive(Default)]
struct Recorder {
    events: Vec<Event>,
    /// この回数だけ rule を受け付けた後に中断する
    abort_after: Option<usize>,
}

impl CallFrameInfoHandler for Recorder {
    fn entry(&mut self, address: u64, length: u64, _: u8, _: &str, return_address: u64) -> bool {
        self.events.push(Event::Entry {
            address,
            length,
            return_address,
        });
        true
    }

    fn rule(&mut self, address: u64, column: Column, rule: &str) -> bool {
        self.events.push(Event::Rule(address, column, rule.to_string()));
        match self.abort_after.as_mut() {
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
            None => true,
        }
    }
}

/// バージョン1のCIE（拡張なし、code alignment 1, data alignment -8）
fn cie(return_address: u8, instructions: &[u8]) -> Vec<u8> {
    let body = Bytes::new()
        .u32(0xffff_ffff)
        .u8(1)
        .u8(0)
        .uleb(1)
        .sleb(-8)
        .u8(return_address)
        .bytes(instructions)
        .into_vec();
    with_length32(&body)
}

/// 8バイトアドレスのFDE
fn fde(cie_offset: u32, address: u64, length: u64, instructions: &[u8]) -> Vec<u8> {
    let body = Bytes::new()
        .u32(cie_offset)
        .u64(address)
        .u64(length)
        .bytes(instructions)
        .into_vec();
    with_length32(&body)
}

fn run(section: &[u8], names: &[String], recorder: &mut Recorder) -> dwarf2reader::Result<()> {
    CallFrameInfo::new(section, ByteReader::new(gimli::RunTimeEndian::Little), names, recorder).start()
}

#[test]
fn test_def_cfa_after_advance() {
    let mut section = cie(8, &[]);
    // advance_loc 4; def_cfa r7 16
    section.extend(fde(0, 0x1000, 0x10, &[0x44, 0x0c, 0x07, 0x10]));

    let mut recorder = Recorder::default();
    run(&section, &[], &mut recorder).expect("CFI should parse");
    assert_eq!(
        recorder.events,
        vec![
            Event::Entry {
                address: 0x1000,
                length: 0x10,
                return_address: 8
            },
            Event::Rule(0x1004, Column::Cfa, "$r7 16 +".to_string()),
        ]
    );

    let names = RegisterNames::x86_64();
    let mut recorder = Recorder::default();
    run(&section, &names, &mut recorder).expect("CFI should parse");
    assert_eq!(
        recorder.events[1],
        Event::Rule(0x1004, Column::Cfa, "$rsp 16 +".to_string())
    );
}

#[test]
fn test_fdes_do_not_share_state() {
    // CIE: def_cfa r7 8, r16 at cfa-8
    let mut section = cie(16, &[0x0c, 0x07, 0x08, 0x90, 0x01]);
    // 1つ目のFDEはCFAとr6の規則を変更する
    section.extend(fde(0, 0x1000, 0x20, &[0x41, 0x0e, 0x10, 0x86, 0x02]));
    section.extend(fde(0, 0x2000, 0x20, &[]));

    let mut recorder = Recorder::default();
    run(&section, &[], &mut recorder).expect("CFI should parse");

    let second_entry = recorder
        .events
        .iter()
        .position(|e| matches!(e, Event::Entry { address: 0x2000, .. }))
        .expect("Second FDE should be reported");
    assert_eq!(
        recorder.events[second_entry + 1..].to_vec(),
        vec![
            Event::Rule(0x2000, Column::Cfa, "$r7 8 +".to_string()),
            Event::Rule(0x2000, Column::Register(16), "$cfa -8 + ^".to_string()),
        ],
        "Second FDE should start from the CIE's initial rules only"
    );
}

#[test]
fn test_missing_cie_skips_entry() {
    let mut section = cie(16, &[0x0c, 0x07, 0x08]);
    let bad_offset = section.len() as u64;
    section.extend(fde(0x100, 0x1000, 0x10, &[]));
    section.extend(fde(0, 0x2000, 0x10, &[]));

    let mut recorder = Recorder::default();
    let result = run(&section, &[], &mut recorder);
    assert_eq!(
        result,
        Err(Error::MissingCie {
            fde: bad_offset,
            cie: 0x100
        })
    );
    assert_eq!(
        recorder.events,
        vec![
            Event::Entry {
                address: 0x2000,
                length: 0x10,
                return_address: 16
            },
            Event::Rule(0x2000, Column::Cfa, "$r7 8 +".to_string()),
        ]
    );
}

#[test]
fn test_handler_abort_stops_parsing() {
    let mut section = cie(16, &[0x0c, 0x07, 0x08]);
    section.extend(fde(0, 0x1000, 0x10, &[0x41, 0x0e, 0x10]));
    section.extend(fde(0, 0x2000, 0x10, &[]));

    let mut recorder = Recorder {
        abort_after: Some(0),
        ..Default::default()
    };
    let result = run(&section, &[], &mut recorder);
    assert_eq!(result, Err(Error::HandlerAborted(cie(16, &[0x0c, 0x07, 0x08]).len() as u64)));
    assert_eq!(recorder.events.len(), 2, "Nothing should be reported after the abort");
}

#[test]
fn test_dwarf64_entries() {
    let cie_body = Bytes::new()
        .u64(u64::MAX)
        .u8(3)
        .u8(0)
        .uleb(1)
        .sleb(-8)
        .uleb(16)
        .bytes(&[0x0c, 0x07, 0x08])
        .into_vec();
    let mut section = Bytes::new()
        .u32(0xffff_ffff)
        .u64(cie_body.len() as u64)
        .bytes(&cie_body)
        .into_vec();

    let fde_body = Bytes::new().u64(0).u64(0x3000).u64(0x40).into_vec();
    section.extend(
        Bytes::new()
            .u32(0xffff_ffff)
            .u64(fde_body.len() as u64)
            .bytes(&fde_body)
            .into_vec(),
    );

    let mut recorder = Recorder::default();
    run(&section, &[], &mut recorder).expect("64-bit CFI should parse");
    assert_eq!(
        recorder.events,
        vec![
            Event::Entry {
                address: 0x3000,
                length: 0x40,
                return_address: 16
            },
            Event::Rule(0x3000, Column::Cfa, "$r7 8 +".to_string()),
        ]
    );
}

#[test]
fn test_zero_length_entries_are_skipped() {
    let mut section = vec![0, 0, 0, 0];
    let cie_offset = section.len() as u32;
    section.extend(cie(16, &[]));
    section.extend(fde(cie_offset, 0x1000, 0x10, &[]));

    let mut recorder = Recorder::default();
    run(&section, &[], &mut recorder).expect("Padding should be ignored");
    assert_eq!(recorder.events.len(), 1);
}

#[test]
fn test_instructions_past_entry_end() {
    let mut section = cie(16, &[]);
    // def_cfa r7 のオフセットが欠けている。直後は次のFDEの長さフィールド
    section.extend(fde(0, 0x1000, 0x10, &[0x0c, 0x07]));
    section.extend(fde(0, 0x2000, 0x10, &[0x0c, 0x07, 0x08]));

    let mut recorder = Recorder::default();
    let result = run(&section, &[], &mut recorder);
    assert_eq!(result, Err(Error::OutOfBounds));

    let rules: Vec<&Event> = recorder
        .events
        .iter()
        .filter(|e| matches!(e, Event::Rule(..)))
        .collect();
    assert_eq!(
        rules,
        vec![&Event::Rule(0x2000, Column::Cfa, "$r7 8 +".to_string())],
        "Only the following FDE should produce rules"
    );
    assert!(
        recorder.events.contains(&Event::Entry {
            address: 0x2000,
            length: 0x10,
            return_address: 16
        }),
        "The entry after the truncated one should still be reported"
    );
}
