use super::{parse_cie, parse_fde, Cie, Cursor, Encoding, InstrIter, Instruction};
use crate::dwarf::CodeRange;
use crate::fixtures::{self, cfa, CieSpec, FunctionCfi};
use crate::memory::MemoryView;
use crate::Error;

fn cursor(data: &[u8]) -> Cursor<'_> {
    let view = MemoryView::for_slice(data);
    Cursor::new(view, view.base(), view.base() + data.len())
}

#[test]
fn uleb128_fixtures() {
    #[rustfmt::skip]
    let cases: &[(&[u8], u64)] = &[
        (&[0x02], 2),
        (&[0x7f], 127),
        (&[0x80, 0x01], 128),
        (&[0xe5, 0x8e, 0x26], 624_485),
        (&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f], (1 << 63) - 1),
    ];
    for &(bytes, value) in cases {
        let mut data = cursor(bytes);
        assert_eq!(data.read_uleb128().unwrap(), value);
        assert!(data.is_empty(), "{bytes:x?} not fully consumed");
    }
}

#[test]
fn uleb128_consumes_exactly_its_bytes() {
    let values = [0, 1, 63, 64, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, 1 << 40, (1 << 63) - 1];
    for value in values {
        let mut bytes = fixtures::uleb(value);
        let len = bytes.len();
        // trailing garbage must stay unread
        bytes.extend_from_slice(&[0xaa, 0xbb]);

        let mut data = cursor(&bytes);
        let start = data.pos();
        assert_eq!(data.read_uleb128().unwrap(), value);
        assert_eq!(data.pos() - start, len, "value {value}");
    }
}

#[test]
fn sleb128_sign_extends() {
    #[rustfmt::skip]
    let cases: &[(&[u8], i64)] = &[
        (&[0x02], 2),
        (&[0x7e], -2),
        (&[0x3f], 63),
        (&[0x40], -64),
        (&[0xff, 0x00], 127),
        (&[0x80, 0x7f], -128),
        (&[0x78], -8),
    ];
    for &(bytes, value) in cases {
        let mut data = cursor(bytes);
        assert_eq!(data.read_sleb128().unwrap(), value, "{bytes:x?}");
        assert!(data.is_empty());
    }

    let values = [0, 1, -1, 63, -64, 64, -65, 1 << 30, -(1 << 30), (1 << 62) - 1, -(1 << 62)];
    for value in values {
        let bytes = fixtures::sleb(value);
        let mut data = cursor(&bytes);
        assert_eq!(data.read_sleb128().unwrap(), value);
        assert!(data.is_empty());
    }
}

#[test]
fn leb128_stops_at_the_end() {
    let mut data = cursor(&[0x80, 0x80]);
    assert!(matches!(data.read_uleb128(), Err(Error::UnexpectedEnd { .. })));
}

#[test]
fn encoded_pointers() {
    #[rustfmt::skip]
    let data: [u8; 16] = [
        0xfc, 0xff, 0xff, 0xff, // -4
        0x10, 0x00, 0x00, 0x00, // 16
        0, 0, 0, 0, 0, 0, 0, 0,
    ];
    let view = MemoryView::for_slice(&data);
    let base = view.base();

    // pcrel sdata4: relative to the field
    let mut c = Cursor::new(view, base, base + 16);
    assert_eq!(c.read_encoded(Encoding(0x1b), None).unwrap(), Some(base - 4));
    // datarel udata4
    assert_eq!(c.read_encoded(Encoding(0x33), Some(0x1000)).unwrap(), Some(0x1010));
    assert_eq!(c.pos(), base + 8);

    // omit reads nothing
    assert_eq!(c.read_encoded(Encoding::OMIT, None).unwrap(), None);
    assert_eq!(c.pos(), base + 8);

    // datarel needs a base
    let mut c = Cursor::new(view, base, base + 16);
    assert_eq!(c.read_encoded(Encoding(0x3b), None), Err(Error::InvalidEncoding(0x3b)));

    // textrel is not supported, neither are unknown formats
    let mut c = Cursor::new(view, base, base + 16);
    assert_eq!(c.read_encoded(Encoding(0x2b), None), Err(Error::InvalidEncoding(0x2b)));
    assert_eq!(c.read_encoded(Encoding(0x07), None), Err(Error::InvalidEncoding(0x07)));
}

#[test]
fn indirect_pointers() {
    let mut data = vec![0u8; 16];
    let target = data.as_ptr().expose_provenance() + 8;
    data[..8].copy_from_slice(&(target as u64).to_le_bytes());
    data[8..].copy_from_slice(&0xdead_beef_u64.to_le_bytes());

    let view = MemoryView::for_slice(&data);
    let mut c = Cursor::new(view, view.base(), view.base() + 8);
    // DW_EH_PE_indirect | DW_EH_PE_udata8
    assert_eq!(c.read_encoded(Encoding(0x84), None).unwrap(), Some(0xdead_beef));
}

#[test]
fn parse_simple_cie() {
    #[rustfmt::skip]
    let data = [
        0x14, 0, 0, 0,
        0, 0, 0, 0, 1,
        0x7a, 0x52, 0, 1,
        0x78, 0x10, 1,
        0x1b, 0xc, 7, 8,
        0x90, 1, 0, 0,
    ];
    let view = MemoryView::for_slice(&data);
    let base = view.base();

    let cie = parse_cie(view, base).unwrap();

    assert_eq!(
        cie,
        Cie {
            version: 1,
            has_augmentation_data: true,
            pointer_encoding: Some(Encoding(0x1b)),
            signal_frame: false,
            code_alignment_factor: 1,
            data_alignment_factor: -8,
            return_address_register: 16,
            initial_instructions: CodeRange::new(base + 17, base + 24),
        }
    );

    let instructions: Vec<_> = InstrIter::new(view, cie.initial_instructions, cie.pointer_encoding)
        .map(|i| i.unwrap().1)
        .collect();
    assert_eq!(
        instructions,
        [
            Instruction::DefCfa { register: 7, offset: 8 },
            Instruction::Offset { register: 16, factored_offset: 1 },
            Instruction::Nop,
            Instruction::Nop,
        ]
    );

    // llvm-dwarfdump output:
    /*
    00000000 00000014 00000000 CIE
    Format:                DWARF32
    Version:               1
    Augmentation:          "zR"
    Code alignment factor: 1
    Data alignment factor: -8
    Return address column: 16
    Augmentation data:     1B

    DW_CFA_def_cfa: RSP +8
    DW_CFA_offset: RIP -8
    DW_CFA_nop:
    DW_CFA_nop:

    CFA=RSP+8: RIP=[CFA-8]
    */
}

#[test]
fn cie_augmentations() {
    // "eh" skips a pointer, "S" marks a signal frame, no 'z' means the
    // instructions start right after the header
    let mut data = vec![0u8; 4];
    data.extend_from_slice(&[0, 0, 0, 0, 1]);
    data.extend_from_slice(b"ehS\0");
    data.extend_from_slice(&[0xaa; 8]);
    data.extend_from_slice(&[1, 0x78, 0x10, 0x0c, 7, 8]);
    let len = data.len() as u32 - 4;
    data[..4].copy_from_slice(&len.to_le_bytes());

    let view = MemoryView::for_slice(&data);
    let base = view.base();
    let cie = parse_cie(view, base).unwrap();
    assert!(cie.signal_frame);
    assert!(!cie.has_augmentation_data);
    assert_eq!(cie.pointer_encoding, None);
    assert_eq!(cie.initial_instructions, CodeRange::new(base + data.len() - 3, base + data.len()));
}

#[test]
fn unknown_augmentation() {
    #[rustfmt::skip]
    let mut data = vec![
        0, 0, 0, 0,
        0, 0, 0, 0, 1,
        b'X', 0,
        1, 0x78, 0x10,
        0x0c, 7, 8, 0,
    ];
    let len = data.len() as u32 - 4;
    data[..4].copy_from_slice(&len.to_le_bytes());
    let view = MemoryView::for_slice(&data);
    assert_eq!(parse_cie(view, view.base()), Err(Error::UnknownAugmentation(b'X')));

    // with a 'z' the unknown letter is skipped using the augmentation length
    #[rustfmt::skip]
    let mut data = vec![
        0, 0, 0, 0,
        0, 0, 0, 0, 1,
        b'z', b'X', b'R', 0,
        1, 0x78, 0x10,
        3, 0xee, 0xee, 0xee,
        0x0c, 7, 8, 0,
    ];
    let len = data.len() as u32 - 4;
    data[..4].copy_from_slice(&len.to_le_bytes());
    let view = MemoryView::for_slice(&data);
    let cie = parse_cie(view, view.base()).unwrap();
    assert_eq!(cie.pointer_encoding, None);
    assert_eq!(cie.initial_instructions.start, view.base() + 20);
}

#[test]
fn cie_must_have_a_zero_id() {
    #[rustfmt::skip]
    let data = [
        0x0c, 0, 0, 0,
        1, 0, 0, 0, 1,
        0, 1, 0x78, 0x10,
    ];
    let view = MemoryView::for_slice(&data);
    assert_eq!(parse_cie(view, view.base()), Err(Error::InvalidCieId));
}

#[test]
fn dwarf64_is_rejected() {
    let data = [0xff; 16];
    let view = MemoryView::for_slice(&data);
    assert_eq!(parse_cie(view, view.base()), Err(Error::Dwarf64));
}

#[test]
fn fde_through_its_cie() {
    let mut image = vec![0u8; 0x100];
    let functions = [
        FunctionCfi::new(0x10, 0x20, cfa::def_cfa_offset(16)),
        FunctionCfi::new(0x40, 0x08, vec![]),
    ];
    let sections = fixtures::push_unwind_sections(&mut image, &CieSpec::default(), &functions, true);

    let view = MemoryView::for_slice(&image);
    let base = view.base();

    let fde = parse_fde(view, base + sections.fdes[0]).unwrap();
    assert_eq!(fde.pc_begin, base + 0x10);
    assert_eq!(fde.pc_range, 0x20);
    assert_eq!(fde.cie_addr, base + sections.cie);
    assert_eq!(fde.cie.data_alignment_factor, -(core::mem::size_of::<usize>() as i64));

    let instructions: Vec<_> = InstrIter::new(view, fde.instructions, fde.cie.pointer_encoding)
        .map(|i| i.unwrap().1)
        .filter(|i| *i != Instruction::Nop)
        .collect();
    assert_eq!(instructions, [Instruction::DefCfaOffset(16)]);

    assert!(fde.covers(base + 0x10));
    assert!(fde.covers(base + 0x2f));
    assert!(fde.covers(base + 0x30));
    assert!(!fde.covers(base + 0x31));
    assert!(!fde.covers(base + 0x0f));

    let fde = parse_fde(view, base + sections.fdes[1]).unwrap();
    assert_eq!(fde.pc_begin, base + 0x40);

    // a CIE is not an FDE
    assert_eq!(parse_fde(view, base + sections.cie), Err(Error::InvalidCieId));
}

#[test]
fn fde_without_pointer_encoding() {
    // CIE without augmentation, FDE with two raw pointers
    #[rustfmt::skip]
    let mut data = vec![
        0x0c, 0, 0, 0,
        0, 0, 0, 0, 1,
        0, 1, 0x78, 0x10,
        0x0c, 7, 8,
    ];
    let fde = data.len();
    let body_len = 4 + 2 * core::mem::size_of::<usize>() + 2;
    data.extend_from_slice(&(body_len as u32).to_le_bytes());
    data.extend_from_slice(&((fde + 4) as u32).to_le_bytes());
    data.extend_from_slice(&0x4000usize.to_ne_bytes());
    data.extend_from_slice(&0x100usize.to_ne_bytes());
    data.extend_from_slice(&[0x0e, 16]);

    let view = MemoryView::for_slice(&data);
    let parsed = parse_fde(view, view.base() + fde).unwrap();
    assert_eq!(parsed.pc_begin, 0x4000);
    assert_eq!(parsed.pc_range, 0x100);
    assert_eq!(parsed.instructions.len(), 2);
}

#[test]
fn instructions_decode() {
    #[rustfmt::skip]
    let data = [
        0x41,                   // advance_loc 1
        0x02, 0x10,             // advance_loc1 16
        0x03, 0x00, 0x01,       // advance_loc2 256
        0x0e, 0x10,             // def_cfa_offset 16
        0x86, 0x02,             // offset r6, 2
        0x11, 0x06, 0x7e,       // offset_extended_sf r6, -2
        0x2f, 0x03, 0x01,       // GNU_negative_offset_extended r3, 1
        0x0a, 0x0b,             // remember_state, restore_state
        0xc6,                   // restore r6
        0x10, 0x07, 0x02, 0x77, 0x08, // expression r7, [breg7 +8]
        0x2e, 0x20,             // GNU_args_size 32
        0x2d,                   // GNU_window_save
    ];
    let view = MemoryView::for_slice(&data);
    let base = view.base();
    let range = CodeRange::new(base, base + data.len());

    let instructions: Vec<_> = InstrIter::new(view, range, None)
        .map(|i| i.unwrap().1)
        .collect();
    assert_eq!(
        instructions,
        [
            Instruction::AdvanceLoc(1),
            Instruction::AdvanceLoc(16),
            Instruction::AdvanceLoc(256),
            Instruction::DefCfaOffset(16),
            Instruction::Offset { register: 6, factored_offset: 2 },
            Instruction::OffsetExtendedSf { register: 6, factored_offset: -2 },
            Instruction::GnuNegativeOffsetExtended { register: 3, factored_offset: 1 },
            Instruction::RememberState,
            Instruction::RestoreState,
            Instruction::Restore(6),
            Instruction::Expression {
                register: 7,
                expr: CodeRange::new(base + 22, base + 24)
            },
            Instruction::GnuArgsSize(32),
            Instruction::GnuWindowSave,
        ]
    );
}

#[test]
fn unknown_instruction_stops_the_iterator() {
    let data = [0x0e, 0x10, 0x3f, 0x0e, 0x10];
    let view = MemoryView::for_slice(&data);
    let range = CodeRange::new(view.base(), view.base() + data.len());

    let mut iter = InstrIter::new(view, range, None);
    assert_eq!(iter.next().unwrap().unwrap().1, Instruction::DefCfaOffset(16));
    assert_eq!(iter.next().unwrap(), Err(Error::UnknownCfaOpcode(0x3f)));
    assert!(iter.next().is_none());
}

#[test]
fn truncated_instruction() {
    // def_cfa whose offset operand is cut off by the end of the range
    let data = [0x0c, 0x07, 0x08];
    let view = MemoryView::for_slice(&data);
    let range = CodeRange::new(view.base(), view.base() + 2);

    let mut iter = InstrIter::new(view, range, None);
    assert!(matches!(iter.next(), Some(Err(Error::UnexpectedEnd { .. }))));
}
