use scroll::Pread;
use synth_elf::{Endian, StInfo, StringTable, SymbolTable};

struct Func {
    name: &'static str,
    addr: u64,
    size: u64,
}

const FUNCS: &[Func] = &[
    Func {
        name: "superfunc",
        addr: 0x1000_1000,
        size: 0x10,
    },
    Func {
        name: "awesomefunc",
        addr: 0x2000_2000,
        size: 0x2f,
    },
    Func {
        name: "megafunc",
        addr: 0x3000_3000,
        size: 0x3c,
    },
];

fn expected_strings() -> Vec<u8> {
    let mut v = vec![0];
    for func in FUNCS {
        v.extend_from_slice(func.name.as_bytes());
        v.push(0);
    }
    v
}

#[test]
fn simple_32() {
    let mut st = StringTable::with_endian(Endian::Little);
    let mut symtab = SymbolTable::<u32>::with_endian(Endian::Little);

    for (i, func) in FUNCS.iter().enumerate() {
        symtab.add_symbol(
            &mut st,
            func.name,
            func.addr as u32,
            func.size as u32,
            StInfo {
                bind: if i == 0 {
                    goblin::elf::sym::STB_GLOBAL
                } else {
                    goblin::elf::sym::STB_LOCAL
                },
                kind: goblin::elf::sym::STT_FUNC,
            },
            i as u16 + 1,
        );
    }

    assert_eq!(symtab.count(), FUNCS.len() + 1);
    assert_eq!(st.finish().unwrap(), expected_strings());

    let bytes = symtab.finish().unwrap();
    assert_eq!(bytes.len(), 16 * (FUNCS.len() + 1));

    // The null symbol occupies slot 0.
    assert!(bytes[..16].iter().all(|&b| b == 0));

    let le = scroll::LE;
    let mut name_off = 1usize;
    for (i, func) in FUNCS.iter().enumerate() {
        let at = 16 * (i + 1);
        assert_eq!(bytes.pread_with::<u32>(at, le).unwrap(), name_off as u32);
        assert_eq!(bytes.pread_with::<u32>(at + 4, le).unwrap(), func.addr as u32);
        assert_eq!(bytes.pread_with::<u32>(at + 8, le).unwrap(), func.size as u32);
        assert_eq!(bytes.pread_with::<u16>(at + 14, le).unwrap(), i as u16 + 1);
        name_off += func.name.len() + 1;
    }
}

#[test]
fn simple_64() {
    let mut st = StringTable::with_endian(Endian::Little);
    let mut symtab = SymbolTable::<u64>::with_endian(Endian::Little);

    for func in FUNCS {
        symtab.add_symbol(
            &mut st,
            func.name,
            func.addr,
            func.size,
            StInfo {
                bind: goblin::elf::sym::STB_GLOBAL,
                kind: goblin::elf::sym::STT_FUNC,
            },
            1,
        );
    }

    let bytes = symtab.finish().unwrap();
    assert_eq!(bytes.len(), 24 * (FUNCS.len() + 1));

    let le = scroll::LE;
    for (i, func) in FUNCS.iter().enumerate() {
        let at = 24 * (i + 1);
        let info: u8 = bytes.pread_with(at + 4, le).unwrap();
        assert_eq!(info >> 4, goblin::elf::sym::STB_GLOBAL);
        assert_eq!(info & 0xf, goblin::elf::sym::STT_FUNC);
        assert_eq!(bytes.pread_with::<u64>(at + 8, le).unwrap(), func.addr);
        assert_eq!(bytes.pread_with::<u64>(at + 16, le).unwrap(), func.size);
    }
}
