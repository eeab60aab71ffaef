use super::*;
use crate::test_log;

fn declared(config: &Config) -> MemoryMap {
    let mut mem = MemoryMap::new(config);
    mem.declare(0x1000, 0x1000).unwrap();
    mem
}

fn abs(addr: u64) -> Address {
    Address::absolute(addr)
}

fn test_endian_write(e: Endianness) {
    let mut mem = declared(&Config::default());
    mem.write(&abs(0x1000), &Expr::from_u64(0xdead_beef, 32), e)
        .unwrap();
    let expected = match e {
        Endianness::Big => [0xde, 0xad, 0xbe, 0xef],
        Endianness::Little => [0xef, 0xbe, 0xad, 0xde],
    };
    for i in 0..4 {
        let data = mem.read(&abs(0x1000 + i), 8, Endianness::Little).unwrap();
        assert_eq!(data.as_u64().unwrap(), expected[i as usize]);
    }
}

fn test_endian_read(e: Endianness) {
    let mut mem = declared(&Config::default());
    let byte_layout = match e {
        Endianness::Big => [0xde, 0xad, 0xbe, 0xef],
        Endianness::Little => [0xef, 0xbe, 0xad, 0xde],
    };
    for (i, b) in byte_layout.iter().enumerate() {
        mem.write_bytes(0x1000 + i as u64, &[*b]).unwrap();
    }
    let val = mem.read(&abs(0x1000), 32, e).unwrap();
    assert_eq!(val.as_u64().unwrap(), 0xdead_beef);
}

#[test]
fn test_little_endian_write() {
    test_endian_write(Endianness::Little)
}

#[test]
fn test_big_endian_write() {
    test_endian_write(Endianness::Big)
}

#[test]
fn test_little_endian_read() {
    test_endian_read(Endianness::Little)
}

#[test]
fn test_big_endian_read() {
    test_endian_read(Endianness::Big)
}

#[test]
fn test_overlapping_write() {
    let mut mem = MemoryMap::new(&Config::default());
    mem.write_bytes(0x1000, &[0xdd, 0xcc, 0xbb, 0xaa]).unwrap();
    mem.write_bytes(0x1001, &[0xff, 0xee]).unwrap();
    let val = mem.read(&abs(0x1000), 32, Endianness::Little).unwrap();
    assert_eq!(val, Expr::from_u64(0xaaee_ffdd, 32));
}

#[test]
fn test_symbolic_write_is_idempotent() {
    let mut mem = declared(&Config::default());
    let eax = Expr::reg("eax", 32);
    mem.write(&abs(0x1800), &eax, Endianness::Little).unwrap();
    assert_eq!(mem.read(&abs(0x1800), 32, Endianness::Little).unwrap(), eax);
    assert_eq!(
        mem.read(&abs(0x1801), 16, Endianness::Little).unwrap(),
        eax.slice(8, 16).unwrap()
    );
}

#[test]
fn test_gaps_and_undeclared_reads() {
    let mut mem = declared(&Config::default());
    assert_eq!(
        mem.read(&abs(0x1000), 32, Endianness::Little).unwrap(),
        Expr::top(32)
    );
    mem.write_bytes(0x1000, &[0x01]).unwrap();
    assert_eq!(
        mem.read(&abs(0x1000), 16, Endianness::Little).unwrap(),
        Expr::composite([Expr::from_u64(1, 8), Expr::top(8)]).unwrap()
    );
    assert!(matches!(
        mem.read(&abs(0x9000), 8, Endianness::Little),
        Err(RavelError::MemoryMap { .. })
    ));
    // a write declares what it covers
    mem.write_bytes(0x9000, &[0x02]).unwrap();
    assert_eq!(mem.read(&abs(0x9000), 8, Endianness::Little).unwrap().as_u64(), Some(2));
}

#[test]
fn test_uninitialized_as_zero() {
    let config = Config {
        read_uninitialized_as_zero: true,
        ..Config::default()
    };
    let mut mem = declared(&config);
    mem.write_bytes(0x1000, &[0x01]).unwrap();
    assert_eq!(
        mem.read(&abs(0x1000), 16, Endianness::Little).unwrap(),
        Expr::from_u64(1, 16)
    );
    assert!(mem.read(&abs(0x9000), 8, Endianness::Little).is_err());
}

#[test]
fn test_relative_zone() {
    let mem = MemoryMap::new(&Config::default());
    let esp = Expr::reg("esp", 32);
    let initial = mem
        .read(&Address::relative(esp, -4), 32, Endianness::Little)
        .unwrap();
    assert_eq!(initial, Expr::mem(&(esp - 4), 32));

    let mut mem = mem;
    let eax = Expr::reg("eax", 32);
    mem.write(&Address::relative(esp, 0), &eax, Endianness::Little)
        .unwrap();
    let wide = mem
        .read(&Address::relative(esp, 0), 64, Endianness::Little)
        .unwrap();
    assert_eq!(
        wide,
        Expr::composite([eax, Expr::mem(&(esp + 4), 32)]).unwrap()
    );
}

#[test]
fn test_fragments() {
    let mut mem = declared(&Config::default());
    mem.write_bytes(0x1010, &[1, 2]).unwrap();
    let frags = mem.read_fragments(&abs(0x100e), 6).unwrap();
    assert_eq!(
        frags,
        vec![
            Fragment {
                offset: 0,
                len: 2,
                data: None
            },
            Fragment {
                offset: 2,
                len: 2,
                data: Some(Expr::from_u64(0x0201, 16))
            },
            Fragment {
                offset: 4,
                len: 2,
                data: None
            },
        ]
    );
}

#[test]
fn test_weak_write() {
    test_log();
    let mut mem = declared(&Config::default());
    mem.write_bytes(0x1000, &[1, 0, 0, 0]).unwrap();
    mem.write_weak(&abs(0x1000), &Expr::from_u64(2, 32), Endianness::Little)
        .unwrap();
    let val = mem.read(&abs(0x1000), 32, Endianness::Little).unwrap();
    assert_eq!(
        val,
        Expr::vec([Expr::from_u64(1, 32), Expr::from_u64(2, 32)]).unwrap()
    );
}

#[test]
fn test_weak_write_bound() {
    let config = Config {
        max_vec: 2,
        ..Config::default()
    };
    let mut mem = declared(&config);
    mem.write_bytes(0x1000, &[1]).unwrap();
    mem.write_weak(&abs(0x1000), &Expr::from_u64(2, 8), Endianness::Little)
        .unwrap();
    mem.write_weak(&abs(0x1000), &Expr::from_u64(3, 8), Endianness::Little)
        .unwrap();
    assert!(mem.read(&abs(0x1000), 8, Endianness::Little).unwrap().is_top());
}

#[test]
fn test_taint() {
    test_log();
    let mut mem = declared(&Config::default());
    let esp = Expr::reg("esp", 32);
    mem.write_bytes(0x1000, &[1, 2, 3, 4]).unwrap();
    mem.taint();
    assert!(mem.is_tainted());
    assert_eq!(
        mem.read(&abs(0x1000), 32, Endianness::Little).unwrap(),
        Expr::top(32)
    );
    assert_eq!(
        mem.read(&Address::relative(esp, 0), 32, Endianness::Little)
            .unwrap(),
        Expr::top(32)
    );
    // writes after the taint are trusted again
    mem.write_bytes(0x1001, &[9]).unwrap();
    assert_eq!(
        mem.read(&abs(0x1001), 8, Endianness::Little).unwrap(),
        Expr::from_u64(9, 8)
    );
}

#[test]
fn test_clones_are_isolated() {
    let mut mem = declared(&Config::default());
    mem.write_bytes(0x1000, &[1]).unwrap();
    let mut other = mem.clone();
    other.write_bytes(0x1000, &[2]).unwrap();
    assert_eq!(mem.read(&abs(0x1000), 8, Endianness::Little).unwrap().as_u64(), Some(1));
    assert_eq!(other.read(&abs(0x1000), 8, Endianness::Little).unwrap().as_u64(), Some(2));
}

#[test]
fn test_join() {
    let mut mem = declared(&Config::default());
    mem.write_bytes(0x1000, &[1]).unwrap();
    mem.write_bytes(0x1004, &[7]).unwrap();
    let mut other = mem.clone();
    other.write_bytes(0x1000, &[2]).unwrap();
    mem.join(&other, |a, b| Ok(disjunction(a, b, 16)?)).unwrap();
    assert_eq!(
        mem.read(&abs(0x1000), 8, Endianness::Little).unwrap(),
        Expr::vec([Expr::from_u64(1, 8), Expr::from_u64(2, 8)]).unwrap()
    );
    assert_eq!(mem.read(&abs(0x1004), 8, Endianness::Little).unwrap().as_u64(), Some(7));
}

#[test]
fn test_address_classification() {
    let esp = Expr::reg("esp", 32);
    assert_eq!(
        Address::from_ptr(&Expr::from_u64(0x1000, 32)),
        Some(abs(0x1000))
    );
    assert_eq!(
        Address::from_ptr(&Expr::ptr(esp, None, -8)),
        Some(Address::relative(esp, -8))
    );
    assert_eq!(Address::from_ptr(&(esp + 0xc)), Some(Address::relative(esp, 0xc)));
    assert_eq!(Address::from_ptr(&Expr::top(32)), None);
    let either = Expr::vec([esp, Expr::reg("ebp", 32)]).unwrap();
    assert_eq!(Address::from_ptr(&either), None);
    assert_eq!(Address::relative(esp, -8).to_string(), "esp-0x8");
}

fn page_tables(mem: &mut MemoryMap) {
    mem.write_bytes(0x1000, &[0u8; 0x2000]).unwrap();
    // directory entry 1 -> table at 0x2000, table entry 1 -> frame 0x5000
    mem.write_bytes(0x1004, &0x2003u32.to_le_bytes()).unwrap();
    mem.write_bytes(0x2004, &0x5001u32.to_le_bytes()).unwrap();
}

#[test]
fn test_translate() {
    test_log();
    let mut mem = MemoryMap::new(&Config::default());
    page_tables(&mut mem);
    assert_eq!(mem.translate(0x0040_1234, 0x1000).unwrap(), 0x5234);
    assert_eq!(mem.page_cache().len(), 2);
    assert!(matches!(
        mem.translate(0x0040_2000, 0x1000),
        Err(RavelError::PageFault { .. })
    ));

    // cached tables survive writes until invalidated
    mem.write_bytes(0x2004, &0x6001u32.to_le_bytes()).unwrap();
    assert_eq!(mem.translate(0x0040_1234, 0x1000).unwrap(), 0x5234);
    mem.invalidate_page(0x0040_1234, 0x1000);
    assert_eq!(mem.translate(0x0040_1234, 0x1000).unwrap(), 0x6234);
}

#[test]
fn test_translate_needs_concrete_tables() {
    let mut mem = declared(&Config::default());
    assert!(matches!(
        mem.translate(0x0040_1234, 0x1000),
        Err(RavelError::SymbolicAddress(_))
    ));
}

#[test]
fn test_symbolic_write_may_alias_other_zones() {
    test_log();
    let mut mem = declared(&Config::default());
    let eax = Expr::reg("eax", 32);
    let ebx = Expr::reg("ebx", 32);
    mem.write_bytes(0x1000, &[5, 0, 0, 0]).unwrap();
    mem.write(&Address::relative(ebx, 0), &Expr::from_u64(9, 32), Endianness::Little)
        .unwrap();
    mem.write(&Address::relative(eax, 4), &Expr::from_u64(8, 32), Endianness::Little)
        .unwrap();
    mem.write(&Address::relative(eax, 0), &Expr::from_u64(7, 32), Endianness::Little)
        .unwrap();

    assert!(mem.read(&abs(0x1000), 32, Endianness::Little).unwrap().is_top());
    assert!(mem
        .read(&Address::relative(ebx, 0), 32, Endianness::Little)
        .unwrap()
        .is_top());
    // bytes nobody wrote may have been hit as well
    assert!(mem
        .read(&Address::relative(ebx, 8), 32, Endianness::Little)
        .unwrap()
        .is_top());
    // offsets from the same base never collide
    assert_eq!(
        mem.read(&Address::relative(eax, 0), 64, Endianness::Little)
            .unwrap(),
        Expr::from_u64(0x8_0000_0007, 64)
    );
    assert!(!mem.is_tainted());

    mem.write_bytes(0x1000, &[6]).unwrap();
    assert_eq!(
        mem.read(&abs(0x1000), 8, Endianness::Little).unwrap(),
        Expr::from_u64(6, 8)
    );
}

#[test]
fn test_join_keeps_aliasing_writes() {
    let mut mem = declared(&Config::default());
    let eax = Expr::reg("eax", 32);
    mem.write_bytes(0x1000, &[1]).unwrap();
    let mut other = mem.clone();
    other
        .write(&Address::relative(eax, 0), &Expr::from_u64(7, 8), Endianness::Little)
        .unwrap();
    mem.join(&other, |a, b| Ok(disjunction(a, b, 16)?)).unwrap();

    assert!(mem.read(&abs(0x1000), 8, Endianness::Little).unwrap().is_top());
    assert!(mem.read(&abs(0x1008), 8, Endianness::Little).unwrap().is_top());
    assert_eq!(
        mem.read(&Address::relative(eax, 0), 8, Endianness::Little)
            .unwrap(),
        Expr::vec([Expr::mem(&eax, 8), Expr::from_u64(7, 8)]).unwrap()
    );
}

#[test]
fn test_weak_writes_respect_the_expression_bound() {
    let config = Config {
        max_vec: usize::MAX,
        ..Config::default()
    };
    let mut mem = declared(&config);
    mem.write_bytes(0x1000, &[0]).unwrap();
    for i in 1..ravel_expr::MAX_VEC as u64 {
        mem.write_weak(&abs(0x1000), &Expr::from_u64(i, 8), Endianness::Little)
            .unwrap();
    }
    let full = mem.read(&abs(0x1000), 8, Endianness::Little).unwrap();
    assert_eq!(full.alternatives().len(), ravel_expr::MAX_VEC);
    mem.write_weak(&abs(0x1000), &Expr::from_u64(0xff, 8), Endianness::Little)
        .unwrap();
    assert!(mem.read(&abs(0x1000), 8, Endianness::Little).unwrap().is_top());
}
