//! Recompiler vs. interpreter on small guest programs

use proptest::prelude::*;

use psx_dynarec::cpu::asm::*;
use psx_dynarec::cpu::interpreter;
use psx_dynarec::memory::{RAM_SIZE_2MB, RAM_SIZE_8MB};
use psx_dynarec::{BackendKind, CpuState, DynarecConfig, DynarecError, Memory, RunExit, System};

const BASE: u32 = 0x8001_0000;
const HALT: u32 = 0x8001_F000;
const DATA: u32 = 0x8002_0000;

/// Run on the interpreter alone until pc reaches `HALT`
fn reference(program: &[u32], init: &[(u8, u32)]) -> CpuState {
    let mut mem = Memory::new(RAM_SIZE_2MB);
    mem.load_binary(&to_bytes(program), BASE).unwrap();
    let mut cpu = CpuState::new();
    cpu.pc = BASE;
    for &(reg, value) in init {
        cpu.gpr[reg as usize] = value;
    }
    for _ in 0..100_000 {
        if cpu.pc == HALT {
            break;
        }
        interpreter::step(&mut cpu, &mut mem).unwrap();
    }
    assert_eq!(cpu.pc, HALT, "reference run did not reach the halt address");
    cpu
}

fn recompiled_with(backend: BackendKind, program: &[u32], init: &[(u8, u32)]) -> System {
    let config = DynarecConfig { backend, ..DynarecConfig::default() };
    let mut system = System::new(config).unwrap();
    system.load_binary(&to_bytes(program), BASE).unwrap();
    system.cpu.pc = BASE;
    for &(reg, value) in init {
        system.cpu.gpr[reg as usize] = value;
    }
    let exit = system.run_until(HALT, 100_000).unwrap();
    assert_eq!(exit, RunExit::HaltPc(HALT));
    system
}

fn recompiled(program: &[u32], init: &[(u8, u32)]) -> System {
    recompiled_with(BackendKind::Interp, program, init)
}

fn assert_same(expected: &CpuState, actual: &CpuState) {
    assert_eq!(actual.gpr, expected.gpr, "gpr");
    assert_eq!(actual.hi, expected.hi, "hi");
    assert_eq!(actual.lo, expected.lo, "lo");
    assert_eq!(actual.pc, expected.pc, "pc");
    assert_eq!(actual.cycle, expected.cycle, "cycle");
}

fn check(program: &[u32], init: &[(u8, u32)]) -> System {
    let expected = reference(program, init);
    let system = recompiled(program, init);
    assert_same(&expected, &system.cpu);
    system
}

fn halt() -> [u32; 2] {
    [j(HALT), NOP]
}

#[test]
fn test_constant_folded_arithmetic() {
    let mut program = vec![
        lui(8, 0x1234),
        ori(8, 8, 0x5678),
        addiu(9, 8, -1),
        subu(10, 8, 9),
        sll(11, 8, 4),
        sra(12, 8, 8),
        slt(13, 12, 8),
        sltiu(14, 8, 0x7FFF),
        nor(15, 8, 0),
        mult(8, 9),
        mflo(16),
        mfhi(17),
        div(8, 0),
        mflo(18),
    ];
    program.extend(halt());
    let system = check(&program, &[]);
    assert_eq!(system.cpu.gpr[8], 0x1234_5678);
    assert_eq!(system.cpu.gpr[10], 1);
}

#[test]
fn test_unknown_values_use_host_registers() {
    let mut program = vec![
        addu(10, 4, 5),
        subu(11, 4, 5),
        and(12, 4, 6),
        or(13, 5, 6),
        xor(14, 4, 7),
        sllv(15, 4, 7),
        srav(16, 6, 7),
        srlv(17, 6, 7),
        multu(4, 6),
        mfhi(18),
        divu(6, 5),
        mflo(19),
        mthi(4),
        mfhi(20),
    ];
    program.extend(halt());
    check(&program, &[(4, 0xDEAD_BEEF), (5, 3), (6, 0x8000_0001), (7, 33)]);
}

#[test]
fn test_register_pressure_spills_dirty_values() {
    // Ten live values with only six host registers
    let mut program = Vec::new();
    for r in 1..=10u8 {
        program.push(addu(r, r, 20));
    }
    for r in 1..=10u8 {
        program.push(addu(21, 21, r));
    }
    program.extend(halt());
    let init: Vec<(u8, u32)> = (1..=10).map(|r| (r, r as u32 * 100)).chain([(20, 7), (21, 0)]).collect();
    let system = check(&program, &init);
    assert_eq!(system.cpu.gpr[21], 5500 + 70);
}

#[test]
fn test_counted_loop_with_memory() {
    // for i in 0..16 { data[i] = i * 3 } ; sum them back
    let program = [
        lui(4, (DATA >> 16) as u16),
        addiu(5, 0, 0),
        addiu(6, 0, 16),
        // fill:
        sll(7, 5, 2),
        addu(7, 7, 4),
        addu(8, 5, 5),
        addu(8, 8, 5),
        sw(8, 0, 7),
        addiu(5, 5, 1),
        bne(5, 6, branch_offset(BASE + 36, BASE + 12)),
        NOP,
        // sum:
        addiu(5, 0, 0),
        addiu(9, 0, 0),
        // sum_loop (BASE + 52):
        sll(7, 5, 2),
        addu(7, 7, 4),
        lw(8, 0, 7),
        addiu(5, 5, 1),
        addu(9, 9, 8),
        bne(5, 6, branch_offset(BASE + 72, BASE + 52)),
        NOP,
        j(HALT),
        NOP,
    ];
    let system = check(&program, &[]);
    assert_eq!(system.cpu.gpr[9], 3 * (0..16).sum::<u32>());
    assert_eq!(system.dynarec().stats().compiled, 5);
}

#[test]
fn test_load_delay_edges() {
    let program = [
        lui(4, (DATA >> 16) as u16),
        addiu(2, 0, 1),
        sw(4, 0, 4),
        addiu(3, 0, 0x55),
        sb(3, 5, 4),
        // use in the delay slot sees the old value
        lw(2, 0, 4),
        addu(10, 2, 0),
        addu(11, 2, 0),
        // overwritten in the delay slot
        lw(2, 0, 4),
        addiu(2, 0, 9),
        addu(12, 2, 0),
        // back to back into the same register
        lbu(3, 5, 4),
        lh(3, 0, 4),
        addu(13, 3, 0),
        addu(14, 3, 0),
        // load in a branch delay slot crosses into the next block
        jal(BASE + 0x100),
        lw(6, 0, 4),
    ];
    let mut image = program.to_vec();
    image.resize(0x40, NOP);
    // BASE + 0x100
    image.extend([addu(15, 6, 0), addu(16, 6, 0), j(HALT), NOP]);

    let system = check(&image, &[]);
    assert_eq!(system.cpu.gpr[10], 1);
    assert_eq!(system.cpu.gpr[11], DATA);
    assert_eq!(system.cpu.gpr[12], 9);
    assert_eq!(system.cpu.gpr[15], 0);
    assert_eq!(system.cpu.gpr[16], DATA);
}

#[test]
fn test_load_at_block_size_limit() {
    // 29 filler instructions, a load as the 30th, its consumer in the next block
    let mut program = vec![lui(4, (DATA >> 16) as u16), addiu(5, 0, 0x77), sw(5, 0, 4)];
    while program.len() < 29 {
        program.push(addiu(6, 6, 1));
    }
    program.push(lw(7, 0, 4));
    program.push(addu(8, 7, 0));
    program.push(addu(9, 7, 0));
    program.extend(halt());

    let system = check(&program, &[(7, 5)]);
    assert_eq!(system.cpu.gpr[8], 5);
    assert_eq!(system.cpu.gpr[9], 0x77);
}

#[test]
fn test_call_and_return() {
    let func = BASE + 0x80;
    let mut image = vec![
        addiu(4, 0, 6),
        jal(func),
        addiu(5, 0, 7),
        addu(10, 2, 0),
        jalr(9, 8),
        NOP,
        j(HALT),
        NOP,
    ];
    image.resize(0x20, NOP);
    // func: v0 = a0 * a1
    image.extend([mult(4, 5), mflo(2), jr(31), NOP]);
    image.resize(0x30, NOP);
    // BASE + 0xC0: link through $9
    image.extend([addiu(11, 0, 1), jr(9), NOP]);

    let system = check(&image, &[(8, BASE + 0xC0)]);
    assert_eq!(system.cpu.gpr[10], 42);
    assert_eq!(system.cpu.gpr[31], BASE + 12);
    assert_eq!(system.cpu.gpr[9], BASE + 24);
}

#[test]
fn test_linking_branch_not_taken() {
    let mut program = vec![addiu(4, 0, 1), bltzal(4, 8), NOP, addu(10, 31, 0), bgezal(0, 2), NOP, NOP, NOP];
    program.extend(halt());
    let system = check(&program, &[]);
    assert_eq!(system.cpu.gpr[10], BASE + 12);
}

#[test]
fn test_unknown_instructions_fall_back() {
    let mtc0 = 0x4080_6000; // mtc0 $0, $12
    let func = BASE + 0x40;
    let mut image = vec![
        addiu(4, 0, 1),
        mtc0,
        addiu(5, 4, 1),
        jal(func),
        NOP,
        addiu(6, 0, 3),
        j(HALT),
        NOP,
    ];
    image.resize(0x10, NOP);
    // branch whose delay slot has to be interpreted
    image.extend([jr(31), mtc0]);

    let system = check(&image, &[]);
    assert_eq!(system.cpu.gpr[5], 2);
    assert_eq!(system.cpu.gpr[6], 3);
    assert!(system.dynarec().stats().interpreted >= 2);
}

#[test]
fn test_self_modifying_code_is_recompiled() {
    let func = BASE + 0x100;
    let patch = addiu(2, 0, 77);
    let mut image = vec![
        jal(func),
        NOP,
        addu(10, 2, 0),
        lui(8, (patch >> 16) as u16),
        ori(8, 8, patch as u16),
        // store through the uncached mirror
        lui(9, 0xA001),
        ori(9, 9, 0x0100),
        sw(8, 0, 9),
        jal(func),
        NOP,
        j(HALT),
        NOP,
    ];
    image.resize(0x40, NOP);
    image.extend([addiu(2, 0, 11), jr(31), NOP]);

    let system = check(&image, &[]);
    assert_eq!(system.cpu.gpr[10], 11);
    assert_eq!(system.cpu.gpr[2], 77);
    assert!(system.dynarec().stats().invalidated >= 1);
}

#[test]
fn test_mirrors_share_compiled_blocks() {
    let mut system = System::new(DynarecConfig::default()).unwrap();
    system.load_binary(&to_bytes(&[addiu(2, 2, 1), jr(31), NOP]), BASE).unwrap();

    for entry in [BASE, BASE & 0x1FFF_FFFF, BASE | 0x2000_0000] {
        system.cpu.pc = entry;
        system.cpu.gpr[31] = HALT;
        system.run_until(HALT, 100).unwrap();
    }
    assert_eq!(system.cpu.gpr[2], 3);
    assert_eq!(system.dynarec().stats().compiled, 1);
}

#[test]
fn test_executing_unmapped_memory_is_fatal() {
    let mut system = System::new(DynarecConfig::default()).unwrap();
    system.cpu.pc = 0x1F80_0000;
    assert!(matches!(system.run(10), Err(DynarecError::InvalidPc(0x1F80_0000))));
}

#[test]
fn test_block_arrays_follow_ram_size() {
    let retail = System::new(DynarecConfig::default()).unwrap();
    let cache = retail.dynarec().cache().unwrap();
    assert_eq!(cache.ram_slot_count(), (RAM_SIZE_2MB / 4) as usize);
    assert_eq!(cache.bios_slot_count(), 0x2_0000);

    let dev = System::new(DynarecConfig { ram_expansion: true, ..DynarecConfig::default() }).unwrap();
    assert_eq!(dev.dynarec().cache().unwrap().ram_slot_count(), (RAM_SIZE_8MB / 4) as usize);
    assert!(dev.dynarec().is_pc_valid(0x8070_0000));
    assert!(!retail.dynarec().is_pc_valid(0x8070_0000));
}

#[cfg(all(feature = "jit-dynasm", target_arch = "x86_64"))]
#[test]
fn test_native_backend_matches_interpreter() {
    let mut program = vec![
        lui(4, (DATA >> 16) as u16),
        addiu(5, 0, 0x1234),
        sw(5, 0, 4),
        lw(6, 0, 4),
        addu(7, 6, 5),
        addu(8, 6, 5),
        mult(8, 5),
        mflo(9),
        sltu(10, 5, 8),
    ];
    program.extend(halt());
    let expected = reference(&program, &[(11, 3)]);
    let system = recompiled_with(BackendKind::Native, &program, &[(11, 3)]);
    assert_same(&expected, &system.cpu);
}

/// Random ALU and multiply/divide instructions over a small register set
fn arb_alu() -> impl Strategy<Value = u32> {
    let reg = 1u8..=12;
    prop_oneof![
        (reg.clone(), reg.clone(), any::<i16>()).prop_map(|(t, s, i)| addiu(t, s, i)),
        (reg.clone(), reg.clone(), any::<u16>()).prop_map(|(t, s, i)| ori(t, s, i)),
        (reg.clone(), reg.clone(), any::<i16>()).prop_map(|(t, s, i)| slti(t, s, i)),
        (reg.clone(), any::<u16>()).prop_map(|(t, i)| lui(t, i)),
        (reg.clone(), reg.clone(), reg.clone()).prop_map(|(d, s, t)| addu(d, s, t)),
        (reg.clone(), reg.clone(), reg.clone()).prop_map(|(d, s, t)| subu(d, s, t)),
        (reg.clone(), reg.clone(), reg.clone()).prop_map(|(d, s, t)| xor(d, s, t)),
        (reg.clone(), reg.clone(), reg.clone()).prop_map(|(d, s, t)| sltu(d, s, t)),
        (reg.clone(), reg.clone(), reg.clone()).prop_map(|(d, t, s)| srav(d, t, s)),
        (reg, 1u8..=12, 0u32..32).prop_map(|(d, t, sa)| sll(d, t, sa)),
    ]
}

/// Random HI/LO traffic and memory accesses relative to $20
fn arb_mem() -> impl Strategy<Value = u32> {
    let reg = 1u8..=12;
    let off = (0i16..16).prop_map(|w| w * 4);
    prop_oneof![
        (reg.clone(), reg.clone()).prop_map(|(s, t)| multu(s, t)),
        (reg.clone(), reg.clone()).prop_map(|(s, t)| div(s, t)),
        reg.clone().prop_map(mflo),
        reg.clone().prop_map(mfhi),
        (reg.clone(), off.clone()).prop_map(|(t, o)| lw(t, o, 20)),
        (reg.clone(), off.clone()).prop_map(|(t, o)| lb(t, o + 1, 20)),
        (reg.clone(), off.clone()).prop_map(|(t, o)| lhu(t, o + 2, 20)),
        (reg.clone(), off.clone()).prop_map(|(t, o)| sw(t, o, 20)),
        (reg, off).prop_map(|(t, o)| sh(t, o, 20)),
    ]
}

fn arb_instruction() -> impl Strategy<Value = u32> {
    prop_oneof![arb_alu(), arb_mem()]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_straight_line_matches_interpreter(
        body in prop::collection::vec(arb_instruction(), 1..70),
        seed in prop::array::uniform12(any::<u32>()),
    ) {
        let mut program = body;
        program.extend(halt());
        let init: Vec<(u8, u32)> = seed
            .iter()
            .enumerate()
            .map(|(i, &v)| (i as u8 + 1, v))
            .chain([(20, DATA)])
            .collect();

        let expected = reference(&program, &init);
        let system = recompiled(&program, &init);
        prop_assert_eq!(system.cpu.gpr, expected.gpr);
        prop_assert_eq!(system.cpu.hi, expected.hi);
        prop_assert_eq!(system.cpu.lo, expected.lo);
        prop_assert_eq!(system.cpu.cycle, expected.cycle);
    }
}
