use psx_dynarec::cpu::asm::*;
use psx_dynarec::snapshot::{Snapshot, SnapshotError};
use psx_dynarec::{DynarecConfig, RunExit, System};

const BASE: u32 = 0x8001_0000;

/// Counts $2 up by one per loop iteration
fn counting_system() -> System {
    let mut system = System::new(DynarecConfig::default()).unwrap();
    let program = [addiu(2, 2, 1), j(BASE), NOP];
    system.load_binary(&to_bytes(&program), BASE).unwrap();
    system.cpu.pc = BASE;
    system
}

#[test]
fn test_file_round_trip_resumes_execution() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.bin");

    let mut system = counting_system();
    assert_eq!(system.run(30).unwrap(), RunExit::CycleBudget);
    system.save_state().save(&path).unwrap();
    assert_eq!(system.run(30).unwrap(), RunExit::CycleBudget);
    let uninterrupted = system.cpu.clone();

    let mut resumed = System::new(DynarecConfig::default()).unwrap();
    resumed.load_state(&Snapshot::load(&path).unwrap()).unwrap();
    assert_eq!(resumed.cpu.gpr[2], 10);
    assert!(resumed.dynarec().cache().unwrap().is_empty());
    resumed.run(30).unwrap();

    assert_eq!(resumed.cpu, uninterrupted);
    assert_eq!(resumed.cpu.gpr[2], 20);
}

#[test]
fn test_restore_into_other_ram_size_fails() {
    let system = counting_system();
    let snapshot = system.save_state();

    let mut expanded = System::new(DynarecConfig { ram_expansion: true, ..DynarecConfig::default() }).unwrap();
    assert!(matches!(expanded.load_state(&snapshot), Err(SnapshotError::RamSize { .. })));
}

#[test]
fn test_truncated_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.bin");

    let bytes = counting_system().save_state().to_bytes().unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
    assert!(matches!(Snapshot::load(&path), Err(SnapshotError::Decode(_))));
}
