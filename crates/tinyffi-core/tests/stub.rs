//! Tests for executable stubs
#![cfg(unix)]

use tinyffi_core::error::FfiError;
use tinyffi_core::module::PlatformModule;
use tinyffi_core::stub::{Stub, StubState};

fn platform() -> &'static dyn PlatformModule
{
    let platform = tinyffi_core::platform::native().expect("native platform");
    platform.initialize().unwrap();
    platform
}

#[test]
fn test_stub_lifecycle()
{
    let mut stub = Stub::allocate(platform(), 10).unwrap();
    assert_eq!(stub.state(), StubState::Writable);
    assert_eq!(stub.len(), 10);
    assert!(stub.region().size >= 10);
    assert!(matches!(stub.pc(), Err(FfiError::NotExecutable)));

    stub.write(0, &[0x90; 10]).unwrap();
    let pc = stub.lock().unwrap();
    assert_eq!(stub.state(), StubState::Executable(pc));
    assert_eq!(stub.pc().unwrap(), pc);

    stub.free().unwrap();
    assert_eq!(stub.state(), StubState::Freed);
}

#[test]
fn test_stub_write_bounds()
{
    let mut stub = Stub::allocate(platform(), 10).unwrap();

    stub.write(6, &[1, 2, 3, 4]).unwrap();
    assert!(matches!(
        stub.write(7, &[1, 2, 3, 4]),
        Err(FfiError::StubOutOfBounds {
            offset: 7,
            len: 4,
            capacity: 10,
        })
    ));
    assert!(matches!(stub.write(usize::MAX, &[1]), Err(FfiError::StubOutOfBounds { .. })));
    assert_eq!(&stub.bytes_mut().unwrap()[6..], &[1, 2, 3, 4]);
}

#[test]
fn test_stub_zero_size()
{
    assert!(matches!(Stub::allocate(platform(), 0), Err(FfiError::InvalidArgument(_))));
}

#[test]
fn test_stub_locked_is_read_only()
{
    let mut stub = Stub::with_code(platform(), &[0xC3]).unwrap();

    assert!(matches!(stub.lock(), Err(FfiError::AlreadyLocked)));
    assert!(matches!(stub.write(0, &[0x90]), Err(FfiError::AlreadyLocked)));
    assert!(matches!(stub.bytes_mut(), Err(FfiError::AlreadyLocked)));
}

#[test]
fn test_stub_double_free()
{
    let mut writable = Stub::allocate(platform(), 32).unwrap();
    writable.free().unwrap();
    assert!(matches!(writable.free(), Err(FfiError::DoubleFree("stub"))));
    assert!(matches!(writable.lock(), Err(FfiError::DoubleFree("stub"))));

    let mut executable = Stub::with_code(platform(), &[0xC3]).unwrap();
    executable.free().unwrap();
    assert!(matches!(executable.free(), Err(FfiError::DoubleFree("stub"))));
}
