//! Test framework for lumOS.
//!
//! Tests are plain functions run in order by [`run`] when the kernel is
//! built with the `self-test` feature. Results go over serial and the
//! kernel leaves QEMU through the debug exit device.

use crate::{serial_print, serial_println};

/// QEMU exit codes for test results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Exit QEMU with the given exit code
pub fn exit_qemu(exit_code: QemuExitCode) {
    use x86_64::instructions::port::Port;

    unsafe {
        let mut port = Port::new(0xf4);
        port.write(exit_code as u32);
    }
}

/// Trait for items that can be tested
pub trait Testable {
    /// Run the test
    fn run(&self);
    /// Get the test name
    fn name(&self) -> &'static str;
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        serial_print!("{}...\t", self.name());
        self();
        serial_println!("[ok]");
    }

    fn name(&self) -> &'static str {
        core::any::type_name::<T>()
    }
}

/// Runs every test, then exits QEMU with success. A failing test panics,
/// and the panic handler exits with failure instead.
pub fn run(tests: &[&dyn Testable]) -> ! {
    serial_println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    serial_println!("All tests passed");

    exit_qemu(QemuExitCode::Success);
    crate::hcf();
}
