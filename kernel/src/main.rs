/*
Copyright © 2024 Mako and JayAndJef

This file is part of lumOS.

lumOS is free software: you can redistribute it and/or modify it under the terms of the GNU General
Public License as published by the Free Software Foundation, either version 3 of the License, or (at
your option) any later version.

lumOS is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the
implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public
License for more details.

You should have received a copy of the GNU General Public License along with lumOS. If not, see
<https://www.gnu.org/licenses/>.
*/

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use bootloader_api::{BootInfo, BootloaderConfig, config::Mapping, entry_point};

mod memory;
mod meta;
mod output;
mod serial;
#[cfg(feature = "self-test")]
mod testing;

/// The memory stack needs all physical memory mapped into the kernel's
/// address space. The stack must hold the self tests' largest by-value
/// objects.
pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config.kernel_stack_size = 4 * 1024 * 1024;
    config
};

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    info!("lumOS {} booting", meta::VERSION);

    memory::init(boot_info);
    // Stand-in for scheduler bringup: with one core running, the page
    // caches can go live as soon as the PMM exists.
    memory::pmm::set_cache_live();

    meta::print_welcome();

    #[cfg(feature = "self-test")]
    memory::tests::main();
    #[cfg(not(feature = "self-test"))]
    hcf();
}

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

/// Halts the CPU forever.
pub fn hcf() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("\nKERNEL PANIC: {}", info);
    #[cfg(feature = "self-test")]
    testing::exit_qemu(testing::QemuExitCode::Failed);
    hcf();
}
