use crate::serial_println;

const WELCOME: &str = r"
 _                  ___  ____
| |_   _ _ __ ___  / _ \/ ___|
| | | | | '_ ` _ \| | | \___ \
| | |_| | | | | | | |_| |___) |
|_|\__,_|_| |_| |_|\___/|____/
";

pub const VERSION: &str = "v0.1.0";

/// Prints the welcome message to the serial console.
pub fn print_welcome() {
    serial_println!("{}", WELCOME);
    serial_println!("welcome to lumOS {}", VERSION);
}
