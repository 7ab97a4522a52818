//! Serial port (COM1 UART 16550) driver, polled.

use core::fmt;

use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::irq;

/// COM1 base port address
const COM1_PORT: u16 = 0x3F8;

/// Line status register: transmit holding register empty.
const LSR_THRE: u8 = 0x20;

/// Serial port driver for COM1
pub struct Serial {
    initialized: bool,
}

impl Serial {
    const fn new() -> Self {
        Self { initialized: false }
    }

    fn out(offset: u16, value: u8) {
        let mut port = Port::<u8>::new(COM1_PORT + offset);
        // SAFETY: COM1 registers; writes have no memory side effects.
        unsafe { port.write(value) }
    }

    fn inp(offset: u16) -> u8 {
        let mut port = Port::<u8>::new(COM1_PORT + offset);
        // SAFETY: as above.
        unsafe { port.read() }
    }

    /// Programs the UART for 115200 baud, 8N1, FIFO on, IRQs off.
    pub fn init(&mut self) {
        if self.initialized {
            return;
        }
        Self::out(1, 0x00); // IER: no interrupts
        Self::out(3, 0x80); // LCR: DLAB on
        Self::out(0, 0x01); // divisor low (115200)
        Self::out(1, 0x00); // divisor high
        Self::out(3, 0x03); // 8N1, DLAB off
        Self::out(2, 0xC7); // FIFO on, cleared, 14-byte threshold
        Self::out(4, 0x0B); // DTR | RTS | OUT2
        self.initialized = true;
    }

    /// Write a byte, busy-waiting for the transmit register.
    pub fn write_byte(&self, byte: u8) {
        if !self.initialized {
            return;
        }
        while Self::inp(5) & LSR_THRE == 0 {
            core::hint::spin_loop();
        }
        Self::out(0, byte);
    }
}

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

/// Global serial port instance (COM1)
static SERIAL: Mutex<Serial> = Mutex::new(Serial::new());

/// Initialize the global serial port
pub fn init() {
    let flags = irq::save_and_disable();
    SERIAL.lock().init();
    irq::restore(flags);
}

/// Write formatted arguments to the serial port.
///
/// Interrupts are off while the port lock is held so a handler that logs
/// cannot spin on a lock its own core holds.
pub fn write_fmt(args: fmt::Arguments<'_>) {
    use fmt::Write;
    let flags = irq::save_and_disable();
    let _ = SERIAL.lock().write_fmt(args);
    irq::restore(flags);
}
