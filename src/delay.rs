//! Busy-wait delays
//!
//! Reset pulses and settle times are expressed as loop counts. Drivers take a
//! `Delay` so the waits can be observed or skipped.

/// Something that can stall the caller for a number of iterations
pub trait Delay {
    fn spin(&mut self, iterations: u32);
}

/// Delay that burns CPU cycles
#[derive(Debug, Default, Clone, Copy)]
pub struct SpinDelay;

impl Delay for SpinDelay {
    fn spin(&mut self, iterations: u32) {
        for _ in 0..iterations {
            core::hint::spin_loop();
        }
    }
}

impl<D: Delay + ?Sized> Delay for &mut D {
    fn spin(&mut self, iterations: u32) {
        (**self).spin(iterations)
    }
}
