use std::ops::{Add, Div, Sub};

pub trait Number:
    Add<Output = Self> + Sub<Output = Self> + Div<Output = Self> + PartialEq + Copy
{
    fn one() -> Self;
}

impl Number for u64 {
    fn one() -> Self {
        1
    }
}

impl Number for usize {
    fn one() -> Self {
        1
    }
}

pub fn ceil_dev<T: Number>(a: T, b: T) -> T {
    (a + b - T::one()) / b
}

/// Round `size` up to the next multiple of 8 bytes. Everything stored on
/// a page (headers, block payloads) is laid out in little-endian u64
/// words, so sizes have to be word aligned.
pub fn align_to_word(size: usize) -> usize {
    ceil_dev(size, 8) * 8
}
