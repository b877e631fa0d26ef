//! Linux `_IOC` request-number encoding, evaluated at compile time.

const NR_BITS: u32 = 8;
const TYPE_BITS: u32 = 8;
const SIZE_BITS: u32 = 14;

const TYPE_SHIFT: u32 = NR_BITS;
const SIZE_SHIFT: u32 = TYPE_SHIFT + TYPE_BITS;
const DIR_SHIFT: u32 = SIZE_SHIFT + SIZE_BITS;

const DIR_WRITE: u32 = 1;
const DIR_READ: u32 = 2;

/// Packs direction, ioctl type, number and argument size.
///
/// An argument struct that does not fit the 14-bit size field is rejected
/// while the constant is evaluated.
#[must_use]
pub const fn ioc(dir: u32, ty: u32, nr: u32, size: usize) -> u32 {
    assert!(size < 1 << SIZE_BITS, "ioctl argument struct too large");
    #[allow(clippy::cast_possible_truncation)]
    let size = size as u32;
    (dir << DIR_SHIFT) | (ty << TYPE_SHIFT) | nr | (size << SIZE_SHIFT)
}

/// The kernel writes `T` back.
#[must_use]
pub const fn ior<T>(ty: u32, nr: u32) -> u32 {
    ioc(DIR_READ, ty, nr, size_of::<T>())
}

/// The kernel only reads `T`.
#[must_use]
pub const fn iow<T>(ty: u32, nr: u32) -> u32 {
    ioc(DIR_WRITE, ty, nr, size_of::<T>())
}

#[must_use]
pub const fn iowr<T>(ty: u32, nr: u32) -> u32 {
    ioc(DIR_READ | DIR_WRITE, ty, nr, size_of::<T>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_land_in_their_bit_ranges() {
        let req = iowr::<[u8; 0x28]>(0x4b, 0x16);
        assert_eq!(req >> DIR_SHIFT, DIR_READ | DIR_WRITE);
        assert_eq!((req >> SIZE_SHIFT) & ((1 << SIZE_BITS) - 1), 0x28);
        assert_eq!((req >> TYPE_SHIFT) & 0xff, 0x4b);
        assert_eq!(req & 0xff, 0x16);
    }
}
