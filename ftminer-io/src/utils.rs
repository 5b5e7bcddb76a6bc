use std::fmt::Display;

pub struct Hex<T>(pub T);
impl Display for Hex<u8> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}
impl Display for Hex<u16> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}
impl Display for Hex<u32> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

const MAX_DISPLAY: usize = 16;

pub struct SpaceHex<'a>(pub &'a [u8]);
impl Display for SpaceHex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for e in self.0.iter().take(MAX_DISPLAY) {
            write!(f, "{:02X} ", e)?;
        }
        if self.0.len() > MAX_DISPLAY {
            write!(f, "...")?;
        }
        Ok(())
    }
}

/// Renders a bit vector in shift order, first bit on the left.
pub struct BitStr<'a>(pub &'a [bool]);
impl Display for BitStr<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use std::fmt::Write as _;
        for bit in self.0.iter().take(MAX_DISPLAY * 8) {
            f.write_char(if *bit { '1' } else { '0' })?;
        }
        if self.0.len() > MAX_DISPLAY * 8 {
            write!(f, "...")?;
        }
        Ok(())
    }
}

/// Packs bits into an integer, first bit in the least significant position.
pub fn bits_to_u64(bits: &[bool]) -> u64 {
    bits.iter()
        .take(64)
        .enumerate()
        .fold(0, |acc, (i, bit)| acc | (u64::from(*bit) << i))
}

/// Expands the low `len` bits of `value`, least significant first.
pub fn u64_to_bits(value: u64, len: usize) -> Vec<bool> {
    (0..len).map(|i| i < 64 && (value >> i) & 1 == 1).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_order() {
        let bits = u64_to_bits(0b1101, 6);
        assert_eq!(bits, [true, false, true, true, false, false]);
        assert_eq!(bits_to_u64(&bits), 0b1101);
        assert_eq!(BitStr(&bits).to_string(), "101100");
    }

    #[test]
    fn hex_widths() {
        assert_eq!(Hex(0x0Au8).to_string(), "0A");
        assert_eq!(Hex(0x0403D093u32).to_string(), "0403D093");
        assert_eq!(SpaceHex(&[1, 2]).to_string(), "01 02 ");
    }
}
