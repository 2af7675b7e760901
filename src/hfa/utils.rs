//! Low-level byte access utilities.
//!
//! HFA containers store every multi-byte value in little-endian ("Intel")
//! order regardless of host. These helpers are the "standardization"
//! primitive used by the whole engine: every read checks bounds before
//! touching the window, so a truncated or corrupt container surfaces as a
//! [`HfaError::Bounds`] instead of an out-of-bounds access.

use byteorder::{ByteOrder, LittleEndian};

use super::error::{HfaError, Result};

/// Returns `&data[off..off + len]`, or a bounds error naming `context`.
pub fn window<'a>(data: &'a [u8], off: usize, len: usize, context: &'static str) -> Result<&'a [u8]> {
    off.checked_add(len)
        .and_then(|end| data.get(off..end))
        .ok_or(HfaError::Bounds {
            context,
            needed: off.saturating_add(len),
            available: data.len(),
        })
}

/// Mutable variant of [`window`].
pub fn window_mut<'a>(
    data: &'a mut [u8],
    off: usize,
    len: usize,
    context: &'static str,
) -> Result<&'a mut [u8]> {
    let available = data.len();
    off.checked_add(len)
        .and_then(|end| data.get_mut(off..end))
        .ok_or(HfaError::Bounds {
            context,
            needed: off.saturating_add(len),
            available,
        })
}

pub fn read_u8(data: &[u8], off: usize) -> Result<u8> {
    Ok(window(data, off, 1, "u8")?[0])
}

pub fn read_u16(data: &[u8], off: usize) -> Result<u16> {
    Ok(LittleEndian::read_u16(window(data, off, 2, "u16")?))
}

pub fn read_i16(data: &[u8], off: usize) -> Result<i16> {
    Ok(LittleEndian::read_i16(window(data, off, 2, "i16")?))
}

pub fn read_u32(data: &[u8], off: usize) -> Result<u32> {
    Ok(LittleEndian::read_u32(window(data, off, 4, "u32")?))
}

pub fn read_i32(data: &[u8], off: usize) -> Result<i32> {
    Ok(LittleEndian::read_i32(window(data, off, 4, "i32")?))
}

pub fn read_f32(data: &[u8], off: usize) -> Result<f32> {
    Ok(LittleEndian::read_f32(window(data, off, 4, "f32")?))
}

pub fn read_f64(data: &[u8], off: usize) -> Result<f64> {
    Ok(LittleEndian::read_f64(window(data, off, 8, "f64")?))
}

pub fn write_u8(data: &mut [u8], off: usize, value: u8) -> Result<()> {
    window_mut(data, off, 1, "u8")?[0] = value;
    Ok(())
}

pub fn write_u16(data: &mut [u8], off: usize, value: u16) -> Result<()> {
    LittleEndian::write_u16(window_mut(data, off, 2, "u16")?, value);
    Ok(())
}

pub fn write_i16(data: &mut [u8], off: usize, value: i16) -> Result<()> {
    LittleEndian::write_i16(window_mut(data, off, 2, "i16")?, value);
    Ok(())
}

pub fn write_u32(data: &mut [u8], off: usize, value: u32) -> Result<()> {
    LittleEndian::write_u32(window_mut(data, off, 4, "u32")?, value);
    Ok(())
}

pub fn write_i32(data: &mut [u8], off: usize, value: i32) -> Result<()> {
    LittleEndian::write_i32(window_mut(data, off, 4, "i32")?, value);
    Ok(())
}

pub fn write_f32(data: &mut [u8], off: usize, value: f32) -> Result<()> {
    LittleEndian::write_f32(window_mut(data, off, 4, "f32")?, value);
    Ok(())
}

pub fn write_f64(data: &mut [u8], off: usize, value: f64) -> Result<()> {
    LittleEndian::write_f64(window_mut(data, off, 8, "f64")?, value);
    Ok(())
}

/// Saturating conversion from double to a 32-bit integer.
///
/// Out-of-range values clamp to `i32::MIN`/`i32::MAX` rather than wrapping;
/// a non-finite input is rejected as out of range.
pub fn double_to_int(value: f64) -> Result<i32> {
    if !value.is_finite() {
        return Err(HfaError::OutOfRange(format!(
            "non-finite value {} cannot convert to integer",
            value
        )));
    }
    if value >= i32::MAX as f64 {
        Ok(i32::MAX)
    } else if value <= i32::MIN as f64 {
        Ok(i32::MIN)
    } else {
        Ok(value as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_checked_reads() {
        let data = [0x01u8, 0x02, 0x03];
        assert_eq!(read_u16(&data, 0).unwrap(), 0x0201);
        assert_eq!(read_u16(&data, 1).unwrap(), 0x0302);
        assert!(read_u32(&data, 0).is_err());
        assert!(read_u16(&data, 2).is_err());
    }

    #[test]
    fn little_endian_round_trip() {
        let mut data = [0u8; 8];
        write_u32(&mut data, 0, 0xDEADBEEF).unwrap();
        assert_eq!(data[0], 0xEF);
        assert_eq!(read_u32(&data, 0).unwrap(), 0xDEADBEEF);
        write_f64(&mut data, 0, -2.5).unwrap();
        assert_eq!(read_f64(&data, 0).unwrap(), -2.5);
    }

    #[test]
    fn double_to_int_saturates() {
        assert_eq!(double_to_int(1e12).unwrap(), i32::MAX);
        assert_eq!(double_to_int(-1e12).unwrap(), i32::MIN);
        assert_eq!(double_to_int(42.9).unwrap(), 42);
        assert!(double_to_int(f64::NAN).is_err());
        assert!(double_to_int(f64::INFINITY).is_err());
    }
}
