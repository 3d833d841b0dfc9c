//! Encoded polyline format for bus tracks.
//!
//! Points are rounded to `precision` decimal places, and each one is stored
//! as the (latitude, longitude) delta from its predecessor. Every delta is a
//! zig-zag encoded integer written in 5-bit chunks offset into printable
//! ASCII, with bit 0x20 marking "more chunks follow".

use geo::Point;

use crate::models::types::{DispatchError, Result};

/// Precision used by common map renderers (about one meter)
pub const DEFAULT_PRECISION: u32 = 5;

pub fn encode(points: &[Point], precision: u32) -> String {
    let factor = 10f64.powi(precision as i32);
    let mut output = String::new();
    let (mut last_lat, mut last_lon) = (0i64, 0i64);

    for point in points {
        let lat = (point.y() * factor).round() as i64;
        let lon = (point.x() * factor).round() as i64;
        encode_value(lat - last_lat, &mut output);
        encode_value(lon - last_lon, &mut output);
        last_lat = lat;
        last_lon = lon;
    }
    output
}

pub fn decode(encoded: &str, precision: u32) -> Result<Vec<Point>> {
    let factor = 10f64.powi(precision as i32);
    let mut bytes = encoded.bytes();
    let mut points = Vec::new();
    let (mut lat, mut lon) = (0i64, 0i64);

    while let Some(d_lat) = decode_value(&mut bytes)? {
        let d_lon = decode_value(&mut bytes)?.ok_or_else(|| {
            DispatchError::InvalidData("polyline ends between latitude and longitude".into())
        })?;
        lat += d_lat;
        lon += d_lon;
        points.push(Point::new(lon as f64 / factor, lat as f64 / factor));
    }
    Ok(points)
}

fn encode_value(value: i64, output: &mut String) {
    let shifted = value << 1;
    let mut rest = (if value < 0 { !shifted } else { shifted }) as u64;
    while rest >= 0x20 {
        output.push((((0x20 | (rest & 0x1f)) + 63) as u8) as char);
        rest >>= 5;
    }
    output.push(((rest + 63) as u8) as char);
}

/// Next value, `None` at a clean end of input
fn decode_value(bytes: &mut impl Iterator<Item = u8>) -> Result<Option<i64>> {
    let mut result: u64 = 0;
    let mut shift = 0u32;

    loop {
        let Some(byte) = bytes.next() else {
            if shift == 0 {
                return Ok(None);
            }
            return Err(DispatchError::InvalidData("polyline ends mid-value".into()));
        };
        if !(63..=126).contains(&byte) || shift > 60 {
            return Err(DispatchError::InvalidData(format!(
                "invalid polyline byte 0x{:02x}",
                byte
            )));
        }

        let chunk = (byte - 63) as u64;
        result |= (chunk & 0x1f) << shift;
        shift += 5;
        if chunk < 0x20 {
            break;
        }
    }

    let value = if result & 1 == 1 {
        (!(result >> 1)) as i64
    } else {
        (result >> 1) as i64
    };
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_reference_vector() {
        // Reference example from the format's documentation
        let points = vec![
            Point::new(-120.2, 38.5),
            Point::new(-120.95, 40.7),
            Point::new(-126.453, 43.252),
        ];
        assert_eq!(encode(&points, DEFAULT_PRECISION), "_p~iF~ps|U_ulLnnqC_mqNvxq`@");
    }

    #[test]
    fn test_decode_reference_vector() {
        let points = decode("_p~iF~ps|U_ulLnnqC_mqNvxq`@", DEFAULT_PRECISION).unwrap();
        assert_eq!(points.len(), 3);
        assert_abs_diff_eq!(points[2].x(), -126.453, epsilon = 1e-9);
        assert_abs_diff_eq!(points[2].y(), 43.252, epsilon = 1e-9);
    }

    #[test]
    fn test_empty() {
        assert_eq!(encode(&[], DEFAULT_PRECISION), "");
        assert!(decode("", DEFAULT_PRECISION).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_input() {
        // Drop the final longitude
        assert!(decode("_p~iF", DEFAULT_PRECISION).is_err());
        // Continuation bit set on the last byte
        assert!(decode("_p~i", DEFAULT_PRECISION).is_err());
        assert!(decode("_p~iF ", DEFAULT_PRECISION).is_err());
    }
}
