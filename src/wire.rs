// ===============================
// src/wire.rs
// ===============================
//
// Token codec for the broker gateway socket.
//
// Frame   : [u32 BE length][payload]
// Payload : ASCII tokens, each terminated by \0
//
// Empty token = unset. "Infinity" = +inf for floats. Sentinels (i32::MAX,
// f64::MAX) only exist on the outbound side and are written as empty.
//
use rust_decimal::Decimal;

use crate::error::{VenueError, VenueResult};

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
pub const MIN_CLIENT_VERSION: u32 = 100;
pub const MAX_CLIENT_VERSION: u32 = 176;

pub const UNSET_INT: i32 = i32::MAX;
pub const UNSET_DOUBLE: f64 = f64::MAX;

#[derive(Debug, Default, Clone)]
pub struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_str(&mut self, s: &str) -> &mut Self {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        self
    }

    pub fn push_int(&mut self, v: i64) -> &mut Self {
        if v == UNSET_INT as i64 {
            return self.push_str("");
        }
        self.push_str(&v.to_string())
    }

    pub fn push_opt_int(&mut self, v: Option<i64>) -> &mut Self {
        match v {
            Some(v) => self.push_int(v),
            None => self.push_str(""),
        }
    }

    pub fn push_f64(&mut self, v: f64) -> &mut Self {
        if v == UNSET_DOUBLE || v.is_nan() {
            return self.push_str("");
        }
        if v.is_infinite() && v > 0.0 {
            return self.push_str("Infinity");
        }
        self.push_str(&v.to_string())
    }

    pub fn push_opt_f64(&mut self, v: Option<f64>) -> &mut Self {
        match v {
            Some(v) => self.push_f64(v),
            None => self.push_str(""),
        }
    }

    pub fn push_bool(&mut self, v: bool) -> &mut Self {
        self.push_str(if v { "1" } else { "0" })
    }

    pub fn push_decimal(&mut self, v: Decimal) -> &mut Self {
        self.push_str(&v.normalize().to_string())
    }

    pub fn push_opt_decimal(&mut self, v: Option<Decimal>) -> &mut Self {
        match v {
            Some(v) => self.push_decimal(v),
            None => self.push_str(""),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf
    }

    /// Length-prefixed frame ready for the socket.
    pub fn finish(&self) -> VenueResult<Vec<u8>> {
        frame(&self.buf)
    }
}

pub fn frame(payload: &[u8]) -> VenueResult<Vec<u8>> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(VenueError::ProtocolFatal(format!("outbound frame too large: {}", payload.len())));
    }
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Initial bytes after connect: `API\0` then a framed version range.
pub fn handshake_prefix(caps: Option<&str>) -> VenueResult<Vec<u8>> {
    let mut version = format!("v{MIN_CLIENT_VERSION}..{MAX_CLIENT_VERSION}");
    if let Some(c) = caps.filter(|c| !c.is_empty()) {
        version.push(' ');
        version.push_str(c);
    }
    let mut out = b"API\0".to_vec();
    out.extend(frame(version.as_bytes())?);
    Ok(out)
}

pub fn split_fields(payload: &[u8]) -> Vec<String> {
    let mut fields: Vec<String> = payload
        .split(|b| *b == 0)
        .map(|t| String::from_utf8_lossy(t).into_owned())
        .collect();
    // trailing terminator leaves one empty tail
    if payload.last() == Some(&0) {
        fields.pop();
    }
    fields
}

/// Take one complete frame off the front of `buf`, if there is one.
pub fn take_frame(buf: &mut Vec<u8>) -> VenueResult<Option<Vec<u8>>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(VenueError::ProtocolFatal(format!("inbound frame too large: {len}")));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let payload = buf[4..4 + len].to_vec();
    buf.drain(..4 + len);
    Ok(Some(payload))
}

#[derive(Debug, Clone)]
pub struct FieldReader {
    fields: Vec<String>,
    pos: usize,
}

impl FieldReader {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields, pos: 0 }
    }

    pub fn from_payload(payload: &[u8]) -> Self {
        Self::new(split_fields(payload))
    }

    pub fn remaining(&self) -> usize {
        self.fields.len().saturating_sub(self.pos)
    }

    pub fn next_str(&mut self) -> VenueResult<String> {
        let f = self
            .fields
            .get(self.pos)
            .cloned()
            .ok_or_else(|| VenueError::Decode(format!("missing field #{}", self.pos)))?;
        self.pos += 1;
        Ok(f)
    }

    pub fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    pub fn next_opt_int(&mut self) -> VenueResult<Option<i64>> {
        let s = self.next_str()?;
        let t = s.trim();
        if t.is_empty() {
            return Ok(None);
        }
        let v: i64 = t.parse().map_err(|_| VenueError::Decode(format!("bad int '{t}'")))?;
        if v == UNSET_INT as i64 {
            return Ok(None);
        }
        Ok(Some(v))
    }

    pub fn next_int(&mut self) -> VenueResult<i64> {
        Ok(self.next_opt_int()?.unwrap_or(0))
    }

    pub fn next_opt_f64(&mut self) -> VenueResult<Option<f64>> {
        let s = self.next_str()?;
        let t = s.trim();
        if t.is_empty() {
            return Ok(None);
        }
        if t == "Infinity" {
            return Ok(Some(f64::INFINITY));
        }
        let v: f64 = t.parse().map_err(|_| VenueError::Decode(format!("bad float '{t}'")))?;
        if v == UNSET_DOUBLE {
            return Ok(None);
        }
        Ok(Some(v))
    }

    pub fn next_f64(&mut self) -> VenueResult<f64> {
        Ok(self.next_opt_f64()?.unwrap_or(0.0))
    }

    pub fn next_bool(&mut self) -> VenueResult<bool> {
        Ok(self.next_int()? != 0)
    }

    pub fn next_opt_decimal(&mut self) -> VenueResult<Option<Decimal>> {
        let s = self.next_str()?;
        let t = s.trim();
        if t.is_empty() || t == "Infinity" {
            return Ok(None);
        }
        let v: Decimal = t
            .parse()
            .or_else(|_| Decimal::from_scientific(t))
            .map_err(|_| VenueError::Decode(format!("bad decimal '{t}'")))?;
        if v == Decimal::from(UNSET_INT) {
            return Ok(None);
        }
        Ok(Some(v))
    }

    pub fn next_decimal(&mut self) -> VenueResult<Decimal> {
        Ok(self.next_opt_decimal()?.unwrap_or(Decimal::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn sentinels_are_written_empty() {
        let mut w = FieldWriter::new();
        w.push_int(7)
            .push_int(UNSET_INT as i64)
            .push_f64(UNSET_DOUBLE)
            .push_f64(f64::INFINITY)
            .push_opt_f64(None)
            .push_decimal(dec!(20000.50));
        assert_eq!(w.payload(), b"7\0\0\0Infinity\0\020000.5\0");
    }

    #[test]
    fn reader_decodes_unset_and_infinity() {
        let mut r = FieldReader::from_payload(b"\0Infinity\02147483647\01.5\0abc\0");
        assert_eq!(r.next_opt_f64().unwrap(), None);
        assert_eq!(r.next_opt_f64().unwrap(), Some(f64::INFINITY));
        assert_eq!(r.next_opt_int().unwrap(), None);
        assert_eq!(r.next_decimal().unwrap(), dec!(1.5));
        assert_eq!(r.next_str().unwrap(), "abc");
        assert!(r.next_str().is_err());
    }

    #[test]
    fn frames_split_across_reads() {
        let mut w = FieldWriter::new();
        w.push_str("9").push_str("1").push_str("42");
        let bytes = w.finish().unwrap();
        let mut buf = bytes[..5].to_vec();
        assert_eq!(take_frame(&mut buf).unwrap(), None);
        buf.extend_from_slice(&bytes[5..]);
        let payload = take_frame(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(split_fields(&payload), vec!["9", "1", "42"]);
    }

    #[test]
    fn oversize_frame_is_fatal() {
        let mut buf = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        assert!(matches!(take_frame(&mut buf), Err(VenueError::ProtocolFatal(_))));
    }

    #[test]
    fn handshake_layout() {
        let h = handshake_prefix(None).unwrap();
        assert_eq!(&h[..4], b"API\0");
        assert_eq!(&h[4..8], &9u32.to_be_bytes());
        assert_eq!(&h[8..], b"v100..176");
        let h = handshake_prefix(Some("+PACEAPI")).unwrap();
        assert!(h.ends_with(b"v100..176 +PACEAPI"));
    }
}
