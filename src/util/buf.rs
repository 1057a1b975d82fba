use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        return Err(anyhow::anyhow!(
            "string of length {} exceeds remaining buffer ({})",
            len,
            buf.remaining()
        ));
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Ok(String::from_utf8(raw)?)
}

pub fn put_bool(buf: &mut impl BufMut, value: bool) {
    buf.put_u8(if value { 1 } else { 0 });
}

pub fn try_get_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(anyhow::anyhow!("invalid value for a boolean: {}", b)),
    }
}
