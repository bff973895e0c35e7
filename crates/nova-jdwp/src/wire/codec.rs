use super::types::{
    JdwpError, JdwpIdSizes, JdwpValue, Location, ObjectId, ReferenceTypeId, Result,
};

pub const HANDSHAKE: &[u8] = b"JDWP-Handshake";
pub const HEADER_LEN: usize = crate::JDWP_HEADER_LEN;
pub const FLAG_REPLY: u8 = 0x80;

pub fn signature_to_tag(signature: &str) -> u8 {
    match signature.as_bytes().first().copied() {
        Some(b'L') if signature == "Ljava/lang/String;" => b's',
        Some(tag) => tag,
        None => b'V',
    }
}

/// Convert a Java binary class name (`com.example.Foo`) into a JNI signature
/// (`Lcom/example/Foo;`). Array names (`[I`) and existing signatures pass through.
pub fn class_name_to_signature(class: &str) -> String {
    if class.starts_with('[') || (class.starts_with('L') && class.ends_with(';')) {
        return class.to_string();
    }
    let internal = class.replace('.', "/");
    format!("L{internal};")
}

#[derive(Default)]
pub struct JdwpWriter {
    buf: Vec<u8>,
}

impl JdwpWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_string(&mut self, s: &str) {
        // Length prefix counts bytes, not chars.
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_id(&mut self, id: u64, size: usize) {
        let be = id.to_be_bytes();
        self.buf.extend_from_slice(&be[8 - size.min(8)..]);
    }

    pub fn write_object_id(&mut self, id: ObjectId, sizes: &JdwpIdSizes) {
        self.write_id(id, sizes.object_id);
    }

    pub fn write_reference_type_id(&mut self, id: ReferenceTypeId, sizes: &JdwpIdSizes) {
        self.write_id(id, sizes.reference_type_id);
    }

    pub fn write_location(&mut self, loc: &Location, sizes: &JdwpIdSizes) {
        self.write_u8(loc.type_tag);
        self.write_reference_type_id(loc.class_id, sizes);
        self.write_id(loc.method_id, sizes.method_id);
        self.write_u64(loc.index);
    }

    /// Untagged value, as used by `ArrayReference.SetValues`.
    pub fn write_value(&mut self, v: &JdwpValue, sizes: &JdwpIdSizes) {
        match *v {
            JdwpValue::Boolean(v) => self.write_bool(v),
            JdwpValue::Byte(v) => self.write_u8(v as u8),
            JdwpValue::Char(v) => self.write_u16(v),
            JdwpValue::Short(v) => self.write_u16(v as u16),
            JdwpValue::Int(v) => self.write_i32(v),
            JdwpValue::Long(v) => self.write_i64(v),
            JdwpValue::Float(v) => self.write_u32(v.to_bits()),
            JdwpValue::Double(v) => self.write_u64(v.to_bits()),
            JdwpValue::Object { id, .. } => self.write_object_id(id, sizes),
            JdwpValue::Void => {}
        }
    }

    pub fn write_tagged_value(&mut self, v: &JdwpValue, sizes: &JdwpIdSizes) {
        self.write_u8(v.tag());
        self.write_value(v, sizes);
    }
}

pub struct JdwpReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> JdwpReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                JdwpError::Protocol(format!(
                    "buffer underflow: need {n} bytes at {}, have {}",
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| JdwpError::Protocol(format!("invalid utf-8 string: {e}")))
    }

    pub fn read_id(&mut self, size: usize) -> Result<u64> {
        if size == 0 || size > 8 {
            return Err(JdwpError::Protocol(format!("invalid id size: {size}")));
        }
        let mut be = [0u8; 8];
        be[8 - size..].copy_from_slice(self.take(size)?);
        Ok(u64::from_be_bytes(be))
    }

    pub fn read_object_id(&mut self, sizes: &JdwpIdSizes) -> Result<ObjectId> {
        self.read_id(sizes.object_id)
    }

    pub fn read_tagged_object_id(&mut self, sizes: &JdwpIdSizes) -> Result<(u8, ObjectId)> {
        let tag = self.read_u8()?;
        let id = self.read_object_id(sizes)?;
        Ok((tag, id))
    }

    pub fn read_reference_type_id(&mut self, sizes: &JdwpIdSizes) -> Result<ReferenceTypeId> {
        self.read_id(sizes.reference_type_id)
    }

    pub fn read_location(&mut self, sizes: &JdwpIdSizes) -> Result<Location> {
        Ok(Location {
            type_tag: self.read_u8()?,
            class_id: self.read_reference_type_id(sizes)?,
            method_id: self.read_id(sizes.method_id)?,
            index: self.read_u64()?,
        })
    }

    /// Location that may be all zeroes (e.g. an uncaught exception's catch site).
    pub fn read_optional_location(&mut self, sizes: &JdwpIdSizes) -> Result<Option<Location>> {
        let loc = self.read_location(sizes)?;
        if loc.type_tag == 0 && loc.class_id == 0 && loc.method_id == 0 && loc.index == 0 {
            Ok(None)
        } else {
            Ok(Some(loc))
        }
    }

    pub fn read_value(&mut self, tag: u8, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        let v = match tag {
            b'Z' => JdwpValue::Boolean(self.read_bool()?),
            b'B' => JdwpValue::Byte(self.read_u8()? as i8),
            b'C' => JdwpValue::Char(self.read_u16()?),
            b'S' => JdwpValue::Short(self.read_u16()? as i16),
            b'I' => JdwpValue::Int(self.read_i32()?),
            b'J' => JdwpValue::Long(self.read_i64()?),
            b'F' => JdwpValue::Float(f32::from_bits(self.read_u32()?)),
            b'D' => JdwpValue::Double(f64::from_bits(self.read_u64()?)),
            b'V' => JdwpValue::Void,
            _ => JdwpValue::Object {
                tag,
                id: self.read_object_id(sizes)?,
            },
        };
        Ok(v)
    }

    pub fn read_tagged_value(&mut self, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        let tag = self.read_u8()?;
        self.read_value(tag, sizes)
    }

    /// `arrayregion`: a tag followed by values that are untagged for primitive
    /// element types and tagged for reference element types.
    pub fn read_array_region(&mut self, sizes: &JdwpIdSizes) -> Result<Vec<JdwpValue>> {
        let tag = self.read_u8()?;
        let count = self.read_u32()? as usize;
        let primitive = matches!(tag, b'Z' | b'B' | b'C' | b'S' | b'I' | b'J' | b'F' | b'D');
        let mut values = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            let value = if primitive {
                self.read_value(tag, sizes)?
            } else {
                self.read_tagged_value(sizes)?
            };
            values.push(value);
        }
        Ok(values)
    }
}

pub fn encode_command(id: u32, command_set: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    encode_packet(id, 0, [command_set, command], payload)
}

#[cfg_attr(not(any(test, feature = "wire-test-support")), allow(dead_code))]
pub fn encode_reply(id: u32, error_code: u16, payload: &[u8]) -> Vec<u8> {
    encode_packet(id, FLAG_REPLY, error_code.to_be_bytes(), payload)
}

fn encode_packet(id: u32, flags: u8, trailer: [u8; 2], payload: &[u8]) -> Vec<u8> {
    let length = (HEADER_LEN + payload.len()) as u32;
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(flags);
    out.extend_from_slice(&trailer);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn class_name_to_signature_converts_dots() {
        assert_eq!(
            class_name_to_signature("com.example.Foo"),
            "Lcom/example/Foo;"
        );
        assert_eq!(class_name_to_signature("[I"), "[I");
        assert_eq!(
            class_name_to_signature("Ljava/lang/String;"),
            "Ljava/lang/String;"
        );
    }

    #[test]
    fn catch_location_of_zeroes_reads_as_none() {
        let sizes = JdwpIdSizes::default();
        let mut w = JdwpWriter::new();
        w.write_location(
            &Location {
                type_tag: 0,
                class_id: 0,
                method_id: 0,
                index: 0,
            },
            &sizes,
        );
        let bytes = w.into_vec();
        let mut r = JdwpReader::new(&bytes);
        assert_eq!(r.read_optional_location(&sizes).unwrap(), None);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn reader_reports_underflow() {
        let mut r = JdwpReader::new(&[0, 1]);
        assert!(matches!(r.read_u32(), Err(JdwpError::Protocol(_))));
    }

    #[test]
    fn primitive_array_region_is_untagged() {
        let sizes = JdwpIdSizes::default();
        let mut w = JdwpWriter::new();
        w.write_u8(b'I');
        w.write_u32(2);
        w.write_i32(4);
        w.write_i32(7);
        let bytes = w.into_vec();
        let mut r = JdwpReader::new(&bytes);
        assert_eq!(
            r.read_array_region(&sizes).unwrap(),
            vec![JdwpValue::Int(4), JdwpValue::Int(7)]
        );
    }

    #[test]
    fn reply_header_carries_error_code() {
        let packet = encode_reply(7, 34, &[]);
        assert_eq!(packet.len(), HEADER_LEN);
        assert_eq!(packet[8], FLAG_REPLY);
        assert_eq!(u16::from_be_bytes([packet[9], packet[10]]), 34);
    }
}
