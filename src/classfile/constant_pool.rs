use super::reader::{ClassReader, ParseError};

#[derive(Debug, Clone)]
enum Constant {
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index: u16 },
    Other,
    Unusable,
}

/// The subset of the constant pool needed for structure and annotation
/// literals. References to fields, methods and call sites are skipped.
pub struct ConstantPool {
    entries: Vec<Constant>,
}

impl ConstantPool {
    pub fn parse(reader: &mut ClassReader<'_>) -> Result<Self, ParseError> {
        let count = reader.read_u2()? as usize;
        let mut entries = Vec::with_capacity(count);
        entries.push(Constant::Unusable); // index 0 unused

        let mut index = 1;
        while index < count {
            let tag = reader.read_u1()?;
            let entry = match tag {
                1 => {
                    let length = reader.read_u2()? as usize;
                    let bytes = reader.read_slice(length)?;
                    Constant::Utf8(decode_modified_utf8(bytes))
                }
                3 => Constant::Integer(reader.read_u4()? as i32),
                4 => Constant::Float(f32::from_bits(reader.read_u4()?)),
                5 | 6 => {
                    let bits = reader.read_u8()?;
                    let value = if tag == 5 {
                        Constant::Long(bits as i64)
                    } else {
                        Constant::Double(f64::from_bits(bits))
                    };
                    // Eight-byte constants take two slots.
                    entries.push(value);
                    index += 1;
                    Constant::Unusable
                }
                7 => Constant::Class {
                    name_index: reader.read_u2()?,
                },
                8 | 16 | 19 | 20 => {
                    reader.read_u2()?;
                    Constant::Other
                }
                9 | 10 | 11 | 12 | 17 | 18 => {
                    reader.skip(4)?;
                    Constant::Other
                }
                15 => {
                    reader.skip(3)?;
                    Constant::Other
                }
                other => return Err(ParseError::UnsupportedConstant { tag: other, index }),
            };

            entries.push(entry);
            index += 1;
        }

        Ok(Self { entries })
    }

    fn get(&self, index: u16) -> Result<&Constant, ParseError> {
        self.entries
            .get(index as usize)
            .ok_or(ParseError::InvalidConstantIndex { index })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn utf8(&self, index: u16) -> Result<&str, ParseError> {
        match self.get(index)? {
            Constant::Utf8(value) => Ok(value.as_str()),
            _ => Err(ParseError::InvalidConstantIndex { index }),
        }
    }

    /// Internal (slash separated) name of a `CONSTANT_Class` entry.
    pub fn class_name(&self, index: u16) -> Result<&str, ParseError> {
        match self.get(index)? {
            Constant::Class { name_index } => self.utf8(*name_index),
            _ => Err(ParseError::InvalidConstantIndex { index }),
        }
    }

    pub fn integer(&self, index: u16) -> Result<i32, ParseError> {
        match self.get(index)? {
            Constant::Integer(v) => Ok(*v),
            _ => Err(ParseError::InvalidConstantIndex { index }),
        }
    }

    pub fn float(&self, index: u16) -> Result<f32, ParseError> {
        match self.get(index)? {
            Constant::Float(v) => Ok(*v),
            _ => Err(ParseError::InvalidConstantIndex { index }),
        }
    }

    pub fn long(&self, index: u16) -> Result<i64, ParseError> {
        match self.get(index)? {
            Constant::Long(v) => Ok(*v),
            _ => Err(ParseError::InvalidConstantIndex { index }),
        }
    }

    pub fn double(&self, index: u16) -> Result<f64, ParseError> {
        match self.get(index)? {
            Constant::Double(v) => Ok(*v),
            _ => Err(ParseError::InvalidConstantIndex { index }),
        }
    }
}

/// Decodes the JVM's modified UTF-8 (two-byte NUL, surrogate pairs encoded
/// separately). Invalid sequences become U+FFFD instead of failing.
pub fn decode_modified_utf8(bytes: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(bytes) {
        if !bytes.contains(&0xED) {
            return s.to_string();
        }
    }

    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b & 0x80 == 0 {
            units.push(b as u16);
            i += 1;
        } else if b & 0xE0 == 0xC0 && i + 1 < bytes.len() {
            units.push((((b & 0x1F) as u16) << 6) | (bytes[i + 1] & 0x3F) as u16);
            i += 2;
        } else if b & 0xF0 == 0xE0 && i + 2 < bytes.len() {
            units.push(
                (((b & 0x0F) as u16) << 12)
                    | (((bytes[i + 1] & 0x3F) as u16) << 6)
                    | (bytes[i + 2] & 0x3F) as u16,
            );
            i += 3;
        } else {
            units.push(0xFFFD);
            i += 1;
        }
    }
    String::from_utf16_lossy(&units)
}

/// Inverse of [`decode_modified_utf8`].
pub fn encode_modified_utf8(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_bytes(entries: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        let slots: usize = entries
            .iter()
            .map(|e| if e[0] == 5 || e[0] == 6 { 2 } else { 1 })
            .sum();
        out.extend_from_slice(&((slots + 1) as u16).to_be_bytes());
        for e in entries {
            out.extend_from_slice(e);
        }
        out
    }

    #[test]
    fn long_constants_occupy_two_slots() {
        let bytes = pool_bytes(&[
            &[5, 0, 0, 0, 0, 0, 0, 0, 42],
            &[3, 0, 0, 0, 7],
            &[1, 0, 2, b'h', b'i'],
        ]);
        let mut reader = ClassReader::new(&bytes);
        let pool = ConstantPool::parse(&mut reader).unwrap();
        assert_eq!(pool.long(1).unwrap(), 42);
        assert!(pool.integer(2).is_err());
        assert_eq!(pool.integer(3).unwrap(), 7);
        assert_eq!(pool.utf8(4).unwrap(), "hi");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let bytes = pool_bytes(&[&[2, 0, 0]]);
        let mut reader = ClassReader::new(&bytes);
        assert!(matches!(
            ConstantPool::parse(&mut reader),
            Err(ParseError::UnsupportedConstant { tag: 2, index: 1 })
        ));
    }

    #[test]
    fn class_entry_resolves_through_utf8() {
        let bytes = pool_bytes(&[&[1, 0, 3, b'a', b'/', b'B'], &[7, 0, 1]]);
        let mut reader = ClassReader::new(&bytes);
        let pool = ConstantPool::parse(&mut reader).unwrap();
        assert_eq!(pool.class_name(2).unwrap(), "a/B");
        assert!(pool.class_name(1).is_err());
        assert!(pool.utf8(9).is_err());
    }

    #[test]
    fn modified_utf8_round_trips_nul_and_supplementary() {
        let text = "a\u{0}b\u{e9}\u{1F600}";
        let encoded = encode_modified_utf8(text);
        assert!(!encoded.contains(&0));
        assert_eq!(decode_modified_utf8(&encoded), text);
    }
}
