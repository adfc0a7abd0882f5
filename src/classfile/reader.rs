use thiserror::Error;

/// Low-level failure while walking class-file bytes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected end of class file at offset {offset}")]
    UnexpectedEof { offset: usize },
    #[error("invalid class file magic header {found:#010x}")]
    InvalidMagic { found: u32 },
    #[error("unsupported class file version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("unsupported constant pool tag {tag} at index {index}")]
    UnsupportedConstant { tag: u8, index: usize },
    #[error("invalid constant pool index {index}")]
    InvalidConstantIndex { index: u16 },
    #[error("malformed descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("malformed attribute {name}: {reason}")]
    InvalidAttribute { name: String, reason: String },
    #[error("annotation nesting deeper than {0}")]
    NestingTooDeep(usize),
    #[error("missing superclass for {0}")]
    MissingSuperclass(String),
}

/// Big-endian cursor over a byte slice. Every read is bounds checked.
pub struct ClassReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ClassReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn expect_magic(&mut self) -> Result<(), ParseError> {
        const MAGIC: u32 = 0xCAFEBABE;
        let magic = self.read_u4()?;
        if magic != MAGIC {
            return Err(ParseError::InvalidMagic { found: magic });
        }
        Ok(())
    }

    pub fn read_u1(&mut self) -> Result<u8, ParseError> {
        let slice = self.read_slice(1)?;
        Ok(slice[0])
    }

    pub fn read_u2(&mut self) -> Result<u16, ParseError> {
        let slice = self.read_slice(2)?;
        Ok(u16::from_be_bytes([slice[0], slice[1]]))
    }

    pub fn read_u4(&mut self) -> Result<u32, ParseError> {
        let slice = self.read_slice(4)?;
        Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    pub fn read_u8(&mut self) -> Result<u64, ParseError> {
        let hi = self.read_u4()? as u64;
        let lo = self.read_u4()? as u64;
        Ok((hi << 32) | lo)
    }

    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(ParseError::UnexpectedEof { offset: self.pos })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), ParseError> {
        self.read_slice(len).map(|_| ())
    }
}
