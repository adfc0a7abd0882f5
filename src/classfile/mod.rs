//! Class-file reading: byte cursor, constant pool, record decoder and a
//! small assembler for producing class files.

pub mod builder;
pub mod constant_pool;
pub mod decode;
pub mod reader;

pub use builder::ClassFileBuilder;
pub use decode::decode;
