//! On-disk form of a [`PerContainerIndex`].
//!
//! ```text
//! C0 CA 01 01 | version: u16 BE | bincode payload | C0 CA A0 A0
//! ```
//!
//! The trailing magic catches truncated writes that still happen to decode.

use crate::error::CodecError;
use crate::index::PerContainerIndex;

pub const MAGIC_BEGIN: [u8; 4] = [0xC0, 0xCA, 0x01, 0x01];
pub const MAGIC_END: [u8; 4] = [0xC0, 0xCA, 0xA0, 0xA0];
pub const FORMAT_VERSION: u16 = 1;

const HEADER_LEN: usize = MAGIC_BEGIN.len() + 2;
const MIN_LEN: usize = HEADER_LEN + MAGIC_END.len();

pub fn encode(index: &PerContainerIndex) -> Result<Vec<u8>, CodecError> {
    let payload = bincode::serialize(index)?;
    let mut out = Vec::with_capacity(MIN_LEN + payload.len());
    out.extend_from_slice(&MAGIC_BEGIN);
    out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&MAGIC_END);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<PerContainerIndex, CodecError> {
    if bytes.len() < MIN_LEN {
        return Err(CodecError::Truncated(bytes.len()));
    }
    if bytes[..MAGIC_BEGIN.len()] != MAGIC_BEGIN || bytes[bytes.len() - MAGIC_END.len()..] != MAGIC_END
    {
        return Err(CodecError::BadMagic);
    }
    let found = u16::from_be_bytes([bytes[4], bytes[5]]);
    if found != FORMAT_VERSION {
        return Err(CodecError::VersionMismatch {
            expected: FORMAT_VERSION,
            found,
        });
    }
    let payload = &bytes[HEADER_LEN..bytes.len() - MAGIC_END.len()];
    Ok(bincode::deserialize(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ContainerIdentity;
    use crate::record::{AnnotationUsage, ClassRecord, ElementValue, Retention};

    fn sample() -> PerContainerIndex {
        let mut index = PerContainerIndex::new(ContainerIdentity {
            path: "/lib/a.jar".to_string(),
            size: 42,
            last_modified: 7,
            digest: Some("ab".repeat(32)),
        });
        let mut record = ClassRecord::new("org.example.Service");
        record.superclass = Some("java.lang.Object".to_string());
        record.interfaces.push("java.io.Serializable".to_string());
        record.class_annotations.push(
            AnnotationUsage::new("org.example.Marker", Retention::Runtime).with_element(
                "values",
                ElementValue::Array(vec![ElementValue::Int(1), ElementValue::Double(0.5)]),
            ),
        );
        record.field_annotations.insert(
            "id".to_string(),
            vec![AnnotationUsage::new("org.example.Id", Retention::Class)],
        );
        index.insert("org/example/Service.class", record);
        index.record_failure("org/example/Broken.class", "bad magic");
        index
    }

    #[test]
    fn encoded_blob_is_framed_and_decodes_back() {
        let index = sample();
        let bytes = encode(&index).unwrap();
        assert_eq!(&bytes[..4], &MAGIC_BEGIN);
        assert_eq!(&bytes[bytes.len() - 4..], &MAGIC_END);
        assert_eq!(decode(&bytes).unwrap(), index);
    }

    #[test]
    fn damaged_blobs_are_rejected() {
        let bytes = encode(&sample()).unwrap();

        assert!(matches!(decode(&bytes[..5]), Err(CodecError::Truncated(5))));
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(CodecError::BadMagic)
        ));

        let mut wrong_version = bytes.clone();
        wrong_version[5] = 9;
        assert!(matches!(
            decode(&wrong_version),
            Err(CodecError::VersionMismatch { found: 9, .. })
        ));

        let mut short_payload = bytes[..HEADER_LEN + 3].to_vec();
        short_payload.extend_from_slice(&MAGIC_END);
        assert!(matches!(decode(&short_payload), Err(CodecError::Payload(_))));
    }
}
