use std::io::Read;

use bson::{Bson, Document};

use crate::error::{ErrorKind, Result};

/// Coerce numeric types into an `i64` if it would be lossless to do so. If this Bson is not numeric
/// or the conversion would be lossy (e.g. 1.5 -> 1), this returns `None`.
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

/// Read a document's raw BSON bytes from the provided reader.
pub(crate) fn read_document_bytes<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let mut length_bytes = [0u8; 4];
    reader.read_exact(&mut length_bytes)?;

    let length = i32::from_le_bytes(length_bytes);
    if length < 5 {
        return Err(ErrorKind::InvalidResponse {
            message: format!("invalid document length: {}", length),
        }
        .into());
    }

    let mut bytes = Vec::with_capacity(length as usize);
    bytes.extend_from_slice(&length_bytes);

    reader.take(length as u64 - 4).read_to_end(&mut bytes)?;

    if bytes.len() != length as usize {
        return Err(ErrorKind::InvalidResponse {
            message: format!(
                "expected document of length {}, only received {} bytes",
                length,
                bytes.len()
            ),
        }
        .into());
    }

    Ok(bytes)
}

pub(crate) fn deserialize_duration_option_from_u64_millis<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<std::time::Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    let millis = Option::<u64>::deserialize(deserializer)?;
    Ok(millis.map(std::time::Duration::from_millis))
}

/// Returns the raw BSON bytes of the provided document.
pub(crate) fn document_to_vec(doc: &Document) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    doc.to_writer(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod test {
    use bson::{doc, Bson};

    use super::{get_int, read_document_bytes};

    #[test]
    fn get_int_coercions() {
        assert_eq!(get_int(&Bson::Int32(3)), Some(3));
        assert_eq!(get_int(&Bson::Int64(7)), Some(7));
        assert_eq!(get_int(&Bson::Double(1.0)), Some(1));
        assert_eq!(get_int(&Bson::Double(1.5)), None);
        assert_eq!(get_int(&Bson::String("1".to_string())), None);
    }

    #[test]
    fn read_document_round_trips() {
        let doc = doc! { "ok": 1, "nested": { "x": [1, 2, 3] } };
        let bytes = super::document_to_vec(&doc).unwrap();

        // Trailing garbage must not be consumed.
        let mut padded = bytes.clone();
        padded.extend_from_slice(&[1, 2, 3]);

        let read = read_document_bytes(padded.as_slice()).unwrap();
        assert_eq!(read, bytes);
        assert_eq!(bson::from_slice::<bson::Document>(&read).unwrap(), doc);
    }

    #[test]
    fn truncated_document_is_an_error() {
        let bytes = super::document_to_vec(&doc! { "ok": 1 }).unwrap();
        assert!(read_document_bytes(&bytes[..bytes.len() - 2]).is_err());
    }
}
