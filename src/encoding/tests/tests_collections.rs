//! Tests for variable-length collections and safety limits.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::encoding::*;

    #[test]
    fn encoding__byte_vec_round_trip() {
        let data = vec![0u8, 1, 2, 255];
        let bytes = encode_to_vec(&data).unwrap();
        let (decoded, consumed) = Vec::<u8>::decode_from(&bytes).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(consumed, 4 + data.len());
    }

    #[test]
    fn encoding__byte_vec_rejects_oversized_length() {
        let bytes = encode_to_vec(&(MAX_BYTE_LEN + 1)).unwrap();
        assert!(matches!(
            Vec::<u8>::decode_from(&bytes),
            Err(EncodingError::LengthOverflow(_))
        ));
    }

    #[test]
    fn encoding__option_round_trip() {
        let bytes = encode_to_vec(&Some(42u64)).unwrap();
        let (decoded, _) = Option::<u64>::decode_from(&bytes).unwrap();
        assert_eq!(decoded, Some(42));

        let bytes = encode_to_vec(&Option::<u64>::None).unwrap();
        let (decoded, consumed) = Option::<u64>::decode_from(&bytes).unwrap();
        assert_eq!(decoded, None);
        assert_eq!(consumed, 1);
    }

    #[test]
    fn encoding__typed_vec_round_trip() {
        let items = vec![1u64, 2, 3];
        let mut buf = Vec::new();
        encode_vec(&items, &mut buf).unwrap();
        let (decoded, consumed) = decode_vec::<u64>(&buf).unwrap();
        assert_eq!(decoded, items);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn encoding__typed_vec_rejects_oversized_count() {
        let bytes = encode_to_vec(&(MAX_VEC_ELEMENTS + 1)).unwrap();
        assert!(matches!(
            decode_vec::<u64>(&bytes),
            Err(EncodingError::LengthOverflow(_))
        ));
    }

    #[test]
    fn encoding__cursor_advances_through_concatenated_items() {
        let mut buf = Vec::new();
        "alpha".encode_to(&mut buf).unwrap();
        7u32.encode_to(&mut buf).unwrap();

        let (first, n) = String::decode_from(&buf).unwrap();
        assert_eq!(first, "alpha");
        let (second, _) = u32::decode_from(&buf[n..]).unwrap();
        assert_eq!(second, 7);
    }
}
