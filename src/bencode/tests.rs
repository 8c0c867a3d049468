use bytes::Bytes;

use super::*;

#[test]
fn test_decode_scalars() {
    assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
    assert_eq!(decode(b"i-7e").unwrap(), Value::Integer(-7));
    assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
    assert_eq!(decode(b"4:spam").unwrap(), Value::string("spam"));
    assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Bytes::new()));
}

#[test]
fn test_decode_rejects_bad_integers() {
    assert_eq!(decode(b"i-0e"), Err(BencodeError::InvalidInteger(0)));
    assert_eq!(decode(b"i03e"), Err(BencodeError::InvalidInteger(0)));
    assert_eq!(decode(b"ie"), Err(BencodeError::InvalidInteger(0)));
    assert_eq!(decode(b"i-e"), Err(BencodeError::InvalidInteger(0)));
    assert!(decode(b"i99999999999999999999e").is_err());
}

#[test]
fn test_decode_krpc_query() {
    let value = decode(b"d1:ad2:id2:xxe1:q4:ping1:t1:\x051:y1:qe").unwrap();

    assert_eq!(value.get(b"y").and_then(Value::as_str), Some("q"));
    assert_eq!(value.get(b"q").and_then(Value::as_str), Some("ping"));
    assert_eq!(
        value.get(b"t").and_then(Value::as_bytes).map(|b| b.as_ref()),
        Some(&[5u8][..])
    );
    let args = value.get(b"a").and_then(Value::as_dict).unwrap();
    assert_eq!(args.get(b"id".as_slice()), Some(&Value::string("xx")));
}

#[test]
fn test_decode_truncated_input() {
    assert!(matches!(
        decode(b"d1:t1:a"),
        Err(BencodeError::UnexpectedEof(_))
    ));
    assert!(matches!(decode(b"5:abc"), Err(BencodeError::UnexpectedEof(_))));
    assert!(matches!(decode(b"l"), Err(BencodeError::UnexpectedEof(_))));
    assert!(matches!(decode(b""), Err(BencodeError::UnexpectedEof(0))));
}

#[test]
fn test_decode_rejects_garbage() {
    assert!(matches!(
        decode(b"x"),
        Err(BencodeError::UnexpectedByte { byte: b'x', .. })
    ));
    assert_eq!(decode(b"i1ei2e"), Err(BencodeError::TrailingData(3)));
    assert!(matches!(decode(b"di1e1:ae"), Err(BencodeError::NonStringKey(1))));
    assert!(decode(b"05:hello").is_err());
}

#[test]
fn test_decode_nesting_limit() {
    let mut deep = vec![b'l'; 100];
    deep.extend(vec![b'e'; 100]);
    assert_eq!(decode(&deep), Err(BencodeError::NestingTooDeep));

    let mut shallow = vec![b'l'; 10];
    shallow.extend(vec![b'e'; 10]);
    assert!(decode(&shallow).is_ok());
}

#[test]
fn test_encode_sorts_dict_keys() {
    let mut dict = Dict::new();
    dict.insert(Bytes::from_static(b"y"), Value::string("r"));
    dict.insert(Bytes::from_static(b"t"), Value::bytes(&[0]));
    dict.insert(Bytes::from_static(b"r"), Value::Dict(Dict::new()));

    assert_eq!(encode(&Value::Dict(dict)), b"d1:rde1:t1:\x001:y1:re");
}

#[test]
fn test_encode_negative_and_binary() {
    assert_eq!(encode(&Value::Integer(-3)), b"i-3e");
    assert_eq!(encode(&Value::bytes(&[0xff, 0x00])), b"2:\xff\x00");
}
