//! Wire protocol properties across the framing and field layers.


use bytes::BytesMut;
use strata::protocol::{Operation, PacketBuffer, Status, TaggedValue, FRAME_HEADER_SIZE};
use strata::server::FrameAccumulator;

/// A frame built by the packet buffer parses back through the accumulator.
#[test]
fn test_built_frame_round_trips_through_accumulator() {
    let mut frame = PacketBuffer::request(Operation::SetString, 77);
    frame.write_string("key");
    frame.write_opt_string(Some("value"));
    frame.write_var_uint(1_500);
    frame.finalize();

    let mut accumulator = FrameAccumulator::new();
    let payloads = accumulator.push(frame.frame()).unwrap();
    assert_eq!(payloads.len(), 1);
    assert_eq!(
        payloads[0].len(),
        frame.frame().len() - FRAME_HEADER_SIZE
    );

    let mut parsed = PacketBuffer::from_payload(payloads[0].clone());
    assert_eq!(parsed.read_u8().unwrap(), Operation::SetString as u8);
    assert_eq!(parsed.read_u32().unwrap(), 77);
    assert_eq!(parsed.read_string().unwrap(), "key");
    assert_eq!(parsed.read_opt_string().unwrap(), Some("value".to_string()));
    assert_eq!(parsed.read_var_uint().unwrap(), 1_500);
    assert_eq!(parsed.remaining(), 0);
}

/// Response frames place the status byte right after the request id.
#[test]
fn test_response_layout() {
    let mut frame = PacketBuffer::response(Operation::GetString, 5, Status::Ok);
    frame.write_opt_string(None);
    frame.finalize();

    let bytes = frame.frame();
    let declared =
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    assert_eq!(declared, bytes.len() - FRAME_HEADER_SIZE);
    assert_eq!(bytes[4], Operation::GetString as u8);
    assert_eq!(&bytes[5..9], &5u32.to_be_bytes());
    assert_eq!(bytes[9], Status::Ok as u8);
    // Null string body is a single zero var-uint.
    assert_eq!(bytes[10], 0);
    assert_eq!(bytes.len(), 11);
}

/// The null convention distinguishes absent from empty at every layer.
#[test]
fn test_null_and_empty_are_distinct() {
    let mut packet = PacketBuffer::from_payload(BytesMut::new());
    packet.write_opt_string(None);
    packet.write_opt_string(Some(""));
    packet.write_opt_bytes(None);
    packet.write_opt_bytes(Some(&[]));

    assert_eq!(packet.read_opt_string().unwrap(), None);
    assert_eq!(packet.read_opt_string().unwrap(), Some(String::new()));
    assert_eq!(packet.read_opt_bytes().unwrap(), None);
    assert_eq!(packet.read_opt_bytes().unwrap(), Some(Vec::new()));
}

/// Tagged values inside a map survive a wire round trip untouched.
#[test]
fn test_tagged_map_wire_round_trip() {
    let mut map = std::collections::HashMap::new();
    map.insert("one".to_string(), TaggedValue::Float32(2.4));
    map.insert("two".to_string(), TaggedValue::Float64(2.4));
    map.insert("three".to_string(), TaggedValue::String("value".into()));
    map.insert("four".to_string(), TaggedValue::Bool(true));
    map.insert("five".to_string(), TaggedValue::Bytes(vec![1, 2, 3, 4]));
    map.insert("six".to_string(), TaggedValue::Null);
    map.insert("seven".to_string(), TaggedValue::Int(i64::MIN));

    let mut frame = PacketBuffer::request(Operation::SetMap, 1);
    frame.write_string("key");
    frame.write_tagged_map(&map);
    frame.write_var_uint(0);
    frame.finalize();

    let mut accumulator = FrameAccumulator::new();
    let mut payloads = accumulator.push(frame.frame()).unwrap();
    let mut parsed = PacketBuffer::from_payload(payloads.remove(0));
    parsed.read_u8().unwrap();
    parsed.read_u32().unwrap();
    assert_eq!(parsed.read_string().unwrap(), "key");
    assert_eq!(parsed.read_tagged_map().unwrap(), map);
    assert_eq!(parsed.read_var_uint().unwrap(), 0);
}

/// Interleaved partial frames decode exactly once each.
#[test]
fn test_accumulator_handles_split_and_coalesced_frames() {
    let mut first = PacketBuffer::request(Operation::Exists, 1);
    first.write_string("a");
    first.finalize();
    let mut second = PacketBuffer::request(Operation::Delete, 2);
    second.write_string("b");
    second.finalize();

    let mut wire = first.frame().to_vec();
    wire.extend_from_slice(second.frame());

    let mut accumulator = FrameAccumulator::new();
    let mut seen = Vec::new();
    // Feed in 3-byte slivers.
    for chunk in wire.chunks(3) {
        seen.extend(accumulator.push(chunk).unwrap());
    }
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0][0], Operation::Exists as u8);
    assert_eq!(seen[1][0], Operation::Delete as u8);
}
