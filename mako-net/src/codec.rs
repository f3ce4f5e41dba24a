// Length-prefixed frame codec implementing the wire format of §6:
//   packet_size:i32 (little-endian) ++ xid:varint ++ rpc_id:i32 ++ body   (request)
//   packet_size:i32 (little-endian) ++ xid:varint ++ error_code:varint ++ body (response)
//
// Modeled the way `tokio-util`'s `LengthDelimitedCodec` frames on a
// length prefix, but the prefix here is part of the spec's own wire
// format rather than an opaque transport detail, so we hand-roll the
// (de)framing instead of wrapping `LengthDelimitedCodec`.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use mako_base::{err_kind, Kind, Result as MakoResult};

use crate::wire::{RequestFrame, ResponseFrame, RpcId};

fn write_varint(buf: &mut BytesMut, mut v: u64) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if v == 0 {
            break;
        }
    }
}

fn read_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        v |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((v, i + 1));
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
    None
}

#[derive(Default)]
pub struct RequestCodec;

impl Encoder<RequestFrame> for RequestCodec {
    type Error = mako_base::Error;

    fn encode(&mut self, item: RequestFrame, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        let mut body = BytesMut::new();
        write_varint(&mut body, item.xid);
        body.put_i32_le(item.rpc_id.to_i32());
        body.extend_from_slice(&item.body);

        if body.len() > i32::MAX as usize {
            return Err(err_kind(Kind::Protocol, "request frame too large"));
        }
        dst.put_i32_le(body.len() as i32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for RequestCodec {
    type Item = RequestFrame;
    type Error = mako_base::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let packet_size = LittleEndian::read_i32(&src[..4]) as usize;
        if src.len() < 4 + packet_size {
            src.reserve(4 + packet_size - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut body = src.split_to(packet_size);

        let (xid, xid_len) = read_varint(&body)
            .ok_or_else(|| err_kind(Kind::Protocol, "truncated xid varint"))?;
        body.advance(xid_len);
        if body.len() < 4 {
            return Err(err_kind(Kind::Protocol, "truncated rpc_id"));
        }
        let rpc_id_raw = LittleEndian::read_i32(&body[..4]);
        body.advance(4);
        let rpc_id = RpcId::from_i32(rpc_id_raw)
            .ok_or_else(|| err_kind(Kind::Protocol, format!("unknown rpc_id {rpc_id_raw}")))?;

        Ok(Some(RequestFrame {
            xid,
            rpc_id,
            body: body.to_vec(),
        }))
    }
}

#[derive(Default)]
pub struct ResponseCodec;

impl Encoder<ResponseFrame> for ResponseCodec {
    type Error = mako_base::Error;

    fn encode(&mut self, item: ResponseFrame, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        let mut body = BytesMut::new();
        write_varint(&mut body, item.xid);
        write_varint(&mut body, item.error_code as u64);
        body.extend_from_slice(&item.body);

        if body.len() > i32::MAX as usize {
            return Err(err_kind(Kind::Protocol, "response frame too large"));
        }
        dst.put_i32_le(body.len() as i32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for ResponseCodec {
    type Item = ResponseFrame;
    type Error = mako_base::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let packet_size = LittleEndian::read_i32(&src[..4]) as usize;
        if src.len() < 4 + packet_size {
            src.reserve(4 + packet_size - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut body = src.split_to(packet_size);

        let (xid, xid_len) = read_varint(&body)
            .ok_or_else(|| err_kind(Kind::Protocol, "truncated xid varint"))?;
        body.advance(xid_len);
        let (error_code, err_len) = read_varint(&body)
            .ok_or_else(|| err_kind(Kind::Protocol, "truncated error_code varint"))?;
        body.advance(err_len);

        Ok(Some(ResponseFrame {
            xid,
            error_code: error_code as u32,
            body: body.to_vec(),
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_round_trips() {
        let mut codec = RequestCodec;
        let frame = RequestFrame {
            xid: 0x1234_5678_9abc,
            rpc_id: RpcId::Validate,
            body: vec![1, 2, 3, 4, 5],
        };
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.xid, frame.xid);
        assert_eq!(decoded.rpc_id, frame.rpc_id);
        assert_eq!(decoded.body, frame.body);
        assert!(buf.is_empty());
    }

    #[test]
    fn request_decode_waits_for_full_frame() {
        let mut codec = RequestCodec;
        let frame = RequestFrame {
            xid: 7,
            rpc_id: RpcId::Get,
            body: vec![9; 32],
        };
        let mut full = BytesMut::new();
        codec.encode(frame, &mut full).unwrap();

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn response_round_trips() {
        let mut codec = ResponseCodec;
        let frame = ResponseFrame {
            xid: 42,
            error_code: 0,
            body: vec![0xaa, 0xbb],
        };
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.xid, frame.xid);
        assert_eq!(decoded.error_code, frame.error_code);
        assert_eq!(decoded.body, frame.body);
    }
}
