//! A minimal WebSocket session for connections upgraded through a pipeline.
//!
//! [`RawWebSocket`] does framing only: it does not answer pings or complete the closing
//! handshake on its own, leaving that to whatever session logic sits on top.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_core::stream::Stream;
use futures_sink::Sink;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
const READ_CHUNK: usize = 4 * 1024;
const WRITE_HIGH_WATER: usize = 64 * 1024;

/// A complete WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A UTF-8 text message.
    Text(String),
    /// A binary message.
    Binary(Bytes),
    /// A ping control frame.
    Ping(Bytes),
    /// A pong control frame.
    Pong(Bytes),
    /// A close control frame, with its status code and reason if present.
    Close(Option<(u16, String)>),
}

impl Message {
    fn opcode(&self) -> u8 {
        match *self {
            Message::Text(_) => OP_TEXT,
            Message::Binary(_) => OP_BINARY,
            Message::Ping(_) => OP_PING,
            Message::Pong(_) => OP_PONG,
            Message::Close(_) => OP_CLOSE,
        }
    }
}

struct Frame {
    fin: bool,
    opcode: u8,
    payload: BytesMut,
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b ^= mask[i % 4];
    }
}

fn gen_mask() -> [u8; 4] {
    rand::random()
}

fn encode_frame(opcode: u8, payload: &[u8], mask: Option<[u8; 4]>, dst: &mut BytesMut) {
    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    dst.reserve(payload.len() + 14);
    dst.put_u8(0x80 | opcode);
    match payload.len() {
        n if n < 126 => dst.put_u8(mask_bit | n as u8),
        n if n <= u16::MAX as usize => {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(n as u16);
        }
        n => {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(n as u64);
        }
    }

    let start = match mask {
        Some(mask) => {
            dst.put_slice(&mask);
            dst.len()
        }
        None => dst.len(),
    };
    dst.put_slice(payload);
    if let Some(mask) = mask {
        apply_mask(&mut dst[start..], mask);
    }
}

fn decode_frame(src: &mut BytesMut, max_frame_size: usize) -> io::Result<Option<Frame>> {
    if src.len() < 2 {
        return Ok(None);
    }

    let fin = src[0] & 0x80 != 0;
    if src[0] & 0x70 != 0 {
        return Err(invalid("reserved bits set without a negotiated extension"));
    }
    let opcode = src[0] & 0x0F;
    let masked = src[1] & 0x80 != 0;

    let (len, mut header) = match src[1] & 0x7F {
        126 => {
            if src.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([src[2], src[3]]) as u64, 4)
        }
        127 => {
            if src.len() < 10 {
                return Ok(None);
            }
            let mut len = [0; 8];
            len.copy_from_slice(&src[2..10]);
            (u64::from_be_bytes(len), 10)
        }
        n => (n as u64, 2),
    };

    if len > max_frame_size as u64 {
        return Err(invalid("frame exceeds maximum frame size"));
    }
    let len = len as usize;

    if opcode >= OP_CLOSE && (!fin || len > 125) {
        return Err(invalid("fragmented or oversized control frame"));
    }

    let mask = if masked {
        if src.len() < header + 4 {
            return Ok(None);
        }
        let mut mask = [0; 4];
        mask.copy_from_slice(&src[header..header + 4]);
        header += 4;
        Some(mask)
    } else {
        None
    };

    if src.len() < header + len {
        return Ok(None);
    }

    src.advance(header);
    let mut payload = src.split_to(len);
    if let Some(mask) = mask {
        apply_mask(&mut payload, mask);
    }
    Ok(Some(Frame {
        fin,
        opcode,
        payload,
    }))
}

/// A framed WebSocket over a raw byte stream.
///
/// When acting as a client, every outgoing frame must be masked with a fresh random key; use
/// [`RawWebSocket::client`] for that. Incoming messages are reassembled from continuation frames
/// before they are yielded.
pub struct RawWebSocket<IO> {
    io: IO,
    masking: bool,
    max_frame_size: usize,
    read_buf: BytesMut,
    write_buf: BytesMut,
    fragments: Option<(u8, BytesMut)>,
    eof: bool,
}

impl<IO> fmt::Debug for RawWebSocket<IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawWebSocket")
            .field("masking", &self.masking)
            .field("max_frame_size", &self.max_frame_size)
            .field("buffered_read", &self.read_buf.len())
            .field("buffered_write", &self.write_buf.len())
            .finish()
    }
}

impl<IO> RawWebSocket<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap `io`, masking outgoing frames if `masking` is set.
    pub fn new(io: IO, masking: bool) -> Self {
        RawWebSocket {
            io,
            masking,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            fragments: None,
            eof: false,
        }
    }

    /// Wrap `io` as the client end of a WebSocket, with masking enabled.
    pub fn client(io: IO) -> Self {
        Self::new(io, true)
    }

    /// Refuse incoming frames larger than `max` bytes.
    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Take the byte stream back out. Buffered data is discarded.
    pub fn into_inner(self) -> IO {
        self.io
    }

    fn poll_write_buf(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = futures_core::ready!(Pin::new(&mut self.io).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }

    /// Turn a frame into a message, or stash it if it is part of a fragmented one.
    fn assemble(&mut self, frame: Frame) -> io::Result<Option<Message>> {
        let (opcode, payload) = match frame.opcode {
            OP_CONTINUATION => {
                let (opcode, mut buf) = self
                    .fragments
                    .take()
                    .ok_or_else(|| invalid("continuation frame without a message to continue"))?;
                buf.extend_from_slice(&frame.payload);
                if buf.len() > self.max_frame_size {
                    return Err(invalid("message exceeds maximum frame size"));
                }
                if !frame.fin {
                    self.fragments = Some((opcode, buf));
                    return Ok(None);
                }
                (opcode, buf)
            }
            OP_TEXT | OP_BINARY => {
                if self.fragments.is_some() {
                    return Err(invalid("new message started inside a fragmented one"));
                }
                if !frame.fin {
                    self.fragments = Some((frame.opcode, frame.payload));
                    return Ok(None);
                }
                (frame.opcode, frame.payload)
            }
            OP_PING => return Ok(Some(Message::Ping(frame.payload.freeze()))),
            OP_PONG => return Ok(Some(Message::Pong(frame.payload.freeze()))),
            OP_CLOSE => {
                let mut payload = frame.payload;
                let close = if payload.len() >= 2 {
                    let code = payload.get_u16();
                    let reason = String::from_utf8(payload.to_vec())
                        .map_err(|_| invalid("close reason is not valid UTF-8"))?;
                    Some((code, reason))
                } else {
                    None
                };
                return Ok(Some(Message::Close(close)));
            }
            _ => return Err(invalid("unknown opcode")),
        };

        match opcode {
            OP_TEXT => String::from_utf8(payload.to_vec())
                .map(|s| Some(Message::Text(s)))
                .map_err(|_| invalid("text message is not valid UTF-8")),
            _ => Ok(Some(Message::Binary(payload.freeze()))),
        }
    }
}

impl<IO> Stream for RawWebSocket<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    type Item = io::Result<Message>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            match decode_frame(&mut this.read_buf, this.max_frame_size) {
                Ok(Some(frame)) => match this.assemble(frame) {
                    Ok(Some(msg)) => return Poll::Ready(Some(Ok(msg))),
                    Ok(None) => continue,
                    Err(e) => return Poll::Ready(Some(Err(e))),
                },
                Ok(None) => {}
                Err(e) => return Poll::Ready(Some(Err(e))),
            }

            if this.eof {
                return Poll::Ready(None);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut buf = ReadBuf::new(&mut chunk);
            futures_core::ready!(Pin::new(&mut this.io).poll_read(cx, &mut buf))?;
            if buf.filled().is_empty() {
                this.eof = true;
                if !this.read_buf.is_empty() || this.fragments.is_some() {
                    return Poll::Ready(Some(Err(io::ErrorKind::UnexpectedEof.into())));
                }
                return Poll::Ready(None);
            }
            this.read_buf.extend_from_slice(buf.filled());
        }
    }
}

impl<IO> Sink<Message> for RawWebSocket<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    type Error = io::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.write_buf.len() >= WRITE_HIGH_WATER {
            return self.poll_write_buf(cx);
        }
        Poll::Ready(Ok(()))
    }

    fn start_send(mut self: Pin<&mut Self>, item: Message) -> io::Result<()> {
        let opcode = item.opcode();
        let mask = if self.masking { Some(gen_mask()) } else { None };
        let this = &mut *self;
        match item {
            Message::Text(s) => encode_frame(opcode, s.as_bytes(), mask, &mut this.write_buf),
            Message::Binary(b) | Message::Ping(b) | Message::Pong(b) => {
                encode_frame(opcode, &b, mask, &mut this.write_buf)
            }
            Message::Close(None) => encode_frame(opcode, &[], mask, &mut this.write_buf),
            Message::Close(Some((code, reason))) => {
                let mut payload = BytesMut::with_capacity(2 + reason.len());
                payload.put_u16(code);
                payload.put_slice(reason.as_bytes());
                encode_frame(opcode, &payload, mask, &mut this.write_buf)
            }
        }
        Ok(())
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        futures_core::ready!(self.poll_write_buf(cx))?;
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        futures_core::ready!(self.poll_write_buf(cx))?;
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
