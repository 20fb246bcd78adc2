#![allow(dead_code)]

use std::net::TcpStream;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use qcollab::collab::proto::{decode_message, encode_message};
use qcollab::collab::{FrameReader, FrameWriter, Handshake, WireMessage};
use qcollab::core::{Command, CommandKind, Limits, SynchronizationRequest};
use qcollab::{NodeAddress, NodeMetadata, QueueStatus};

/// A hand-driven dialer that completes negotiation with a node and then
/// never sends another frame.
pub struct SilentPeer {
    pub address: NodeAddress,
    stream: TcpStream,
    drain: Option<JoinHandle<()>>,
}

impl SilentPeer {
    /// Dial `node`, advertising `address`, and drive the link to
    /// established.
    pub fn link(node: &NodeAddress, address: NodeAddress) -> Self {
        let limits = Limits::default();
        let stream = TcpStream::connect(node.to_string()).expect("dial node");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        let max_frame = limits.max_frame_bytes;
        let mut writer = FrameWriter::new(stream.try_clone().expect("clone stream"), max_frame);
        let mut reader = FrameReader::new(stream.try_clone().expect("clone stream"), max_frame);
        let mut send = |message: WireMessage| {
            let bytes = encode_message(&message).expect("encode");
            writer.write_frame(&bytes).expect("write frame");
        };

        let metadata = NodeMetadata::full(
            QueueStatus::default(),
            &address,
            "silent",
            Duration::from_millis(200),
        );
        send(WireMessage::Handshake(Handshake { magic: 7, metadata }));
        match next_message(&mut reader, &limits) {
            WireMessage::Handshake(echo) => assert_eq!(echo.magic, 7),
            other => panic!("expected handshake echo, got {other:?}"),
        }

        send(WireMessage::Command(Command::SyncRequest {
            target: node.clone(),
            request: SynchronizationRequest {
                payload: Bytes::new(),
            },
        }));
        loop {
            match next_message(&mut reader, &limits) {
                WireMessage::Command(command) if command.kind() == CommandKind::SyncResponse => {
                    break;
                }
                WireMessage::Command(_) => {}
                other => panic!("expected SYNC_RESPONSE, got {other:?}"),
            }
        }
        send(WireMessage::Command(Command::LinkEstablish {
            target: node.clone(),
        }));

        stream.set_read_timeout(None).expect("clear read timeout");
        let drain = thread::spawn(move || while let Ok(Some(_)) = reader.read_next() {});
        Self {
            address,
            stream,
            drain: Some(drain),
        }
    }
}

impl Drop for SilentPeer {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        if let Some(drain) = self.drain.take() {
            let _ = drain.join();
        }
    }
}

fn next_message(reader: &mut FrameReader<TcpStream>, limits: &Limits) -> WireMessage {
    let bytes = reader
        .read_next()
        .expect("read frame")
        .expect("node closed connection");
    decode_message(&bytes, limits).expect("decode")
}
