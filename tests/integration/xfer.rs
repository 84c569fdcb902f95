use std::sync::{Arc, Mutex};

use bytes::Bytes;

use meridian_core::config::{ThrottleConfig, TransferConfig};
use meridian_core::packets::{
    AbortXfer, ConfirmXferPacket, PacketBody, RequestXfer, SendXferPacket,
};
use meridian_core::wire::PacketType;
use meridian_services::xfer::XFER_LAST_PACKET;
use meridian_services::XferService;

use crate::*;

fn small_chunks() -> Arc<meridian_services::ClientConnection> {
    connection_with(
        &ThrottleConfig::default(),
        TransferConfig {
            xfer_chunk_size: 4,
            ..TransferConfig::default()
        },
    )
}

fn request(id: u64, filename: &str, delete: bool) -> RequestXfer {
    RequestXfer {
        id,
        filename: filename.into(),
        delete_on_completion: delete,
        vfile_id: [0; 16],
        vfile_type: 0,
    }
}

fn only_xfer_packet(conn: &meridian_services::ClientConnection) -> SendXferPacket {
    let packets = sent(conn);
    assert_eq!(packets.len(), 1, "expected one packet, got {packets:?}");
    assert_eq!(packets[0].packet_type, PacketType::SendXferPacket);
    SendXferPacket::decode(&packets[0].body).unwrap()
}

#[test]
fn download_is_lock_step() {
    let conn = small_chunks();
    let xfers = XferService::new();
    xfers.add_new_file("inventory.tmp", Bytes::from_static(b"abcdefghij"));
    assert!(xfers.request_xfer(&conn, &request(1, "inventory.tmp", true)));

    let mut received = Vec::new();
    let first = only_xfer_packet(&conn);
    assert_eq!(first.packet, 0);
    assert_eq!(&first.data[..4], &10u32.to_le_bytes());
    received.extend_from_slice(&first.data[4..]);

    // a stale confirm does not advance
    assert!(!xfers.confirm(&conn, &ConfirmXferPacket { id: 1, packet: 5 }));
    assert!(sent(&conn).is_empty());

    let mut last = first.packet;
    loop {
        assert!(xfers.confirm(&conn, &ConfirmXferPacket { id: 1, packet: last }));
        let packets = sent(&conn);
        if packets.is_empty() {
            break;
        }
        let next = SendXferPacket::decode(&packets[0].body).unwrap();
        received.extend_from_slice(&next.data);
        last = next.packet;
    }

    assert_eq!(received, b"abcdefghij");
    assert_ne!(last & XFER_LAST_PACKET, 0);
    assert_eq!(conn.xfers.active_downloads(), 0);
    assert!(!xfers.has_file("inventory.tmp"));
}

#[test]
fn abort_drops_download() {
    let conn = small_chunks();
    let xfers = XferService::new();
    xfers.add_new_file("a.bin", Bytes::from_static(b"0123456789"));
    xfers.request_xfer(&conn, &request(2, "a.bin", false));
    sent(&conn);

    assert!(xfers.abort(&conn, &AbortXfer { id: 2, result: -1 }));
    assert_eq!(conn.xfers.active_downloads(), 0);
    assert!(!xfers.confirm(&conn, &ConfirmXferPacket { id: 2, packet: 0 }));
    assert!(xfers.has_file("a.bin"));
}

#[test]
fn unknown_file_is_ignored() {
    let conn = small_chunks();
    let xfers = XferService::new();
    assert!(!xfers.request_xfer(&conn, &request(3, "missing", false)));
    assert!(sent(&conn).is_empty());
}

#[test]
fn upload_assembles_and_confirms() {
    let conn = small_chunks();
    let xfers = XferService::new();
    let result = Arc::new(Mutex::new(None));
    let sink = result.clone();
    xfers.begin_upload(&conn, 9, "script.lsl", move |data| {
        *sink.lock().unwrap() = Some(data);
    });

    let packets = sent(&conn);
    assert_eq!(packets[0].packet_type, PacketType::RequestXfer);
    assert_eq!(RequestXfer::decode(&packets[0].body).unwrap().filename, "script.lsl");

    let mut first = 7u32.to_le_bytes().to_vec();
    first.extend_from_slice(b"hel");
    let parts = [
        SendXferPacket {
            id: 9,
            packet: 0,
            data: Bytes::from(first),
        },
        SendXferPacket {
            id: 9,
            packet: 1 | XFER_LAST_PACKET,
            data: Bytes::from_static(b"lo!!"),
        },
    ];

    assert!(xfers.receive_packet(&conn, &parts[0]));
    // duplicate is confirmed again but not appended
    assert!(xfers.receive_packet(&conn, &parts[0]));
    let confirms = sent(&conn);
    assert_eq!(confirms.len(), 2);
    assert!(confirms.iter().all(|p| p.packet_type == PacketType::ConfirmXferPacket));

    assert!(xfers.receive_packet(&conn, &parts[1]));
    assert_eq!(result.lock().unwrap().as_deref(), Some(&b"hello!!"[..]));
    assert_eq!(conn.xfers.active_uploads(), 0);
    assert!(!xfers.receive_packet(&conn, &parts[1]));
}
