//! Xfer: the generic file transfer, keyed by a 64-bit xfer id.
//!
//! Downloads are lock-step: packet N+1 goes out only after the client
//! confirms packet N. Packet 0 starts with the total length as a u32 and the
//! final packet number has the high bit set. Uploads mirror that shape in
//! the other direction.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use tracing::{debug, warn};

use meridian_core::packets::{AbortXfer, ConfirmXferPacket, RequestXfer, SendXferPacket};
use meridian_core::wire::{ThrottleCategory, UUID_ZERO};

use crate::session::ClientConnection;

/// Set on the packet number of the last packet in a transfer.
pub const XFER_LAST_PACKET: u32 = 0x8000_0000;

pub type UploadCallback = Box<dyn FnOnce(Bytes) + Send>;

struct Download {
    filename: String,
    data: Bytes,
    total_packets: u32,
    next_packet: u32,
    last_sent: u32,
    delete_on_completion: bool,
}

struct Upload {
    buffer: BytesMut,
    expected_len: Option<u32>,
    next_packet: u32,
    on_complete: Option<UploadCallback>,
}

/// In-flight xfers on one connection.
#[derive(Default)]
pub struct XferBook {
    downloads: Mutex<HashMap<u64, Download>>,
    uploads: Mutex<HashMap<u64, Upload>>,
}

impl XferBook {
    pub fn active_downloads(&self) -> usize {
        self.downloads.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn active_uploads(&self) -> usize {
        self.uploads.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn clear(&self) {
        self.downloads.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.uploads.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

fn packet_count(len: usize, chunk_size: usize) -> u32 {
    if chunk_size == 0 {
        return 1;
    }
    len.div_ceil(chunk_size).max(1) as u32
}

/// Wire packet number and payload for data packet `n`.
fn download_packet(dl: &Download, n: u32, chunk_size: usize) -> (u32, Bytes) {
    let start = (n as usize * chunk_size).min(dl.data.len());
    let end = (start + chunk_size).min(dl.data.len());
    let chunk = dl.data.slice(start..end);

    let number = if n + 1 == dl.total_packets {
        n | XFER_LAST_PACKET
    } else {
        n
    };
    if n != 0 {
        return (number, chunk);
    }
    let mut first = BytesMut::with_capacity(4 + chunk.len());
    first.put_u32_le(dl.data.len() as u32);
    first.put_slice(&chunk);
    (number, first.freeze())
}

/// Files offered for download, shared across connections.
#[derive(Default)]
pub struct XferService {
    files: DashMap<String, Bytes>,
}

impl XferService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer `data` under `filename`, replacing any earlier file.
    pub fn add_new_file(&self, filename: &str, data: impl Into<Bytes>) {
        self.files.insert(filename.to_string(), data.into());
    }

    pub fn remove_file(&self, filename: &str) -> Option<Bytes> {
        self.files.remove(filename).map(|(_, data)| data)
    }

    pub fn has_file(&self, filename: &str) -> bool {
        self.files.contains_key(filename)
    }

    /// Start a download. Unknown files are ignored.
    pub fn request_xfer(&self, conn: &ClientConnection, request: &RequestXfer) -> bool {
        let Some(data) = self.files.get(&request.filename).map(|f| f.value().clone()) else {
            debug!(filename = %request.filename, xfer = request.id, "xfer for unknown file");
            return false;
        };

        let chunk_size = conn.transfer_config().xfer_chunk_size;
        let mut download = Download {
            filename: request.filename.clone(),
            total_packets: packet_count(data.len(), chunk_size),
            data,
            next_packet: 0,
            last_sent: 0,
            delete_on_completion: request.delete_on_completion,
        };

        let mut downloads = conn.xfers.downloads.lock().unwrap_or_else(PoisonError::into_inner);
        if downloads.contains_key(&request.id) {
            return false;
        }
        send_next(conn, request.id, &mut download, chunk_size);
        downloads.insert(request.id, download);
        true
    }

    /// Client confirmed a download packet. Only a confirm of the most
    /// recently sent packet advances the transfer.
    pub fn confirm(&self, conn: &ClientConnection, confirm: &ConfirmXferPacket) -> bool {
        let chunk_size = conn.transfer_config().xfer_chunk_size;
        let mut downloads = conn.xfers.downloads.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(download) = downloads.get_mut(&confirm.id) else {
            return false;
        };
        if download.last_sent != confirm.packet {
            debug!(xfer = confirm.id, packet = confirm.packet, "stale xfer confirm");
            return false;
        }

        if download.next_packet < download.total_packets {
            send_next(conn, confirm.id, download, chunk_size);
            return true;
        }

        if let Some(done) = downloads.remove(&confirm.id) {
            debug!(xfer = confirm.id, filename = %done.filename, "xfer download complete");
            if done.delete_on_completion {
                self.files.remove(&done.filename);
            }
        }
        true
    }

    /// Drop a download or upload by id.
    pub fn abort(&self, conn: &ClientConnection, abort: &AbortXfer) -> bool {
        let dropped_download = conn
            .xfers
            .downloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&abort.id)
            .is_some();
        let dropped_upload = conn
            .xfers
            .uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&abort.id)
            .is_some();
        if dropped_download || dropped_upload {
            debug!(xfer = abort.id, result = abort.result, "xfer aborted");
        }
        dropped_download || dropped_upload
    }

    /// Ask the client to upload `filename` under `xfer_id`. The callback
    /// receives the assembled bytes after the final packet.
    pub fn begin_upload(
        &self,
        conn: &ClientConnection,
        xfer_id: u64,
        filename: &str,
        on_complete: impl FnOnce(Bytes) + Send + 'static,
    ) {
        conn.xfers
            .uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                xfer_id,
                Upload {
                    buffer: BytesMut::new(),
                    expected_len: None,
                    next_packet: 0,
                    on_complete: Some(Box::new(on_complete)),
                },
            );
        let request = RequestXfer {
            id: xfer_id,
            filename: filename.to_string(),
            delete_on_completion: false,
            vfile_id: UUID_ZERO,
            vfile_type: 0,
        };
        conn.send(&request, ThrottleCategory::Asset);
    }

    /// Take one upload packet from the client. Returns false for unknown
    /// xfer ids.
    pub fn receive_packet(&self, conn: &ClientConnection, packet: &SendXferPacket) -> bool {
        let number = packet.packet & !XFER_LAST_PACKET;
        let last = packet.packet & XFER_LAST_PACKET != 0;

        let finished = {
            let mut uploads = conn.xfers.uploads.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(upload) = uploads.get_mut(&packet.id) else {
                return false;
            };

            if number < upload.next_packet {
                // duplicate, the confirm was lost
                conn.send(
                    &ConfirmXferPacket {
                        id: packet.id,
                        packet: packet.packet,
                    },
                    ThrottleCategory::Asset,
                );
                return true;
            }
            if number > upload.next_packet {
                warn!(xfer = packet.id, packet = number, expected = upload.next_packet, "out of order xfer packet");
                return true;
            }

            let mut data = &packet.data[..];
            if number == 0 {
                if data.len() < 4 {
                    warn!(xfer = packet.id, "first xfer packet missing length prefix");
                    return true;
                }
                upload.expected_len = Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
                data = &data[4..];
            }
            upload.buffer.extend_from_slice(data);
            upload.next_packet += 1;

            conn.send(
                &ConfirmXferPacket {
                    id: packet.id,
                    packet: packet.packet,
                },
                ThrottleCategory::Asset,
            );

            if last {
                uploads.remove(&packet.id)
            } else {
                None
            }
        };

        if let Some(mut upload) = finished {
            let data = upload.buffer.split().freeze();
            if let Some(expected) = upload.expected_len {
                if expected as usize != data.len() {
                    warn!(xfer = packet.id, expected, got = data.len(), "xfer upload length mismatch");
                }
            }
            if let Some(callback) = upload.on_complete.take() {
                callback(data);
            }
        }
        true
    }
}

fn send_next(conn: &ClientConnection, id: u64, download: &mut Download, chunk_size: usize) {
    let (number, data) = download_packet(download, download.next_packet, chunk_size);
    download.last_sent = number;
    download.next_packet += 1;
    conn.send(
        &SendXferPacket {
            id,
            packet: number,
            data,
        },
        ThrottleCategory::Asset,
    );
}
