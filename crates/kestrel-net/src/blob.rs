//! Chunked reliable delivery of arbitrarily sized byte streams.
//!
//! The sender is a stateless helper that splits a blob into 64 KiB chunks
//! on the reliable control channel. The receiver is stateful, one instance
//! per blob type, so parallel transfers never collide. Chunks must arrive
//! strictly in order: the channel guarantees it, so anything else means
//! corruption and resets the receiver.

use tracing::{debug, error};

use kestrel_netproto::constants::BLOB_CHUNK_SIZE;
use kestrel_netproto::netplay::{BlobType, NetplayMsg};

use crate::error::NetError;
use crate::transport::{Transport, CHAN_CONTROL};

/// Where a blob is headed.
#[derive(Debug, Clone, Copy)]
pub enum BlobTarget {
    Peer(usize),
    Broadcast,
}

/// Stream `data` as `BlobStart`, chunks, `BlobEnd`.
pub fn send_blob(transport: &Transport, target: BlobTarget, blob_type: BlobType, data: &[u8]) {
    let send = |msg: NetplayMsg| {
        let bytes = msg.encode();
        match target {
            BlobTarget::Peer(peer) => transport.send_to(peer, CHAN_CONTROL, true, &bytes),
            BlobTarget::Broadcast => transport.broadcast(CHAN_CONTROL, true, &bytes),
        }
    };

    send(NetplayMsg::BlobStart {
        blob_type,
        total_len: data.len() as u32,
    });

    for (i, chunk) in data.chunks(BLOB_CHUNK_SIZE).enumerate() {
        send(NetplayMsg::BlobChunk {
            offset: (i * BLOB_CHUNK_SIZE) as u32,
            payload: chunk.to_vec(),
        });
    }

    send(NetplayMsg::BlobEnd {
        blob_type,
        checksum: byte_sum(data),
    });
    debug!(?blob_type, len = data.len(), "blob sent");
}

/// Receiving half of one blob slot.
#[derive(Debug)]
pub struct BlobReceiver {
    blob_type: BlobType,
    buffer: Vec<u8>,
    total_len: usize,
    received_len: usize,
    receiving: bool,
    complete: bool,
}

impl BlobReceiver {
    pub fn new(blob_type: BlobType) -> Self {
        Self {
            blob_type,
            buffer: Vec::new(),
            total_len: 0,
            received_len: 0,
            receiving: false,
            complete: false,
        }
    }

    /// Feed one blob message. Returns `Ok(true)` once the blob is complete
    /// and verified. Any violation (wrong order, out of bounds, bad
    /// checksum) resets the receiver and returns an error; the transfer
    /// can only recover by restarting from `BlobStart`.
    pub fn on_message(&mut self, msg: &NetplayMsg) -> Result<bool, NetError> {
        match msg {
            NetplayMsg::BlobStart {
                blob_type,
                total_len,
            } => {
                debug_assert_eq!(*blob_type, self.blob_type);
                self.buffer = vec![0; *total_len as usize];
                self.total_len = *total_len as usize;
                self.received_len = 0;
                self.receiving = true;
                self.complete = false;
                debug!(?blob_type, total_len, "blob receive started");
                Ok(false)
            }
            NetplayMsg::BlobChunk { offset, payload } => {
                if !self.receiving {
                    return self.fail("chunk without start");
                }
                let offset = *offset as usize;
                if offset != self.received_len {
                    // Duplicate or reordered chunk: the reliable channel
                    // never does this, so the stream is corrupt.
                    return self.fail("chunk out of order");
                }
                if offset + payload.len() > self.total_len {
                    return self.fail("chunk out of bounds");
                }
                self.buffer[offset..offset + payload.len()].copy_from_slice(payload);
                self.received_len += payload.len();
                Ok(false)
            }
            NetplayMsg::BlobEnd {
                blob_type,
                checksum,
            } => {
                if !self.receiving {
                    return self.fail("end without start");
                }
                if *blob_type != self.blob_type {
                    return self.fail("end for a different blob");
                }
                if self.received_len != self.total_len {
                    return self.fail("incomplete blob");
                }
                let got = byte_sum(&self.buffer);
                if got != *checksum {
                    error!(
                        ?blob_type,
                        expected = checksum,
                        got,
                        "blob checksum mismatch"
                    );
                    return self.fail("checksum mismatch");
                }
                self.receiving = false;
                self.complete = true;
                debug!(?blob_type, len = self.total_len, "blob received");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn fail(&mut self, what: &str) -> Result<bool, NetError> {
        let err = NetError::BlobTransfer(format!("{what} (type {:?})", self.blob_type));
        self.reset();
        Err(err)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn blob_type(&self) -> BlobType {
        self.blob_type
    }

    /// Hand out the finished blob and clear the slot.
    pub fn take_data(&mut self) -> Option<Vec<u8>> {
        if !self.complete {
            return None;
        }
        self.complete = false;
        self.total_len = 0;
        self.received_len = 0;
        Some(std::mem::take(&mut self.buffer))
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.total_len = 0;
        self.received_len = 0;
        self.receiving = false;
        self.complete = false;
    }
}

fn byte_sum(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}
