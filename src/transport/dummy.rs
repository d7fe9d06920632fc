//! No-op backend that answers every request without touching a socket.

use super::{Channel, SocketBinding, TransportBackend, TransportError, DUMMY_BACKEND};
use vmvol_protocol::MAX_MESSAGE_SIZE;

/// Reply returned for every request: the service's "success, no data".
pub const DUMMY_REPLY: &[u8] = b"null";

/// Backend whose channels echo a canned success reply.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyBackend;

impl TransportBackend for DummyBackend {
    fn name(&self) -> &'static str {
        DUMMY_BACKEND
    }

    fn description(&self) -> &'static str {
        "no-op backend which only returns OK, for testing"
    }

    fn open(&self, cid: u32, port: u32) -> Result<Box<dyn Channel>, TransportError> {
        Ok(Box::new(DummyChannel {
            binding: SocketBinding {
                socket: None,
                local_port: None,
                remote_cid: cid,
                remote_port: port,
            },
        }))
    }
}

struct DummyChannel {
    binding: SocketBinding,
}

impl Channel for DummyChannel {
    fn binding(&self) -> &SocketBinding {
        &self.binding
    }

    fn send_and_receive(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        if request.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::Oversized {
                size: request.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        tracing::debug!(
            binding = %self.binding,
            request = %String::from_utf8_lossy(request),
            "dummy backend received request"
        );
        Ok(DUMMY_REPLY.to_vec())
    }
}
