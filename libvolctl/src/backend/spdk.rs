//! JSON-RPC client for the SPDK vhost daemon.
//!
//! SPDK listens on a Unix domain socket and speaks JSON-RPC 2.0 without any
//! framing: a response is complete when the bytes read so far form one JSON
//! value.  [`SpdkClient`] keeps a single connection and sends one request at
//! a time over it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::{
    BDev, BlockBackend, ControllerBackend, MallocBDevArgs, RbdBDevArgs, ScsiTarget,
    VHostController,
};
use crate::error::BackendError;

/// Upper bound for a single response.
const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Serialize)]
struct Request<'a, P> {
    jsonrpc: &'static str,
    method: &'a str,
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<P>,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    id: serde_json::Value,
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Serialize)]
struct NameArgs<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct ScsiLunArgs<'a> {
    ctrlr: &'a str,
    scsi_target_num: u32,
    bdev_name: &'a str,
}

#[derive(Serialize)]
struct ScsiTargetArgs<'a> {
    ctrlr: &'a str,
    scsi_target_num: u32,
}

/// Controller entry of `get_vhost_controllers` before `backend_specific` is
/// turned into a [`ControllerBackend`].
#[derive(Deserialize)]
struct RawController {
    ctrlr: String,
    #[serde(default)]
    backend_specific: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct RawBlk {
    bdev: String,
}

impl TryFrom<RawController> for VHostController {
    type Error = BackendError;

    fn try_from(raw: RawController) -> Result<Self, Self::Error> {
        let decode = |e: serde_json::Error| {
            BackendError::io(format!("controller {}: malformed backend data: {e}", raw.ctrlr))
        };
        let backend = if let Some(scsi) = raw.backend_specific.get("scsi") {
            let targets: Vec<ScsiTarget> =
                serde_json::from_value(scsi.clone()).map_err(decode)?;
            ControllerBackend::Scsi(targets)
        } else if let Some(block) = raw.backend_specific.get("block") {
            let blk: RawBlk = serde_json::from_value(block.clone()).map_err(decode)?;
            ControllerBackend::Blk { bdev: blk.bdev }
        } else {
            ControllerBackend::Unknown
        };
        Ok(Self {
            name: raw.ctrlr,
            backend,
        })
    }
}

/// [`BlockBackend`] talking to SPDK over its RPC socket.
pub struct SpdkClient {
    socket: PathBuf,
    next_id: AtomicU64,
    /// Idle connection.  Taken out for the duration of a call so that a
    /// cancelled or failed call never leaves a half-read response behind.
    conn: Mutex<Option<UnixStream>>,
}

impl SpdkClient {
    /// Create a client that dials `socket` lazily on the first call.
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            next_id: AtomicU64::new(1),
            conn: Mutex::new(None),
        }
    }

    /// Create a client and dial `socket` immediately, so that a wrong path
    /// is reported at startup.
    pub async fn connect(socket: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let client = Self::new(socket);
        let stream = client.dial().await?;
        *client.conn.lock().await = Some(stream);
        Ok(client)
    }

    async fn dial(&self) -> Result<UnixStream, BackendError> {
        UnixStream::connect(&self.socket)
            .await
            .map_err(|e| BackendError::io(format!("connect {}: {e}", self.socket.display())))
    }

    /// Issue one JSON-RPC call and decode its result.
    #[instrument(skip(self, params), fields(socket = %self.socket.display()))]
    async fn call<P, R>(&self, method: &str, params: Option<P>) -> Result<R, BackendError>
    where
        P: Serialize + Send,
        R: DeserializeOwned,
    {
        let mut slot = self.conn.lock().await;
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => self.dial().await?,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_vec(&Request {
            jsonrpc: "2.0",
            method,
            id,
            params,
        })
        .map_err(BackendError::io)?;
        stream.write_all(&payload).await.map_err(BackendError::io)?;

        let response = read_response(&mut stream).await?;
        if response.id != serde_json::Value::from(id) {
            // Out of sync with the server; the next call redials.
            return Err(BackendError::io(format!(
                "{method}: response id {} does not match request id {id}",
                response.id
            )));
        }
        *slot = Some(stream);
        drop(slot);

        if let Some(err) = response.error {
            debug!(method, code = err.code, message = %err.message, "SPDK call failed");
            return Err(BackendError::new(err.code, err.message));
        }
        serde_json::from_value(response.result)
            .map_err(|e| BackendError::io(format!("{method}: unexpected result: {e}")))
    }
}

/// Tracks the nesting of the JSON bytes seen so far, so that a response is
/// parsed once its outermost object or array has closed instead of after
/// every read.
#[derive(Default)]
struct ValueScanner {
    depth: usize,
    started: bool,
    in_string: bool,
    escaped: bool,
}

impl ValueScanner {
    /// Consume `bytes`; true once a top-level value has closed.
    fn feed(&mut self, bytes: &[u8]) -> bool {
        let mut closed = false;
        for &b in bytes {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => {
                    self.depth += 1;
                    self.started = true;
                }
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    closed |= self.started && self.depth == 0;
                }
                _ => {}
            }
        }
        closed
    }
}

/// Read from `stream` until the buffered bytes contain one complete JSON
/// value.
async fn read_response(stream: &mut UnixStream) -> Result<Response, BackendError> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let mut scanner = ValueScanner::default();
    loop {
        let n = stream.read(&mut chunk).await.map_err(BackendError::io)?;
        if n == 0 {
            return Err(BackendError::io("connection closed before response"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_RESPONSE_BYTES {
            return Err(BackendError::io("response exceeds size limit"));
        }
        if !scanner.feed(&chunk[..n]) {
            continue;
        }

        let mut values = serde_json::Deserializer::from_slice(&buf).into_iter::<Response>();
        match values.next() {
            Some(Ok(response)) => return Ok(response),
            Some(Err(e)) if e.is_eof() => {}
            Some(Err(e)) => return Err(BackendError::io(format!("malformed response: {e}"))),
            None => {}
        }
    }
}

#[async_trait]
impl BlockBackend for SpdkClient {
    async fn get_bdevs(&self, name: Option<&str>) -> Result<Vec<BDev>, BackendError> {
        self.call("get_bdevs", name.map(|name| NameArgs { name }))
            .await
    }

    async fn construct_malloc_bdev(&self, args: MallocBDevArgs) -> Result<String, BackendError> {
        self.call("construct_malloc_bdev", Some(args)).await
    }

    async fn construct_rbd_bdev(&self, args: RbdBDevArgs) -> Result<String, BackendError> {
        self.call("construct_rbd_bdev", Some(args)).await
    }

    async fn delete_bdev(&self, name: &str) -> Result<(), BackendError> {
        let _: bool = self.call("delete_bdev", Some(NameArgs { name })).await?;
        Ok(())
    }

    async fn get_vhost_controllers(&self) -> Result<Vec<VHostController>, BackendError> {
        let raw: Vec<RawController> = self.call("get_vhost_controllers", None::<()>).await?;
        raw.into_iter().map(VHostController::try_from).collect()
    }

    async fn add_vhost_scsi_lun(
        &self,
        controller: &str,
        scsi_target_num: u32,
        bdev_name: &str,
    ) -> Result<(), BackendError> {
        let args = ScsiLunArgs {
            ctrlr: controller,
            scsi_target_num,
            bdev_name,
        };
        let _: serde_json::Value = self.call("add_vhost_scsi_lun", Some(args)).await?;
        Ok(())
    }

    async fn remove_vhost_scsi_target(
        &self,
        controller: &str,
        scsi_target_num: u32,
    ) -> Result<(), BackendError> {
        let args = ScsiTargetArgs {
            ctrlr: controller,
            scsi_target_num,
        };
        let _: serde_json::Value = self.call("remove_vhost_scsi_target", Some(args)).await?;
        Ok(())
    }
}
