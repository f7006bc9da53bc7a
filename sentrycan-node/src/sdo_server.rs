//! SDO server
//!
//! Serves expedited and segmented transfers on the node's SDO server
//! channel. Block transfers are not supported; block initiations are aborted
//! with an invalid-command-specifier code.
//!
//! Received requests are staged by the [`SdoReceiver`] (fed from the receive
//! context) and consumed from [`SdoServer::process`] during the node tick.
//! Errors returned by object dictionary access are funneled into the abort
//! code of the current transfer.

use sentrycan_common::{
    objects::{DataType, ObjectId, SubInfo},
    sdo::{AbortCode, SdoRequest, SdoResponse},
    AtomicCell,
};

use crate::object_dict::{find_object, ODEntry, ObjectAccess};

/// Size of the transfer assembly buffer; bounds the largest sub-object which
/// can be transferred over SDO
const SDO_BUF_SIZE: usize = 256;

/// Number of microseconds to wait for a message before timing out an SDO
/// transaction
const SDO_TIMEOUT_US: u32 = 25_000;

/// Staging cell for SDO requests, shared with the receive context
#[allow(missing_debug_implementations)]
pub struct SdoReceiver {
    request: AtomicCell<Option<SdoRequest>>,
    timer: AtomicCell<u32>,
}

impl Default for SdoReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl SdoReceiver {
    /// Create an empty receiver
    pub const fn new() -> Self {
        Self {
            request: AtomicCell::new(None),
            timer: AtomicCell::new(0),
        }
    }

    /// Handle a received request frame; safe to call from interrupt context
    ///
    /// Returns true when a request was staged and a process call is needed.
    pub fn handle_req(&self, msg_data: &[u8]) -> bool {
        // Ignore invalid lengths
        if msg_data.len() != 8 {
            return false;
        }
        match SdoRequest::try_from(msg_data) {
            Ok(req) => {
                self.request.store(Some(req));
                self.timer.store(0);
                true
            }
            Err(_) => false,
        }
    }

    fn take_request(&self) -> Option<SdoRequest> {
        self.request.take()
    }

    fn increment_timer(&self, elapsed_us: u32) -> u32 {
        let timer = self.timer.load().saturating_add(elapsed_us);
        self.timer.store(timer);
        timer
    }
}

#[derive(Clone, Copy)]
struct Transfer {
    index: u16,
    sub: u8,
    toggle: bool,
    pos: usize,
    /// Total bytes for an upload; announced size for a download (0 when the
    /// client did not provide one)
    total: usize,
}

enum SdoState {
    Idle,
    DownloadSegmented(Transfer),
    UploadSegmented(Transfer),
}

fn validate_download_size(dl_size: usize, subobj: &SubInfo) -> Result<(), AbortCode> {
    if subobj.size == 0 {
        // Some objects (e.g. domains) do not provide a size; the write
        // itself decides
        return Ok(());
    }
    if subobj.data_type.is_str() || matches!(subobj.data_type, DataType::Domain) {
        // Strings can write shorter lengths
        if dl_size > subobj.size {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
    } else {
        // All other types require exact size
        if dl_size < subobj.size {
            return Err(AbortCode::DataTypeMismatchLengthLow);
        } else if dl_size > subobj.size {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
    }
    Ok(())
}

/// The SDO server state machine
#[allow(missing_debug_implementations)]
pub struct SdoServer {
    state: SdoState,
    buffer: [u8; SDO_BUF_SIZE],
}

impl Default for SdoServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SdoServer {
    /// Create a new server in the idle state
    pub fn new() -> Self {
        Self {
            state: SdoState::Idle,
            buffer: [0; SDO_BUF_SIZE],
        }
    }

    /// Abort any transfer in progress, e.g. at communication reset
    pub fn reset(&mut self) {
        self.state = SdoState::Idle;
    }

    /// Run one step of the server
    ///
    /// Returns the response to transmit (if any) and the id of an object
    /// updated by a completed download (if any).
    pub fn process(
        &mut self,
        rx: &SdoReceiver,
        elapsed_us: u32,
        od: &[ODEntry<'_>],
    ) -> (Option<SdoResponse>, Option<ObjectId>) {
        let req = match rx.take_request() {
            Some(req) => req,
            None => {
                // Time out a pending transfer when the client goes quiet
                if !matches!(self.state, SdoState::Idle)
                    && rx.increment_timer(elapsed_us) > SDO_TIMEOUT_US
                {
                    let (index, sub) = match &self.state {
                        SdoState::DownloadSegmented(t) | SdoState::UploadSegmented(t) => {
                            (t.index, t.sub)
                        }
                        SdoState::Idle => unreachable!(),
                    };
                    self.state = SdoState::Idle;
                    return (
                        Some(SdoResponse::abort(index, sub, AbortCode::SdoTimeout)),
                        None,
                    );
                }
                return (None, None);
            }
        };

        match &self.state {
            SdoState::Idle => self.handle_idle(req, od),
            SdoState::DownloadSegmented(transfer) => {
                let transfer = *transfer;
                self.handle_download_segment(req, transfer, od)
            }
            SdoState::UploadSegmented(transfer) => {
                let transfer = *transfer;
                self.handle_upload_segment(req, transfer)
            }
        }
    }

    fn abort(
        &mut self,
        index: u16,
        sub: u8,
        code: AbortCode,
    ) -> (Option<SdoResponse>, Option<ObjectId>) {
        self.state = SdoState::Idle;
        (Some(SdoResponse::abort(index, sub, code)), None)
    }

    fn handle_idle(
        &mut self,
        req: SdoRequest,
        od: &[ODEntry<'_>],
    ) -> (Option<SdoResponse>, Option<ObjectId>) {
        match req {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                let obj = match find_object(od, index) {
                    Some(obj) => obj,
                    None => return self.abort(index, sub, AbortCode::NoSuchObject),
                };
                let subinfo = match obj.sub_info(sub) {
                    Ok(info) => info,
                    Err(code) => return self.abort(index, sub, code),
                };
                if !subinfo.access_type.is_writable() {
                    return self.abort(index, sub, AbortCode::ReadOnly);
                }

                if e {
                    // Expedited download carries the data in the initiation
                    let dl_size = 4 - n as usize;
                    if let Err(code) = validate_download_size(dl_size, &subinfo) {
                        return self.abort(index, sub, code);
                    }
                    if let Err(code) = obj.write(sub, &data[0..dl_size]) {
                        return self.abort(index, sub, code);
                    }
                    (
                        Some(SdoResponse::download_acknowledge(index, sub)),
                        Some(ObjectId { index, sub }),
                    )
                } else {
                    // Start a segmented download
                    let mut total = 0;
                    if s {
                        total = u32::from_le_bytes(data) as usize;
                        if let Err(code) = validate_download_size(total, &subinfo) {
                            return self.abort(index, sub, code);
                        }
                        if total > SDO_BUF_SIZE {
                            return self.abort(index, sub, AbortCode::OutOfMemory);
                        }
                    }
                    self.state = SdoState::DownloadSegmented(Transfer {
                        index,
                        sub,
                        toggle: false,
                        pos: 0,
                        total,
                    });
                    (Some(SdoResponse::download_acknowledge(index, sub)), None)
                }
            }
            SdoRequest::InitiateUpload { index, sub } => {
                let obj = match find_object(od, index) {
                    Some(obj) => obj,
                    None => return self.abort(index, sub, AbortCode::NoSuchObject),
                };
                match obj.read_size(sub) {
                    Ok(size) if size > SDO_BUF_SIZE => {
                        return self.abort(index, sub, AbortCode::OutOfMemory)
                    }
                    Err(code) => return self.abort(index, sub, code),
                    _ => (),
                }
                let read_size = match obj.read(sub, 0, &mut self.buffer) {
                    Ok(size) => size,
                    Err(code) => return self.abort(index, sub, code),
                };

                if read_size <= 4 {
                    (
                        Some(SdoResponse::expedited_upload(
                            index,
                            sub,
                            &self.buffer[..read_size],
                        )),
                        None,
                    )
                } else {
                    self.state = SdoState::UploadSegmented(Transfer {
                        index,
                        sub,
                        toggle: false,
                        pos: 0,
                        total: read_size,
                    });
                    (
                        Some(SdoResponse::upload_acknowledge(
                            index,
                            sub,
                            Some(read_size as u32),
                        )),
                        None,
                    )
                }
            }
            SdoRequest::InitiateBlockDownload { index, sub }
            | SdoRequest::InitiateBlockUpload { index, sub } => {
                self.abort(index, sub, AbortCode::InvalidCommandSpecifier)
            }
            SdoRequest::Abort { .. } => (None, None),
            _ => self.abort(0, 0, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn handle_download_segment(
        &mut self,
        req: SdoRequest,
        mut transfer: Transfer,
        od: &[ODEntry<'_>],
    ) -> (Option<SdoResponse>, Option<ObjectId>) {
        let (index, sub) = (transfer.index, transfer.sub);
        match req {
            SdoRequest::DownloadSegment { t, n, c, data } => {
                if t != transfer.toggle {
                    return self.abort(index, sub, AbortCode::ToggleNotAlternated);
                }
                let segment_size = 7 - n as usize;
                if transfer.pos + segment_size > SDO_BUF_SIZE {
                    return self.abort(index, sub, AbortCode::OutOfMemory);
                }
                self.buffer[transfer.pos..transfer.pos + segment_size]
                    .copy_from_slice(&data[..segment_size]);
                transfer.pos += segment_size;

                if c {
                    let obj = match find_object(od, index) {
                        Some(obj) => obj,
                        None => return self.abort(index, sub, AbortCode::NoSuchObject),
                    };
                    if let Ok(subinfo) = obj.sub_info(sub) {
                        if let Err(code) = validate_download_size(transfer.pos, &subinfo) {
                            return self.abort(index, sub, code);
                        }
                    }
                    if let Err(code) = obj.write(sub, &self.buffer[..transfer.pos]) {
                        return self.abort(index, sub, code);
                    }
                    self.state = SdoState::Idle;
                    (
                        Some(SdoResponse::download_segment_acknowledge(t)),
                        Some(ObjectId { index, sub }),
                    )
                } else {
                    transfer.toggle = !transfer.toggle;
                    self.state = SdoState::DownloadSegmented(transfer);
                    (Some(SdoResponse::download_segment_acknowledge(t)), None)
                }
            }
            SdoRequest::Abort { .. } => {
                self.state = SdoState::Idle;
                (None, None)
            }
            _ => self.abort(index, sub, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn handle_upload_segment(
        &mut self,
        req: SdoRequest,
        mut transfer: Transfer,
    ) -> (Option<SdoResponse>, Option<ObjectId>) {
        let (index, sub) = (transfer.index, transfer.sub);
        match req {
            SdoRequest::ReqUploadSegment { t } => {
                if t != transfer.toggle {
                    return self.abort(index, sub, AbortCode::ToggleNotAlternated);
                }
                let remaining = transfer.total - transfer.pos;
                let n = remaining.min(7);
                let c = transfer.pos + n >= transfer.total;
                let response =
                    SdoResponse::upload_segment(t, c, &self.buffer[transfer.pos..transfer.pos + n]);
                transfer.pos += n;
                if c {
                    self.state = SdoState::Idle;
                } else {
                    transfer.toggle = !transfer.toggle;
                    self.state = SdoState::UploadSegmented(transfer);
                }
                (Some(response), None)
            }
            SdoRequest::Abort { .. } => {
                self.state = SdoState::Idle;
                (None, None)
            }
            _ => self.abort(index, sub, AbortCode::InvalidCommandSpecifier),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_dict::{NullTermByteField, ProvidesSubObjects, ScalarField, SubObjectAccess};
    use sentrycan_common::objects::ObjectCode;

    struct TestObj {
        value: ScalarField<u32>,
        name: NullTermByteField<20>,
    }

    impl ProvidesSubObjects for TestObj {
        fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
            match sub {
                1 => Some((SubInfo::new_u32().rw_access(), &self.value)),
                2 => Some((SubInfo::new_visible_str(20).rw_access(), &self.name)),
                _ => None,
            }
        }

        fn object_code(&self) -> ObjectCode {
            ObjectCode::Record
        }
    }

    fn test_od() -> &'static [ODEntry<'static>] {
        extern crate std;
        let obj = std::boxed::Box::leak(std::boxed::Box::new(TestObj {
            value: ScalarField::<u32>::new(0),
            name: NullTermByteField::new([0; 20]),
        }));
        std::boxed::Box::leak(std::boxed::Box::new([ODEntry {
            index: 0x2000,
            data: obj,
        }]))
    }

    fn request(server: &mut SdoServer, rx: &SdoReceiver, od: &[ODEntry], req: SdoRequest) -> SdoResponse {
        rx.handle_req(&req.to_bytes());
        let (resp, _) = server.process(rx, 0, od);
        resp.expect("expected a response")
    }

    #[test]
    fn test_expedited_download_upload() {
        let od = test_od();
        let rx = SdoReceiver::new();
        let mut server = SdoServer::new();

        let resp = request(
            &mut server,
            &rx,
            od,
            SdoRequest::expedited_download(0x2000, 1, &0xDEADBEEFu32.to_le_bytes()),
        );
        assert_eq!(resp, SdoResponse::download_acknowledge(0x2000, 1));

        let resp = request(&mut server, &rx, od, SdoRequest::initiate_upload(0x2000, 1));
        assert_eq!(
            resp,
            SdoResponse::expedited_upload(0x2000, 1, &0xDEADBEEFu32.to_le_bytes())
        );
    }

    #[test]
    fn test_segmented_download_and_upload() {
        let od = test_od();
        let rx = SdoReceiver::new();
        let mut server = SdoServer::new();

        let text = b"hello world";
        let resp = request(
            &mut server,
            &rx,
            od,
            SdoRequest::initiate_download(0x2000, 2, Some(text.len() as u32)),
        );
        assert_eq!(resp, SdoResponse::download_acknowledge(0x2000, 2));

        let resp = request(
            &mut server,
            &rx,
            od,
            SdoRequest::download_segment(false, false, &text[0..7]),
        );
        assert_eq!(resp, SdoResponse::download_segment_acknowledge(false));
        let resp = request(
            &mut server,
            &rx,
            od,
            SdoRequest::download_segment(true, true, &text[7..]),
        );
        assert_eq!(resp, SdoResponse::download_segment_acknowledge(true));

        // Read it back with a segmented upload
        let resp = request(&mut server, &rx, od, SdoRequest::initiate_upload(0x2000, 2));
        assert_eq!(
            resp,
            SdoResponse::upload_acknowledge(0x2000, 2, Some(text.len() as u32))
        );
        let resp = request(
            &mut server,
            &rx,
            od,
            SdoRequest::upload_segment_request(false),
        );
        assert_eq!(resp, SdoResponse::upload_segment(false, false, &text[0..7]));
        let resp = request(&mut server, &rx, od, SdoRequest::upload_segment_request(true));
        assert_eq!(resp, SdoResponse::upload_segment(true, true, &text[7..]));
    }

    #[test]
    fn test_toggle_error_aborts() {
        let od = test_od();
        let rx = SdoReceiver::new();
        let mut server = SdoServer::new();

        request(
            &mut server,
            &rx,
            od,
            SdoRequest::initiate_download(0x2000, 2, None),
        );
        let resp = request(
            &mut server,
            &rx,
            od,
            SdoRequest::download_segment(true, false, &[0; 7]),
        );
        assert_eq!(
            resp,
            SdoResponse::abort(0x2000, 2, AbortCode::ToggleNotAlternated)
        );
    }

    #[test]
    fn test_unknown_object_aborts() {
        let od = test_od();
        let rx = SdoReceiver::new();
        let mut server = SdoServer::new();
        let resp = request(&mut server, &rx, od, SdoRequest::initiate_upload(0x5555, 0));
        assert_eq!(resp, SdoResponse::abort(0x5555, 0, AbortCode::NoSuchObject));
    }

    #[test]
    fn test_block_download_aborts() {
        let od = test_od();
        let rx = SdoReceiver::new();
        let mut server = SdoServer::new();
        let mut bytes = [0u8; 8];
        bytes[0] = 6 << 5;
        bytes[1..3].copy_from_slice(&0x2000u16.to_le_bytes());
        bytes[3] = 1;
        rx.handle_req(&bytes);
        let (resp, _) = server.process(&rx, 0, od);
        assert_eq!(
            resp.unwrap(),
            SdoResponse::abort(0x2000, 1, AbortCode::InvalidCommandSpecifier)
        );
    }

    #[test]
    fn test_timeout_aborts() {
        let od = test_od();
        let rx = SdoReceiver::new();
        let mut server = SdoServer::new();
        request(
            &mut server,
            &rx,
            od,
            SdoRequest::initiate_download(0x2000, 2, None),
        );
        let (resp, _) = server.process(&rx, SDO_TIMEOUT_US + 1, od);
        assert_eq!(
            resp.unwrap(),
            SdoResponse::abort(0x2000, 2, AbortCode::SdoTimeout)
        );
    }
}
