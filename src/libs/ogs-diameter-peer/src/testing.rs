//! In-memory peer for unit tests

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::avp::{Avp, AvpData};
use crate::common::avp_code;
use crate::config::{PeerIdentity, PeerSettings};
use crate::connection::{Connection, ConnectionContext};
use crate::dict::{Dictionary, HELLO_DICTIONARY};
use crate::handler::HandlerRegistry;
use crate::message::{base_cmd, DiameterMessage, DIAMETER_HEADER_SIZE};
use crate::peer::DiameterClient;
use crate::report::error_channel;
use crate::transport::{self, BoxedReader, DiameterStream, Frame, MessageReader};

pub(crate) const FAKE_PEER_ADDR: &str = "fake-peer";

pub(crate) fn hello_dictionary() -> Arc<Dictionary> {
    Arc::new(Dictionary::from_yaml_str(HELLO_DICTIONARY).unwrap())
}

pub(crate) fn client_identity() -> PeerIdentity {
    let mut identity = PeerIdentity::new("client", "client_realm")
        .with_host_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
    identity.vendor_id = 13;
    identity.firmware_revision = 1;
    identity
}

pub(crate) fn client_settings() -> PeerSettings {
    PeerSettings {
        auth_application_ids: vec![4],
        acct_application_ids: vec![999],
        ..Default::default()
    }
}

pub(crate) fn settings_without_watchdog() -> PeerSettings {
    PeerSettings {
        enable_watchdog: false,
        ..client_settings()
    }
}

pub(crate) fn client(settings: PeerSettings) -> DiameterClient {
    DiameterClient::new(client_identity(), settings, hello_dictionary())
}

/// Handshake `client` with a fake peer answering CER with success
pub(crate) async fn open_connection(client: &DiameterClient) -> (Connection, FakePeer) {
    open_connection_with_buffer(client, 64 * 1024).await
}

/// Like `open_connection`, over a pipe buffering at most `buffer` bytes
/// each way
pub(crate) async fn open_connection_with_buffer(
    client: &DiameterClient,
    buffer: usize,
) -> (Connection, FakePeer) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (local, remote) = tokio::io::duplex(buffer);
    let mut peer = FakePeer::new(remote);
    let (conn, _) = tokio::join!(
        client.connect_stream(local, FAKE_PEER_ADDR),
        peer.accept_cer()
    );
    (conn.unwrap(), peer)
}

/// A connection in state Connecting with no reader task
pub(crate) fn detached_connection() -> (Connection, FakePeer) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (reporter, _) = error_channel(16);
    let context = ConnectionContext {
        identity: Arc::new(client_identity()),
        settings: Arc::new(client_settings()),
        dictionary: hello_dictionary(),
        handlers: Arc::new(HandlerRegistry::new()),
        reporter,
    };
    let (_, writer) = transport::split(local);
    let conn = Connection::new(context, FAKE_PEER_ADDR.to_string(), writer);
    (conn, FakePeer::new(remote))
}

pub(crate) struct FakePeer {
    reader: BoxedReader,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub(crate) host: String,
    pub(crate) realm: String,
}

impl FakePeer {
    pub(crate) fn new<S: DiameterStream>(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: MessageReader::new(Box::new(read_half)),
            writer: Box::new(write_half),
            host: "server".to_string(),
            realm: "server_realm".to_string(),
        }
    }

    /// Next decodable message; `None` once the client side is gone
    pub(crate) async fn recv(&mut self) -> Option<DiameterMessage> {
        loop {
            match self.reader.recv().await {
                Ok(Frame::Message(msg)) => return Some(msg),
                Ok(Frame::Malformed(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Like `recv`, but gives up after `wait`
    pub(crate) async fn recv_within(&mut self, wait: Duration) -> Option<DiameterMessage> {
        tokio::time::timeout(wait, self.recv()).await.ok().flatten()
    }

    pub(crate) async fn send(&mut self, msg: &DiameterMessage) {
        self.send_raw(&msg.encode()).await;
    }

    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub(crate) fn add_origin(&self, msg: &mut DiameterMessage) {
        msg.add_avp(Avp::identity(avp_code::ORIGIN_HOST, &self.host));
        msg.add_avp(Avp::identity(avp_code::ORIGIN_REALM, &self.realm));
    }

    /// Answer to `request` carrying its Session-Id and `result_code`
    pub(crate) fn answer(&self, request: &DiameterMessage, result_code: u32) -> DiameterMessage {
        let mut answer = DiameterMessage::new_answer(request);
        if let Some(session_id) = request.session_id() {
            answer.add_avp(Avp::utf8(avp_code::SESSION_ID, session_id));
        }
        answer.add_avp(Avp::unsigned32(avp_code::RESULT_CODE, result_code));
        self.add_origin(&mut answer);
        answer
    }

    /// CEA advertising the hello application (acct 999) and auth app 4
    pub(crate) fn capabilities_answer(&self, cer: &DiameterMessage, result_code: u32) -> DiameterMessage {
        let mut cea = self.answer(cer, result_code);
        cea.add_avp(Avp::mandatory(
            avp_code::HOST_IP_ADDRESS,
            AvpData::Address(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2))),
        ));
        cea.add_avp(Avp::unsigned32(avp_code::VENDOR_ID, 0));
        cea.add_avp(Avp::optional(
            avp_code::PRODUCT_NAME,
            AvpData::Utf8String("fake-peer".to_string()),
        ));
        cea.add_avp(Avp::unsigned32(avp_code::AUTH_APPLICATION_ID, 4));
        cea.add_avp(Avp::unsigned32(avp_code::ACCT_APPLICATION_ID, 999));
        cea
    }

    /// Receive a CER and answer it with success
    pub(crate) async fn accept_cer(&mut self) -> DiameterMessage {
        let cer = self.recv().await.expect("CER");
        assert_eq!(cer.header.command_code, base_cmd::CAPABILITIES_EXCHANGE);
        assert!(cer.header.is_request());
        let cea = self.capabilities_answer(&cer, 2001);
        self.send(&cea).await;
        cer
    }

    /// Hello request from this peer towards the client
    pub(crate) fn hello_request(&self, session_id: &str) -> DiameterMessage {
        let mut request = DiameterMessage::new_request(111, 999);
        request.header.hop_by_hop_id = 0x1000;
        request.header.end_to_end_id = 0x2000;
        request.add_avp(Avp::utf8(avp_code::SESSION_ID, session_id));
        self.add_origin(&mut request);
        request.add_avp(Avp::identity(avp_code::DESTINATION_REALM, "client_realm"));
        request.add_avp(Avp::identity(avp_code::DESTINATION_HOST, "client"));
        request
    }

    /// A complete frame whose only AVP overruns the message
    pub(crate) fn malformed_frame() -> Vec<u8> {
        let mut dwr = DiameterMessage::new_base_request(base_cmd::DEVICE_WATCHDOG);
        dwr.add_avp(Avp::identity(avp_code::ORIGIN_HOST, "server"));
        let mut wire = dwr.encode().to_vec();
        wire[DIAMETER_HEADER_SIZE + 7] = 0xff;
        wire
    }
}
