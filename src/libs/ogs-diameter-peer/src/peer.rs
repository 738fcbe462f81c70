//! Diameter client peer per RFC 6733 Section 5
//!
//! [`DiameterClient`] dials a remote peer and drives the initiator side of
//! the peer state machine:
//! - Capabilities Exchange (CER/CEA), retransmitted until answered or
//!   `max_retransmits` is reached
//! - Device Watchdog (DWR/DWA) once the connection has been idle for the
//!   watchdog interval (RFC 3539)
//! - Disconnect Peer (DPR/DPA) through [`Connection::close`]

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use crate::avp::{Avp, AvpData};
use crate::common::{avp_code, RELAY_APPLICATION_ID};
use crate::config::{PeerEndpoint, PeerIdentity, PeerSettings};
use crate::connection::{Connection, ConnectionContext, ConnectionState, RemotePeerMetadata};
use crate::dict::Dictionary;
use crate::error::{is_success_code, DiameterError, PeerError, PeerResult};
use crate::handler::HandlerRegistry;
use crate::message::{base_cmd, CommandId, DiameterMessage};
use crate::report::{error_channel, ErrorCause, ErrorReports};
use crate::tls::{dial_tls, TlsSettings};
use crate::transport::{self, dial_tcp, DiameterStream};

/// Initiating Diameter peer.
///
/// Handlers and the error report channel are shared by every connection
/// the client opens.
pub struct DiameterClient {
    context: ConnectionContext,
    reports: Mutex<Option<ErrorReports>>,
}

impl DiameterClient {
    pub fn new(identity: PeerIdentity, settings: PeerSettings, dictionary: Arc<Dictionary>) -> Self {
        let (reporter, reports) = error_channel(settings.error_report_capacity);
        Self {
            context: ConnectionContext {
                identity: Arc::new(identity),
                settings: Arc::new(settings),
                dictionary,
                handlers: Arc::new(HandlerRegistry::new()),
                reporter,
            },
            reports: Mutex::new(Some(reports)),
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.context.identity
    }

    pub fn settings(&self) -> &PeerSettings {
        &self.context.settings
    }

    pub fn dictionary(&self) -> &Arc<Dictionary> {
        &self.context.dictionary
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.context.handlers
    }

    /// Register a handler for inbound `command`; the last registration wins
    pub fn handle<F>(&self, command: CommandId, handler: F)
    where
        F: Fn(&Connection, DiameterMessage) + Send + Sync + 'static,
    {
        self.context.handlers.register(command, handler);
    }

    /// Register a handler by short command name, e.g. `HMA`
    pub fn handle_name<F>(&self, name: &str, handler: F) -> PeerResult<()>
    where
        F: Fn(&Connection, DiameterMessage) + Send + Sync + 'static,
    {
        let command = self
            .context
            .dictionary
            .command_id(name)
            .ok_or_else(|| PeerError::UnknownCommand(name.to_string()))?;
        self.handle(command, handler);
        Ok(())
    }

    /// Take the receiving end of the error report channel.
    ///
    /// Returns `None` after the first call.
    pub fn error_reports(&self) -> Option<ErrorReports> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Dial `address` over TCP and complete the capabilities exchange
    pub async fn connect(&self, address: &str) -> PeerResult<Connection> {
        let (stream, peer_addr) = dial_tcp(address, self.settings().dial_timeout)
            .await
            .inspect_err(|e| self.report(ErrorCause::Dial, Some(address), e))?;
        let local_ip = stream.local_addr().ok().map(|a| a.ip());
        self.establish(stream, peer_addr, local_ip).await
    }

    /// Dial `address`, run a TLS handshake, then the capabilities exchange
    pub async fn connect_tls(&self, address: &str, tls: &TlsSettings) -> PeerResult<Connection> {
        let (stream, peer_addr) = dial_tls(address, tls, self.settings().dial_timeout)
            .await
            .inspect_err(|e| self.report(ErrorCause::Dial, Some(address), e))?;
        let local_ip = stream.get_ref().0.local_addr().ok().map(|a| a.ip());
        self.establish(stream, peer_addr, local_ip).await
    }

    /// Connect to a configured endpoint, with TLS when it carries TLS settings
    pub async fn connect_endpoint(&self, endpoint: &PeerEndpoint) -> PeerResult<Connection> {
        match &endpoint.tls {
            Some(tls) => self.connect_tls(&endpoint.address, tls).await,
            None => self.connect(&endpoint.address).await,
        }
    }

    /// Run the capabilities exchange over an already established stream
    pub async fn connect_stream<S: DiameterStream>(
        &self,
        stream: S,
        peer_addr: impl Into<String>,
    ) -> PeerResult<Connection> {
        self.establish(stream, peer_addr.into(), None).await
    }

    fn report(&self, cause: ErrorCause, peer: Option<&str>, error: &PeerError) {
        self.context.reporter.report(cause, peer, error.to_string());
    }

    async fn establish<S: DiameterStream>(
        &self,
        stream: S,
        peer_addr: String,
        local_ip: Option<IpAddr>,
    ) -> PeerResult<Connection> {
        let (reader, writer) = transport::split(stream);
        let conn = Connection::new(self.context.clone(), peer_addr, writer);
        conn.spawn_reader(reader);

        match self.handshake(&conn, local_ip).await {
            Ok(metadata) => {
                log::info!(
                    "[{}] peer open: host={}, realm={}",
                    conn.peer_addr(),
                    metadata.origin_host,
                    metadata.origin_realm
                );
                if !conn.open(metadata) {
                    return Err(PeerError::ConnectionClosed);
                }
            }
            Err(e) => {
                let cause = match e {
                    PeerError::HandshakeTimeout { .. } => ErrorCause::HandshakeTimeout,
                    _ => ErrorCause::HandshakeFailed,
                };
                self.report(cause, Some(conn.peer_addr()), &e);
                conn.teardown("capabilities exchange failed");
                return Err(e);
            }
        }

        if self.settings().enable_watchdog {
            conn.spawn_task(run_watchdog(conn.clone()));
        }
        Ok(conn)
    }

    async fn handshake(
        &self,
        conn: &Connection,
        local_ip: Option<IpAddr>,
    ) -> PeerResult<RemotePeerMetadata> {
        conn.transition(ConnectionState::Handshaking);
        let settings = self.settings();
        let cer = build_cer(self.identity(), settings, local_ip);

        log::debug!("[{}] sending CER", conn.peer_addr());
        let cea = conn
            .exchange_base(cer, settings.max_retransmits, settings.retransmit_interval)
            .await?
            .ok_or(PeerError::HandshakeTimeout {
                retransmits: settings.max_retransmits,
            })?;
        check_cea(&cea, settings)
    }
}

impl std::fmt::Debug for DiameterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiameterClient")
            .field("origin_host", &self.context.identity.origin_host)
            .field("handlers", &self.context.handlers)
            .finish()
    }
}

fn build_cer(identity: &PeerIdentity, settings: &PeerSettings, local_ip: Option<IpAddr>) -> DiameterMessage {
    let mut cer = DiameterMessage::new_base_request(base_cmd::CAPABILITIES_EXCHANGE);
    cer.add_avp(Avp::identity(avp_code::ORIGIN_HOST, &identity.origin_host));
    cer.add_avp(Avp::identity(avp_code::ORIGIN_REALM, &identity.origin_realm));

    let addresses: Vec<IpAddr> = if identity.host_addresses.is_empty() {
        local_ip.into_iter().collect()
    } else {
        identity.host_addresses.iter().copied().collect()
    };
    for addr in addresses {
        cer.add_avp(Avp::mandatory(avp_code::HOST_IP_ADDRESS, AvpData::Address(addr)));
    }

    cer.add_avp(Avp::unsigned32(avp_code::VENDOR_ID, identity.vendor_id));
    cer.add_avp(Avp::optional(
        avp_code::PRODUCT_NAME,
        AvpData::Utf8String(identity.product_name.clone()),
    ));
    cer.add_avp(Avp::unsigned32(avp_code::ORIGIN_STATE_ID, identity.origin_state_id));
    for id in &settings.auth_application_ids {
        cer.add_avp(Avp::unsigned32(avp_code::AUTH_APPLICATION_ID, *id));
    }
    for id in &settings.acct_application_ids {
        cer.add_avp(Avp::unsigned32(avp_code::ACCT_APPLICATION_ID, *id));
    }
    cer.add_avp(Avp::optional(
        avp_code::FIRMWARE_REVISION,
        AvpData::Unsigned32(identity.firmware_revision),
    ));
    cer
}

/// Auth/Acct application ids in `msg`, including vendor-specific ones
fn advertised_applications(msg: &DiameterMessage) -> Vec<u32> {
    let is_app_id =
        |avp: &&Avp| avp.code == avp_code::AUTH_APPLICATION_ID || avp.code == avp_code::ACCT_APPLICATION_ID;

    let mut ids: Vec<u32> = msg.avps.iter().filter(is_app_id).filter_map(Avp::as_u32).collect();
    for vsa in msg.find_all_avps(avp_code::VENDOR_SPECIFIC_APPLICATION_ID) {
        match vsa.grouped() {
            Ok(members) => ids.extend(members.iter().filter(is_app_id).filter_map(Avp::as_u32)),
            Err(e) => log::debug!("Ignoring undecodable Vendor-Specific-Application-Id: {e}"),
        }
    }
    ids
}

fn check_cea(cea: &DiameterMessage, settings: &PeerSettings) -> PeerResult<RemotePeerMetadata> {
    let result_code = cea
        .result_code()
        .ok_or_else(|| PeerError::InvalidMessage(DiameterError::MissingAvp("Result-Code".into())))?;
    if !is_success_code(result_code) {
        return Err(PeerError::HandshakeRejected { result_code });
    }

    let origin_host = cea
        .origin_host()
        .ok_or_else(|| PeerError::InvalidMessage(DiameterError::MissingAvp("Origin-Host".into())))?
        .to_string();
    let origin_realm = cea
        .origin_realm()
        .ok_or_else(|| PeerError::InvalidMessage(DiameterError::MissingAvp("Origin-Realm".into())))?
        .to_string();

    let application_ids = advertised_applications(cea);
    let relay = application_ids.contains(&RELAY_APPLICATION_ID);
    let mut accepted = settings.accepted_application_ids().peekable();
    if accepted.peek().is_some() && !relay && !accepted.any(|id| application_ids.contains(&id)) {
        return Err(PeerError::NoCommonApplication { peer: origin_host });
    }

    Ok(RemotePeerMetadata {
        origin_host,
        origin_realm,
        application_ids,
    })
}

/// Send DWR whenever nothing valid arrived for the watchdog interval.
///
/// A DWR that stays unanswered through every retransmission is a watchdog
/// failure: it is reported once and the connection is torn down.
async fn run_watchdog(conn: Connection) {
    let settings = conn.settings().clone();
    let interval = settings.watchdog_interval;

    while conn.state() == ConnectionState::Open {
        let idle = conn.idle_for();
        if idle < interval {
            tokio::time::sleep(interval - idle).await;
            continue;
        }

        log::debug!("[{}] idle for {idle:?}, sending DWR", conn.peer_addr());
        let outcome = conn
            .exchange_base(conn.build_dwr(), settings.max_retransmits, settings.retransmit_interval)
            .await;
        let failure = match outcome {
            Ok(Some(dwa)) => {
                match dwa.result_code() {
                    Some(code) if is_success_code(code) => {}
                    code => log::warn!("[{}] DWA with Result-Code {code:?}", conn.peer_addr()),
                }
                continue;
            }
            Ok(None) => format!(
                "no DWA after {} retransmission(s)",
                settings.max_retransmits
            ),
            Err(PeerError::ConnectionClosed) => return,
            Err(e) => e.to_string(),
        };

        conn.report(ErrorCause::WatchdogFailure, failure);
        conn.teardown("watchdog failure");
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::avp_code;
    use crate::testing::{self, FakePeer, FAKE_PEER_ADDR};
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::time::Instant;

    fn assert_elapsed(since: Instant, expected: Duration) {
        let elapsed = since.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(50),
            "elapsed {elapsed:?}, expected {expected:?}"
        );
    }

    fn connect(client: &DiameterClient) -> (tokio::task::JoinHandle<PeerResult<Connection>>, FakePeer) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let client = DiameterClient {
            context: client.context.clone(),
            reports: Mutex::new(None),
        };
        let task = tokio::spawn(async move { client.connect_stream(local, FAKE_PEER_ADDR).await });
        (task, FakePeer::new(remote))
    }

    #[tokio::test]
    async fn test_handshake_opens_connection() {
        let client = testing::client(testing::settings_without_watchdog());
        let (conn, peer) = testing::open_connection(&client).await;

        assert_eq!(conn.state(), ConnectionState::Open);
        let metadata = conn.peer_metadata().unwrap();
        assert_eq!(metadata.origin_host, peer.host);
        assert_eq!(metadata.origin_realm, peer.realm);
        assert!(metadata.application_ids.contains(&999));
    }

    #[tokio::test]
    async fn test_cer_contents() {
        let client = testing::client(testing::settings_without_watchdog());
        let (task, mut peer) = connect(&client);
        let cer = peer.accept_cer().await;
        task.await.unwrap().unwrap();

        assert!(!cer.header.is_proxiable());
        assert!(!cer.header.is_retransmit());
        assert_eq!(cer.origin_host(), Some("client"));
        assert_eq!(cer.origin_realm(), Some("client_realm"));
        assert_eq!(
            cer.find_avp(avp_code::HOST_IP_ADDRESS).and_then(Avp::as_address),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert_eq!(cer.find_avp(avp_code::VENDOR_ID).and_then(Avp::as_u32), Some(13));
        assert_eq!(
            cer.find_avp(avp_code::PRODUCT_NAME).and_then(Avp::as_utf8_string),
            Some(crate::config::DEFAULT_PRODUCT_NAME)
        );
        assert_eq!(
            cer.find_avp(avp_code::AUTH_APPLICATION_ID).and_then(Avp::as_u32),
            Some(4)
        );
        assert_eq!(
            cer.find_avp(avp_code::ACCT_APPLICATION_ID).and_then(Avp::as_u32),
            Some(999)
        );
        assert_eq!(
            cer.find_avp(avp_code::FIRMWARE_REVISION).and_then(Avp::as_u32),
            Some(1)
        );
        assert!(cer.has_avp(avp_code::ORIGIN_STATE_ID));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_after_retransmits() {
        let settings = PeerSettings {
            max_retransmits: 3,
            retransmit_interval: Duration::from_secs(1),
            ..testing::client_settings()
        };
        let client = testing::client(settings);
        let mut reports = client.error_reports().unwrap();
        let started = Instant::now();
        let (task, mut peer) = connect(&client);

        let mut cers = Vec::new();
        while let Some(cer) = peer.recv().await {
            cers.push(cer);
        }
        let result = task.await.unwrap();

        assert!(matches!(
            result,
            Err(PeerError::HandshakeTimeout { retransmits: 3 })
        ));
        assert_elapsed(started, Duration::from_secs(4));
        assert_eq!(cers.len(), 4);
        assert!(!cers[0].header.is_retransmit());
        for cer in &cers[1..] {
            assert!(cer.header.is_retransmit());
            assert_eq!(cer.header.hop_by_hop_id, cers[0].header.hop_by_hop_id);
            assert_eq!(cer.header.end_to_end_id, cers[0].header.end_to_end_id);
        }
        assert_eq!(reports.recv().await.unwrap().cause, ErrorCause::HandshakeTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_cea_after_retransmit_accepted() {
        let client = testing::client(testing::settings_without_watchdog());
        let (task, mut peer) = connect(&client);

        let first = peer.recv().await.unwrap();
        let retransmitted = peer.recv().await.unwrap();
        assert!(retransmitted.header.is_retransmit());
        let cea = peer.capabilities_answer(&first, 2001);
        peer.send(&cea).await;

        let conn = task.await.unwrap().unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let client = testing::client(testing::settings_without_watchdog());
        let mut reports = client.error_reports().unwrap();
        let (task, mut peer) = connect(&client);

        let cer = peer.recv().await.unwrap();
        let cea = peer.capabilities_answer(&cer, 5010);
        peer.send(&cea).await;

        assert!(matches!(
            task.await.unwrap(),
            Err(PeerError::HandshakeRejected { result_code: 5010 })
        ));
        assert_eq!(reports.recv().await.unwrap().cause, ErrorCause::HandshakeFailed);
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_handshake_rejected_with_error_bit() {
        let client = testing::client(testing::settings_without_watchdog());
        let (task, mut peer) = connect(&client);

        let cer = peer.recv().await.unwrap();
        let mut cea = peer.answer(&cer, 3010);
        cea.header.set_error();
        peer.send(&cea).await;

        assert!(matches!(
            task.await.unwrap(),
            Err(PeerError::HandshakeRejected { result_code: 3010 })
        ));
    }

    #[tokio::test]
    async fn test_incomplete_cea_fails_handshake() {
        let required = [
            (avp_code::RESULT_CODE, "Result-Code"),
            (avp_code::ORIGIN_HOST, "Origin-Host"),
            (avp_code::ORIGIN_REALM, "Origin-Realm"),
        ];
        for (code, name) in required {
            let client = testing::client(testing::settings_without_watchdog());
            let mut reports = client.error_reports().unwrap();
            let (task, mut peer) = connect(&client);

            let cer = peer.recv().await.unwrap();
            let mut cea = peer.capabilities_answer(&cer, 2001);
            cea.avps.retain(|a| a.code != code);
            peer.send(&cea).await;

            match task.await.unwrap() {
                Err(PeerError::InvalidMessage(DiameterError::MissingAvp(missing))) => {
                    assert_eq!(missing, name)
                }
                other => panic!("expected missing {name}, got {other:?}"),
            }
            // Rejected on the first answer, not retransmitted into a timeout
            assert!(peer.recv().await.is_none());
            let report = reports.recv().await.unwrap();
            assert_eq!(report.cause, ErrorCause::HandshakeFailed);
            assert!(report.detail.contains(name), "{}", report.detail);
            assert!(reports.try_recv().is_none());
        }
    }

    #[tokio::test]
    async fn test_no_common_application() {
        let client = testing::client(testing::settings_without_watchdog());
        let (task, mut peer) = connect(&client);

        let cer = peer.recv().await.unwrap();
        let mut cea = peer.capabilities_answer(&cer, 2001);
        cea.avps.retain(|a| {
            a.code != avp_code::AUTH_APPLICATION_ID && a.code != avp_code::ACCT_APPLICATION_ID
        });
        cea.add_avp(Avp::unsigned32(avp_code::ACCT_APPLICATION_ID, 1000));
        peer.send(&cea).await;

        match task.await.unwrap() {
            Err(PeerError::NoCommonApplication { peer: host }) => assert_eq!(host, "server"),
            other => panic!("expected NoCommonApplication, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_vendor_specific_and_relay_applications() {
        let client = testing::client(testing::settings_without_watchdog());
        let (task, mut peer) = connect(&client);

        let cer = peer.recv().await.unwrap();
        let mut cea = peer.capabilities_answer(&cer, 2001);
        cea.avps.retain(|a| {
            a.code != avp_code::AUTH_APPLICATION_ID && a.code != avp_code::ACCT_APPLICATION_ID
        });
        cea.add_avp(Avp::mandatory(
            avp_code::VENDOR_SPECIFIC_APPLICATION_ID,
            AvpData::Grouped(vec![
                Avp::unsigned32(avp_code::VENDOR_ID, 10415),
                Avp::unsigned32(avp_code::AUTH_APPLICATION_ID, 4),
            ]),
        ));
        peer.send(&cea).await;
        let conn = task.await.unwrap().unwrap();
        assert_eq!(conn.peer_metadata().unwrap().application_ids, vec![4]);

        let (task, mut peer) = connect(&client);
        let cer = peer.recv().await.unwrap();
        let mut cea = peer.answer(&cer, 2001);
        cea.add_avp(Avp::unsigned32(avp_code::AUTH_APPLICATION_ID, RELAY_APPLICATION_ID));
        peer.send(&cea).await;
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_sends_one_dwr_when_idle() {
        let settings = PeerSettings {
            watchdog_interval: Duration::from_secs(5),
            ..testing::client_settings()
        };
        let client = testing::client(settings);
        let mut reports = client.error_reports().unwrap();
        let (conn, mut peer) = testing::open_connection(&client).await;
        let opened = Instant::now();

        let dwr = peer.recv().await.unwrap();
        assert_eq!(dwr.command_id(), CommandId::request(0, base_cmd::DEVICE_WATCHDOG));
        assert_elapsed(opened, Duration::from_secs(5));
        let dwa = peer.answer(&dwr, 2001);
        peer.send(&dwa).await;

        // Nothing else until the link has been idle for another interval
        assert!(peer.recv_within(Duration::from_millis(4900)).await.is_none());
        let dwr = peer.recv().await.unwrap();
        assert_eq!(dwr.header.command_code, base_cmd::DEVICE_WATCHDOG);
        assert!(!dwr.header.is_retransmit());

        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(reports.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_dwa_counts_as_answer() {
        let settings = PeerSettings {
            max_retransmits: 2,
            retransmit_interval: Duration::from_secs(1),
            watchdog_interval: Duration::from_secs(5),
            ..testing::client_settings()
        };
        let client = testing::client(settings);
        let mut reports = client.error_reports().unwrap();
        let (conn, mut peer) = testing::open_connection(&client).await;
        let opened = Instant::now();

        let dwr = peer.recv().await.unwrap();
        let mut dwa = peer.answer(&dwr, 2001);
        dwa.avps.retain(|a| a.code != avp_code::ORIGIN_REALM);
        peer.send(&dwa).await;

        assert!(peer.recv_within(Duration::from_millis(4900)).await.is_none());
        let dwr = peer.recv().await.unwrap();
        assert!(!dwr.header.is_retransmit());
        assert_elapsed(opened, Duration::from_secs(10));
        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(reports.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_traffic_defers_watchdog() {
        let client = testing::client(testing::client_settings());
        let (_conn, mut peer) = testing::open_connection(&client).await;
        let opened = Instant::now();

        tokio::time::sleep(Duration::from_secs(3)).await;
        let mut dwr = DiameterMessage::new_base_request(base_cmd::DEVICE_WATCHDOG);
        peer.add_origin(&mut dwr);
        peer.send(&dwr).await;
        let dwa = peer.recv().await.unwrap();
        assert!(dwa.header.is_answer());

        let dwr = peer.recv().await.unwrap();
        assert!(dwr.header.is_request());
        assert_elapsed(opened, Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_failure_reported_once() {
        let settings = PeerSettings {
            max_retransmits: 2,
            retransmit_interval: Duration::from_secs(1),
            watchdog_interval: Duration::from_secs(5),
            ..testing::client_settings()
        };
        let client = testing::client(settings);
        let mut reports = client.error_reports().unwrap();
        let (conn, mut peer) = testing::open_connection(&client).await;

        let mut dwrs = Vec::new();
        while let Some(msg) = peer.recv().await {
            assert_eq!(msg.header.command_code, base_cmd::DEVICE_WATCHDOG);
            dwrs.push(msg);
        }
        conn.closed().await;

        assert_eq!(dwrs.len(), 3);
        assert!(dwrs[1..].iter().all(|d| d.header.is_retransmit()));
        assert_eq!(conn.state(), ConnectionState::Closed);

        let report = reports.recv().await.unwrap();
        assert_eq!(report.cause, ErrorCause::WatchdogFailure);
        assert_eq!(report.peer.as_deref(), Some(FAKE_PEER_ADDR));
        assert!(reports.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_connect_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut peer = FakePeer::new(stream);
            let cer = peer.accept_cer().await;
            let dpr = peer.recv().await.unwrap();
            assert_eq!(dpr.header.command_code, base_cmd::DISCONNECT_PEER);
            let dpa = peer.answer(&dpr, 2001);
            peer.send(&dpa).await;
            cer
        });

        let mut identity = testing::client_identity();
        identity.host_addresses.clear();
        let client = DiameterClient::new(
            identity,
            testing::settings_without_watchdog(),
            testing::hello_dictionary(),
        );
        let conn = client.connect(&addr).await.unwrap();
        assert_eq!(conn.peer_addr(), addr);
        assert_eq!(conn.state(), ConnectionState::Open);
        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);

        let cer = server.await.unwrap();
        assert_eq!(
            cer.find_avp(avp_code::HOST_IP_ADDRESS).and_then(Avp::as_address),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
    }

    #[tokio::test]
    async fn test_connect_refused_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = testing::client(testing::client_settings());
        let mut reports = client.error_reports().unwrap();
        assert!(matches!(
            client.connect(&addr).await,
            Err(PeerError::Dial { .. })
        ));
        let report = reports.recv().await.unwrap();
        assert_eq!(report.cause, ErrorCause::Dial);
        assert_eq!(report.peer.as_deref(), Some(addr.as_str()));
    }

    #[test]
    fn test_handle_name() {
        let client = testing::client(testing::client_settings());
        assert!(client.handle_name("HMA", |_, _| {}).is_ok());
        assert!(client.handlers().get(CommandId::answer(999, 111)).is_some());
        assert!(matches!(
            client.handle_name("XYZ", |_, _| {}),
            Err(PeerError::UnknownCommand(_))
        ));
        assert!(client.error_reports().is_some());
        assert!(client.error_reports().is_none());
    }
}
