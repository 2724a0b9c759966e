use anyhow::bail;
use bytes::Bytes;
use std::cmp::min;
use std::io;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use crate::assembler::{DatagramBuilder, PackageAssembler, PreparedDatagram};
use crate::checksum::SessionInvalidChecker;
use crate::config::ArqConfig;
use crate::encryption::{ArqEncryption, DataEncryption, NoEncryption, PackageEncryption};
use crate::flow_control::{ResendControl, SendingAdjustor};
use crate::key_exchange::{initiate, EcdhHandshake, Role};
use crate::message::{Answer, MessageCodec, Quest};
use crate::packet_header::ArqType;
use crate::parser::{ArqParser, ParseResult};
use crate::seq::Seq;
use crate::seq_manager::SeqManager;
use crate::unconfirmed::UnconfirmedLedger;

/// A datagram that is ready to go out except for the (package level) encryption envelope, which
///  is applied by [Outgoing::seal] outside the engine's lock.
pub struct Outgoing {
    version: u8,
    plain: Bytes,
    encryptor: Arc<dyn ArqEncryption>,
}

impl Outgoing {
    pub fn seal(&self) -> anyhow::Result<Bytes> {
        self.encryptor.seal(self.version, &self.plain)
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryptor.is_encrypting()
    }
}

#[derive(Debug, Default)]
pub struct ReceivedMessages {
    pub quests: Vec<Quest>,
    pub answers: Vec<Answer>,
}

impl ReceivedMessages {
    pub fn is_empty(&self) -> bool {
        self.quests.is_empty() && self.answers.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ActiveClose {
    None,
    Required,
    PackageGenerated,
    PackageSent,
}

/// The key exchange datagram is tracked outside the unconfirmed ledger: until the peer
///  acknowledges it, it is the only thing that is sent.
struct PendingEcdh {
    seq: Seq,
    version: u8,
    plain: Bytes,
    last_sent: Option<Instant>,
}

struct ReceiveState {
    parser: ArqParser,
    result: ParseResult,
}

struct EngineState {
    config: Arc<ArqConfig>,

    assembler: PackageAssembler,
    ledger: UnconfirmedLedger,
    seq_manager: SeqManager,
    resend_control: ResendControl,
    adjustor: SendingAdjustor,
    session_checker: SessionInvalidChecker,

    /// there is no datagram in flight, i.e. the holder of the token may start sending
    send_token: bool,
    /// remaining number of resent sections for the current sending round
    resent_budget: usize,

    active_close: ActiveClose,
    require_close: bool,
    require_keep_alive: bool,
    untransmitted_timeout: Option<Duration>,

    sending_encryptor: Arc<dyn ArqEncryption>,
    pending_ecdh: Option<PendingEcdh>,

    last_urgent_sync: Option<Instant>,
    last_sent: Instant,
    last_recv: Option<Instant>,
    last_active: Instant,
}

/// The ARQ engine for a single connection. It is driven from the outside: received datagrams go
///  into [ArqIoBuffer::recv_data], and whatever the engine wants to send comes out as
///  [Outgoing] datagrams from the send operations.
///
/// There is at most one datagram in flight at any time. Whoever receives an [Outgoing] holds the
///  'send token' and must report the outcome through [ArqIoBuffer::send_completed], which
///  returns the next datagram to send (if any) or releases the token.
///
/// Receiving and sending are independent: the parser has its own lock, and the engine state is
///  locked only briefly to synchronize the parse result.
pub struct ArqIoBuffer {
    receive: Mutex<ReceiveState>,
    state: Mutex<EngineState>,
}

impl ArqIoBuffer {
    pub fn new(config: Arc<ArqConfig>, codec: Arc<dyn MessageCodec>, now: Instant) -> ArqIoBuffer {
        let parser = ArqParser::new(config.clone(), codec);
        let state = EngineState {
            assembler: PackageAssembler::new(config.clone()),
            ledger: UnconfirmedLedger::default(),
            seq_manager: SeqManager::default(),
            resend_control: ResendControl::new(&config),
            adjustor: SendingAdjustor::new(&config, now),
            session_checker: SessionInvalidChecker::new(&config, now),
            send_token: true,
            resent_budget: 0,
            active_close: ActiveClose::None,
            require_close: false,
            require_keep_alive: false,
            untransmitted_timeout: config.untransmitted_timeout,
            sending_encryptor: Arc::new(NoEncryption),
            pending_ecdh: None,
            last_urgent_sync: None,
            last_sent: now,
            last_recv: None,
            last_active: now,
            config,
        };

        ArqIoBuffer {
            receive: Mutex::new(ReceiveState { parser, result: ParseResult::default() }),
            state: Mutex::new(state),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn lock_receive(&self) -> MutexGuard<'_, ReceiveState> {
        self.receive.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Parses a received datagram and applies it to the engine state. Returns the messages that
    ///  were completed by it.
    pub fn recv_data(&self, raw: &[u8], now: Instant) -> ReceivedMessages {
        let mut receive = self.lock_receive();
        let ReceiveState { parser, result } = &mut *receive;

        parser.parse(raw, now, result);

        let received = ReceivedMessages {
            quests: std::mem::take(&mut result.quests),
            answers: std::mem::take(&mut result.answers),
        };
        self.lock_state().sync_arq_status(result, parser.last_contiguous_seq(), now);
        result.reset();
        received
    }

    /// OS level receive errors other than 'would block' are fatal for the connection
    pub fn recv_failed(&self, e: &io::Error) {
        match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::Interrupted => trace!("transient receive error: {}", e),
            _ => {
                warn!("error receiving datagram, closing connection: {}", e);
                self.lock_state().require_close = true;
            }
        }
    }

    /// Queues application data (one or more encoded messages) and starts sending if no other
    ///  datagram is in flight.
    pub fn send_data(&self, data: Bytes, discardable: bool, expires: Option<Instant>, now: Instant) -> Option<Outgoing> {
        let mut state = self.lock_state();
        if state.active_close != ActiveClose::None {
            debug!("connection is closing, dropping outgoing data");
            return None;
        }
        state.assembler.push_data(data, discardable, expires);
        state.start_sending(now)
    }

    /// sends whatever is due: feedback, resends, pending data, heartbeats
    pub fn send_cached_data(&self, now: Instant) -> Option<Outgoing> {
        self.lock_state().start_sending(now)
    }

    /// reports the outcome of sending an [Outgoing], returning the next datagram to send
    pub fn send_completed(&self, result: io::Result<usize>, now: Instant) -> Option<Outgoing> {
        self.lock_state().send_completed(result, now)
    }

    /// Periodic housekeeping, followed by a sending round
    pub fn on_tick(&self, now: Instant) -> Option<Outgoing> {
        let mut receive = self.lock_receive();
        let una_advanced = receive.parser.check_timeouts(now);
        let last_contiguous = receive.parser.last_contiguous_seq();

        let mut state = self.lock_state();
        drop(receive);

        if una_advanced {
            if let Some(last) = last_contiguous {
                state.seq_manager.update_last_una(last);
            }
        }
        let num_expired = state.ledger.drop_expired(now);
        if num_expired > 0 {
            debug!("gave up on {} expired unconfirmed sections", num_expired);
        }
        state.start_sending(now)
    }

    pub fn enable_keep_alive(&self) {
        self.lock_state().require_keep_alive = true;
    }

    /// `0` restores the configured timeout, a negative value disables the check
    pub fn set_untransmitted_seconds(&self, seconds: i64) {
        let mut state = self.lock_state();
        state.untransmitted_timeout = match seconds {
            0 => state.config.untransmitted_timeout,
            s if s < 0 => None,
            s => Some(Duration::from_secs(s.unsigned_abs())),
        };
    }

    /// Starts the two step active close: a CLOSE datagram is sent, and once it is out the
    ///  engine requires close.
    pub fn mark_active_close_signal(&self, now: Instant) -> Option<Outgoing> {
        let mut state = self.lock_state();
        if state.active_close == ActiveClose::None {
            debug!("active close requested");
            state.active_close = ActiveClose::Required;
        }
        state.start_sending(now)
    }

    pub fn is_require_close(&self, now: Instant) -> bool {
        let state = self.lock_state();
        if state.require_close {
            return true;
        }
        if state.session_checker.is_invalid(now) {
            debug!("session is invalid ({} invalid datagrams)", state.session_checker.invalid_count());
            return true;
        }
        state.is_transmission_stopped(now)
    }

    pub fn last_active(&self) -> Instant {
        self.lock_state().last_active
    }

    pub fn num_unconfirmed(&self) -> usize {
        self.lock_state().ledger.len()
    }

    pub fn protocol_version(&self) -> u8 {
        self.lock_state().assembler.protocol_version()
    }

    pub fn is_encrypted(&self) -> bool {
        self.lock_receive().parser.is_encrypted()
    }

    /// Performs a key exchange against the peer's well known public key, and encrypts the
    ///  connection from now on. `data_reinforce` enables data level encryption in addition to
    ///  package level encryption, with a 256 bit key if it is `Some(true)`.
    ///
    /// This must happen before any data is sent on the connection.
    pub fn enable_encryptor_as_initiator(
        &self,
        curve: &str,
        peer_public_key: &[u8],
        reinforce_package: bool,
        data_reinforce: Option<bool>,
        now: Instant,
    ) -> anyhow::Result<Option<Outgoing>> {
        let (package_spec, package_keys) = initiate(curve, peer_public_key, reinforce_package)?;
        let package = Arc::new(PackageEncryption::new(&package_keys, Role::Initiator)?);
        let (data_spec, data) = match data_reinforce {
            Some(reinforce) => {
                let (spec, keys) = initiate(curve, peer_public_key, reinforce)?;
                (Some(spec), Some(Arc::new(DataEncryption::new(&keys, Role::Initiator)?)))
            }
            None => (None, None),
        };

        let mut receive = self.lock_receive();
        let mut state = self.lock_state();

        if receive.parser.is_encrypted() || state.pending_ecdh.is_some() {
            bail!("encryption is already enabled");
        }
        if state.assembler.last_seq() != state.assembler.first_seq().prev() {
            bail!("encryption must be enabled before any data is sent");
        }

        receive.parser.install_decryptors(package.clone(), data.clone());
        drop(receive);

        let handshake = EcdhHandshake { package: package_spec, data: data_spec };
        let prepared = state.assembler.prepare_ecdh(&handshake);
        state.pending_ecdh = Some(PendingEcdh {
            seq: prepared.seq,
            version: state.assembler.protocol_version(),
            plain: prepared.plain,
            last_sent: None,
        });
        state.install_sending_encryption(package, data);
        info!("enabled encryption as initiator (data encryption: {})", data_reinforce.is_some());

        Ok(state.start_sending(now))
    }
}

impl EngineState {
    /// applies everything the parser learned to the sending side
    fn sync_arq_status(&mut self, result: &mut ParseResult, last_contiguous: Option<Seq>, now: Instant) {
        for _ in 0..result.invalid_datagrams {
            self.session_checker.update_invalid_count();
        }
        if result.first_package_received {
            self.session_checker.first_package_received();
        }
        if result.valid_datagrams > 0 {
            self.session_checker.update_valid_status(now);
            self.last_recv = Some(now);
            self.last_active = now;
        }

        if let Some(version) = result.peer_protocol_version {
            if version < self.assembler.protocol_version() {
                info!("peer uses protocol version {}, downgrading", version);
                self.assembler.set_protocol_version(version);
            }
        }

        if let Some(established) = result.established_encryption.take() {
            self.install_sending_encryption(established.package, established.data);
        }

        if result.require_close {
            self.require_close = true;
        }

        self.check_ecdh_confirmed(result);
        if result.received_feedback() {
            self.assembler.feedback_received();
        }

        if let Some(una) = result.received_una {
            let stats = self.ledger.clean_by_una(una, now);
            self.resend_control.update_delay(stats);
            result.received_acks.retain(|seq| !seq.is_covered_by(una));
        }
        if !result.received_acks.is_empty() {
            let stats = self.ledger.clean_by_acks(&result.received_acks, now);
            self.resend_control.update_delay(stats);
        }

        // datagrams without tracked sections do not establish a UNA, so they are not answered
        if result.una_advanced || !result.new_received_seqs.is_empty() {
            if let Some(last) = last_contiguous {
                self.seq_manager.update_last_una(last);
            }
        }
        if result.received_prior_seqs {
            self.seq_manager.repeat_una();
        }
        self.seq_manager.new_received_seqs(&result.new_received_seqs);
        if result.require_force_sync {
            self.seq_manager.require_force_sync = true;
        }

        if result.require_keep_link && !self.require_keep_alive {
            debug!("peer sent heartbeat, enabling keep alive");
            self.require_keep_alive = true;
        }
    }

    fn check_ecdh_confirmed(&mut self, result: &ParseResult) {
        let Some(ecdh) = &self.pending_ecdh else {
            return;
        };
        let confirmed = result.received_una.is_some_and(|una| ecdh.seq.is_covered_by(una))
            || result.received_acks.contains(&ecdh.seq);
        if confirmed {
            debug!("peer confirmed the key exchange");
            self.pending_ecdh = None;
        }
    }

    fn install_sending_encryption(&mut self, package: Arc<PackageEncryption>, data: Option<Arc<DataEncryption>>) {
        self.assembler.set_envelope_overhead(package.envelope_overhead());
        if let Some(data) = data {
            self.assembler.install_data_encryptor(data);
        }
        self.sending_encryptor = package;
    }

    fn is_transmission_stopped(&self, now: Instant) -> bool {
        let (Some(timeout), Some(last_recv)) = (self.untransmitted_timeout, self.last_recv) else {
            return false;
        };
        let stopped = now.saturating_duration_since(last_recv) > timeout;
        if stopped {
            debug!("nothing received for {:?}, transmission stopped", timeout);
        }
        stopped
    }

    fn start_sending(&mut self, now: Instant) -> Option<Outgoing> {
        if !self.send_token {
            // the completion of the datagram in flight continues sending
            return None;
        }
        self.send_token = false;
        self.resent_budget = min(self.ledger.len(), self.config.max_resent_count_per_call);

        let outgoing = self.next_outgoing(now);
        if outgoing.is_none() {
            self.send_token = true;
        }
        outgoing
    }

    fn send_completed(&mut self, result: io::Result<usize>, now: Instant) -> Option<Outgoing> {
        if self.send_token {
            error!("send completed without a datagram in flight");
        }

        match result {
            Ok(_) => {
                self.last_sent = now;
                self.last_active = now;
            }
            Err(e) => {
                self.send_token = true;
                if self.active_close == ActiveClose::PackageGenerated {
                    self.active_close = ActiveClose::Required;
                }
                match e.kind() {
                    ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::ConnectionRefused | ErrorKind::BrokenPipe => {
                        warn!("error sending datagram, closing connection: {}", e);
                        self.require_close = true;
                    }
                    _ => debug!("error sending datagram, retrying later: {}", e),
                }
                return None;
            }
        }

        let outgoing = self.next_outgoing(now);
        self.send_token = outgoing.is_none();
        outgoing
    }

    fn next_outgoing(&mut self, now: Instant) -> Option<Outgoing> {
        match self.active_close {
            ActiveClose::PackageGenerated => {
                debug!("CLOSE datagram was sent");
                self.active_close = ActiveClose::PackageSent;
                self.require_close = true;
                return None;
            }
            ActiveClose::PackageSent => return None,
            _ => {}
        }
        if self.require_close {
            return None;
        }

        if self.active_close == ActiveClose::Required {
            let mut builder = self.assembler.builder();
            self.assembler.add_signal(&mut builder, ArqType::Close);
            self.active_close = ActiveClose::PackageGenerated;
            let prepared = self.assembler.finish(builder);
            return Some(self.outgoing(prepared, now));
        }

        if !self.adjustor.sending_check(now) {
            return None;
        }
        let outgoing = self.prepare_sending_package(now);
        if outgoing.is_none() {
            self.adjustor.revoke();
        }
        outgoing
    }

    fn prepare_sending_package(&mut self, now: Instant) -> Option<Outgoing> {
        let threshold = self.resend_control.resend_threshold(now);

        if let Some(ecdh) = &mut self.pending_ecdh {
            if ecdh.last_sent.is_some_and(|t| t > threshold) {
                return None;
            }
            trace!("sending key exchange datagram {}", ecdh.seq);
            ecdh.last_sent = Some(now);
            return Some(Outgoing {
                version: ecdh.version,
                plain: ecdh.plain.clone(),
                encryptor: Arc::new(NoEncryption),
            });
        }

        if let Some(prepared) = self.prepare_urgent_sync(now, threshold) {
            return Some(self.outgoing(prepared, now));
        }

        if self.resent_budget > 0 {
            if let Some(prepared) = self.prepare_resend(now, threshold) {
                return Some(self.outgoing(prepared, now));
            }
        }

        if self.ledger.len() >= self.config.unconfirmed_package_limit {
            trace!("{} unconfirmed packages, holding back new data", self.ledger.len());
            return None;
        }

        if self.assembler.has_pending_data() {
            let mut builder = self.assembler.builder();
            let max_tracked = self.config.unconfirmed_package_limit - self.ledger.len();
            self.assembler.fill_data(&mut builder, max_tracked, now);
            if !builder.is_empty() {
                self.pad_with_resends(&mut builder, now, threshold);
                let prepared = self.assembler.finish(builder);
                return Some(self.outgoing(prepared, now));
            }
        }

        if self.require_keep_alive && now.saturating_duration_since(self.last_sent) >= self.config.heartbeat_interval {
            trace!("sending heartbeat");
            let mut builder = self.assembler.builder();
            self.assembler.add_signal(&mut builder, ArqType::Heartbeat);
            let prepared = self.assembler.finish(builder);
            return Some(self.outgoing(prepared, now));
        }

        None
    }

    fn prepare_urgent_sync(&mut self, now: Instant, threshold: Instant) -> Option<PreparedDatagram> {
        let threshold_triggered = self.ledger.len() >= self.config.urgent_sync_triggered_threshold
            && self.last_urgent_sync.map_or(true, |t| now.saturating_duration_since(t) >= self.config.urgent_sync_interval);
        let peer_requested = self.seq_manager.require_force_sync;

        if !threshold_triggered && !peer_requested && !self.seq_manager.need_sync_seq_status() {
            return None;
        }

        let mut builder = self.assembler.builder();
        if threshold_triggered {
            self.assembler.add_signal(&mut builder, ArqType::ForceSync);
            self.last_urgent_sync = Some(now);
        }
        if self.assembler.add_feedback(&mut builder, &mut self.seq_manager, peer_requested) {
            self.seq_manager.require_force_sync = false;
        }

        if self.ledger.len() <= self.config.unconfirmed_package_limit / 2 {
            let max_tracked = self.config.unconfirmed_package_limit - self.ledger.len();
            self.assembler.fill_data(&mut builder, max_tracked, now);
        }
        if builder.is_empty() {
            return None;
        }

        self.pad_with_resends(&mut builder, now, threshold);
        Some(self.assembler.finish(builder))
    }

    fn prepare_resend(&mut self, now: Instant, threshold: Instant) -> Option<PreparedDatagram> {
        let mut builder = self.assembler.builder();

        if self.assembler.protocol_version() >= ArqConfig::PROTOCOL_VERSION_2 {
            let sections = self.ledger.fetch_overdue(threshold, now, builder.remaining(), self.resent_budget);
            self.resent_budget -= sections.len();
            for section in sections {
                builder.push(section);
            }
        }

        if builder.is_empty() {
            // version 1, or a section that outgrew the datagram budget when encryption started
            let section = self.ledger.fetch_first_overdue(threshold, now)?;
            self.resent_budget = self.resent_budget.saturating_sub(1);
            let mut single = DatagramBuilder::new(usize::MAX);
            single.push(section);
            builder = single;
        }

        trace!("resending {} sections", builder.num_sections());
        Some(self.assembler.finish(builder))
    }

    /// fills the rest of a datagram with overdue sections
    fn pad_with_resends(&mut self, builder: &mut DatagramBuilder, now: Instant, threshold: Instant) {
        if self.assembler.protocol_version() < ArqConfig::PROTOCOL_VERSION_2 || self.resent_budget == 0 {
            return;
        }
        let sections = self.ledger.fetch_overdue(threshold, now, builder.remaining(), self.resent_budget);
        self.resent_budget -= sections.len();
        for section in sections {
            builder.push(section);
        }
    }

    /// records new tracked sections as unconfirmed, and wraps the datagram for sending
    fn outgoing(&mut self, prepared: PreparedDatagram, now: Instant) -> Outgoing {
        for (section, expires) in prepared.new_tracked {
            self.ledger.insert(section, now, expires);
        }
        Outgoing {
            version: self.assembler.protocol_version(),
            plain: prepared.plain,
            encryptor: self.sending_encryptor.clone(),
        }
    }
}
