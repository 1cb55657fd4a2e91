//! The network registration state machine.
//!
//! A flat machine drives the module from power-up to a usable packet data
//! session: module/SIM checks, radio and APN preparation, operator scanning,
//! manual operator iteration, registration polling and service validation.
//! Timers are monotonic deadlines stored on the session and reset on state
//! entry; the overall operation deadline bounds every path.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::modem::at::{
    AtChannel, AtChannelExt, AtResponse, DEFAULT_TIMEOUT, ERROR, LINE_TIMEOUT, OK,
};
use crate::modem::operators::{self, OperatorInfo};
use crate::modem::{CellError, CellResult, NoPowerPin, PowerPin};
use crate::Clock;

const RETRY_DELAY: Duration = Duration::from_secs(1);
const LOOP_DELAY: Duration = Duration::from_millis(10);
const SETTLE_DELAY: Duration = Duration::from_secs(2);
const PROBE_ATTEMPTS: usize = 10;

/// How long a freshly selected operator gets to register us
const PER_OPERATOR_TIMEOUT: Duration = Duration::from_secs(60);
/// Poll interval while waiting for registration with the current operator
const REGISTRATION_POLL_DELAY: Duration = Duration::from_secs(3);
/// Budget for the PDP/attach checks before falling back to registration
const SERVICE_STATUS_TIMEOUT: Duration = Duration::from_secs(30);
/// Window over which a denied/emergency-only status must persist before the
/// operator is abandoned
const DENIED_CONFIRMATION: Duration = Duration::from_secs(10);
/// Settling time before selecting an operator manually
const OPERATOR_SETTLE_DELAY: Duration = Duration::from_secs(5);
/// Deadline for the module to apply a manual operator selection
const SELECT_OPERATOR_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline for reading the operator scan result line
const SCAN_LINE_TIMEOUT: Duration = Duration::from_secs(2);
/// Module warm-up after a reset or power cycle
const WARM_UP: Duration = Duration::from_secs(10);
/// Full passes through the operator list before registration fails for good
const MAX_LIST_EXHAUSTION: u32 = 3;

/// A registered operator below this CSQ is not worth keeping
const MIN_USABLE_CSQ: u8 = 10;
const CSQ_UNKNOWN: u8 = 99;

/// States of the registration machine
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegistrationState {
    /// AT probe and SIM readiness
    CheckModuleReady,
    /// Disable registration reports, select RAT, program the APN
    PrepareModule,
    /// `+COPS=?` scan to populate the operator list
    ScanOperator,
    /// Select the next candidate operator manually
    ConfigureManualNetwork,
    /// Poll registration status and signal quality
    CheckNetworkRegistration,
    /// Service mode, PDP context and packet domain attach
    CheckServiceStatus,
    /// Final signal and address validation; terminal on success
    NetworkReady,
    /// Recovery edge after a full pass through the operator list
    OperatorListExhausted,
}

/// Radio access technology preference
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CellTechnology {
    Auto,
    Gsm,
    Lte,
}

impl CellTechnology {
    /// `+CNMP` mode value for this preference
    fn mode(self) -> u8 {
        match self {
            CellTechnology::Auto => 2,
            CellTechnology::Gsm => 13,
            CellTechnology::Lte => 38,
        }
    }

    /// Registration report covering this technology's domain
    fn registration_command(self) -> &'static str {
        match self {
            CellTechnology::Auto => "CREG",
            CellTechnology::Gsm => "CGREG",
            CellTechnology::Lte => "CEREG",
        }
    }
}

/// Parsed `+CREG`/`+CGREG`/`+CEREG` report
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RegistrationStatus {
    /// Unsolicited report mode, 0..=2
    pub mode: u8,
    /// Registration status per 3GPP TS 27.007
    pub stat: u8,
}

impl RegistrationStatus {
    /// Registered at home (1) or roaming (5)
    pub fn is_registered(self) -> bool {
        matches!(self.stat, 1 | 5)
    }

    /// Denied (3) or emergency bearer only (11)
    pub fn is_denied(self) -> bool {
        matches!(self.stat, 3 | 11)
    }
}

/// Why registration did not reach the ready state
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum RegistrationError {
    #[error("module or SIM not ready")]
    ModuleNotReady,
    #[error("registration did not complete before the operation deadline")]
    OperationTimeout,
    #[error("every candidate operator failed three full passes")]
    OperatorsExhausted,
}

/// Owns the modem-facing capabilities and the registration bookkeeping
///
/// Lives as long as the device is up; [`register`](Self::register) may run
/// any number of times over it. The operator list and the last successful
/// PLMN survive between runs and can be persisted through
/// [`serialized_operators`](Self::serialized_operators) and restored with
/// [`load_operators`](Self::load_operators).
pub struct ModemSession<A, C, P = NoPowerPin> {
    at: A,
    clock: C,
    power: Option<P>,
    initialized: bool,
    operators: Vec<OperatorInfo>,
    current_index: usize,
    saved_plmn: u32,
    operator_deadline: Option<Instant>,
    service_deadline: Option<Instant>,
}

impl<A: AtChannel, C: Clock> ModemSession<A, C> {
    pub fn new(at: A, clock: C) -> Self {
        Self {
            at,
            clock,
            power: None,
            initialized: false,
            operators: Vec::new(),
            current_index: 0,
            saved_plmn: 0,
            operator_deadline: None,
            service_deadline: None,
        }
    }
}

impl<A: AtChannel, C: Clock, P: PowerPin> ModemSession<A, C, P> {
    pub fn with_power_pin(at: A, clock: C, power: P) -> Self {
        Self {
            at,
            clock,
            power: Some(power),
            initialized: false,
            operators: Vec::new(),
            current_index: 0,
            saved_plmn: 0,
            operator_deadline: None,
            service_deadline: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn channel(&mut self) -> &mut A {
        &mut self.at
    }

    #[cfg(test)]
    pub(crate) fn power_pin(&mut self) -> Option<&mut P> {
        self.power.as_mut()
    }

    /// Candidate operators known to this session
    pub fn operators(&self) -> &[OperatorInfo] {
        &self.operators
    }

    /// PLMN of the last operator that reached the ready state, 0 if none
    pub fn current_plmn(&self) -> u32 {
        self.saved_plmn
    }

    /// Canonical persisted form of the operator list
    pub fn serialized_operators(&self) -> String {
        operators::serialize_list(&self.operators)
    }

    /// Restore the operator list and last successful PLMN from persisted
    /// state; malformed entries are skipped
    pub fn load_operators(&mut self, serialized: &str, current_plmn: u32) {
        self.operators = operators::parse_list(serialized);
        self.saved_plmn = current_plmn;
        self.current_index = 0;
        if current_plmn != 0 {
            match self.operators.iter().position(|op| op.plmn == current_plmn) {
                Some(i) => {
                    debug!("persisted operator {} found at index {}", current_plmn, i);
                    self.current_index = i;
                }
                None => warn!("persisted operator {} not in the stored list", current_plmn),
            }
        }
        info!("loaded {} operators from persisted state", self.operators.len());
    }

    /// Bring the module up for first use
    pub fn init(&mut self) -> CellResult<()> {
        if self.initialized {
            debug!("module already initialized");
            return Ok(());
        }
        if self.power.is_some() {
            self.power_on();
        }
        self.bring_up()?;
        self.initialized = true;
        Ok(())
    }

    /// Re-run the bring-up sequence after a reset or power cycle
    pub fn reinitialize(&mut self) -> CellResult<()> {
        info!("reinitializing module");
        self.bring_up()
    }

    fn bring_up(&mut self) -> CellResult<()> {
        info!("waiting for module to become ready");
        self.probe()?;
        // echo off, GPRS event reports off
        let _ = self.at.command("E0", DEFAULT_TIMEOUT);
        self.clock.sleep(SETTLE_DELAY);
        let _ = self.at.command("+CGEREP=0", DEFAULT_TIMEOUT);
        self.clock.sleep(SETTLE_DELAY);
        // product identification, for the logs
        self.at.send_raw(b"ATI\r");
        let _ = self.at.finish(DEFAULT_TIMEOUT);
        Ok(())
    }

    /// Probe the command channel until the module answers
    fn probe(&mut self) -> CellResult<()> {
        for _ in 0..PROBE_ATTEMPTS {
            self.at.send_at("");
            match self.at.wait_response(DEFAULT_TIMEOUT, &[OK, ERROR]) {
                AtResponse::Matched(0) => return Ok(()),
                _ => self.clock.sleep(RETRY_DELAY),
            }
        }
        warn!("module did not answer the AT probe");
        Err(CellError::Timeout)
    }

    /// Pulse the power key to switch the module on
    pub fn power_on(&mut self) {
        let Some(power) = self.power.as_mut() else {
            return;
        };
        power.set_low();
        self.clock.sleep(Duration::from_millis(500));
        power.set_high();
        self.clock.sleep(Duration::from_millis(100));
        power.set_low();
        self.clock.sleep(Duration::from_millis(100));
    }

    /// Switch the module off, gracefully unless `force`
    pub fn power_off(&mut self, force: bool) {
        if !force {
            self.at.send_at("+CPOF");
            if self.at.finish(DEFAULT_TIMEOUT).is_ok() {
                info!("module powered off");
                return;
            }
            warn!("graceful power off failed, forcing");
        }
        let Some(power) = self.power.as_mut() else {
            warn!("no power pin available, cannot force power off");
            return;
        };
        power.set_high();
        self.clock.sleep(Duration::from_millis(1300));
        power.set_low();
    }

    /// Reset the module, falling back to a power cycle, then wait out the
    /// warm-up period
    pub fn hard_reset(&mut self) {
        if self.at.command("+CRESET", DEFAULT_TIMEOUT).is_ok() {
            info!("module reset issued");
        } else {
            warn!("reset command failed, power cycling module");
            self.power_off(true);
            self.clock.sleep(SETTLE_DELAY);
            self.power_on();
        }
        info!("waiting {:?} for module warm-up", WARM_UP);
        self.clock.sleep(WARM_UP);
    }

    /// `+CPIN?` SIM readiness check
    pub fn is_sim_ready(&mut self) -> CellResult<()> {
        self.at.send_at("+CPIN?");
        match self.at.wait_response(DEFAULT_TIMEOUT, &["+CPIN:", ERROR]) {
            AtResponse::Matched(0) => {}
            AtResponse::Matched(_) | AtResponse::CmeError => return Err(CellError::Module),
            AtResponse::Timeout => return Err(CellError::Timeout),
        }
        match self.at.wait_response(DEFAULT_TIMEOUT, &["READY", ERROR]) {
            AtResponse::Matched(0) => {}
            _ => return Err(CellError::Failed),
        }
        let _ = self.at.finish(DEFAULT_TIMEOUT);
        Ok(())
    }

    /// SIM ICCID via `+CICCID`
    pub fn retrieve_iccid(&mut self) -> CellResult<String> {
        let line = self.at.query("+CICCID", "+ICCID:", DEFAULT_TIMEOUT)?;
        Ok(line.trim().to_owned())
    }

    /// Signal quality via `+CSQ`; 99 means unknown
    pub fn retrieve_signal(&mut self) -> CellResult<u8> {
        let line = self.at.query("+CSQ", "+CSQ:", DEFAULT_TIMEOUT)?;
        // +CSQ: <rssi>,<ber>; only <rssi> is interesting
        let rssi = line
            .trim()
            .split(',')
            .next()
            .and_then(|v| v.trim().parse::<u8>().ok())
            .unwrap_or(CSQ_UNKNOWN);
        Ok(rssi)
    }

    /// Address of PDP context 1 via `+CGPADDR`
    pub fn retrieve_ip_addr(&mut self) -> CellResult<String> {
        let line = self.at.query("+CGPADDR=1", "+CGPADDR: 1,", DEFAULT_TIMEOUT)?;
        let addr = line.trim().trim_matches('"').to_owned();
        if addr.is_empty() {
            return Err(CellError::Failed);
        }
        Ok(addr)
    }

    /// Drive the machine until the network is usable or a terminal failure
    ///
    /// `operation_timeout` bounds the whole run; `scan_timeout` bounds the
    /// `+COPS=?` scan alone, which routinely takes minutes.
    pub fn register(
        &mut self,
        tech: CellTechnology,
        apn: &str,
        operation_timeout: Duration,
        scan_timeout: Duration,
    ) -> Result<(), RegistrationError> {
        let deadline = self.clock.now() + operation_timeout;
        let mut exhaustion_count = 0u32;
        let mut state = RegistrationState::CheckModuleReady;
        self.operator_deadline = None;
        self.service_deadline = None;

        info!(
            "starting network registration (operation timeout {:?}, scan timeout {:?})",
            operation_timeout, scan_timeout
        );

        while self.clock.now() < deadline {
            trace!("registration state: {:?}", state);
            match state {
                RegistrationState::CheckModuleReady => {
                    state = self.check_module_ready()?;
                }
                RegistrationState::PrepareModule => {
                    state = self.prepare_module(tech, apn);
                }
                RegistrationState::ScanOperator => {
                    state = self.scan_operator(scan_timeout);
                }
                RegistrationState::ConfigureManualNetwork => {
                    state = self.configure_manual_network();
                    if state == RegistrationState::CheckNetworkRegistration {
                        self.operator_deadline = Some(self.clock.now() + PER_OPERATOR_TIMEOUT);
                    }
                }
                RegistrationState::CheckNetworkRegistration => {
                    state = self.check_network_registration(tech);
                    if state == RegistrationState::CheckServiceStatus {
                        self.service_deadline = Some(self.clock.now() + SERVICE_STATUS_TIMEOUT);
                    }
                }
                RegistrationState::CheckServiceStatus => {
                    state = self.check_service_status();
                    if let Some(service_deadline) = self.service_deadline {
                        if self.clock.now() > service_deadline {
                            warn!(
                                "service checks exceeded {:?}, re-checking registration",
                                SERVICE_STATUS_TIMEOUT
                            );
                            self.operator_deadline =
                                Some(self.clock.now() + PER_OPERATOR_TIMEOUT);
                            self.service_deadline = None;
                            state = RegistrationState::CheckNetworkRegistration;
                        }
                    }
                }
                RegistrationState::NetworkReady => {
                    state = self.network_ready();
                    if state == RegistrationState::NetworkReady {
                        info!("network registration complete");
                        return Ok(());
                    }
                }
                RegistrationState::OperatorListExhausted => {
                    exhaustion_count += 1;
                    warn!(
                        "operator list exhausted (pass {} of {})",
                        exhaustion_count, MAX_LIST_EXHAUSTION
                    );
                    if exhaustion_count >= MAX_LIST_EXHAUSTION {
                        self.operators.clear();
                        self.saved_plmn = 0;
                        self.current_index = 0;
                        return Err(RegistrationError::OperatorsExhausted);
                    }
                    // a clean slate for the next pass, in case every operator
                    // reported denied or emergency-only
                    self.hard_reset();
                    let _ = self.reinitialize();
                    self.current_index = 0;
                    state = RegistrationState::CheckModuleReady;
                }
            }
            self.clock.sleep(LOOP_DELAY);
        }

        warn!("registration abandoned in state {:?}", state);
        Err(RegistrationError::OperationTimeout)
    }

    fn check_module_ready(&mut self) -> Result<RegistrationState, RegistrationError> {
        self.at.send_at("");
        match self.at.wait_response(DEFAULT_TIMEOUT, &[OK, ERROR]) {
            AtResponse::Matched(0) => {}
            _ => {
                debug!("module not answering, retrying");
                self.clock.sleep(RETRY_DELAY);
                return Ok(RegistrationState::CheckModuleReady);
            }
        }
        match self.is_sim_ready() {
            Ok(()) => {}
            Err(CellError::Module) => {
                warn!("SIM reported an error, aborting registration");
                return Err(RegistrationError::ModuleNotReady);
            }
            Err(_) => {
                debug!("SIM not ready, retrying");
                self.clock.sleep(RETRY_DELAY);
                return Ok(RegistrationState::CheckModuleReady);
            }
        }
        info!("module and SIM ready");
        Ok(RegistrationState::PrepareModule)
    }

    fn prepare_module(&mut self, tech: CellTechnology, apn: &str) -> RegistrationState {
        debug!("preparing module for registration");
        if let Err(err) = self.disable_registration_urc(tech) {
            warn!("failed to disable registration reports: {}", err);
            return RegistrationState::CheckModuleReady;
        }
        if self.apply_cellular_technology(tech).is_err() {
            warn!("failed to select radio access technology");
            return RegistrationState::CheckModuleReady;
        }
        if self.apply_apn(apn).is_err() {
            warn!("failed to program APN");
            return RegistrationState::CheckModuleReady;
        }
        if self.operators.is_empty() {
            debug!("no operator list, scanning");
            RegistrationState::ScanOperator
        } else {
            debug!("{} candidate operators known", self.operators.len());
            RegistrationState::ConfigureManualNetwork
        }
    }

    fn scan_operator(&mut self, scan_timeout: Duration) -> RegistrationState {
        info!("scanning for available operators, this can take several minutes");
        self.at.send_at("+COPS=?");
        match self.at.wait_response(scan_timeout, &["+COPS:", ERROR]) {
            AtResponse::Matched(0) => {}
            _ => {
                warn!("operator scan failed or timed out");
                return RegistrationState::CheckModuleReady;
            }
        }
        let Some(line) = self.at.wait_line(SCAN_LINE_TIMEOUT) else {
            warn!("failed to read operator scan result");
            return RegistrationState::CheckModuleReady;
        };
        let _ = self.at.finish(DEFAULT_TIMEOUT);

        let found = operators::parse_scan(&line);
        if found.is_empty() {
            warn!("scan returned no usable operators");
            return RegistrationState::CheckModuleReady;
        }
        info!("scan found {} operator(s)", found.len());
        self.operators = found;
        self.current_index = 0;
        RegistrationState::ConfigureManualNetwork
    }

    fn configure_manual_network(&mut self) -> RegistrationState {
        // the previously successful operator goes first, but only before any
        // iteration has happened
        if self.saved_plmn != 0 && self.current_index == 0 {
            match self.operators.iter().position(|op| op.plmn == self.saved_plmn) {
                Some(i) => {
                    debug!("starting with previously successful operator {}", self.saved_plmn);
                    self.current_index = i;
                }
                None => {
                    warn!(
                        "previously successful operator {} not in the candidate list",
                        self.saved_plmn
                    );
                }
            }
        }

        let Some(op) = self.operators.get(self.current_index).copied() else {
            warn!("no operators left to try");
            return RegistrationState::OperatorListExhausted;
        };

        info!(
            "selecting operator {} with AcT {} (candidate {} of {})",
            op.plmn,
            op.access_tech,
            self.current_index + 1,
            self.operators.len()
        );
        self.clock.sleep(OPERATOR_SETTLE_DELAY);
        match self.apply_operator_selection(op.plmn, op.access_tech) {
            Ok(()) => RegistrationState::CheckNetworkRegistration,
            Err(CellError::Timeout) => {
                warn!("timed out applying operator selection");
                self.current_index += 1;
                RegistrationState::CheckModuleReady
            }
            Err(_) => {
                warn!("operator {} rejected, trying next", op.plmn);
                self.current_index += 1;
                RegistrationState::ConfigureManualNetwork
            }
        }
    }

    fn check_network_registration(&mut self, tech: CellTechnology) -> RegistrationState {
        let status = match self.registration_status(tech) {
            Ok(status) => status,
            Err(CellError::Timeout) => {
                warn!("timed out checking registration status");
                return RegistrationState::CheckModuleReady;
            }
            Err(_) => {
                self.clock.sleep(RETRY_DELAY);
                return RegistrationState::CheckNetworkRegistration;
            }
        };

        // signal is queried on every poll; readings inform the operator policy
        let signal = self.retrieve_signal();
        let csq = *signal.as_ref().unwrap_or(&CSQ_UNKNOWN);
        debug!("registration status {} with signal {}", status.stat, csq);

        if status.is_registered() {
            if matches!(signal, Err(CellError::Timeout)) {
                return RegistrationState::CheckModuleReady;
            }
            if !(1..=31).contains(&csq) {
                warn!("invalid signal quality {}", csq);
                self.clock.sleep(RETRY_DELAY);
                return RegistrationState::CheckNetworkRegistration;
            }
            if csq < MIN_USABLE_CSQ {
                warn!("operator signal too weak (csq {}), moving on", csq);
                self.advance_operator();
                self.clock.sleep(RETRY_DELAY);
                return RegistrationState::ConfigureManualNetwork;
            }
            info!("registered, continuing to service checks");
            return RegistrationState::CheckServiceStatus;
        }

        if status.is_denied() {
            if self.confirm_denied(tech, status.stat) {
                warn!(
                    "registration still denied after {:?}, trying next operator",
                    DENIED_CONFIRMATION
                );
                self.advance_operator();
                return RegistrationState::ConfigureManualNetwork;
            }
            // the status moved while we watched; judge it afresh
            return RegistrationState::CheckNetworkRegistration;
        }

        // still attaching; give up on this operator once its deadline passes
        if self
            .operator_deadline
            .map_or(false, |d| self.clock.now() > d)
        {
            warn!(
                "not registered within {:?}, trying next operator",
                PER_OPERATOR_TIMEOUT
            );
            self.advance_operator();
            return RegistrationState::ConfigureManualNetwork;
        }

        self.clock.sleep(REGISTRATION_POLL_DELAY);
        RegistrationState::CheckNetworkRegistration
    }

    fn check_service_status(&mut self) -> RegistrationState {
        debug!("checking service status");
        // UE system information, for the logs
        let _ = self.at.command("+CPSI?", DEFAULT_TIMEOUT);

        match self.is_service_available() {
            Ok(()) => {}
            Err(CellError::Timeout) => return RegistrationState::CheckModuleReady,
            Err(_) => {
                debug!("no service yet");
                self.clock.sleep(RETRY_DELAY);
                return RegistrationState::CheckServiceStatus;
            }
        }
        match self.activate_pdp_context() {
            Ok(()) => {}
            Err(CellError::Timeout) => return RegistrationState::CheckModuleReady,
            Err(_) => {
                warn!("failed to activate PDP context");
                self.clock.sleep(RETRY_DELAY);
                return RegistrationState::CheckServiceStatus;
            }
        }
        match self.ensure_packet_domain_attached(true) {
            Ok(()) => {}
            Err(CellError::Timeout) => return RegistrationState::CheckModuleReady,
            Err(_) => {
                debug!("packet domain not attached yet");
                self.clock.sleep(RETRY_DELAY);
                return RegistrationState::CheckServiceStatus;
            }
        }
        info!("service ready");
        RegistrationState::NetworkReady
    }

    fn network_ready(&mut self) -> RegistrationState {
        debug!("verifying network readiness");
        let csq = match self.retrieve_signal() {
            Ok(csq) => csq,
            Err(CellError::Timeout) => return RegistrationState::CheckModuleReady,
            Err(_) => {
                self.clock.sleep(RETRY_DELAY);
                return RegistrationState::CheckServiceStatus;
            }
        };
        if !(1..=31).contains(&csq) {
            warn!("invalid signal quality {}", csq);
            self.clock.sleep(RETRY_DELAY);
            return RegistrationState::CheckServiceStatus;
        }

        let addr = match self.retrieve_ip_addr() {
            Ok(addr) => addr,
            Err(_) => {
                warn!("failed to retrieve IP address");
                return RegistrationState::CheckServiceStatus;
            }
        };
        info!("network ready, signal {}, address {}", csq, addr);

        if let Some(op) = self.operators.get(self.current_index) {
            self.saved_plmn = op.plmn;
            info!("operator {} saved for future sessions", op.plmn);
        }
        RegistrationState::NetworkReady
    }

    /// Re-poll a denied or emergency-only status over a grace window; a
    /// transient value published mid-attach must not cost us the operator.
    /// Returns whether the denial is confirmed.
    fn confirm_denied(&mut self, tech: CellTechnology, stat: u8) -> bool {
        warn!(
            "registration denied or emergency-only (stat {}), confirming over {:?}",
            stat, DENIED_CONFIRMATION
        );
        let deadline = self.clock.now() + DENIED_CONFIRMATION;
        let mut last = stat;
        while self.clock.now() < deadline {
            self.clock.sleep(RETRY_DELAY);
            if let Ok(status) = self.registration_status(tech) {
                if status.is_registered() {
                    info!(
                        "registration recovered (stat {}) during confirmation",
                        status.stat
                    );
                    return false;
                }
                last = status.stat;
            }
        }
        matches!(last, 3 | 11)
    }

    fn advance_operator(&mut self) {
        self.saved_plmn = 0;
        self.current_index += 1;
    }

    fn registration_status(&mut self, tech: CellTechnology) -> CellResult<RegistrationStatus> {
        self.at
            .send_at(&format!("+{}?", tech.registration_command()));
        match self
            .at
            .wait_response(DEFAULT_TIMEOUT, &["+CREG:", "+CEREG:", "+CGREG:"])
        {
            AtResponse::Matched(_) => {}
            AtResponse::CmeError => return Err(CellError::Module),
            AtResponse::Timeout => return Err(CellError::Timeout),
        }
        let line = self.at.wait_line(LINE_TIMEOUT).ok_or(CellError::Timeout)?;
        let _ = self.at.finish(DEFAULT_TIMEOUT);
        parse_registration_status(&line)
    }

    fn disable_registration_urc(&mut self, tech: CellTechnology) -> CellResult<()> {
        match tech {
            CellTechnology::Auto => {
                for cmd in ["+CREG=0", "+CGREG=0", "+CEREG=0"] {
                    self.at.command(cmd, DEFAULT_TIMEOUT)?;
                }
                Ok(())
            }
            _ => self.at.command(
                &format!("+{}=0", tech.registration_command()),
                DEFAULT_TIMEOUT,
            ),
        }
    }

    fn apply_cellular_technology(&mut self, tech: CellTechnology) -> CellResult<()> {
        self.at
            .command(&format!("+CNMP={}", tech.mode()), DEFAULT_TIMEOUT)
    }

    fn apply_apn(&mut self, apn: &str) -> CellResult<()> {
        // PDP context 1 carries everything
        self.at
            .command(&format!("+CGDCONT=1,\"IP\",\"{}\"", apn), DEFAULT_TIMEOUT)
    }

    fn apply_operator_selection(&mut self, plmn: u32, access_tech: i8) -> CellResult<()> {
        if plmn == 0 {
            debug!("switching to automatic operator selection");
            return self.at.command("+COPS=0,2", SELECT_OPERATOR_TIMEOUT);
        }
        if access_tech >= 0 {
            self.at.command(
                &format!("+COPS=1,2,\"{}\",{}", plmn, access_tech),
                SELECT_OPERATOR_TIMEOUT,
            )
        } else {
            self.at
                .command(&format!("+COPS=1,2,\"{}\"", plmn), SELECT_OPERATOR_TIMEOUT)
        }
    }

    fn is_service_available(&mut self) -> CellResult<()> {
        let line = self.at.query("+CNSMOD?", "+CNSMOD:", DEFAULT_TIMEOUT)?;
        // <n>,<stat>; a second value of 0 means no service
        if matches!(line.trim(), "0,0" | "1,0") {
            return Err(CellError::Failed);
        }
        Ok(())
    }

    fn activate_pdp_context(&mut self) -> CellResult<()> {
        self.at.command("+CGACT=1,1", DEFAULT_TIMEOUT)
    }

    fn ensure_packet_domain_attached(&mut self, force: bool) -> CellResult<()> {
        let line = self.at.query("+CGATT?", "+CGATT:", DEFAULT_TIMEOUT)?;
        if line.trim() == "1" {
            return Ok(());
        }
        if !force {
            return Err(CellError::Failed);
        }
        self.at.command("+CGATT=1", DEFAULT_TIMEOUT)
    }
}

fn parse_registration_status(line: &str) -> CellResult<RegistrationStatus> {
    // <n>,<stat>[,<lac>,<ci>,<AcT>]
    let mut parts = line.trim().split(',');
    let mode = parts
        .next()
        .and_then(|v| v.trim().parse::<u8>().ok())
        .ok_or(CellError::Failed)?;
    let stat = parts
        .next()
        .and_then(|v| v.trim().parse::<u8>().ok())
        .ok_or(CellError::Failed)?;
    if mode > 2 {
        warn!("invalid registration report mode {}", mode);
        return Err(CellError::Module);
    }
    Ok(RegistrationStatus { mode, stat })
}
