//! The uplink client: modem bring-up and the CoAP-facing operations.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::coap::engine::{RequestEngine, RequestError};
use crate::modem::at::AtChannel;
use crate::modem::registration::{CellTechnology, ModemSession, RegistrationError};
use crate::modem::{NoPowerPin, PowerPin};
use crate::payload::{EncodeError, PayloadBatch};
use crate::transport::Transport;
use crate::{Clock, EntropySource};

const DEFAULT_APN: &str = "internet";
const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(600);

/// Hardware profile of the node
///
/// Decides which ingestion endpoint measurement posts go to on the HTTP
/// fallback path, and which field groups a node ever reports: the compact
/// indoor profiles never carry the electrochemical O3/NO2 group.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SensorProfile {
    /// Indoor unit with a single PM sensor
    Compact,
    /// Indoor unit with dual PM sensors
    CompactDualPm,
    /// Outdoor unit without the electrochemical O3/NO2 front end
    OutdoorLite,
    /// Outdoor unit with the electrochemical O3/NO2 front end
    OutdoorFull,
}

impl SensorProfile {
    /// Measurement endpoint name for the HTTP fallback path
    pub fn measures_endpoint(self, extended_pm: bool) -> &'static str {
        if extended_pm {
            return "cpm";
        }
        match self {
            SensorProfile::Compact | SensorProfile::CompactDualPm => "cts",
            SensorProfile::OutdoorLite => "cvl",
            SensorProfile::OutdoorFull => "cvn",
        }
    }

    /// Whether this profile carries the electrochemical sensor group
    pub fn has_electrochemical(self) -> bool {
        self == SensorProfile::OutdoorFull
    }
}

/// Failure surfaced by the high-level uplink operations
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum UplinkError {
    #[error("payload encoding failed: {0}")]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Orchestrates the modem session and the request engine for one device
///
/// Owns the outcome flags the application samples between upload cycles:
/// `last_fetch_succeeded`, `last_post_succeeded`, `registered_on_server` and
/// `client_ready`. A cleared `client_ready` means the modem needs
/// reinitialisation ([`ensure_connection`](Self::ensure_connection)) before
/// further uplink traffic.
pub struct UplinkClient<A, C, P = NoPowerPin> {
    modem: ModemSession<A, C, P>,
    engine: RequestEngine,
    serial_number: String,
    profile: SensorProfile,
    extended_pm: bool,
    apn: String,
    registration_timeout: Duration,
    scan_timeout: Duration,
    iccid: Option<String>,
    client_ready: bool,
    last_fetch_succeeded: bool,
    last_post_succeeded: bool,
    registered_on_server: bool,
}

impl<A: AtChannel, C: Clock> UplinkClient<A, C> {
    pub fn new(at: A, clock: C, serial_number: impl Into<String>, profile: SensorProfile) -> Self {
        Self::with_session(ModemSession::new(at, clock), serial_number, profile)
    }
}

impl<A: AtChannel, C: Clock, P: PowerPin> UplinkClient<A, C, P> {
    pub fn with_power_pin(
        at: A,
        clock: C,
        power: P,
        serial_number: impl Into<String>,
        profile: SensorProfile,
    ) -> Self {
        Self::with_session(
            ModemSession::with_power_pin(at, clock, power),
            serial_number,
            profile,
        )
    }

    fn with_session(
        modem: ModemSession<A, C, P>,
        serial_number: impl Into<String>,
        profile: SensorProfile,
    ) -> Self {
        Self {
            modem,
            engine: RequestEngine::new(),
            serial_number: serial_number.into(),
            profile,
            extended_pm: false,
            apn: DEFAULT_APN.to_owned(),
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            iccid: None,
            client_ready: false,
            last_fetch_succeeded: true,
            last_post_succeeded: true,
            registered_on_server: true,
        }
    }

    pub fn set_apn(&mut self, apn: impl Into<String>) {
        self.apn = apn.into();
    }

    pub fn set_extended_pm(&mut self, enable: bool) {
        self.extended_pm = enable;
    }

    pub fn set_registration_timeout(&mut self, timeout: Duration) {
        info!("registration timeout set to {}s", timeout.as_secs());
        self.registration_timeout = timeout;
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn profile(&self) -> SensorProfile {
        self.profile
    }

    /// ICCID of the SIM, known after [`begin`](Self::begin)
    pub fn iccid(&self) -> Option<&str> {
        self.iccid.as_deref()
    }

    pub fn modem(&mut self) -> &mut ModemSession<A, C, P> {
        &mut self.modem
    }

    pub fn engine(&mut self) -> &mut RequestEngine {
        &mut self.engine
    }

    pub fn is_client_ready(&self) -> bool {
        self.client_ready
    }

    pub fn last_fetch_succeeded(&self) -> bool {
        self.last_fetch_succeeded
    }

    pub fn last_post_succeeded(&self) -> bool {
        self.last_post_succeeded
    }

    pub fn is_registered_on_server(&self) -> bool {
        self.registered_on_server
    }

    pub fn reset_fetch_status(&mut self) {
        self.last_fetch_succeeded = true;
    }

    pub fn reset_post_status(&mut self) {
        self.last_post_succeeded = true;
    }

    /// Bring the modem up and register on the network
    pub fn begin(&mut self) -> Result<(), RegistrationError> {
        self.client_ready = false;

        if self.modem.init().is_err() {
            warn!("cannot initialize cellular module");
            return Err(RegistrationError::ModuleNotReady);
        }
        if self.modem.is_sim_ready().is_err() {
            warn!("SIM is not ready, check that it is inserted properly");
            return Err(RegistrationError::ModuleNotReady);
        }
        match self.modem.retrieve_iccid() {
            Ok(iccid) => {
                info!("SIM CCID: {}", iccid);
                self.iccid = Some(iccid);
            }
            Err(err) => {
                warn!("failed to read SIM CCID: {}", err);
                return Err(RegistrationError::ModuleNotReady);
            }
        }

        let apn = self.apn.clone();
        self.modem.register(
            CellTechnology::Auto,
            &apn,
            self.registration_timeout,
            self.scan_timeout,
        )?;

        info!("cellular client ready, module registered to network");
        self.client_ready = true;
        Ok(())
    }

    /// Recover the link after a hard failure: optional module reset, then
    /// reinitialisation and a fresh registration
    pub fn ensure_connection(&mut self, reset: bool) -> Result<(), RegistrationError> {
        warn!("ensuring client connection, reinitializing cellular module");
        if reset {
            self.modem.hard_reset();
        }
        if self.modem.reinitialize().is_err() {
            self.client_ready = false;
            return Err(RegistrationError::ModuleNotReady);
        }

        let apn = self.apn.clone();
        match self.modem.register(
            CellTechnology::Auto,
            &apn,
            self.registration_timeout,
            self.scan_timeout,
        ) {
            Ok(()) => {
                info!("cellular client ready, module registered to network");
                self.client_ready = true;
                Ok(())
            }
            Err(err) => {
                self.client_ready = false;
                Err(err)
            }
        }
    }

    /// Fetch the device configuration over CoAP
    pub fn fetch_config(
        &mut self,
        transport: &mut dyn Transport,
        rng: &mut dyn EntropySource,
        keep_connection: bool,
    ) -> Result<Bytes, RequestError> {
        info!("fetching configuration for {}", self.serial_number);
        let response = match self.engine.get(transport, rng, &self.serial_number) {
            Ok(response) => response,
            Err(err) => {
                self.last_fetch_succeeded = false;
                self.note_request_failure(&err);
                return Err(err);
            }
        };

        if response.code_class() != 2 {
            warn!("configuration fetch rejected with {}", response.code);
            if response.code_class() == 4 {
                // the ingestion service does not know this device
                self.registered_on_server = false;
            }
            self.last_fetch_succeeded = false;
            return Err(RequestError::ErrorResponse(response.code));
        }

        self.last_fetch_succeeded = true;
        self.registered_on_server = true;
        self.engine.close(transport, keep_connection);
        debug!("received configuration ({} bytes)", response.payload.len());
        Ok(response.payload)
    }

    /// Encode a measurement batch and post it over CoAP
    pub fn post_measures(
        &mut self,
        transport: &mut dyn Transport,
        rng: &mut dyn EntropySource,
        batch: &PayloadBatch,
        keep_connection: bool,
    ) -> Result<(), UplinkError> {
        let payload = batch.to_bytes()?;
        self.post_raw_measures(transport, rng, &payload, keep_connection)?;
        Ok(())
    }

    /// Post an already encoded measurement payload over CoAP
    ///
    /// Bodies larger than one block go out as a Block1 transfer.
    pub fn post_raw_measures(
        &mut self,
        transport: &mut dyn Transport,
        rng: &mut dyn EntropySource,
        payload: &[u8],
        keep_connection: bool,
    ) -> Result<(), RequestError> {
        info!(
            "posting {} bytes of measurements for {}",
            payload.len(),
            self.serial_number
        );
        let response = match self.engine.post(transport, rng, &self.serial_number, payload) {
            Ok(response) => response,
            Err(err) => {
                self.last_post_succeeded = false;
                self.note_request_failure(&err);
                return Err(err);
            }
        };

        if response.code_class() != 2 {
            warn!("measurement post rejected with {}", response.code);
            self.last_post_succeeded = false;
            return Err(RequestError::ErrorResponse(response.code));
        }

        debug!("measurement post acknowledged with {}", response.code);
        self.last_post_succeeded = true;
        self.engine.close(transport, keep_connection);
        Ok(())
    }

    /// A hard bearer failure means the modem needs reinitialisation before
    /// the next exchange; protocol-level failures leave readiness untouched
    fn note_request_failure(&mut self, err: &RequestError) {
        if matches!(err, RequestError::Transport(_)) {
            self.client_ready = false;
        }
    }
}
