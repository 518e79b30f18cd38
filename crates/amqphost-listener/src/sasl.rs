//! Listener side SASL negotiation with the PLAIN and EXTERNAL mechanisms.
//!
//! The negotiation runs before the frame pump starts: the connection task
//! answers the client's SASL header, exchanges SASL frames and then reads the
//! AMQP header that follows a successful outcome.

use std::sync::Arc;

use amqphost_transport::{FrameReader, Transport};
use amqphost_types::{
    condition, decode_frame, encode_sasl_frame, FrameBody, ProtocolHeader, ProtocolId, SaslCode,
    SaslFrame, SaslInit, SaslMechanisms, SaslOutcome, SaslResponse, Symbol,
};
use bytes::Bytes;
use subtle::ConstantTimeEq;

use crate::config::{PlainCredentials, SaslSettings};
use crate::error::{AmqpError, Result};

/// What a profile wants to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslStep {
    /// Send a challenge and wait for a response.
    Challenge(Bytes),
    /// Finish with this outcome; `identity` is set on success.
    Outcome {
        /// Outcome code.
        code: SaslCode,
        /// Authenticated identity.
        identity: Option<String>,
    },
}

impl SaslStep {
    fn success(identity: impl Into<String>) -> Self {
        SaslStep::Outcome {
            code: SaslCode::Ok,
            identity: Some(identity.into()),
        }
    }

    fn failure(code: SaslCode) -> Self {
        SaslStep::Outcome { code, identity: None }
    }
}

/// What a mechanism may learn about the connection being authenticated.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaslContext<'a> {
    /// DER certificates presented during the TLS handshake.
    pub peer_certificates: Option<&'a [Vec<u8>]>,
}

/// Per-connection state of one mechanism.
pub trait SaslProfile: Send {
    /// Handles `sasl-init`.
    fn on_init(&mut self, init: &SaslInit, context: &SaslContext<'_>) -> SaslStep;

    /// Handles `sasl-response`. Mechanisms without challenges fail here.
    fn on_response(&mut self, _response: &SaslResponse, _context: &SaslContext<'_>) -> SaslStep {
        SaslStep::failure(SaslCode::Auth)
    }
}

/// A mechanism offered in `sasl-mechanisms`.
pub trait SaslMechanism: Send + Sync {
    /// Mechanism name, e.g. `PLAIN`.
    fn name(&self) -> &str;

    /// Creates the state for one connection.
    fn create_profile(&self) -> Box<dyn SaslProfile>;
}

/// `PLAIN` (RFC 4616) against one configured user.
#[derive(Debug, Clone)]
pub struct PlainMechanism {
    credentials: PlainCredentials,
}

impl PlainMechanism {
    /// Accepts exactly these credentials.
    pub fn new(credentials: PlainCredentials) -> Self {
        Self { credentials }
    }
}

impl SaslMechanism for PlainMechanism {
    fn name(&self) -> &str {
        "PLAIN"
    }

    fn create_profile(&self) -> Box<dyn SaslProfile> {
        Box::new(PlainProfile {
            credentials: self.credentials.clone(),
        })
    }
}

struct PlainProfile {
    credentials: PlainCredentials,
}

/// Splits `authzid NUL authcid NUL passwd`.
fn parse_plain(response: &[u8]) -> Option<(&str, &str)> {
    let mut parts = response.split(|b| *b == 0);
    let _authzid = parts.next()?;
    let user = std::str::from_utf8(parts.next()?).ok()?;
    let password = std::str::from_utf8(parts.next()?).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((user, password))
}

/// Compares both fields in constant time for equal lengths.
fn credentials_match(credentials: &PlainCredentials, user: &str, password: &str) -> bool {
    let user = user.as_bytes().ct_eq(credentials.user.as_bytes());
    let password = password.as_bytes().ct_eq(credentials.password.as_bytes());
    bool::from(user & password)
}

impl SaslProfile for PlainProfile {
    fn on_init(&mut self, init: &SaslInit, _context: &SaslContext<'_>) -> SaslStep {
        let response = init.initial_response.as_deref().unwrap_or_default();
        match parse_plain(response) {
            Some((user, password)) if credentials_match(&self.credentials, user, password) => {
                SaslStep::success(user)
            }
            _ => SaslStep::failure(SaslCode::Auth),
        }
    }
}

/// `EXTERNAL`: succeeds when the transport carries a client certificate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalMechanism;

impl SaslMechanism for ExternalMechanism {
    fn name(&self) -> &str {
        "EXTERNAL"
    }

    fn create_profile(&self) -> Box<dyn SaslProfile> {
        Box::new(ExternalProfile)
    }
}

struct ExternalProfile;

impl SaslProfile for ExternalProfile {
    fn on_init(&mut self, init: &SaslInit, context: &SaslContext<'_>) -> SaslStep {
        match context.peer_certificates {
            Some(chain) if !chain.is_empty() => {
                let authzid = init
                    .initial_response
                    .as_deref()
                    .and_then(|r| std::str::from_utf8(r).ok())
                    .filter(|s| !s.is_empty())
                    .unwrap_or("external");
                SaslStep::success(authzid)
            }
            _ => SaslStep::failure(SaslCode::Auth),
        }
    }
}

/// Builds the mechanism table for a listener.
///
/// Credentials from the listen address override those from `settings`.
pub fn mechanisms(
    settings: &SaslSettings,
    address_credentials: Option<PlainCredentials>,
) -> Vec<Arc<dyn SaslMechanism>> {
    let mut table: Vec<Arc<dyn SaslMechanism>> = Vec::new();
    if let Some(credentials) = address_credentials.or_else(|| settings.plain.clone()) {
        table.push(Arc::new(PlainMechanism::new(credentials)));
    }
    if settings.external {
        table.push(Arc::new(ExternalMechanism));
    }
    table
}

/// Negotiation progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslState {
    /// Mechanisms sent, waiting for `sasl-init`.
    WaitingForInit,
    /// A mechanism is exchanging challenges.
    MechanismSelected,
    /// Outcome `ok` sent, waiting for the AMQP header.
    Upgrading,
    /// AMQP header received.
    Done,
    /// Negotiation failed.
    Failed,
}

/// The listener's SASL state machine, independent of I/O.
pub struct SaslNegotiator {
    mechanisms: Vec<Arc<dyn SaslMechanism>>,
    state: SaslState,
    profile: Option<Box<dyn SaslProfile>>,
    identity: Option<String>,
}

impl std::fmt::Debug for SaslNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslNegotiator")
            .field("state", &self.state)
            .field("identity", &self.identity)
            .finish()
    }
}

impl SaslNegotiator {
    /// Starts in [`SaslState::WaitingForInit`].
    pub fn new(mechanisms: Vec<Arc<dyn SaslMechanism>>) -> Self {
        Self {
            mechanisms,
            state: SaslState::WaitingForInit,
            profile: None,
            identity: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SaslState {
        self.state
    }

    /// Identity established by a successful outcome.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// The `sasl-mechanisms` frame announcing the table.
    pub fn mechanisms_frame(&self) -> SaslFrame {
        SaslFrame::Mechanisms(SaslMechanisms {
            mechanisms: self
                .mechanisms
                .iter()
                .map(|m| Symbol::from(m.name()))
                .collect(),
        })
    }

    /// Processes one decoded frame body and returns the frame to send back.
    ///
    /// A failed outcome is returned as `Ok`; the caller sends it and then
    /// reads [`SaslNegotiator::state`].
    pub fn on_frame(&mut self, body: FrameBody, context: &SaslContext<'_>) -> Result<SaslFrame> {
        let step = match (self.state, body) {
            (SaslState::WaitingForInit, FrameBody::Sasl(SaslFrame::Init(init))) => {
                let name = init.mechanism.as_str();
                let Some(mechanism) = self.mechanisms.iter().find(|m| m.name() == name) else {
                    self.state = SaslState::Failed;
                    return Err(AmqpError::not_implemented(format!(
                        "SASL mechanism {} is not supported",
                        name
                    )));
                };
                let mut profile = mechanism.create_profile();
                let step = profile.on_init(&init, context);
                self.profile = Some(profile);
                self.state = SaslState::MechanismSelected;
                step
            }
            (SaslState::MechanismSelected, FrameBody::Sasl(SaslFrame::Response(response))) => {
                match self.profile.as_mut() {
                    Some(profile) => profile.on_response(&response, context),
                    None => SaslStep::failure(SaslCode::Sys),
                }
            }
            (state, body) => {
                self.state = SaslState::Failed;
                return Err(AmqpError::not_allowed(format!(
                    "unexpected {} during SASL negotiation in state {:?}",
                    describe(&body),
                    state
                )));
            }
        };

        Ok(match step {
            SaslStep::Challenge(challenge) => {
                SaslFrame::Challenge(amqphost_types::SaslChallenge { challenge })
            }
            SaslStep::Outcome { code, identity } => {
                if code == SaslCode::Ok {
                    self.identity = identity;
                    self.state = SaslState::Upgrading;
                } else {
                    self.state = SaslState::Failed;
                }
                self.profile = None;
                SaslFrame::Outcome(SaslOutcome {
                    code,
                    additional_data: None,
                })
            }
        })
    }

    /// Records the AMQP header that ends the SASL layer.
    pub fn on_header(&mut self, header: &ProtocolHeader) -> Result<()> {
        if self.state != SaslState::Upgrading || header.id != ProtocolId::Amqp {
            self.state = SaslState::Failed;
            return Err(AmqpError::not_allowed(format!(
                "unexpected protocol header {:?} in SASL state {:?}",
                header.id, self.state
            )));
        }
        self.state = SaslState::Done;
        Ok(())
    }
}

fn describe(body: &FrameBody) -> &'static str {
    match body {
        FrameBody::Amqp(p) => p.name(),
        FrameBody::Sasl(SaslFrame::Mechanisms(_)) => "sasl-mechanisms",
        FrameBody::Sasl(SaslFrame::Init(_)) => "sasl-init",
        FrameBody::Sasl(SaslFrame::Challenge(_)) => "sasl-challenge",
        FrameBody::Sasl(SaslFrame::Response(_)) => "sasl-response",
        FrameBody::Sasl(SaslFrame::Outcome(_)) => "sasl-outcome",
        FrameBody::Empty => "empty frame",
    }
}

/// The outcome sent before closing on a negotiation error.
fn failure_outcome(error: &AmqpError) -> SaslFrame {
    let code = if error.condition() == condition::NOT_IMPLEMENTED {
        SaslCode::SysPerm
    } else {
        SaslCode::Sys
    };
    SaslFrame::Outcome(SaslOutcome {
        code,
        additional_data: None,
    })
}

/// Runs SASL over a transport after the client's SASL header was read.
///
/// Returns the authenticated identity and the AMQP header that followed.
pub async fn negotiate(
    reader: &FrameReader,
    transport: &dyn Transport,
    negotiator: &mut SaslNegotiator,
) -> Result<(Option<String>, ProtocolHeader)> {
    let peer_certificates = transport.peer_certificates();
    let context = SaslContext {
        peer_certificates: peer_certificates.as_deref(),
    };

    transport
        .send(Bytes::copy_from_slice(&ProtocolHeader::sasl().to_bytes()))
        .await?;
    transport
        .send(encode_sasl_frame(&negotiator.mechanisms_frame()))
        .await?;

    while negotiator.state() != SaslState::Upgrading {
        let frame = decode_frame(reader.read_frame().await?)?;
        match negotiator.on_frame(frame.body, &context) {
            Ok(reply) => transport.send(encode_sasl_frame(&reply)).await?,
            Err(e) => {
                transport.send(encode_sasl_frame(&failure_outcome(&e))).await?;
                return Err(e);
            }
        }
        if negotiator.state() == SaslState::Failed {
            return Err(AmqpError::new(
                condition::UNAUTHORIZED_ACCESS,
                "SASL authentication failed",
            ));
        }
    }

    let header = ProtocolHeader::parse(&reader.read_header().await?)?;
    negotiator.on_header(&header)?;
    tracing::debug!(peer = %transport.peer_addr(), identity = ?negotiator.identity(), "SASL done");
    Ok((negotiator.identity().map(str::to_string), header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqphost_types::{Performative, SaslChallenge};

    fn plain_table() -> Vec<Arc<dyn SaslMechanism>> {
        mechanisms(
            &SaslSettings {
                plain: None,
                external: true,
            },
            Some(PlainCredentials {
                user: "guest".into(),
                password: "secret".into(),
            }),
        )
    }

    fn init(mechanism: &str, response: &[u8]) -> FrameBody {
        FrameBody::Sasl(SaslFrame::Init(SaslInit {
            mechanism: Symbol::from(mechanism),
            initial_response: Some(Bytes::copy_from_slice(response)),
            hostname: None,
        }))
    }

    fn outcome_code(frame: SaslFrame) -> SaslCode {
        match frame {
            SaslFrame::Outcome(o) => o.code,
            other => panic!("expected outcome, got {:?}", other),
        }
    }

    #[test]
    fn test_mechanisms_frame_lists_table() {
        let negotiator = SaslNegotiator::new(plain_table());
        match negotiator.mechanisms_frame() {
            SaslFrame::Mechanisms(m) => {
                assert_eq!(m.mechanisms, vec![Symbol::from("PLAIN"), Symbol::from("EXTERNAL")])
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(mechanisms(&SaslSettings::default(), None).is_empty());
    }

    #[test]
    fn test_plain_success() {
        let mut negotiator = SaslNegotiator::new(plain_table());
        let reply = negotiator
            .on_frame(init("PLAIN", b"\0guest\0secret"), &SaslContext::default())
            .unwrap();
        assert_eq!(outcome_code(reply), SaslCode::Ok);
        assert_eq!(negotiator.state(), SaslState::Upgrading);
        assert_eq!(negotiator.identity(), Some("guest"));
        negotiator.on_header(&ProtocolHeader::amqp()).unwrap();
        assert_eq!(negotiator.state(), SaslState::Done);
    }

    #[test]
    fn test_plain_wrong_password() {
        let mut negotiator = SaslNegotiator::new(plain_table());
        let reply = negotiator
            .on_frame(init("PLAIN", b"\0guest\0nope"), &SaslContext::default())
            .unwrap();
        assert_eq!(outcome_code(reply), SaslCode::Auth);
        assert_eq!(negotiator.state(), SaslState::Failed);
        assert!(negotiator.identity().is_none());
    }

    #[test]
    fn test_plain_parsing() {
        assert_eq!(parse_plain(b"admin\0guest\0pw"), Some(("guest", "pw")));
        assert_eq!(parse_plain(b"\0guest\0"), Some(("guest", "")));
        assert_eq!(parse_plain(b"guest"), None);
        assert_eq!(parse_plain(b"\0a\0b\0c"), None);
    }

    #[test]
    fn test_unknown_mechanism_not_implemented() {
        let mut negotiator = SaslNegotiator::new(plain_table());
        let err = negotiator
            .on_frame(init("SCRAM-SHA-256", b""), &SaslContext::default())
            .unwrap_err();
        assert_eq!(err.condition(), condition::NOT_IMPLEMENTED);
        assert_eq!(negotiator.state(), SaslState::Failed);
    }

    #[test]
    fn test_external_needs_certificate() {
        let mut without = SaslNegotiator::new(plain_table());
        let reply = without
            .on_frame(init("EXTERNAL", b""), &SaslContext::default())
            .unwrap();
        assert_eq!(outcome_code(reply), SaslCode::Auth);

        let chain = vec![vec![0x30u8, 0x82]];
        let mut with = SaslNegotiator::new(plain_table());
        let context = SaslContext {
            peer_certificates: Some(&chain),
        };
        let reply = with.on_frame(init("EXTERNAL", b""), &context).unwrap();
        assert_eq!(outcome_code(reply), SaslCode::Ok);
        assert_eq!(with.identity(), Some("external"));
    }

    #[test]
    fn test_non_sasl_frame_not_allowed() {
        let mut negotiator = SaslNegotiator::new(plain_table());
        let body = FrameBody::Amqp(Performative::Open(amqphost_types::Open::new("c")));
        let err = negotiator.on_frame(body, &SaslContext::default()).unwrap_err();
        assert_eq!(err.condition(), condition::NOT_ALLOWED);

        let mut negotiator = SaslNegotiator::new(plain_table());
        let body = FrameBody::Sasl(SaslFrame::Challenge(SaslChallenge {
            challenge: Bytes::new(),
        }));
        assert!(negotiator.on_frame(body, &SaslContext::default()).is_err());
    }

    #[test]
    fn test_plain_wrong_user_same_password() {
        let mut negotiator = SaslNegotiator::new(plain_table());
        let reply = negotiator
            .on_frame(init("PLAIN", b"\0guesT\0secret"), &SaslContext::default())
            .unwrap();
        assert_eq!(outcome_code(reply), SaslCode::Auth);
        let mut negotiator = SaslNegotiator::new(plain_table());
        let reply = negotiator
            .on_frame(init("PLAIN", b"\0guest\0secret2"), &SaslContext::default())
            .unwrap();
        assert_eq!(outcome_code(reply), SaslCode::Auth);
    }

    #[test]
    fn test_every_negotiation_error_has_an_outcome() {
        let not_allowed = AmqpError::not_allowed("unexpected sasl-response");
        assert_eq!(outcome_code(failure_outcome(&not_allowed)), SaslCode::Sys);
        let unsupported = AmqpError::not_implemented("SASL mechanism X is not supported");
        assert_eq!(outcome_code(failure_outcome(&unsupported)), SaslCode::SysPerm);
    }

    #[test]
    fn test_header_before_outcome_rejected() {
        let mut negotiator = SaslNegotiator::new(plain_table());
        assert!(negotiator.on_header(&ProtocolHeader::amqp()).is_err());
        assert_eq!(negotiator.state(), SaslState::Failed);
    }
}
