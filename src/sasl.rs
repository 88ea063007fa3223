//! Client-side SASL negotiation.
//!
//! The server advertises its mechanisms in response to LIST_MECHS; the
//! conversation picks the strongest one the client implements and
//! produces the initial response. Only PLAIN is implemented, which
//! completes in a single round.

use crate::error::AuthError;
use zeroize::Zeroizing;

/// Mechanisms this client can drive, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mechanism {
    /// RFC 4616 PLAIN: `authzid NUL authcid NUL passwd`
    Plain,
}

impl Mechanism {
    /// Pick the strongest mutually supported mechanism from a
    /// space-separated server offer.
    fn select(offered: &str) -> Option<Mechanism> {
        offered
            .split_whitespace()
            .any(|m| m.eq_ignore_ascii_case("PLAIN"))
            .then_some(Mechanism::Plain)
    }

    /// Mechanism name as it travels in the packet key.
    pub(crate) fn name(self) -> &'static str {
        match self {
            Mechanism::Plain => "PLAIN",
        }
    }
}

/// One authentication exchange against one node.
#[derive(Debug)]
pub(crate) struct SaslConversation {
    username: String,
    password: Zeroizing<String>,
    mechanism: Option<Mechanism>,
}

impl SaslConversation {
    pub(crate) fn new(username: &str, password: &str) -> Self {
        SaslConversation {
            username: username.to_owned(),
            password: Zeroizing::new(password.to_owned()),
            mechanism: None,
        }
    }

    /// React to the server's mechanism list: choose a mechanism and
    /// build the initial response for AUTH.
    pub(crate) fn start(&mut self, offered: &str) -> Result<(&'static str, Vec<u8>), AuthError> {
        let mechanism =
            Mechanism::select(offered).ok_or_else(|| AuthError::NoMechanism(offered.to_owned()))?;
        self.mechanism = Some(mechanism);

        let mut response = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        response.push(0);
        response.extend_from_slice(self.username.as_bytes());
        response.push(0);
        response.extend_from_slice(self.password.as_bytes());
        Ok((mechanism.name(), response))
    }

    /// Name of the mechanism in use.
    pub(crate) fn mechanism_name(&self) -> &'static str {
        self.mechanism.map_or("?", Mechanism::name)
    }

    /// React to an AUTH_CONTINUE challenge. PLAIN is single-round, so
    /// any continuation is an error.
    pub(crate) fn step(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        match self.mechanism {
            Some(m) => Err(AuthError::UnexpectedChallenge(m.name())),
            None => Err(AuthError::OutOfPhase),
        }
    }
}
