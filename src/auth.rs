use base64::engine::general_purpose;
use base64::Engine;
use bytes::Bytes;

/// Username/password pair supplied on the command line.
#[derive(Debug, Clone)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

/// Error type for credential encoding
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("username and password must each fit in 255 bytes")]
    TooLong,
}

impl Auth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    /// Split a raw `user:pass` argument at the first colon.
    pub fn parse(raw: &str) -> Option<Self> {
        let (username, password) = raw.split_once(':')?;
        if username.is_empty() || password.is_empty() {
            return None;
        }
        Some(Self::new(username.to_string(), password.to_string()))
    }

    /// The value a client must present after `Basic ` in `Proxy-Authorization`.
    pub fn basic_token(&self) -> String {
        general_purpose::STANDARD.encode(format!("{}:{}", self.username, self.password))
    }

    /// Pre-serialized RFC 1929 username/password sub-negotiation packet.
    pub fn subnegotiation(&self) -> Result<Bytes, CredentialError> {
        let username = self.username.as_bytes();
        let password = self.password.as_bytes();
        if username.len() > 255 || password.len() > 255 {
            return Err(CredentialError::TooLong);
        }

        let mut packet = Vec::with_capacity(3 + username.len() + password.len());
        packet.push(0x01);
        packet.push(username.len() as u8);
        packet.extend_from_slice(username);
        packet.push(password.len() as u8);
        packet.extend_from_slice(password);
        Ok(Bytes::from(packet))
    }
}
