//! SSH authentication protocol messages (RFC 4252, RFC 4256).
//!
//! This module implements the wire format of user authentication:
//! - "none" - Query the methods the server allows
//! - "password" - Password authentication
//! - "publickey" - Public key authentication, try-then-sign
//! - "keyboard-interactive" - Challenge/response prompts (RFC 4256)
//!
//! The state machine driving these messages lives in
//! [`auth_handler`](crate::ssh::auth_handler).
//!
//! # Security
//!
//! - **Constant-time password comparison** - Prevents timing attacks
//! - **Zeroized secrets** - Passwords and prompt responses are wiped on drop
//!
//! # Example
//!
//! ```rust
//! use tessera_proto::ssh::auth::{AuthMethod, AuthRequest};
//!
//! let auth = AuthRequest::new(
//!     "user",
//!     "ssh-connection",
//!     AuthMethod::Password("secret".to_string()),
//! );
//! assert_eq!(auth.method().name(), "password");
//! ```

use crate::ssh::message::MessageType;
use crate::ssh::wire::{put_bool, put_bytes, put_name_list, put_string};
use bytes::{BufMut, BytesMut};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tessera_platform::TesseraResult;
use zeroize::Zeroize;

/// Service requested before authentication.
pub const SERVICE_USERAUTH: &str = "ssh-userauth";

/// Service started once authentication succeeds.
pub const SERVICE_CONNECTION: &str = "ssh-connection";

/// SSH authentication method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication; used to learn the allowed methods.
    None,
    /// Password authentication.
    Password(String),
    /// Public key authentication.
    PublicKey {
        /// Algorithm name (e.g., "ssh-ed25519")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature (absent for a query)
        signature: Option<Vec<u8>>,
    },
    /// Keyboard-interactive authentication.
    KeyboardInteractive {
        /// Submethod hints, comma separated
        submethods: String,
    },
    /// A method this crate does not implement.
    Unsupported(String),
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
            AuthMethod::Unsupported(name) => name,
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password(ref mut password) = self {
            password.zeroize();
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a new authentication request.
    ///
    /// # Arguments
    ///
    /// * `user_name` - User name to authenticate as
    /// * `service_name` - Service to start afterwards (usually "ssh-connection")
    /// * `method` - Authentication method
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the authentication request to bytes.
    ///
    /// Format (RFC 4252 Section 5):
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthRequest as u8);
        put_string(&mut buf, &self.user_name);
        put_string(&mut buf, &self.service_name);
        put_string(&mut buf, self.method.name());

        match &self.method {
            AuthMethod::None | AuthMethod::Unsupported(_) => {}
            AuthMethod::Password(password) => {
                // not changing password
                put_bool(&mut buf, false);
                put_string(&mut buf, password);
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                put_bool(&mut buf, signature.is_some());
                put_string(&mut buf, algorithm);
                put_bytes(&mut buf, public_key);
                if let Some(sig) = signature {
                    put_bytes(&mut buf, sig);
                }
            }
            AuthMethod::KeyboardInteractive { submethods } => {
                // language tag (deprecated)
                put_string(&mut buf, "");
                put_string(&mut buf, submethods);
            }
        }

        buf.to_vec()
    }

    /// Parses an authentication request from bytes.
    ///
    /// Unknown method names parse as [`AuthMethod::Unsupported`] so the
    /// server can answer with a failure instead of dropping the session.
    pub fn from_bytes(data: &[u8]) -> TesseraResult<Self> {
        let mut r = MessageType::UserauthRequest.reader(data)?;
        let user_name = r.read_string()?;
        let service_name = r.read_string()?;
        let method_name = r.read_string()?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let _changing = r.read_bool()?;
                AuthMethod::Password(r.read_string()?)
            }
            "publickey" => {
                let has_signature = r.read_bool()?;
                let algorithm = r.read_string()?;
                let public_key = r.read_bytes()?.to_vec();
                let signature = if has_signature {
                    Some(r.read_bytes()?.to_vec())
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "keyboard-interactive" => {
                let _language = r.read_bytes()?;
                AuthMethod::KeyboardInteractive {
                    submethods: r.read_string()?,
                }
            }
            _ => AuthMethod::Unsupported(method_name),
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods_can_continue: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a new authentication failure message.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tessera_proto::ssh::auth::AuthFailure;
    ///
    /// let failure = AuthFailure::new(
    ///     vec!["publickey".to_string(), "password".to_string()],
    ///     false,
    /// );
    /// assert!(!failure.partial_success());
    /// ```
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Returns the methods that can continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Returns whether partial success was achieved.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        put_name_list(&mut buf, &self.methods_can_continue);
        put_bool(&mut buf, self.partial_success);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TesseraResult<Self> {
        let mut r = MessageType::UserauthFailure.reader(data)?;
        let methods_can_continue = r.read_name_list()?;
        let partial_success = r.read_bool()?;
        Ok(Self {
            methods_can_continue,
            partial_success,
        })
    }
}

/// SSH_MSG_USERAUTH_BANNER message (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    message: String,
    language_tag: String,
}

impl AuthBanner {
    /// Creates a new banner message.
    pub fn new(message: String) -> Self {
        Self {
            message,
            language_tag: String::new(),
        }
    }

    /// Returns the banner message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        put_string(&mut buf, &self.message);
        put_string(&mut buf, &self.language_tag);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TesseraResult<Self> {
        let mut r = MessageType::UserauthBanner.reader(data)?;
        let message = String::from_utf8_lossy(r.read_bytes()?).into_owned();
        let language_tag = if r.is_empty() {
            String::new()
        } else {
            r.read_string()?
        };
        Ok(Self {
            message,
            language_tag,
        })
    }
}

/// SSH_MSG_USERAUTH_PK_OK message (RFC 4252 Section 7).
///
/// Sent by the server to indicate that the public key is acceptable
/// for authentication (in response to a try-then-sign query).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    algorithm: String,
    public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Creates a new SSH_MSG_USERAUTH_PK_OK message.
    pub fn new(algorithm: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            public_key,
        }
    }

    /// Returns the algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the public key blob.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        put_string(&mut buf, &self.algorithm);
        put_bytes(&mut buf, &self.public_key);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TesseraResult<Self> {
        let mut r = MessageType::UserauthPkOk.reader(data)?;
        let algorithm = r.read_string()?;
        let public_key = r.read_bytes()?.to_vec();
        Ok(Self {
            algorithm,
            public_key,
        })
    }
}

/// One keyboard-interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Prompt text
    pub text: String,
    /// Whether the typed response may be echoed
    pub echo: bool,
}

impl Prompt {
    /// Creates a prompt.
    pub fn new(text: impl Into<String>, echo: bool) -> Self {
        Self {
            text: text.into(),
            echo,
        }
    }
}

/// SSH_MSG_USERAUTH_INFO_REQUEST (RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfoRequest {
    /// Title shown above the prompts
    pub name: String,
    /// Instruction text
    pub instruction: String,
    /// Prompts, possibly none
    pub prompts: Vec<Prompt>,
}

impl InfoRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(crate::ssh::message::MSG_USERAUTH_INFO_REQUEST);
        put_string(&mut buf, &self.name);
        put_string(&mut buf, &self.instruction);
        put_string(&mut buf, "");
        buf.put_u32(self.prompts.len() as u32);
        for prompt in &self.prompts {
            put_string(&mut buf, &prompt.text);
            put_bool(&mut buf, prompt.echo);
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TesseraResult<Self> {
        let mut r = MessageType::UserauthPkOk.reader(data)?;
        let name = r.read_string()?;
        let instruction = r.read_string()?;
        let _language = r.read_bytes()?;
        let count = r.read_u32()?;
        let mut prompts = Vec::new();
        for _ in 0..count {
            let text = r.read_string()?;
            let echo = r.read_bool()?;
            prompts.push(Prompt { text, echo });
        }
        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE (RFC 4256 Section 3.4).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfoResponse {
    /// One answer per prompt, in order
    pub responses: Vec<String>,
}

impl InfoResponse {
    /// Creates a response.
    pub fn new(responses: Vec<String>) -> Self {
        Self { responses }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthInfoResponse as u8);
        buf.put_u32(self.responses.len() as u32);
        for response in &self.responses {
            put_string(&mut buf, response);
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TesseraResult<Self> {
        let mut r = MessageType::UserauthInfoResponse.reader(data)?;
        let count = r.read_u32()?;
        let mut responses = Vec::new();
        for _ in 0..count {
            responses.push(r.read_string()?);
        }
        Ok(Self { responses })
    }
}

impl Drop for InfoResponse {
    fn drop(&mut self) {
        for response in &mut self.responses {
            response.zeroize();
        }
    }
}

/// Constructs the data to be signed for public key authentication (RFC 4252 Section 7).
///
/// # Format
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_bytes(&mut buf, session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    put_string(&mut buf, user_name);
    put_string(&mut buf, service_name);
    put_string(&mut buf, "publickey");
    put_bool(&mut buf, true);
    put_string(&mut buf, algorithm);
    put_bytes(&mut buf, public_key_blob);
    buf.to_vec()
}

/// Compares two passwords in constant time.
///
/// Both inputs are hashed first so differing lengths take the same time.
///
/// ```rust
/// use tessera_proto::ssh::auth::constant_time_compare;
///
/// assert!(constant_time_compare("secret", "secret"));
/// assert!(!constant_time_compare("secret", "wrong"));
/// ```
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    let hash_a = Sha256::digest(a.as_bytes());
    let hash_b = Sha256::digest(b.as_bytes());
    hash_a.ct_eq(&hash_b).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::wire::Reader;

    #[test]
    fn test_auth_request_password() {
        let auth = AuthRequest::new(
            "alice",
            SERVICE_CONNECTION,
            AuthMethod::Password("secret".to_string()),
        );

        let parsed = AuthRequest::from_bytes(&auth.to_bytes()).unwrap();
        assert_eq!(parsed.user_name(), "alice");
        assert_eq!(parsed.service_name(), "ssh-connection");
        match parsed.method() {
            AuthMethod::Password(pw) => assert_eq!(pw, "secret"),
            other => panic!("Expected Password method, got {:?}", other),
        }
    }

    #[test]
    fn test_auth_request_publickey_query() {
        let auth = AuthRequest::new(
            "bob",
            SERVICE_CONNECTION,
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".to_string(),
                public_key: vec![1, 2, 3, 4],
                signature: None,
            },
        );

        let parsed = AuthRequest::from_bytes(&auth.to_bytes()).unwrap();
        match parsed.method() {
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                assert_eq!(algorithm, "ssh-ed25519");
                assert_eq!(public_key, &[1, 2, 3, 4]);
                assert!(signature.is_none());
            }
            other => panic!("Expected PublicKey method, got {:?}", other),
        }
    }

    #[test]
    fn test_auth_request_keyboard_interactive() {
        let auth = AuthRequest::new(
            "carol",
            SERVICE_CONNECTION,
            AuthMethod::KeyboardInteractive {
                submethods: "pam".to_string(),
            },
        );
        let parsed = AuthRequest::from_bytes(&auth.to_bytes()).unwrap();
        assert_eq!(parsed.method().name(), "keyboard-interactive");
    }

    #[test]
    fn test_auth_request_unknown_method() {
        let mut buf = BytesMut::new();
        buf.put_u8(50);
        put_string(&mut buf, "dave");
        put_string(&mut buf, SERVICE_CONNECTION);
        put_string(&mut buf, "hostbased");
        let parsed = AuthRequest::from_bytes(&buf).unwrap();
        assert_eq!(
            parsed.method(),
            &AuthMethod::Unsupported("hostbased".to_string())
        );
    }

    #[test]
    fn test_auth_failure() {
        let failure =
            AuthFailure::new(vec!["publickey".to_string(), "password".to_string()], true);
        let parsed = AuthFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed, failure);
        assert!(parsed.partial_success());
    }

    #[test]
    fn test_auth_banner() {
        let banner = AuthBanner::new("Welcome".to_string());
        let parsed = AuthBanner::from_bytes(&banner.to_bytes()).unwrap();
        assert_eq!(parsed.message(), "Welcome");
    }

    #[test]
    fn test_info_request_and_response() {
        let request = InfoRequest {
            name: "Login".to_string(),
            instruction: String::new(),
            prompts: vec![Prompt::new("Password: ", false), Prompt::new("Code: ", true)],
        };
        let bytes = request.to_bytes();
        assert_eq!(bytes[0], 60);
        assert_eq!(InfoRequest::from_bytes(&bytes).unwrap(), request);

        let response = InfoResponse::new(vec!["pw".to_string(), "123".to_string()]);
        let bytes = response.to_bytes();
        assert_eq!(bytes[0], 61);
        assert_eq!(InfoResponse::from_bytes(&bytes).unwrap(), response);
    }

    #[test]
    fn test_auth_pk_ok_invalid_message_type() {
        assert!(AuthPkOk::from_bytes(&[50, 0, 0, 0, 0]).is_err());
        let pk_ok = AuthPkOk::new("ssh-ed25519", vec![9; 8]);
        assert_eq!(AuthPkOk::from_bytes(&pk_ok.to_bytes()).unwrap(), pk_ok);
    }

    #[test]
    fn test_construct_signature_data() {
        let data = construct_signature_data(&[1, 2, 3, 4], "alice", SERVICE_CONNECTION, "ssh-ed25519", &[5, 6]);

        let mut r = Reader::new(&data);
        assert_eq!(r.read_bytes().unwrap(), &[1, 2, 3, 4]);
        assert_eq!(r.read_u8().unwrap(), 50);
        assert_eq!(r.read_string().unwrap(), "alice");
        assert_eq!(r.read_string().unwrap(), "ssh-connection");
        assert_eq!(r.read_string().unwrap(), "publickey");
        assert!(r.read_bool().unwrap());
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("password123", "password123"));
        assert!(!constant_time_compare("password123", "password124"));
        assert!(!constant_time_compare("short", "verylongpassword"));
    }
}
