//! User authentication state machine (RFC 4252, RFC 4256).
//!
//! # Client
//!
//! Each attempt registers a waiter, sends one `USERAUTH_REQUEST` and waits
//! for the receive loop to deliver `SUCCESS`, `FAILURE`, `PK_OK` or
//! `INFO_REQUEST`. If the session dies first the waiter is dropped and the
//! attempt fails with an authentication error carrying the cause.
//!
//! # Server
//!
//! [`ServerAuthenticator`] validates requests through a
//! [`ServerHandler`](crate::ssh::server::ServerHandler). Every request
//! except `none` and unsigned public-key queries counts as an attempt;
//! the attempt that reaches the limit is answered with `FAILURE` and then
//! `DISCONNECT(no-more-auth-methods-available)`, after which nothing more
//! is processed.

use crate::ssh::auth::{
    construct_signature_data, AuthBanner, AuthFailure, AuthMethod, AuthPkOk, AuthRequest,
    InfoRequest, InfoResponse, SERVICE_CONNECTION, SERVICE_USERAUTH,
};
use crate::ssh::hostkey::{verify_signature, HostKey};
use crate::ssh::message::{service_message, MessageType, MSG_USERAUTH_INFO_REQUEST};
use crate::ssh::server::ServerHandler;
use crate::ssh::transport::Transport;
use std::sync::Arc;
use tessera_platform::{AuthError, TesseraError, TesseraResult};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Successful outcome of one client authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Fully authenticated.
    Success,
    /// This method was accepted but more are required.
    PartialSuccess {
        /// Methods that may continue
        allowed_methods: Vec<String>,
    },
}

/// A server-side verdict on one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Authentication is complete.
    Success,
    /// Rejected.
    Failure,
    /// Accepted, but the listed methods must still succeed.
    PartialSuccess(Vec<String>),
    /// Another keyboard-interactive round with these prompts.
    Prompt(InfoRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Result,
    PkOk,
    InfoRequest,
}

#[derive(Debug)]
pub(crate) enum AuthReply {
    Success,
    Failure(AuthFailure),
    PkOk,
    InfoRequest(InfoRequest),
}

#[derive(Debug)]
struct Pending {
    expect: Expect,
    reply: oneshot::Sender<AuthReply>,
}

/// Client-side authentication state, fed by the receive loop.
#[derive(Debug, Default)]
pub(crate) struct ClientAuthState {
    pending: Option<Pending>,
    service_waiter: Option<oneshot::Sender<()>>,
    service_accepted: bool,
    username: Option<String>,
    authenticated: bool,
    banner: Option<String>,
    closed: bool,
}

impl ClientAuthState {
    pub(crate) fn banner(&self) -> Option<String> {
        self.banner.clone()
    }

    pub(crate) fn username(&self) -> Option<String> {
        self.username.clone()
    }

    /// Drops every waiter; later attempts fail immediately.
    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.pending = None;
        self.service_waiter = None;
    }

    pub(crate) fn handle_service_accept(&mut self, service: &str) -> TesseraResult<()> {
        if service != SERVICE_USERAUTH {
            return Err(TesseraError::Protocol(format!(
                "Server accepted unexpected service '{}'",
                service
            )));
        }
        self.service_accepted = true;
        if let Some(waiter) = self.service_waiter.take() {
            let _ = waiter.send(());
        }
        Ok(())
    }

    /// Handles one message in the 50-79 range.
    ///
    /// Returns true when authentication just completed.
    pub(crate) fn handle(&mut self, payload: &[u8]) -> TesseraResult<bool> {
        let reply = match payload[0] {
            b if b == MessageType::UserauthSuccess as u8 => {
                self.authenticated = true;
                info!(user = ?self.username, "Authenticated");
                AuthReply::Success
            }
            b if b == MessageType::UserauthFailure as u8 => {
                AuthReply::Failure(AuthFailure::from_bytes(payload)?)
            }
            b if b == MessageType::UserauthBanner as u8 => {
                let banner = AuthBanner::from_bytes(payload)?;
                debug!(len = banner.message().len(), "Auth banner received");
                self.banner = Some(banner.message().to_string());
                return Ok(false);
            }
            MSG_USERAUTH_INFO_REQUEST => match self.pending.as_ref().map(|p| p.expect) {
                Some(Expect::PkOk) => {
                    AuthPkOk::from_bytes(payload)?;
                    AuthReply::PkOk
                }
                Some(Expect::InfoRequest) => AuthReply::InfoRequest(InfoRequest::from_bytes(payload)?),
                _ => {
                    return Err(TesseraError::Protocol(
                        "Unexpected USERAUTH message 60".to_string(),
                    ))
                }
            },
            other => {
                return Err(TesseraError::Protocol(format!(
                    "Unexpected auth message {} on client",
                    other
                )))
            }
        };

        let authenticated = matches!(reply, AuthReply::Success);
        match self.pending.take() {
            Some(pending) => {
                let _ = pending.reply.send(reply);
            }
            None => debug!("Auth reply with no attempt outstanding"),
        }
        Ok(authenticated)
    }
}

fn conclude(reply: AuthReply, method: &str) -> TesseraResult<AuthResult> {
    match reply {
        AuthReply::Success => Ok(AuthResult::Success),
        AuthReply::Failure(failure) if failure.partial_success() => {
            debug!(method, "Partial success");
            Ok(AuthResult::PartialSuccess {
                allowed_methods: failure.methods_can_continue().to_vec(),
            })
        }
        AuthReply::Failure(failure) => Err(TesseraError::Auth(AuthError::with_methods(
            format!("{} authentication rejected", method),
            failure.methods_can_continue().to_vec(),
        ))),
        AuthReply::PkOk | AuthReply::InfoRequest(_) => Err(TesseraError::Protocol(format!(
            "Unexpected reply to {} authentication",
            method
        ))),
    }
}

impl Transport {
    /// Asks the server which methods it accepts, or logs in if `none` is
    /// enough.
    ///
    /// # Errors
    ///
    /// [`TesseraError::Auth`] carrying the allowed methods in the usual case.
    pub async fn auth_none(&self, username: &str) -> TesseraResult<AuthResult> {
        let _attempt = self.inner.auth_lock.lock().await;
        let request = AuthRequest::new(username, SERVICE_CONNECTION, AuthMethod::None);
        let reply = self.auth_exchange(username, request.to_bytes(), Expect::Result).await?;
        conclude(reply, "none")
    }

    /// Authenticates with a password.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # async fn demo(transport: tessera_proto::ssh::Transport) -> tessera_platform::TesseraResult<()> {
    /// transport.auth_password("deploy", "hunter2").await?;
    /// assert!(transport.is_authenticated());
    /// # Ok(()) }
    /// ```
    pub async fn auth_password(&self, username: &str, password: &str) -> TesseraResult<AuthResult> {
        let _attempt = self.inner.auth_lock.lock().await;
        let request = AuthRequest::new(
            username,
            SERVICE_CONNECTION,
            AuthMethod::Password(password.to_string()),
        );
        let reply = self.auth_exchange(username, request.to_bytes(), Expect::Result).await?;
        conclude(reply, "password")
    }

    /// Authenticates with a key, asking the server first whether it would
    /// accept it and signing only then.
    pub async fn auth_publickey(
        &self,
        username: &str,
        key: &dyn HostKey,
    ) -> TesseraResult<AuthResult> {
        let _attempt = self.inner.auth_lock.lock().await;
        let algorithm = key.algorithm_name().to_string();
        let public_key = key.public_key_bytes();

        let query = AuthRequest::new(
            username,
            SERVICE_CONNECTION,
            AuthMethod::PublicKey {
                algorithm: algorithm.clone(),
                public_key: public_key.clone(),
                signature: None,
            },
        );
        match self.auth_exchange(username, query.to_bytes(), Expect::PkOk).await? {
            AuthReply::PkOk => debug!(algorithm = %algorithm, "Server accepts key"),
            other => return conclude(other, "publickey"),
        }

        let session_id = self
            .session_id()
            .ok_or_else(|| TesseraError::Protocol("No session id yet".to_string()))?;
        let data = construct_signature_data(
            &session_id,
            username,
            SERVICE_CONNECTION,
            &algorithm,
            &public_key,
        );
        let signed = AuthRequest::new(
            username,
            SERVICE_CONNECTION,
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature: Some(key.sign(&data)?),
            },
        );
        let reply = self.auth_exchange(username, signed.to_bytes(), Expect::Result).await?;
        conclude(reply, "publickey")
    }

    /// Keyboard-interactive authentication.
    ///
    /// `respond` is called for every `INFO_REQUEST` and must return one
    /// answer per prompt.
    pub async fn auth_interactive<F>(
        &self,
        username: &str,
        submethods: &str,
        mut respond: F,
    ) -> TesseraResult<AuthResult>
    where
        F: FnMut(&InfoRequest) -> Vec<String> + Send,
    {
        let _attempt = self.inner.auth_lock.lock().await;
        let request = AuthRequest::new(
            username,
            SERVICE_CONNECTION,
            AuthMethod::KeyboardInteractive {
                submethods: submethods.to_string(),
            },
        );
        let mut reply = self
            .auth_exchange(username, request.to_bytes(), Expect::InfoRequest)
            .await?;
        loop {
            match reply {
                AuthReply::InfoRequest(info) => {
                    debug!(prompts = info.prompts.len(), "Info request");
                    let response = InfoResponse::new(respond(&info));
                    reply = self
                        .auth_exchange(username, response.to_bytes(), Expect::InfoRequest)
                        .await?;
                }
                other => return conclude(other, "keyboard-interactive"),
            }
        }
    }

    /// Authenticates with a password through keyboard-interactive, answering
    /// every prompt with `password`.
    pub async fn auth_interactive_password(
        &self,
        username: &str,
        password: &str,
    ) -> TesseraResult<AuthResult> {
        self.auth_interactive(username, "", |info| {
            info.prompts.iter().map(|_| password.to_string()).collect()
        })
        .await
    }

    async fn ensure_userauth_service(&self) -> TesseraResult<()> {
        let waiter = {
            let mut st = self.inner.client_auth.lock();
            if st.closed {
                return Err(self.auth_session_error());
            }
            if st.service_accepted {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            st.service_waiter = Some(tx);
            rx
        };
        self.inner
            .packetizer
            .send_when_clear(&service_message(MessageType::ServiceRequest, SERVICE_USERAUTH))
            .await
            .map_err(|_| self.auth_session_error())?;
        waiter.await.map_err(|_| self.auth_session_error())
    }

    async fn auth_exchange(
        &self,
        username: &str,
        payload: Vec<u8>,
        expect: Expect,
    ) -> TesseraResult<AuthReply> {
        if self.inner.is_server {
            return Err(TesseraError::Config(
                "Authentication requests are sent by clients".to_string(),
            ));
        }
        if self.is_authenticated() {
            return Err(TesseraError::Auth(AuthError::new("Already authenticated")));
        }
        self.ensure_userauth_service().await?;

        let rx = {
            let mut st = self.inner.client_auth.lock();
            if st.closed {
                return Err(self.auth_session_error());
            }
            let (tx, rx) = oneshot::channel();
            st.pending = Some(Pending { expect, reply: tx });
            st.username = Some(username.to_string());
            rx
        };
        self.inner
            .packetizer
            .send_when_clear(&payload)
            .await
            .map_err(|_| self.auth_session_error())?;
        rx.await.map_err(|_| self.auth_session_error())
    }

    fn auth_session_error(&self) -> TesseraError {
        let reason = match self.last_error() {
            Some(cause) => format!("session ended: {}", cause),
            None => "session ended".to_string(),
        };
        TesseraError::Auth(AuthError::new(reason))
    }
}

/// What the transport must do after the server handled an auth message.
#[derive(Debug, Default)]
pub(crate) struct ServerAuthStep {
    /// Messages to send, in order
    pub(crate) replies: Vec<Vec<u8>>,
    /// Set when the user just authenticated
    pub(crate) authenticated: Option<String>,
    /// Set when the attempt limit was reached
    pub(crate) exhausted: bool,
}

impl ServerAuthStep {
    fn reply(payload: Vec<u8>) -> Self {
        Self {
            replies: vec![payload],
            ..Self::default()
        }
    }
}

/// Server-side authentication state.
pub(crate) struct ServerAuthenticator {
    handler: Arc<dyn ServerHandler>,
    max_attempts: u32,
    failures: u32,
    exhausted: bool,
    authenticated: Option<String>,
    interactive_user: Option<String>,
}

impl ServerAuthenticator {
    pub(crate) fn new(handler: Arc<dyn ServerHandler>, max_attempts: u32) -> Self {
        Self {
            handler,
            max_attempts,
            failures: 0,
            exhausted: false,
            authenticated: None,
            interactive_user: None,
        }
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }

    /// Handles one message in the 50-79 range from the client.
    pub(crate) async fn handle(
        &mut self,
        payload: &[u8],
        session_id: &[u8],
    ) -> TesseraResult<ServerAuthStep> {
        if self.exhausted {
            debug!("Ignoring auth message after attempt limit");
            return Ok(ServerAuthStep::default());
        }
        if self.authenticated.is_some() {
            debug!("Ignoring auth message after success");
            return Ok(ServerAuthStep::default());
        }

        match payload[0] {
            b if b == MessageType::UserauthRequest as u8 => {
                let request = AuthRequest::from_bytes(payload)?;
                self.handle_request(request, session_id).await
            }
            b if b == MessageType::UserauthInfoResponse as u8 => {
                let response = InfoResponse::from_bytes(payload)?;
                let user = self.interactive_user.take().ok_or_else(|| {
                    TesseraError::Protocol("INFO_RESPONSE without a prompt".to_string())
                })?;
                let decision = self
                    .handler
                    .auth_keyboard_interactive_response(&user, &response.responses)
                    .await;
                Ok(self.decide(&user, "keyboard-interactive", decision))
            }
            other => Err(TesseraError::Protocol(format!(
                "Unexpected auth message {} on server",
                other
            ))),
        }
    }

    async fn handle_request(
        &mut self,
        request: AuthRequest,
        session_id: &[u8],
    ) -> TesseraResult<ServerAuthStep> {
        let user = request.user_name().to_string();
        self.interactive_user = None;

        if request.service_name() != SERVICE_CONNECTION {
            warn!(service = request.service_name(), "Auth for unknown service");
            return Ok(self.decide(&user, "service", AuthDecision::Failure));
        }

        debug!(user = %user, method = request.method().name(), "Auth request");
        match request.method() {
            AuthMethod::None => {
                let decision = self.handler.auth_none(&user).await;
                Ok(self.reply_uncounted(&user, decision))
            }
            AuthMethod::Password(password) => {
                let decision = self.handler.auth_password(&user, password).await;
                Ok(self.decide(&user, "password", decision))
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature: None,
            } => {
                if self
                    .handler
                    .auth_publickey_acceptable(&user, algorithm, public_key)
                    .await
                {
                    Ok(ServerAuthStep::reply(
                        AuthPkOk::new(algorithm.clone(), public_key.clone()).to_bytes(),
                    ))
                } else {
                    Ok(self.reply_uncounted(&user, AuthDecision::Failure))
                }
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature: Some(signature),
            } => {
                let data = construct_signature_data(
                    session_id,
                    &user,
                    SERVICE_CONNECTION,
                    algorithm,
                    public_key,
                );
                if let Err(e) = verify_signature(public_key, &data, signature) {
                    warn!(user = %user, error = %e, "Public key signature rejected");
                    return Ok(self.decide(&user, "publickey", AuthDecision::Failure));
                }
                let decision = self.handler.auth_publickey(&user, algorithm, public_key).await;
                Ok(self.decide(&user, "publickey", decision))
            }
            AuthMethod::KeyboardInteractive { submethods } => {
                match self.handler.auth_keyboard_interactive(&user, submethods).await {
                    Some(info) => {
                        self.interactive_user = Some(user);
                        Ok(ServerAuthStep::reply(info.to_bytes()))
                    }
                    None => Ok(self.decide(&user, "keyboard-interactive", AuthDecision::Failure)),
                }
            }
            AuthMethod::Unsupported(name) => {
                debug!(method = %name, "Unsupported auth method");
                Ok(self.decide(&user, "unsupported", AuthDecision::Failure))
            }
        }
    }

    fn failure_message(&self, user: &str) -> Vec<u8> {
        AuthFailure::new(self.handler.allowed_auth_methods(user), false).to_bytes()
    }

    /// Answers without touching the attempt counter.
    fn reply_uncounted(&mut self, user: &str, decision: AuthDecision) -> ServerAuthStep {
        match decision {
            AuthDecision::Failure => ServerAuthStep::reply(self.failure_message(user)),
            other => self.decide(user, "none", other),
        }
    }

    fn decide(&mut self, user: &str, method: &str, decision: AuthDecision) -> ServerAuthStep {
        match decision {
            AuthDecision::Success => {
                info!(user, method, "User authenticated");
                self.authenticated = Some(user.to_string());
                ServerAuthStep {
                    replies: vec![vec![MessageType::UserauthSuccess as u8]],
                    authenticated: Some(user.to_string()),
                    exhausted: false,
                }
            }
            AuthDecision::PartialSuccess(methods) => {
                debug!(user, method, "Partial success");
                ServerAuthStep::reply(AuthFailure::new(methods, true).to_bytes())
            }
            AuthDecision::Prompt(info) if method == "keyboard-interactive" => {
                debug!(user, prompts = info.prompts.len(), "Further keyboard-interactive round");
                self.interactive_user = Some(user.to_string());
                ServerAuthStep::reply(info.to_bytes())
            }
            AuthDecision::Prompt(_) => {
                warn!(user, method, "Prompts only continue keyboard-interactive");
                self.decide(user, method, AuthDecision::Failure)
            }
            AuthDecision::Failure => {
                self.failures += 1;
                warn!(user, method, failures = self.failures, "Authentication failed");
                let mut step = ServerAuthStep::reply(self.failure_message(user));
                if self.failures >= self.max_attempts {
                    warn!(user, "Too many authentication failures");
                    self.exhausted = true;
                    step.exhausted = true;
                }
                step
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::auth::Prompt;
    use crate::ssh::hostkey::Ed25519HostKey;
    use tessera_platform::SystemRandomSource;

    struct Policy;

    #[async_trait::async_trait]
    impl ServerHandler for Policy {
        async fn auth_password(&self, user: &str, password: &str) -> AuthDecision {
            match (user, password) {
                ("alice", "correct") => AuthDecision::Success,
                ("bob", "first") => AuthDecision::PartialSuccess(vec!["keyboard-interactive".into()]),
                _ => AuthDecision::Failure,
            }
        }

        async fn auth_publickey_acceptable(&self, _user: &str, _alg: &str, _key: &[u8]) -> bool {
            true
        }

        async fn auth_publickey(&self, user: &str, _alg: &str, _key: &[u8]) -> AuthDecision {
            if user == "alice" {
                AuthDecision::Success
            } else {
                AuthDecision::Failure
            }
        }

        async fn auth_keyboard_interactive(
            &self,
            _user: &str,
            _submethods: &str,
        ) -> Option<InfoRequest> {
            Some(InfoRequest {
                name: String::new(),
                instruction: String::new(),
                prompts: vec![Prompt::new("Code: ", true)],
            })
        }

        async fn auth_keyboard_interactive_response(
            &self,
            user: &str,
            responses: &[String],
        ) -> AuthDecision {
            match (user, responses) {
                (_, [code]) if code == "42" => AuthDecision::Success,
                ("dave", [code]) if code == "first" => AuthDecision::Prompt(InfoRequest {
                    name: "second factor".into(),
                    instruction: String::new(),
                    prompts: vec![Prompt::new("Token: ", true)],
                }),
                _ => AuthDecision::Failure,
            }
        }
    }

    fn authenticator(max: u32) -> ServerAuthenticator {
        ServerAuthenticator::new(Arc::new(Policy), max)
    }

    fn password(user: &str, pw: &str) -> Vec<u8> {
        AuthRequest::new(user, SERVICE_CONNECTION, AuthMethod::Password(pw.into())).to_bytes()
    }

    #[tokio::test]
    async fn test_password_success() {
        let mut auth = authenticator(10);
        let step = auth.handle(&password("alice", "correct"), b"sid").await.unwrap();
        assert_eq!(step.authenticated.as_deref(), Some("alice"));
        assert_eq!(step.replies, vec![vec![MessageType::UserauthSuccess as u8]]);
    }

    #[tokio::test]
    async fn test_none_is_not_counted() {
        let mut auth = authenticator(2);
        for _ in 0..5 {
            let request = AuthRequest::new("alice", SERVICE_CONNECTION, AuthMethod::None);
            let step = auth.handle(&request.to_bytes(), b"sid").await.unwrap();
            let failure = AuthFailure::from_bytes(&step.replies[0]).unwrap();
            assert!(failure.methods_can_continue().contains(&"password".to_string()));
        }
        assert_eq!(auth.failures(), 0);
        assert!(!auth.is_exhausted());
    }

    #[tokio::test]
    async fn test_exhaustion_stops_processing() {
        let mut auth = authenticator(3);
        for attempt in 1..=3 {
            let step = auth.handle(&password("alice", "wrong"), b"sid").await.unwrap();
            assert_eq!(step.replies.len(), 1);
            assert_eq!(step.exhausted, attempt == 3);
        }
        assert!(auth.is_exhausted());

        let step = auth.handle(&password("alice", "correct"), b"sid").await.unwrap();
        assert!(step.replies.is_empty());
        assert!(step.authenticated.is_none());
    }

    #[tokio::test]
    async fn test_partial_success() {
        let mut auth = authenticator(10);
        let step = auth.handle(&password("bob", "first"), b"sid").await.unwrap();
        let failure = AuthFailure::from_bytes(&step.replies[0]).unwrap();
        assert!(failure.partial_success());
        assert_eq!(failure.methods_can_continue(), ["keyboard-interactive"]);
        assert_eq!(auth.failures(), 0);
    }

    #[tokio::test]
    async fn test_publickey_query_then_signed() {
        let key = Ed25519HostKey::generate(&SystemRandomSource::new()).unwrap();
        let mut auth = authenticator(10);
        let session_id = b"session-id";

        let query = AuthRequest::new(
            "alice",
            SERVICE_CONNECTION,
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".into(),
                public_key: key.public_key_bytes(),
                signature: None,
            },
        );
        let step = auth.handle(&query.to_bytes(), session_id).await.unwrap();
        assert_eq!(step.replies[0][0], MessageType::UserauthPkOk as u8);

        let data = construct_signature_data(
            session_id,
            "alice",
            SERVICE_CONNECTION,
            "ssh-ed25519",
            &key.public_key_bytes(),
        );
        let signed = AuthRequest::new(
            "alice",
            SERVICE_CONNECTION,
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".into(),
                public_key: key.public_key_bytes(),
                signature: Some(key.sign(&data).unwrap()),
            },
        );
        let step = auth.handle(&signed.to_bytes(), session_id).await.unwrap();
        assert_eq!(step.authenticated.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_publickey_bad_signature_counts() {
        let key = Ed25519HostKey::generate(&SystemRandomSource::new()).unwrap();
        let mut auth = authenticator(10);
        let signed = AuthRequest::new(
            "alice",
            SERVICE_CONNECTION,
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".into(),
                public_key: key.public_key_bytes(),
                signature: Some(key.sign(b"not the right data").unwrap()),
            },
        );
        let step = auth.handle(&signed.to_bytes(), b"sid").await.unwrap();
        assert!(step.authenticated.is_none());
        assert_eq!(step.replies[0][0], MessageType::UserauthFailure as u8);
        assert_eq!(auth.failures(), 1);
    }

    #[tokio::test]
    async fn test_keyboard_interactive_round() {
        let mut auth = authenticator(10);
        let request = AuthRequest::new(
            "carol",
            SERVICE_CONNECTION,
            AuthMethod::KeyboardInteractive {
                submethods: String::new(),
            },
        );
        let step = auth.handle(&request.to_bytes(), b"sid").await.unwrap();
        let info = InfoRequest::from_bytes(&step.replies[0]).unwrap();
        assert_eq!(info.prompts.len(), 1);

        let response = InfoResponse::new(vec!["42".into()]);
        let step = auth.handle(&response.to_bytes(), b"sid").await.unwrap();
        assert_eq!(step.authenticated.as_deref(), Some("carol"));
    }

    #[tokio::test]
    async fn test_keyboard_interactive_follow_up_round() {
        let mut auth = authenticator(10);
        let request = AuthRequest::new(
            "dave",
            SERVICE_CONNECTION,
            AuthMethod::KeyboardInteractive {
                submethods: String::new(),
            },
        );
        auth.handle(&request.to_bytes(), b"sid").await.unwrap();

        let step = auth
            .handle(&InfoResponse::new(vec!["first".into()]).to_bytes(), b"sid")
            .await
            .unwrap();
        assert!(step.authenticated.is_none());
        let info = InfoRequest::from_bytes(&step.replies[0]).unwrap();
        assert_eq!(info.name, "second factor");
        assert_eq!(auth.failures(), 0);

        let step = auth
            .handle(&InfoResponse::new(vec!["42".into()]).to_bytes(), b"sid")
            .await
            .unwrap();
        assert_eq!(step.authenticated.as_deref(), Some("dave"));
    }

    #[tokio::test]
    async fn test_prompt_outside_keyboard_interactive_fails() {
        let mut auth = authenticator(10);
        let info = InfoRequest::default();
        let step = auth.decide("alice", "password", AuthDecision::Prompt(info));
        assert_eq!(step.replies[0][0], MessageType::UserauthFailure as u8);
        assert_eq!(auth.failures(), 1);
        assert!(auth.interactive_user.is_none());
    }

    #[test]
    fn test_client_state_routes_replies() {
        let mut st = ClientAuthState::default();
        let (tx, mut rx) = oneshot::channel();
        st.pending = Some(Pending {
            expect: Expect::Result,
            reply: tx,
        });

        let banner = AuthBanner::new("welcome".into()).to_bytes();
        assert!(!st.handle(&banner).unwrap());
        assert_eq!(st.banner().as_deref(), Some("welcome"));
        assert!(rx.try_recv().is_err());

        assert!(st.handle(&[MessageType::UserauthSuccess as u8]).unwrap());
        assert!(matches!(rx.try_recv().unwrap(), AuthReply::Success));
    }

    #[test]
    fn test_client_rejects_stray_info_request() {
        let mut st = ClientAuthState::default();
        let info = InfoRequest::default().to_bytes();
        assert!(matches!(st.handle(&info), Err(TesseraError::Protocol(_))));
    }

    #[test]
    fn test_conclude_failure_lists_methods() {
        let reply = AuthReply::Failure(AuthFailure::new(vec!["publickey".into()], false));
        match conclude(reply, "password") {
            Err(TesseraError::Auth(e)) => assert_eq!(e.allowed_methods, ["publickey"]),
            other => panic!("unexpected {:?}", other),
        }
    }
}
