//! Credential-Injecting TLS Proxy (D) and its supporting pieces: the
//! Certificate Authority (C), the Registry of live run contexts, the
//! streaming body rewriter, manual AWS SigV4 signing, and the daemon that
//! hosts all of it as one long-lived process.

/// Certificate Authority: root cert plus on-demand, cached leaf issuance.
pub mod ca;
/// The daemon: control-socket server, request/response protocol, lifecycle.
pub mod daemon;
/// The `hudsucker` MITM handler and per-request record format.
pub mod http_proxy;
/// Token -> `RunContext` table with idle-shutdown notification.
pub mod registry;
/// Streaming, bounded-lookahead body placeholder substitution.
pub mod rewrite;
/// Manual AWS SigV4 request signing.
pub mod sigv4;

pub use ca::{CertificateAuthority, LeafCert};
pub use daemon::{DaemonRequest, DaemonResponse};
pub use http_proxy::{request_record, InjectionProxy, RequestSink, TOKEN_HEADER};
pub use registry::{OnEmptyCallback, Registry, RunContext};
pub use rewrite::PlaceholderRewriter;
pub use sigv4::{sign, AwsCredentials, SignableRequest, SignedHeaders};
