use std::io;

/// Every way a measurement stage can fail, with a stable numeric code.
///
/// The codes and the strings returned by [`FailureKind::ooni_failure`] are
/// part of the report format: downstream consumers key on them, so they
/// must not change across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FailureKind {
    Generic = 1,
    NotInitialized = 2,
    Value = 3,
    Mocked = 4,
    JsonParse = 5,
    JsonKey = 6,
    JsonDomain = 7,
    FileIo = 8,
    SequentialOperation = 9,

    Socket = 20,
    ConnectFailed = 21,
    Timeout = 22,
    Eof = 23,
    Network = 24,
    DnsGeneric = 25,

    BadSocksVersion = 30,
    NoAvailableSocksAuthentication = 31,
    Socks = 32,
    BadSocksReservedField = 33,
    BadSocksAtypeValue = 34,
    SocksAddressTooLong = 35,
    SocksInvalidPort = 36,

    SslCtxNew = 40,
    SslNew = 41,
    SslCtxLoadVerifyLocations = 42,
    MissingCaBundlePath = 43,
    SslInvalidCertificate = 44,
    SslNoCertificate = 45,
    SslInvalidHostname = 46,
    SslHandshake = 47,

    Resolver = 60,
    Format = 61,
    ServerFailed = 62,
    UnsupportedClass = 63,
    UnsupportedType = 64,
    TemporaryFailure = 65,
    NonRecoverableFailure = 66,
    NotSupportedAiFamily = 67,
    MemoryAllocationFailure = 68,
    HostOrServiceNotProvidedOrNotKnown = 69,
    ArgumentBufferOverflow = 70,
    UnknownResolvedProtocol = 71,
    NotSupportedServname = 72,
    NotSupportedAiSocktype = 73,
    InvalidFlagsValue = 74,
    InvalidHintsValue = 75,

    Upgrade = 80,
    Parser = 81,
    UrlParser = 82,
    MissingUrlSchema = 83,
    MissingUrlHost = 84,
    MissingUrl = 85,
    HttpRequestFailed = 86,

    MissingRequiredInputFile = 90,
    CannotOpenInputFile = 91,

    MissingRequiredValue = 100,
    RegistryWrongUsernamePassword = 101,
    RegistryMissingUsernamePassword = 102,
    RegistryInvalidRequest = 103,
    RegistryEmptyClientId = 104,
}

impl FailureKind {
    /// Stable numeric code of this kind.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// The stable failure string recorded in measurement reports.
    pub fn ooni_failure(self) -> &'static str {
        use FailureKind::*;
        match self {
            Generic => "unknown_failure 1",
            NotInitialized => "not_initialized_error",
            Value => "value_error",
            Mocked => "mocked_error",
            JsonParse => "json_parse_error",
            JsonKey => "json_key_error",
            JsonDomain => "json_domain_error",
            FileIo => "file_io_error",
            SequentialOperation => "sequential_operation_error",

            Socket => "socket_error",
            ConnectFailed => "connect_error",
            Timeout => "generic_timeout_error",
            Eof => "eof_error",
            Network => "network_error",
            DnsGeneric => "dns_lookup_error",

            BadSocksVersion => "socks_bad_version",
            NoAvailableSocksAuthentication => "socks_no_available_authentication",
            Socks => "socks_error",
            BadSocksReservedField => "socks_bad_reserved_field",
            BadSocksAtypeValue => "socks_bad_atype_value",
            SocksAddressTooLong => "socks_address_too_long",
            SocksInvalidPort => "socks_invalid_port",

            SslCtxNew => "ssl_ctx_new_error",
            SslNew => "ssl_new_error",
            SslCtxLoadVerifyLocations => "ssl_ctx_load_verify_locations_error",
            MissingCaBundlePath => "missing_ca_bundle_path",
            SslInvalidCertificate => "ssl_invalid_certificate",
            SslNoCertificate => "ssl_no_certificate",
            SslInvalidHostname => "ssl_invalid_hostname",
            SslHandshake => "ssl_handshake_error",

            Resolver => "resolver_error",
            Format => "dns_format_error",
            ServerFailed => "dns_server_failure",
            UnsupportedClass => "dns_unsupported_class",
            UnsupportedType => "dns_unsupported_type",
            TemporaryFailure => "dns_temporary_failure",
            NonRecoverableFailure => "dns_non_recoverable_failure",
            NotSupportedAiFamily => "dns_not_supported_ai_family",
            MemoryAllocationFailure => "memory_allocation_failure",
            HostOrServiceNotProvidedOrNotKnown => "dns_nxdomain_error",
            ArgumentBufferOverflow => "dns_argument_buffer_overflow",
            UnknownResolvedProtocol => "dns_unknown_resolved_protocol",
            NotSupportedServname => "dns_not_supported_servname",
            NotSupportedAiSocktype => "dns_not_supported_ai_socktype",
            InvalidFlagsValue => "dns_invalid_flags_value",
            InvalidHintsValue => "dns_invalid_hints_value",

            Upgrade => "http_upgrade_error",
            Parser => "parser_error",
            UrlParser => "url_parser_error",
            MissingUrlSchema => "missing_url_schema",
            MissingUrlHost => "missing_url_host",
            MissingUrl => "missing_url",
            HttpRequestFailed => "http_request_failed",

            MissingRequiredInputFile => "missing_required_input_file",
            CannotOpenInputFile => "cannot_open_input_file",

            MissingRequiredValue => "missing_required_value",
            RegistryWrongUsernamePassword => "registry_wrong_username_password",
            RegistryMissingUsernamePassword => "registry_missing_username_password",
            RegistryInvalidRequest => "registry_invalid_request",
            RegistryEmptyClientId => "registry_empty_client_id",
        }
    }
}

/// A tagged failure value: kind, human-readable reason and the chain of
/// lower-level failures that produced it.
///
/// Two failures compare equal iff their kinds match; the reason and the
/// children are diagnostics, not identity.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {reason}", .kind.ooni_failure())]
pub struct Failure {
    kind: FailureKind,
    reason: String,
    children: Vec<Failure>,
}

impl Failure {
    pub fn new(kind: FailureKind) -> Self {
        Self { kind, reason: String::new(), children: Vec::new() }
    }

    pub fn with_reason(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self { kind, reason: reason.into(), children: Vec::new() }
    }

    /// Wraps `child` as the cause of a new higher-level failure.
    pub fn wrap(kind: FailureKind, child: Failure) -> Self {
        Self { kind, reason: String::new(), children: vec![child] }
    }

    /// Collapses several sibling failures into one parent, as the connect
    /// cascade does with its per-address errors.
    pub fn with_children(kind: FailureKind, children: Vec<Failure>) -> Self {
        Self { kind, reason: String::new(), children }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn code(&self) -> u16 {
        self.kind.code()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn children(&self) -> &[Failure] {
        &self.children
    }

    pub fn ooni_failure(&self) -> &'static str {
        self.kind.ooni_failure()
    }
}

impl PartialEq for Failure {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for Failure {}

impl PartialEq<FailureKind> for Failure {
    fn eq(&self, other: &FailureKind) -> bool {
        self.kind == *other
    }
}

impl From<io::Error> for Failure {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut => FailureKind::Timeout,
            io::ErrorKind::UnexpectedEof => FailureKind::Eof,
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => FailureKind::FileIo,
            _ => FailureKind::Network,
        };
        Failure::with_reason(kind, err.to_string())
    }
}

impl From<serde_json::Error> for Failure {
    fn from(err: serde_json::Error) -> Self {
        Failure::with_reason(FailureKind::JsonParse, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_reason_and_children() {
        let a = Failure::with_reason(FailureKind::Timeout, "read");
        let b = Failure::wrap(FailureKind::Timeout, Failure::new(FailureKind::Socket));
        assert_eq!(a, b);
        assert_ne!(a, Failure::new(FailureKind::Eof));
    }

    #[test]
    fn cascade_children_are_preserved_in_order() {
        let children = vec![
            Failure::with_reason(FailureKind::Network, "10.0.0.1"),
            Failure::with_reason(FailureKind::Timeout, "10.0.0.2"),
        ];
        let parent = Failure::with_children(FailureKind::ConnectFailed, children);
        assert_eq!(parent.children().len(), 2);
        assert_eq!(parent.children()[0].reason(), "10.0.0.1");
        assert_eq!(parent.ooni_failure(), "connect_error");
    }

    #[test]
    fn io_error_mapping() {
        let f: Failure = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(f.kind(), FailureKind::Timeout);
        let f: Failure = io::Error::new(io::ErrorKind::UnexpectedEof, "done").into();
        assert_eq!(f.kind(), FailureKind::Eof);
    }
}
