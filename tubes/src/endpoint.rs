//! QUIC endpoint configuration for the bytestream transport.
//!
//! Every endpoint is both a client and a server, since either side of a tube may open
//! bytestreams. Peers are not authenticated here: the server certificate is self-signed and
//! clients accept any certificate.

use std::{
    io::{self, Error, ErrorKind},
    net::UdpSocket,
    sync::Arc,
    time::Duration,
};

use quinn::{ClientConfig, Endpoint, EndpointConfig, IdleTimeout, ServerConfig, TokioRuntime, TransportConfig, VarInt};

pub const KEEPALIVE_INTERVAL_PERIOD_MILLIS: u64 = 1000;
pub const MAX_IDLE_TIMEOUT_MILLIS: u32 = 10000;

/// The server name clients expect; any name works since certificates aren't verified.
pub const SERVER_NAME: &str = "localhost";

pub fn make_endpoint(socket: UdpSocket) -> io::Result<Endpoint> {
    let runtime = Arc::new(TokioRuntime);
    let server_config = configure_server()?;

    let mut endpoint = Endpoint::new(EndpointConfig::default(), Some(server_config), socket, runtime)?;
    endpoint.set_default_client_config(configure_client());

    Ok(endpoint)
}

fn transport_config() -> TransportConfig {
    let mut transport_config = TransportConfig::default();
    transport_config.max_concurrent_uni_streams(0_u8.into());
    transport_config.keep_alive_interval(Some(Duration::from_millis(KEEPALIVE_INTERVAL_PERIOD_MILLIS)));
    transport_config.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(MAX_IDLE_TIMEOUT_MILLIS))));
    transport_config
}

pub fn configure_client() -> ClientConfig {
    let crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();

    let mut client_config = ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(Arc::new(transport_config()));
    client_config
}

pub fn configure_server() -> io::Result<ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()]).map_err(|error| Error::new(ErrorKind::Other, error))?;
    let cert_der = cert.serialize_der().map_err(|error| Error::new(ErrorKind::Other, error))?;
    let priv_key = rustls::PrivateKey(cert.serialize_private_key_der());
    let cert_chain = vec![rustls::Certificate(cert_der)];

    let mut server_config =
        ServerConfig::with_single_cert(cert_chain, priv_key).map_err(|error| Error::new(ErrorKind::InvalidData, error))?;
    server_config.transport_config(Arc::new(transport_config()));

    Ok(server_config)
}

struct SkipServerVerification;

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
