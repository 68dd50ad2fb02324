/*
 * Petrel mail transfer engine
 * Copyright (C) 2024 the Petrel developers
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

use petrel_protocol::{
    rustls, ConnectionKind, DeliverByPolicy, Extensions, MtPriorityProfile, ReceiverConfig,
};

const TEST_SERVER_CERT: &str =
    concat!(env!("CARGO_MANIFEST_DIR"), "/src/template/certs/certificate.crt");
const TEST_SERVER_KEY: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/src/template/certs/private_key.rsa.key"
);

/// The configuration every test starts from: every extension on, insecure
/// AUTH allowed, short timeouts.
#[must_use]
pub fn local_test() -> ReceiverConfig {
    ReceiverConfig {
        domain: "testserver.com".to_owned(),
        kind: ConnectionKind::Smtp,
        message_size_max: Some(20_000_000),
        rcpt_max: Some(32),
        error_threshold: 3,
        read_timeout: Some(std::time::Duration::from_secs(5)),
        write_timeout: Some(std::time::Duration::from_secs(5)),
        allow_insecure_auth: true,
        tls_handshake_timeout: std::time::Duration::from_secs(2),
        extensions: Extensions {
            utf8: true,
            require_tls: true,
            binary_mime: true,
            dsn: true,
            rrvs: true,
            deliver_by: Some(DeliverByPolicy {
                min_seconds: Some(60),
            }),
            mt_priority: Some(MtPriorityProfile::Mixer),
        },
        ..ReceiverConfig::default()
    }
}

/// [`local_test`] in LMTP mode.
#[must_use]
pub fn lmtp_test() -> ReceiverConfig {
    ReceiverConfig {
        kind: ConnectionKind::Lmtp,
        ..local_test()
    }
}

/// [`local_test`] with the test certificate, so STARTTLS is advertised.
#[must_use]
pub fn tls_test() -> ReceiverConfig {
    ReceiverConfig {
        tls: Some(server_tls_config()),
        ..local_test()
    }
}

/// Server-side rustls config over the checked-in self-signed certificate.
#[must_use]
pub fn server_tls_config() -> std::sync::Arc<rustls::ServerConfig> {
    let mut reader =
        std::io::BufReader::new(std::fs::File::open(TEST_SERVER_CERT).expect("test certificate"));
    let certs = rustls_pemfile::certs(&mut reader)
        .expect("valid pem")
        .into_iter()
        .map(rustls::Certificate)
        .collect::<Vec<_>>();

    let mut reader =
        std::io::BufReader::new(std::fs::File::open(TEST_SERVER_KEY).expect("test key"));
    let key = rustls_pemfile::rsa_private_keys(&mut reader)
        .expect("valid pem")
        .into_iter()
        .map(rustls::PrivateKey)
        .next()
        .expect("one rsa key");

    std::sync::Arc::new(
        rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .expect("certificate and key match"),
    )
}

struct AcceptTestCertificate;

impl rustls::client::ServerCertVerifier for AcceptTestCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        // self-signed test certificate
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Client-side rustls config that trusts the test server blindly.
#[must_use]
pub fn client_tls_config() -> std::sync::Arc<rustls::ClientConfig> {
    std::sync::Arc::new(
        rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(std::sync::Arc::new(AcceptTestCertificate))
            .with_no_client_auth(),
    )
}

/// The greeting [`local_test`] produces.
#[must_use]
pub fn greeting() -> String {
    "220 testserver.com ESMTP Service Ready\r\n".to_owned()
}

/// The greeting [`lmtp_test`] produces.
#[must_use]
pub fn lmtp_greeting() -> String {
    "220 testserver.com LMTP Service Ready\r\n".to_owned()
}

/// The full EHLO/LHLO capability reply of [`local_test`], without STARTTLS
/// or AUTH.
#[must_use]
pub fn capabilities() -> String {
    "250-testserver.com\r\n\
     250-PIPELINING\r\n\
     250-8BITMIME\r\n\
     250-ENHANCEDSTATUSCODES\r\n\
     250-CHUNKING\r\n\
     250-SMTPUTF8\r\n\
     250-BINARYMIME\r\n\
     250-DSN\r\n\
     250-RRVS\r\n\
     250-LIMITS RCPTMAX=32\r\n\
     250-SIZE 20000000\r\n\
     250-DELIVERBY 60\r\n\
     250 MT-PRIORITY MIXER\r\n"
        .to_owned()
}

/// [`capabilities`] with a line spliced in after CHUNKING (where STARTTLS
/// and AUTH land).
#[must_use]
pub fn capabilities_with(extra: &str) -> String {
    capabilities().replace(
        "250-SMTPUTF8\r\n",
        &format!("{extra}250-SMTPUTF8\r\n"),
    )
}
