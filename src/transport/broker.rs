//! Broker address, TLS trust and client options for trackerd.
//!
//! Location data stays on a loopback broker unless remote brokers are
//! explicitly allowed.

use anyhow::{anyhow, bail, Context, Result};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use super::discovery::PAYLOAD_OFFLINE;

const KEEP_ALIVE: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Broker {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Broker {
    /// Accepts `host:port`, `[v6]:port` and the `mqtt`, `tcp`, `mqtts`,
    /// `ssl` schemes. A TLS scheme turns TLS on regardless of `force_tls`.
    pub fn parse(addr: &str, force_tls: bool) -> Result<Self> {
        let addr = addr.trim();
        let (tls, authority) = match addr.split_once("://") {
            None => (force_tls, addr),
            Some(("mqtt" | "tcp", rest)) => (force_tls, rest),
            Some(("mqtts" | "ssl", rest)) => (true, rest),
            Some((scheme, _)) => bail!("unsupported MQTT scheme: {}", scheme),
        };

        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let host = match host.strip_prefix('[') {
            Some(v6) => v6
                .strip_suffix(']')
                .ok_or_else(|| anyhow!("unterminated IPv6 host in {}", addr))?,
            None if host.contains(':') => bail!("IPv6 broker hosts need brackets: {}", addr),
            None => host,
        };
        if host.is_empty() {
            bail!("missing MQTT host in {}", addr);
        }
        let port = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }

    pub fn is_loopback(&self) -> bool {
        self.host
            .parse::<IpAddr>()
            .map_or(self.host.eq_ignore_ascii_case("localhost"), |ip| ip.is_loopback())
    }

    pub fn check_reachability(&self, allow_remote: bool) -> Result<()> {
        if self.is_loopback() {
            return Ok(());
        }
        if !allow_remote {
            bail!(
                "MQTT broker {}:{} is not loopback (use --allow-remote-mqtt to override)",
                self.host,
                self.port
            );
        }
        log::warn!("Remote MQTT enabled - ensure broker is in a trusted network");
        Ok(())
    }

    /// Client options with credentials and an `offline` last will on
    /// `will_topic`.
    pub fn options(
        &self,
        trust: BrokerTrust,
        client_id: &str,
        credentials: Option<(&str, &str)>,
        will_topic: &str,
    ) -> Result<MqttOptions> {
        let mut options = MqttOptions::new(client_id, &self.host, self.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_start(true);
        if let Some((user, password)) = credentials {
            options.set_credentials(user, password);
        }
        options.set_last_will(LastWill::new(
            will_topic,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        ));
        options.set_transport(trust.transport(self.tls)?);
        Ok(options)
    }
}

/// How the broker certificate is verified and whether we present one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerTrust {
    SystemRoots,
    Ca(Vec<u8>),
    Mutual {
        ca: Vec<u8>,
        cert: Vec<u8>,
        key: Vec<u8>,
    },
}

impl BrokerTrust {
    /// Reads PEM files. A client certificate needs its key and a CA.
    pub fn from_files(ca: Option<&Path>, cert: Option<&Path>, key: Option<&Path>) -> Result<Self> {
        let ca = ca.map(|p| read_pem(p, "CA")).transpose()?;
        match (ca, cert, key) {
            (None, None, None) => Ok(Self::SystemRoots),
            (Some(ca), None, None) => Ok(Self::Ca(ca)),
            (Some(ca), Some(cert), Some(key)) => Ok(Self::Mutual {
                ca,
                cert: read_pem(cert, "client cert")?,
                key: read_pem(key, "client key")?,
            }),
            (None, Some(_), Some(_)) => {
                bail!("MQTT TLS client certificates need a CA certificate")
            }
            (_, Some(_), None) => bail!("MQTT TLS client certificate provided without key"),
            (_, None, Some(_)) => bail!("MQTT TLS client key provided without certificate"),
        }
    }

    fn transport(self, tls: bool) -> Result<Transport> {
        Ok(match (tls, self) {
            (false, Self::SystemRoots) => Transport::tcp(),
            (false, _) => bail!(
                "MQTT TLS certificates given but TLS is off (use --mqtt-use-tls or mqtts://)"
            ),
            (true, Self::SystemRoots) => Transport::tls_with_default_config(),
            (true, Self::Ca(ca)) => Transport::tls(ca, None, None),
            (true, Self::Mutual { ca, cert, key }) => Transport::tls(ca, Some((cert, key)), None),
        })
    }
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .with_context(|| format!("failed to read MQTT TLS {} '{}'", what, path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn schemes_select_tls() {
        let plain = Broker::parse("tcp://127.0.0.1:1883", false).unwrap();
        assert_eq!(
            plain,
            Broker {
                host: "127.0.0.1".into(),
                port: 1883,
                tls: false
            }
        );
        assert!(Broker::parse("ssl://core-mosquitto:8883", false).unwrap().tls);
        assert!(Broker::parse("localhost:8883", true).unwrap().tls);
        assert!(Broker::parse("ws://broker:80", false).is_err());
    }

    #[test]
    fn bracketed_ipv6_hosts() {
        let broker = Broker::parse("[::1]:1883", false).unwrap();
        assert_eq!(broker.host, "::1");
        assert!(broker.is_loopback());
        assert!(Broker::parse("::1:1883", false).is_err());
        assert!(Broker::parse("[::1:1883", false).is_err());
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        assert!(Broker::parse("broker", false).is_err());
        assert!(Broker::parse(":1883", false).is_err());
        assert!(Broker::parse("broker:99999", false).is_err());
    }

    #[test]
    fn remote_brokers_need_opt_in() {
        assert!(Broker::parse("LOCALHOST:1883", false)
            .unwrap()
            .check_reachability(false)
            .is_ok());
        let lan = Broker::parse("192.168.1.10:1883", false).unwrap();
        let err = lan.check_reachability(false).unwrap_err();
        assert!(err.to_string().contains("not loopback"));
        assert!(lan.check_reachability(true).is_ok());
    }

    #[test]
    fn trust_from_files() {
        assert_eq!(BrokerTrust::from_files(None, None, None).unwrap(), BrokerTrust::SystemRoots);

        let mut ca = tempfile::NamedTempFile::new().unwrap();
        ca.write_all(b"-----BEGIN CERTIFICATE-----").unwrap();
        assert_eq!(
            BrokerTrust::from_files(Some(ca.path()), None, None).unwrap(),
            BrokerTrust::Ca(b"-----BEGIN CERTIFICATE-----".to_vec())
        );

        let key = Path::new("/nonexistent/key.pem");
        let err = BrokerTrust::from_files(Some(ca.path()), None, Some(key)).unwrap_err();
        assert!(err.to_string().contains("without certificate"));
        let err = BrokerTrust::from_files(None, Some(key), Some(key)).unwrap_err();
        assert!(err.to_string().contains("need a CA"));
        let missing = BrokerTrust::from_files(Some(key), None, None).unwrap_err();
        assert!(missing.to_string().contains("failed to read MQTT TLS CA"));
    }

    #[test]
    fn certificates_without_tls_are_rejected() {
        let broker = Broker::parse("127.0.0.1:1883", false).unwrap();
        let ca = BrokerTrust::Ca(b"pem".to_vec());
        assert!(broker.options(ca, "trackerd", None, "transit/status").is_err());

        let options = broker
            .options(BrokerTrust::SystemRoots, "trackerd", Some(("ha", "pw")), "transit/status")
            .unwrap();
        assert_eq!(options.broker_address(), ("127.0.0.1".to_string(), 1883));
    }
}
